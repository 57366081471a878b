//! Macros: parsed command scripts that sequence procedures, shells,
//! messages, filter maintenance and session control.

pub mod expand;
pub mod interpreter;
pub mod parser;

pub use interpreter::MacroInterpreter;
pub use parser::{CommandKind, FilterAction, MacroCommand, MacroDef, MacroFile};
