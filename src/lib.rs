//! Real-time electrophysiology acquisition core.
//!
//! The crate continuously acquires analog input into lock-free cyclic
//! buffers, plays stimuli out with acquisition-exact onset timestamps,
//! derives filtered traces and event streams through an incremental
//! filter/detector graph, schedules one research procedure at a time
//! under macro control, and persists traces, events and a stimulus
//! index per session.
//!
//! ## Threads
//! - **DAQ**: services the devices at a fixed period at elevated
//!   priority; fills the input traces and confirms stimulus onsets.
//! - **Filter**: wakes on DAQ advance and runs the graph incrementally.
//! - **Procedure/macro**: executes the running procedure's `main` and
//!   steps the macro interpreter between runs.
//! - **Storage**: tails all buffers and the stimulus queue into the
//!   session files.
//! - The front end drains a bounded [`ui::UiChannel`]; the core never
//!   calls UI code.

pub mod daq;
pub mod error;
pub mod filter;
pub mod framework;
pub mod macros;
pub mod options;
pub mod repro;
pub mod session;
pub mod storage;
pub mod store;
pub mod ui;

pub use error::{Error, Result};
pub use framework::{Framework, FrameworkConfig, ProcCommand};
