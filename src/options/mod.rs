//! Typed key/value parameter kernel: parameters with units, ranges,
//! defaults and activation conditions, grouped into `Options`
//! collections with named sections.

pub mod options;
pub mod parameter;
pub mod units;

pub use options::Options;
pub use parameter::{
    Activation, CHANGED_FLAG, Comparison, Date, Parameter, Time, Value, ValueType, format_number,
    split_number_unit,
};
pub use units::change_unit;
