//! Wire-format parse errors

use thiserror::Error;

/// Errors raised when decoding annotation or naming grammars.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// A device record did not have the expected fields
    #[error("invalid device record: {0}")]
    InvalidDeviceRecord(String),

    /// A numeric field could not be parsed
    #[error("invalid number in {field}: {value}")]
    InvalidNumber {
        /// Field being parsed
        field: &'static str,
        /// Offending input
        value: String,
    },

    /// Listener section name is not `<network>--<port>`
    #[error("gateway section name {0} is invalid")]
    InvalidSectionName(String),
}
