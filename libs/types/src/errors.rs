//! Error types for tick records
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Reasons a decoded tick is rejected by `TickRecord::validate`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TickError {
    #[error("Tick has an empty symbol")]
    EmptySymbol,

    #[error("Non-finite value in field {field}")]
    NonFinite { field: &'static str },

    #[error("Negative price in field {field}: {value}")]
    NegativePrice { field: &'static str, value: f64 },

    #[error("Negative quantity in field {field}: {value}")]
    NegativeQuantity { field: &'static str, value: i64 },

    #[error("Invalid depth level at index {index}")]
    InvalidDepthLevel { index: usize },
}

/// Errors building a market session calendar
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Invalid UTC offset: {minutes} minutes")]
    InvalidOffset { minutes: i32 },

    #[error("Session close {close} is not after open {open}")]
    EmptySession { open: String, close: String },
}
