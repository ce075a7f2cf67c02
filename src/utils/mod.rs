//! Utility modules for common functionality

pub mod retry;
mod string;

pub use retry::{retry, RetryConfig, RetryableError};
pub use string::truncate_str;
