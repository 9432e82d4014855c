//! Common types for down-pvscope: errors, polling, retry, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use poll::{poll_until, PollSpec};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Value of `app.kubernetes.io/managed-by` on objects created by the tool
pub const MANAGED_BY: &str = "down-pvscope";

/// Label key used to mark objects created by the tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
