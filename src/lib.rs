#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod flow_control;
pub use flow_control::*;

mod qps;
pub use qps::*;

mod handler;
pub use handler::*;

mod key_resolver;
pub use key_resolver::*;

mod time_source;
pub use time_source::*;

mod error;
pub use error::*;

mod common;
pub use common::{AdmissionDecision, DEFAULT_WINDOW_SIZE_MS, FlowDirection, WindowSizeMs};

#[cfg(test)]
mod tests;
