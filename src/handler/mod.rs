//! Pipeline integration.
//!
//! [`QpsFlowControlHandler`] sits in front of the next pipeline stage and
//! forwards or fails each call through the narrow [`Pipeline`] trait.

mod pipeline;
pub use pipeline::*;

mod qps_flow_control_handler;
pub use qps_flow_control_handler::*;
