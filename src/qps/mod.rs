//! In-process QPS accounting.
//!
//! State is kept within the current process using thread-safe data structures
//! ([`DashMap`](dashmap::DashMap) and atomics). Limits are not coordinated
//! across processes: each instance enforces its own.
//!
//! # Components
//!
//! - [`QpsController`]: fixed-window counter for one key
//! - [`QpsControllerRegistry`]: key to controller table, lazily populated
//! - [`QpsConfig`]: last observed limits, fed by [`ConfigChange`] events
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use qps_flowcontrol::{
//!     ConfigChange, FlowDirection, KeyResolver, QpsControllerRegistry, SystemTimeSource,
//!     WindowSizeMs,
//! };
//!
//! let registry = QpsControllerRegistry::new(
//!     FlowDirection::Consumer,
//!     "flowcontrol",
//!     WindowSizeMs::default(),
//!     Arc::new(SystemTimeSource),
//! );
//!
//! registry.apply(&ConfigChange::set("flowcontrol.consumer.qps.limit.orders", 100));
//!
//! let candidates = KeyResolver::candidates(Some("orders"), Some("api"), Some("list"));
//! let controller = registry.resolve(&candidates);
//!
//! assert_eq!(controller.key().as_str(), "orders");
//! assert!(controller.try_admit());
//! ```

mod qps_config;
pub use qps_config::*;

mod qps_controller;
pub use qps_controller::*;

mod qps_controller_registry;
pub use qps_controller_registry::*;
