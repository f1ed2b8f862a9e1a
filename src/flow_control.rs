//! Top-level entrypoint that wires both directions.
//!
//! [`FlowControl`] owns one registry and handler per [`FlowDirection`] and
//! routes configuration events to them. It is an ordinary value: construct one
//! per process (or per test) and share it behind an `Arc`.

use std::sync::Arc;

use crate::{
    ConfigChange, DEFAULT_CONFIG_PREFIX, FlowDirection, QpsControllerRegistry,
    QpsFlowControlHandler, SystemTimeSource, TimeSource, WindowSizeMs,
};

/// Configuration for [`FlowControl`].
#[derive(Clone, Debug)]
pub struct FlowControlOptions {
    /// Root segment of every configuration property name.
    pub config_prefix: String,
    /// Fixed window size used for admission.
    pub window_size_ms: WindowSizeMs,
    /// Clock used to compute windows.
    pub time_source: Arc<dyn TimeSource>,
}

impl Default for FlowControlOptions {
    fn default() -> Self {
        Self {
            config_prefix: DEFAULT_CONFIG_PREFIX.to_string(),
            window_size_ms: WindowSizeMs::default(),
            time_source: Arc::new(SystemTimeSource),
        }
    }
}

/// Flow control entrypoint.
#[derive(Debug)]
pub struct FlowControl {
    provider: QpsFlowControlHandler,
    consumer: QpsFlowControlHandler,
}

impl FlowControl {
    /// Create a [`FlowControl`] with no configured limits.
    pub fn new(options: FlowControlOptions) -> Self {
        let handler = |direction| {
            QpsFlowControlHandler::new(Arc::new(QpsControllerRegistry::new(
                direction,
                &options.config_prefix,
                options.window_size_ms,
                options.time_source.clone(),
            )))
        };

        Self {
            provider: handler(FlowDirection::Provider),
            consumer: handler(FlowDirection::Consumer),
        }
    }

    /// Handler for inbound calls.
    pub fn provider(&self) -> &QpsFlowControlHandler {
        &self.provider
    }

    /// Handler for outbound calls.
    pub fn consumer(&self) -> &QpsFlowControlHandler {
        &self.consumer
    }

    /// Handler for `direction`.
    pub fn handler(&self, direction: FlowDirection) -> &QpsFlowControlHandler {
        match direction {
            FlowDirection::Provider => &self.provider,
            FlowDirection::Consumer => &self.consumer,
        }
    }

    /// Route a configuration change to the direction it belongs to.
    ///
    /// Returns `false` for properties neither direction recognises.
    pub fn apply_change(&self, change: &ConfigChange) -> bool {
        self.provider.registry().apply(change) || self.consumer.registry().apply(change)
    }

    /// Replace the configuration of both directions with `properties`.
    pub fn load<I, K, V>(&self, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        let changes: Vec<ConfigChange> = properties
            .into_iter()
            .map(|(property, value)| ConfigChange::set(property, value))
            .collect();

        self.provider.registry().load(&changes);
        self.consumer.registry().load(&changes);
    }

    /// Drop every controller of both directions, keeping configuration.
    pub fn reset_all(&self) {
        self.provider.registry().reset_all();
        self.consumer.registry().reset_all();
    }
}
