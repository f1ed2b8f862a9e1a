use std::ops::Deref;

/// Default fixed window size: one second.
pub const DEFAULT_WINDOW_SIZE_MS: u64 = 1000;

/// Size of the fixed admission window in milliseconds.
///
/// Windows are aligned to multiples of this value on the time source's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSizeMs(u64);

impl Default for WindowSizeMs {
    fn default() -> Self {
        Self(DEFAULT_WINDOW_SIZE_MS)
    }
}

impl Deref for WindowSizeMs {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSizeMs {
    type Error = &'static str;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err("Window size must be greater than 0")
        } else {
            Ok(Self(value))
        }
    }
}

/// Which side of a call the flow control is applied on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowDirection {
    /// Inbound calls; keys are built from the calling microservice.
    Provider,
    /// Outbound calls; keys are built from the target microservice.
    Consumer,
}

impl FlowDirection {
    /// Segment used for this direction in configuration property names.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowDirection::Provider => "provider",
            FlowDirection::Consumer => "consumer",
        }
    }
}

impl std::fmt::Display for FlowDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The call is admitted.
    Allowed,
    /// The call is rejected.
    ///
    /// Includes a best-effort hint for callers that want to communicate backoff.
    Rejected {
        /// Canonical form of the governing key.
        key: String,
        /// Limit in force when the call was rejected.
        limit: i64,
        /// Milliseconds until the current window closes.
        retry_after_ms: u64,
    },
}

impl AdmissionDecision {
    /// Whether this decision admits the call.
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed)
    }
}
