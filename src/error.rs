/// Error type for this crate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowControlError {
    /// The call exceeded the QPS limit governing its key.
    ///
    /// This is the only condition that fails a call. It is terminal for the
    /// attempt and is never retried by this crate.
    #[error("request rejected by flow control (key: {key}, limit: {limit})")]
    Rejected {
        /// Canonical form of the governing key.
        key: String,
        /// Limit in force when the call was rejected.
        limit: i64,
    },

    /// A configuration property carried a value that is not a valid limit.
    #[error("invalid qps limit {value:?} for property {property}")]
    InvalidLimit {
        /// Full property name.
        property: String,
        /// Raw value as received from the configuration source.
        value: String,
    },
}
