use crate::FlowControlError;

/// Next stage of the invocation pipeline.
///
/// Exactly one of the two methods is called per handled call.
pub trait Pipeline<C> {
    /// Continue with `call`, unchanged.
    fn proceed(&mut self, call: C);

    /// Fail `call` with `error`. Terminal for this invocation attempt.
    fn fail(&mut self, call: C, error: FlowControlError);
}

/// Terminal state of a handled call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The call was admitted and passed to [`Pipeline::proceed`].
    Forwarded,
    /// The call was rejected and passed to [`Pipeline::fail`].
    FailureSignaled,
}
