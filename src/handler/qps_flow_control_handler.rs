use std::sync::Arc;

use crate::{
    AdmissionDecision, AdmissionOutcome, CallContext, FlowControlError, FlowDirection,
    KeyResolver, Pipeline, QpsControllerRegistry,
};

/// Pipeline entry point for QPS flow control.
///
/// Per call: `RECEIVED → KEY_RESOLVED → COUNTER_OBTAINED`, then either
/// `ADMITTED → FORWARDED` or `REJECTED → FAILURE_SIGNALED`. Both ends are
/// terminal; nothing is retried here.
///
/// Missing identity attributes are not an error: the call is checked against
/// the global key instead.
#[derive(Debug, Clone)]
pub struct QpsFlowControlHandler {
    resolver: KeyResolver,
    registry: Arc<QpsControllerRegistry>,
}

impl QpsFlowControlHandler {
    /// Create a handler backed by `registry`.
    pub fn new(registry: Arc<QpsControllerRegistry>) -> Self {
        Self {
            resolver: KeyResolver::new(registry.direction()),
            registry,
        }
    }

    /// Direction this handler applies to.
    pub fn direction(&self) -> FlowDirection {
        self.resolver.direction()
    }

    /// Registry holding this handler's controllers and configuration.
    pub fn registry(&self) -> &Arc<QpsControllerRegistry> {
        &self.registry
    }

    /// Run the admission check for `call`, consuming a slot when admitted.
    pub fn check<C: CallContext + ?Sized>(&self, call: &C) -> AdmissionDecision {
        if !self.registry.is_enabled() {
            return AdmissionDecision::Allowed;
        }

        let candidates = self.resolver.resolve(call);
        let controller = self.registry.resolve(&candidates);

        controller.check()
    }

    /// Check `call` and hand it to `pipeline`.
    ///
    /// Admitted calls go to [`Pipeline::proceed`] unchanged. Rejected calls go
    /// to [`Pipeline::fail`] with [`FlowControlError::Rejected`].
    pub fn handle<C, P>(&self, call: C, pipeline: &mut P) -> AdmissionOutcome
    where
        C: CallContext,
        P: Pipeline<C>,
    {
        match self.check(&call) {
            AdmissionDecision::Allowed => {
                pipeline.proceed(call);
                AdmissionOutcome::Forwarded
            }
            AdmissionDecision::Rejected { key, limit, .. } => {
                tracing::debug!(
                    direction = %self.direction(),
                    key = %key,
                    limit,
                    "qps.rejected"
                );

                pipeline.fail(call, FlowControlError::Rejected { key, limit });
                AdmissionOutcome::FailureSignaled
            }
        }
    } // end method handle
}
