//! Request tokens track one posted operation at a time.
//!
//! A token starts out pending. Handing it to an operation resets it, tags it with the
//! region the operation touches and forces the operation to be signaled. The context
//! resolves it exactly once, when the matching completion is drained from the send
//! completion queue. Nothing moves a token back to pending except handing it to the next
//! operation.
use std::sync::Arc;
use std::sync::OnceLock;

use crate::context::Context;
use crate::primitives::CompletionStatus;
use crate::region::RegionToken;

/// Completion state shared between a token and the context's pending-request table.
#[derive(Debug, Default)]
pub(crate) struct RequestState {
    status: OnceLock<CompletionStatus>,
}

impl RequestState {
    /// Records the outcome. Later calls are ignored.
    pub(crate) fn complete(&self, status: CompletionStatus) {
        let _ = self.status.set(status);
    }

    fn status(&self) -> Option<CompletionStatus> {
        self.status.get().copied()
    }
}

pub struct RequestToken {
    context: Arc<Context>,
    state: Arc<RequestState>,
    region: Option<RegionToken>,
    immediate_value: Option<u32>,
    user_data: Option<Vec<u8>>,
}

impl std::fmt::Debug for RequestToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestToken")
            .field("status", &self.state.status())
            .field("region", &self.region)
            .field("immediate_value", &self.immediate_value)
            .field("user_data_len", &self.user_data.as_ref().map(Vec::len))
            .finish()
    }
}

impl RequestToken {
    pub fn new(context: &Arc<Context>) -> Self {
        Self {
            context: context.clone(),
            state: Arc::new(RequestState::default()),
            region: None,
            immediate_value: None,
            user_data: None,
        }
    }

    /// Returns the token to pending and clears its region and immediate value.
    ///
    /// A completion still outstanding for the previous operation no longer affects it.
    pub fn reset(&mut self) {
        self.state = Arc::new(RequestState::default());
        self.region = None;
        self.immediate_value = None;
    }

    /// Prepares the token for a new operation and returns the state to register.
    pub(crate) fn begin(
        &mut self,
        region: RegionToken,
        immediate_value: Option<u32>,
    ) -> Arc<RequestState> {
        self.reset();
        self.region = Some(region);
        self.immediate_value = immediate_value;
        self.state.clone()
    }

    /// The local region touched by the last operation.
    pub fn region(&self) -> Option<RegionToken> {
        self.region
    }

    pub fn has_immediate_value(&self) -> bool {
        self.immediate_value.is_some()
    }

    pub fn immediate_value(&self) -> Option<u32> {
        self.immediate_value
    }

    pub fn set_user_data(&mut self, data: impl Into<Vec<u8>>) {
        self.user_data = Some(data.into());
    }

    pub fn has_user_data(&self) -> bool {
        self.user_data.is_some()
    }

    pub fn user_data(&self) -> Option<&[u8]> {
        self.user_data.as_deref()
    }

    /// Whether a completion has been observed, without polling.
    pub fn is_completed(&self) -> bool {
        self.state.status().is_some()
    }

    /// Returns whether the operation completed, polling the send completion queue once
    /// if it has not.
    pub fn check_if_completed(&self) -> bool {
        if self.is_completed() {
            return true;
        }
        self.context.poll_send_completion_queue();
        self.is_completed()
    }

    /// Spins until the operation completes. There is no timeout.
    pub fn wait_until_completed(&self) {
        while !self.check_if_completed() {
            std::hint::spin_loop();
        }
    }

    /// Whether the operation completed successfully. False while pending.
    pub fn was_successful(&self) -> bool {
        self.state.status().is_some_and(|status| status.is_success())
    }

    /// Completion status reported by the device, once completed.
    pub fn status(&self) -> Option<CompletionStatus> {
        self.state.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::region::RegionKind;
    use crate::soft_device::SoftFabric;

    fn context() -> Arc<Context> {
        Context::with_device(
            SoftFabric::new().open_device("token_test"),
            ContextConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_token_is_pending() {
        let token = RequestToken::new(&context());
        assert!(!token.is_completed());
        assert!(!token.check_if_completed());
        assert!(!token.was_successful());
        assert!(token.region().is_none());
        assert!(!token.has_immediate_value());
    }

    #[test]
    fn test_complete_once() {
        let mut token = RequestToken::new(&context());
        let region = RegionToken::new(RegionKind::Buffer, 8, 0x1000, 1, 1);
        let state = token.begin(region, Some(9));
        assert_eq!(token.region(), Some(region));
        assert_eq!(token.immediate_value(), Some(9));

        state.complete(CompletionStatus::Success);
        state.complete(CompletionStatus::RemoteAccessError);
        assert!(token.check_if_completed());
        assert!(token.was_successful());
        assert_eq!(token.status(), Some(CompletionStatus::Success));
    }

    #[test]
    fn test_reset_detaches_previous_operation() {
        let mut token = RequestToken::new(&context());
        let region = RegionToken::new(RegionKind::Buffer, 8, 0x1000, 1, 1);
        let previous = token.begin(region, None);
        token.reset();
        previous.complete(CompletionStatus::Success);
        assert!(!token.is_completed());
        assert!(token.region().is_none());
    }

    #[test]
    fn test_user_data_survives_reset() {
        let mut token = RequestToken::new(&context());
        token.set_user_data(b"tag".to_vec());
        token.reset();
        assert!(token.has_user_data());
        assert_eq!(token.user_data(), Some(&b"tag"[..]));
    }
}
