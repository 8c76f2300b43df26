//! Security collaborator seams: authentication/authorization and impersonation.

use courier_protocol::{Fault, Message};

use crate::channel::ResolvedChannel;

/// A synchronous admission check run before instance binding.
///
/// Used for both authentication and authorization hooks; a rejection is
/// reported to the caller as the returned fault.
pub trait AuthorizationHook: Send + Sync {
    fn check(&self, request: &Message, channel: &ResolvedChannel) -> Result<(), Fault>;
}

/// Supplies the impersonation scope an operation runs under.
pub trait Impersonator: Send + Sync {
    fn enter(&self, request: &Message) -> Result<ImpersonationScope, Fault>;
}

/// Active impersonation; reverted when dropped.
pub struct ImpersonationScope {
    revert: Option<Box<dyn FnOnce() + Send>>,
}

impl ImpersonationScope {
    pub fn new(revert: impl FnOnce() + Send + 'static) -> Self {
        Self {
            revert: Some(Box::new(revert)),
        }
    }

    /// A scope with nothing to revert.
    pub fn noop() -> Self {
        Self { revert: None }
    }
}

impl Drop for ImpersonationScope {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}
