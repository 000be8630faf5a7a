//! Client verification hook.
//!
//! The server runs the configured [`Authenticator`] once per connection, on
//! the first inbound frame. The default [`AcceptAll`] lets everyone in; a
//! real check can be plugged in without touching the registry or the
//! broadcast path.

use thiserror::Error;

use crate::data::ClientIdentity;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("client rejected: {reason}")]
pub struct AuthRejection {
    pub reason: String,
}

impl AuthRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Decides whether a newly connected client may stay connected.
///
/// `identity` is `None` when the first frame was not a readable
/// identification payload.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, identity: Option<&ClientIdentity>) -> Result<(), AuthRejection>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl Authenticator for AcceptAll {
    fn authenticate(&self, _identity: Option<&ClientIdentity>) -> Result<(), AuthRejection> {
        Ok(())
    }
}

impl<F> Authenticator for F
where
    F: Fn(Option<&ClientIdentity>) -> Result<(), AuthRejection> + Send + Sync,
{
    fn authenticate(&self, identity: Option<&ClientIdentity>) -> Result<(), AuthRejection> {
        self(identity)
    }
}
