//! Connection-time authentication.
//!
//! The broker consults an [`Authenticator`] once per handshake, after the
//! CONNECT has passed protocol validation. The default [`AllowAll`] accepts
//! every client; embedders plug in their own check through the trait or a
//! plain closure.

use crate::core::packet::{Connect, ConnectReturnCode};

pub trait Authenticator: Send + Sync {
    /// Returns [`ConnectReturnCode::Accepted`] to admit the client, or the
    /// refusal code to put in the CONNACK.
    fn authenticate(&self, connect: &Connect) -> ConnectReturnCode;
}

/// Admits every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _connect: &Connect) -> ConnectReturnCode {
        ConnectReturnCode::Accepted
    }
}

impl<F> Authenticator for F
where
    F: Fn(&Connect) -> ConnectReturnCode + Send + Sync,
{
    fn authenticate(&self, connect: &Connect) -> ConnectReturnCode {
        self(connect)
    }
}
