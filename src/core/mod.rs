//! Protocol core: packets, topic routing and client sessions.

pub mod auth;
pub mod error;
pub mod packet;
pub mod session;
pub mod topics;
