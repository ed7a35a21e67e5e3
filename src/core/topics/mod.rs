//! Topic matching and message routing.
//!
//! `filter` holds the pure wildcard matcher; `router` owns the sharded
//! subscription table and the retained-message store.

pub mod filter;
pub mod router;

pub use router::{RetainedMessage, Router};
