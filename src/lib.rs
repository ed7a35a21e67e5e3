//! blipmqtt – a lightweight MQTT 3.1/3.1.1 broker written in Rust.
//!
//! This crate exports
//!  * `core`    – packet codec, topic router, sessions
//!  * `broker`  – TCP accept loop and stop sequence
//!  * `metrics` – `$SYS` stats collector
//!  * `config`  – TOML + environment configuration
//!
//! Applications can embed the broker (`Broker::serve` over their own
//! listener, or `Broker::serve_connection` for any byte stream) or just call
//! `run` with a [`Config`].

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod util;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{run, Broker};
pub use config::{load_config, Config};
