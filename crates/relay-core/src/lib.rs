//! Core domain + application logic for the announcement relay.
//!
//! Telegram, DeepSeek and X live behind ports (traits) implemented in adapter
//! crates; everything here runs against those ports.

pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod language;
pub mod logging;
pub mod pipeline;
pub mod ports;
pub mod publisher;
pub mod retry;
pub mod state;
pub mod translator;

pub use errors::{Error, Result};
