// SPDX-License-Identifier: Apache-2.0

//! logship: a log-shipping engine.
//!
//! Tails append-only files, splits their byte stream into delimited entries
//! (blocks), binds each block into a typed record through a declarative
//! form, and delivers batches to a pluggable sink, durably tracking how much
//! of each file has been consumed. Restarts never re-read shipped data
//! (beyond crash-window at-least-once duplicates) and never silently drop
//! unread data.

pub mod block;
pub mod bounded_channel;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod form;
pub mod lock;
pub mod monitor;
pub mod position;
pub mod sink;
pub mod source;

pub use channel::{Channel, CycleOutcome, CycleReport};
pub use config::{Config, Context, Engine, Overrides};
pub use error::{Error, Result};
pub use monitor::{Monitor, MonitorConfig};
