//! Client for the external amp CLI.
//!
//! The agent is a stream-producing binary with a fixed protocol:
//! `amp --execute <prompt> --stream-json --settings-file <path> --mode <m>`
//! writes newline-delimited JSON to stdout. This crate owns the pieces
//! around that invocation:
//!
//! - [`permissions`]: the static allow/reject rule list
//! - [`settings`]: ephemeral settings files (permissions + extension servers)
//! - [`message`]: NDJSON stream decoding
//! - [`client`]: spawn, stream, cancel, reap; the [`AgentExecutor`] seam

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;
pub mod message;
pub mod permissions;
pub mod settings;

pub use client::{AgentExecutor, AmpClient, ExecuteOptions, ExecuteResult, OnMessage};
pub use error::AmpError;
pub use message::{AssistantMessage, ContentBlock, ResultMessage, StreamMessage, SystemMessage, Usage};
pub use permissions::{default_rules, PermissionRule};
pub use settings::{ServerConfig, SettingsFile};
