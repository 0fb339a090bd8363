//! Per-node traffic tapper.
//!
//! Frames from one or more [`capture`] sources are decoded (with IPv4
//! defragmentation), reassembled per TCP connection by the [`assembler`]
//! and handed to a pair of [`reader`] threads per tapped stream. Readers
//! run the protocol dissectors, which pair requests with responses and emit
//! [`tap_api::Exchange`]s into the [`emitter`]. The [`pipeline`] wires it
//! together and owns shutdown.

pub mod assembler;
pub mod capture;
pub mod cleaner;
pub mod config;
pub mod control;
pub mod defrag;
pub mod emitter;
pub mod factory;
pub mod har;
pub mod packet;
pub mod pipeline;
pub mod reader;
pub mod registry;
pub mod stats;
pub mod stream;
pub mod target;
pub mod tls;

pub use config::{ConfigError, TapperConfig};
pub use pipeline::{Pipeline, PipelineError, ShutdownSummary};
