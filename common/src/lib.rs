//! Common types shared by the traversal, media and session crates.
//!
//! This crate provides the endpoint descriptors exchanged during call setup,
//! the configuration model, and the observability/CLI policy used by every
//! binary in the workspace.

pub mod cli;
pub mod config;
pub mod endpoint;
pub mod observability;

pub use cli::ColorWhen;
pub use config::{
    AudioConfig, CallConfig, PunchConfig, ReassemblyConfig, RendezvousConfig, StunConfig,
    VideoConfig,
};
pub use endpoint::{Endpoint, EndpointPair, EndpointParseError};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
