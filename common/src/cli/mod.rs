//! CLI-related shared utilities.
//!
//! The `rendezvous`, `punch` and `callpeer` binaries all accept the same
//! `--color` flag; the policy lives here so they agree.

mod color;

pub use color::ColorWhen;
