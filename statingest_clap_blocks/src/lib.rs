//! Building blocks for the [`clap`]-driven configuration of statingest.
//!
//! Each block is a `#[derive(clap::Parser)]` struct meant to be `#[clap(flatten)]`ed into a
//! subcommand's config. Every flag can also be set through an environment variable.

pub mod ingest;
pub mod logging;
pub mod socket_addr;
pub mod tokio;
