//! Command line of the `qkme-node` binary

mod commands;

pub use commands::{run, Cli, Commands};
