//! CLI command implementations.

pub mod check;
pub mod drain;
pub mod pull;
pub mod queue;
pub mod status;
