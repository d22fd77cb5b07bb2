//! Test fixtures for cross-node mesh scenarios.

pub mod two_node;
