//! Shared test helpers for thruflux.
//!
//! Provides an in-memory lossless datagram link for driving two
//! `ConnectionDriver`s against each other deterministically, plus small
//! file-tree fixtures for transfer tests.

pub mod link;
pub mod tree;

pub use link::{run_to_completion, QueuePacketSink};
pub use tree::{fill, read_tree, write_file};
