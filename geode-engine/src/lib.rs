//! Partition-local process assembly.
//!
//! Wires one partition's interleaver, scheduler, and worker shards onto a shared in-process
//! network and owns their lifecycles.

pub mod engine;
