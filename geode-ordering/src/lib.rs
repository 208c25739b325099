//! Deterministic log merging for one partition.
//!
//! The interleaver combines the local region's Paxos-ordered batch stream with single-home
//! logs replicated from every other region and the pre-ordered multi-home log, and emits
//! transactions toward the scheduler in a total order that every replica derives identically.

pub mod batch_log;
pub mod interleaver;
pub mod local_log;
pub mod slot_buffer;
