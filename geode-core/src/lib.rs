//! Core runtime abstractions shared by the ordering and scheduling layers.
//!
//! The crate holds the transaction/batch data model, the internal message vocabulary, and the
//! in-process broker plus module runner that every partition-local module is built on.

pub mod broker;
pub mod containers;
pub mod message;
pub mod module;
pub mod txn;
