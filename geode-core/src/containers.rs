//! Hot-path container aliases used by runtime state tables.
//!
//! Container choices for scheduler and lock-table hot paths are centralized here so future
//! allocator/container upgrades can be done in one place without touching logic modules.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by module-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by secondary indexes.
pub type HotSet<T> = HbSet<T>;
