//! Immutable process configuration shared by every module at bootstrap.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::constants::MAX_NUM_MACHINES;
use crate::error::{GeodeError, GeodeResult};
use crate::ids::{MachineId, MachineIdNum, PartitionId, ReplicaId};

/// Remaster protocol selected for the deployment.
///
/// The protocol decides whether the scheduler runs a remaster manager in front of the lock
/// manager and whether the lock manager itself validates per-key master counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemasterProtocol {
    /// No remaster tracking at all.
    None,
    /// Counter validation with one wait queue per origin region.
    Simple,
    /// Counter validation with one wait queue per key.
    PerKey,
    /// No remaster manager; the lock manager validates counters instead.
    Counterless,
}

/// Strategy used to resolve key ownership to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    /// Deterministic hash of the key bytes. Production default.
    Hash,
    /// Numeric prefix of the key modulo partition count. Used by deterministic test setups
    /// where key placement must be controlled exactly; non-numeric keys fall back to hashing.
    Modulo,
}

/// Immutable configuration describing one partition-local process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// Number of regions replicating the full dataset.
    pub num_replicas: u32,
    /// Number of partitions per region.
    pub num_partitions: u32,
    /// Region this process belongs to.
    pub local_replica: ReplicaId,
    /// Partition this process owns.
    pub local_partition: PartitionId,
    /// Number of executor shards owned by the scheduler.
    pub num_workers: u32,
    /// Remaster protocol for the deployment.
    pub remaster_protocol: RemasterProtocol,
    /// Key-to-partition resolution strategy.
    pub partitioning: Partitioning,
}

impl Configuration {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidConfig` when any count is zero, the local coordinates are
    /// out of range, or the deployment exceeds [`MAX_NUM_MACHINES`].
    pub fn new(
        num_replicas: u32,
        num_partitions: u32,
        local_replica: ReplicaId,
        local_partition: PartitionId,
        num_workers: u32,
        remaster_protocol: RemasterProtocol,
        partitioning: Partitioning,
    ) -> GeodeResult<Self> {
        if num_replicas == 0 || num_partitions == 0 {
            return Err(GeodeError::InvalidConfig(
                "replica and partition counts must be non-zero",
            ));
        }
        if num_workers == 0 {
            return Err(GeodeError::InvalidConfig("worker count must be non-zero"));
        }
        if local_replica >= num_replicas || local_partition >= num_partitions {
            return Err(GeodeError::InvalidConfig(
                "local machine coordinates are out of range",
            ));
        }
        if num_replicas.saturating_mul(num_partitions) > MAX_NUM_MACHINES {
            return Err(GeodeError::InvalidConfig(
                "deployment exceeds the machine address space",
            ));
        }
        Ok(Self {
            num_replicas,
            num_partitions,
            local_replica,
            local_partition,
            num_workers,
            remaster_protocol,
            partitioning,
        })
    }

    /// Packs a (replica, partition) pair into its numeric machine address.
    #[must_use]
    pub fn machine_id_num(&self, replica: ReplicaId, partition: PartitionId) -> MachineIdNum {
        self.num_partitions * replica + partition
    }

    /// Unpacks a numeric machine address into (replica, partition).
    #[must_use]
    pub fn unpack_machine_id(&self, machine: MachineIdNum) -> MachineId {
        MachineId {
            replica: machine / self.num_partitions,
            partition: machine % self.num_partitions,
        }
    }

    /// Numeric address of the local machine.
    #[must_use]
    pub fn local_machine_id_num(&self) -> MachineIdNum {
        self.machine_id_num(self.local_replica, self.local_partition)
    }

    /// Returns the partition owning the given key.
    #[must_use]
    pub fn partition_of_key(&self, key: &str) -> PartitionId {
        match self.partitioning {
            Partitioning::Modulo => {
                if let Ok(numeric) = key.parse::<u64>() {
                    return Self::narrow_partition(numeric % u64::from(self.num_partitions));
                }
                self.hash_partition_of_key(key)
            }
            Partitioning::Hash => self.hash_partition_of_key(key),
        }
    }

    /// Returns whether the local partition owns the given key.
    #[must_use]
    pub fn is_local_partition(&self, key: &str) -> bool {
        self.partition_of_key(key) == self.local_partition
    }

    fn hash_partition_of_key(&self, key: &str) -> PartitionId {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self::narrow_partition(hasher.finish() % u64::from(self.num_partitions))
    }

    fn narrow_partition(partition: u64) -> PartitionId {
        match PartitionId::try_from(partition) {
            Ok(partition) => partition,
            Err(_) => unreachable!("modulo num_partitions ensures partition id fits into u32"),
        }
    }
}
