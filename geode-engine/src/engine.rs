//! One partition's module stack: interleaver, scheduler, and worker shards.

use std::sync::Arc;

use tracing::debug;

use geode_common::config::Configuration;
use geode_common::error::GeodeResult;
use geode_common::ids::Channel;
use geode_core::broker::{Network, Sender};
use geode_core::module::ModuleRunner;
use geode_ordering::interleaver::Interleaver;
use geode_scheduler::scheduler::Scheduler;
use geode_scheduler::worker::Worker;
use geode_storage::Storage;

/// Owns the running modules of one partition-local process.
///
/// Construction registers every mailbox before any module thread starts, so messages sent
/// during startup cannot race a missing registration. Dropping the engine shuts the modules
/// down in reverse dependency order.
pub struct PartitionEngine {
    config: Arc<Configuration>,
    sender: Sender,
    runners: Vec<ModuleRunner>,
}

impl PartitionEngine {
    /// Registers and starts the partition's modules on the shared network.
    ///
    /// # Errors
    ///
    /// Returns an error when a mailbox address is already taken or a module thread cannot be
    /// spawned.
    pub fn start(
        config: Arc<Configuration>,
        network: Arc<Network>,
        storage: Arc<dyn Storage>,
    ) -> GeodeResult<Self> {
        let machine = config.local_machine_id_num();
        let sender = Sender::new(Arc::clone(&network), machine);

        let interleaver_mailbox = network.register(machine, Channel::Interleaver)?;
        let scheduler_mailbox = network.register(machine, Channel::Scheduler)?;
        let mut worker_mailboxes = Vec::new();
        for worker_index in 0..config.num_workers {
            worker_mailboxes.push(network.register(machine, Channel::Worker(worker_index))?);
        }

        let mut runners = Vec::new();
        runners.push(ModuleRunner::spawn(
            Interleaver::new(Arc::clone(&config), sender.clone()),
            interleaver_mailbox,
        )?);
        runners.push(ModuleRunner::spawn(
            Scheduler::new(Arc::clone(&config), sender.clone(), Arc::clone(&storage)),
            scheduler_mailbox,
        )?);
        for (worker_index, mailbox) in (0..config.num_workers).zip(worker_mailboxes) {
            runners.push(ModuleRunner::spawn(
                Worker::new(
                    worker_index,
                    Arc::clone(&config),
                    sender.clone(),
                    Arc::clone(&storage),
                ),
                mailbox,
            )?);
        }

        debug!(machine, "partition engine started");
        Ok(Self {
            config,
            sender,
            runners,
        })
    }

    /// Configuration this engine runs under.
    #[must_use]
    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Sending handle bound to this engine's machine.
    #[must_use]
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// Stops every module thread, workers first.
    pub fn shutdown(&mut self) {
        while let Some(mut runner) = self.runners.pop() {
            runner.shutdown();
        }
    }
}

impl Drop for PartitionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
