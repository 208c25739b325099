//! In-process message routing between modules and machines.
//!
//! A [`Network`] is the registry of every mailbox in the process: unit tests and single-host
//! deployments register several logical machines on one network, and the socket transport that
//! would bridge real machines stays an external collaborator. Sending never blocks; messages
//! to unregistered destinations are logged and dropped, mirroring how the wire transport deals
//! with unroutable traffic.

use std::sync::mpsc::{Receiver, Sender as MpscSender, channel};
use std::sync::{Arc, Mutex};

use tracing::warn;

use geode_common::error::{GeodeError, GeodeResult};
use geode_common::ids::{Channel, MachineIdNum};

use crate::containers::HotMap;
use crate::message::{Envelope, Message};

/// Registry of mailboxes keyed by `(machine, channel)`.
#[derive(Debug, Default)]
pub struct Network {
    mailboxes: Mutex<HotMap<(MachineIdNum, Channel), MpscSender<Envelope>>>,
}

impl Network {
    /// Creates an empty network shared between machines of one process.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a mailbox and returns its receiving end.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidState` when the `(machine, channel)` address is taken.
    pub fn register(
        &self,
        machine: MachineIdNum,
        channel_id: Channel,
    ) -> GeodeResult<Receiver<Envelope>> {
        let mut mailboxes = self
            .mailboxes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if mailboxes.contains_key(&(machine, channel_id)) {
            return Err(GeodeError::InvalidState(
                "mailbox address is already registered",
            ));
        }
        let (sender, receiver) = channel::<Envelope>();
        let _ = mailboxes.insert((machine, channel_id), sender);
        Ok(receiver)
    }

    fn route(&self, to_machine: MachineIdNum, to_channel: Channel, envelope: Envelope) {
        let sender = {
            let mailboxes = self
                .mailboxes
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            mailboxes.get(&(to_machine, to_channel)).cloned()
        };
        let Some(sender) = sender else {
            warn!(
                machine = to_machine,
                ?to_channel,
                "dropping message to unregistered mailbox"
            );
            return;
        };
        if sender.send(envelope).is_err() {
            warn!(
                machine = to_machine,
                ?to_channel,
                "dropping message to closed mailbox"
            );
        }
    }
}

/// Sending handle bound to one machine, shared by all of that machine's modules.
#[derive(Debug, Clone)]
pub struct Sender {
    network: Arc<Network>,
    local_machine: MachineIdNum,
}

impl Sender {
    /// Creates a sending handle for the given machine.
    #[must_use]
    pub fn new(network: Arc<Network>, local_machine: MachineIdNum) -> Self {
        Self {
            network,
            local_machine,
        }
    }

    /// Machine this handle sends on behalf of.
    #[must_use]
    pub fn local_machine(&self) -> MachineIdNum {
        self.local_machine
    }

    /// Sends one message to a channel on the local machine.
    pub fn send(&self, message: Message, to_channel: Channel) {
        self.send_to(message, to_channel, self.local_machine);
    }

    /// Sends one message to a channel on an arbitrary machine.
    pub fn send_to(&self, message: Message, to_channel: Channel, to_machine: MachineIdNum) {
        self.network.route(
            to_machine,
            to_channel,
            Envelope {
                from: self.local_machine,
                message,
            },
        );
    }
}
