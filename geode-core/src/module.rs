//! Module trait and the thread runner driving each module's event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use geode_common::constants::MODULE_POLL_TIMEOUT_MS;
use geode_common::error::{GeodeError, GeodeResult};
use geode_common::ids::MachineIdNum;

use crate::message::{Envelope, Message, Request, Response};

/// A single-threaded module driven by its mailbox.
///
/// Handlers run to completion on one message before the loop polls again; all module state is
/// owned by the module itself, so there is no shared-state concurrency inside a module.
pub trait NetworkedModule: Send {
    /// Thread name for diagnostics.
    fn name(&self) -> &'static str;

    /// One-time setup before the first poll.
    fn initialize(&mut self) {}

    /// Handles one request.
    fn handle_request(&mut self, request: Request, from: MachineIdNum);

    /// Handles one response. Modules that never receive responses keep the default no-op.
    fn handle_response(&mut self, response: Response, from: MachineIdNum) {
        let _ = (response, from);
    }
}

/// Owns the thread running one module's poll loop.
///
/// Dropping the runner requests shutdown and joins the thread; the flag is observed at the
/// poll boundary, so an in-flight handler always finishes first.
#[derive(Debug)]
pub struct ModuleRunner {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ModuleRunner {
    /// Spawns the module on a dedicated named thread.
    ///
    /// # Errors
    ///
    /// Returns `GeodeError::InvalidState` when the OS refuses to spawn the thread.
    pub fn spawn<M: NetworkedModule + 'static>(
        mut module: M,
        receiver: Receiver<Envelope>,
    ) -> GeodeResult<Self> {
        let name = module.name();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_loop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name(format!("geode-{name}"))
            .spawn(move || {
                module.initialize();
                module_loop(&mut module, &receiver, &shutdown_for_loop);
            })
            .map_err(|_| GeodeError::InvalidState("module thread spawn failed"))?;
        Ok(Self {
            name,
            shutdown,
            handle: Some(handle),
        })
    }

    /// Name of the module owned by this runner.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Requests shutdown and joins the module thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ModuleRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn module_loop<M: NetworkedModule>(
    module: &mut M,
    receiver: &Receiver<Envelope>,
    shutdown: &AtomicBool,
) {
    let poll_timeout = Duration::from_millis(MODULE_POLL_TIMEOUT_MS);
    loop {
        if shutdown.load(Ordering::Acquire) {
            debug!(module = module.name(), "module loop shutting down");
            break;
        }
        match receiver.recv_timeout(poll_timeout) {
            Ok(envelope) => match envelope.message {
                Message::Request(request) => module.handle_request(request, envelope.from),
                Message::Response(response) => module.handle_response(response, envelope.from),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!(module = module.name(), "module mailbox disconnected");
                break;
            }
        }
    }
}
