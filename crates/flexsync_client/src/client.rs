//! The sync client: owner of the event loop and the transport.

use crate::config::ClientConfig;
use crate::endpoint::{decompose_server_url, DecomposedUrl};
use crate::error::{LogicError, SyncResult};
use crate::event_loop::{Command, EventLoop};
use crate::transport::SyncTransport;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

#[derive(Debug, Default)]
struct Lifecycle {
    running: bool,
    stopped: bool,
    terminations_initiated: u64,
    terminations_completed: u64,
}

pub(crate) struct ClientShared {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn SyncTransport>,
    tx: UnboundedSender<Command>,
    rx: Mutex<Option<UnboundedReceiver<Command>>>,
    last_session_ident: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
}

impl ClientShared {
    /// Queues a command. If the event loop has stopped the command is
    /// abandoned on the calling thread.
    pub(crate) fn post(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            command.abandon(self);
        }
    }

    pub(crate) fn sender(&self) -> UnboundedSender<Command> {
        self.tx.clone()
    }

    pub(crate) fn next_session_ident(&self) -> u64 {
        self.last_session_ident.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn termination_initiated(&self) {
        self.lifecycle.lock().terminations_initiated += 1;
    }

    pub(crate) fn termination_completed(&self) {
        self.lifecycle.lock().terminations_completed += 1;
        self.lifecycle_changed.notify_all();
    }
}

/// A sync client.
///
/// The client multiplexes the sessions bound to it over shared connections,
/// one per server endpoint unless configured otherwise. Nothing happens until
/// some thread calls [`run`](Self::run), which executes the event loop until
/// [`shutdown`](Self::shutdown).
///
/// Cloning is cheap; clones share the same event loop.
///
/// # Example
///
/// ```ignore
/// use flexsync_client::{Client, ClientConfig, MockTransport, Session, SessionConfig};
/// use flexsync_storage::Database;
/// use std::sync::Arc;
///
/// let client = Client::new(ClientConfig::new(), Arc::new(MockTransport::new()));
/// let runner = client.clone();
/// let thread = std::thread::spawn(move || runner.run());
///
/// let mut session = Session::new(&client, Database::open_in_memory(), SessionConfig::new("localhost", "/data"));
/// session.bind()?;
/// session.wait_for_download_complete_or_client_stopped()?;
///
/// drop(session);
/// client.shutdown_and_wait();
/// thread.join().unwrap()?;
/// ```
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Creates a client that connects through `transport`.
    pub fn new(config: ClientConfig, transport: Arc<dyn SyncTransport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(ClientShared {
                config,
                transport,
                tx,
                rx: Mutex::new(Some(rx)),
                last_session_ident: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
                lifecycle_changed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Runs the event loop on the calling thread until shutdown.
    ///
    /// Can be called once per client; later calls fail with
    /// [`LogicError::ClientAlreadyRunning`].
    pub fn run(&self) -> SyncResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("flexsync-client")
            .build()?;
        let rx = {
            let mut lifecycle = self.shared.lifecycle.lock();
            let rx = self
                .shared
                .rx
                .lock()
                .take()
                .ok_or(LogicError::ClientAlreadyRunning)?;
            lifecycle.running = true;
            rx
        };

        runtime.block_on(EventLoop::new(Arc::clone(&self.shared), rx).run());
        drop(runtime);

        let mut lifecycle = self.shared.lifecycle.lock();
        lifecycle.running = false;
        lifecycle.stopped = true;
        drop(lifecycle);
        self.shared.lifecycle_changed.notify_all();
        debug!("sync client run returned");
        Ok(())
    }

    /// Returns true while [`run`](Self::run) executes.
    pub fn is_running(&self) -> bool {
        self.shared.lifecycle.lock().running
    }

    /// Asks the event loop to stop. Commands queued earlier are handled
    /// first; sessions still bound then have their waits aborted.
    pub fn shutdown(&self) {
        self.shared.post(Command::Shutdown);
    }

    /// Like [`shutdown`](Self::shutdown), then blocks until `run` returned.
    /// Returns at once if `run` is not executing.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        let mut lifecycle = self.shared.lifecycle.lock();
        while lifecycle.running {
            self.shared.lifecycle_changed.wait(&mut lifecycle);
        }
    }

    /// Skips the reconnect delay of every server endpoint and resumes
    /// sessions waiting to retry after an error.
    pub fn cancel_reconnect_delay(&self) {
        self.shared
            .post(Command::CancelReconnectDelay { session: None });
    }

    /// Blocks until every session detached before this call has been torn
    /// down on the event loop. Returns false if the client stopped first.
    pub fn wait_for_session_terminations_or_client_stopped(&self) -> bool {
        let mut lifecycle = self.shared.lifecycle.lock();
        let target = lifecycle.terminations_initiated;
        while lifecycle.terminations_completed < target && !lifecycle.stopped {
            self.shared.lifecycle_changed.wait(&mut lifecycle);
        }
        lifecycle.terminations_completed >= target
    }

    /// Splits a server URL into endpoint and path. See
    /// [`decompose_server_url`](crate::decompose_server_url).
    pub fn decompose_server_url(url: &str) -> Option<DecomposedUrl> {
        decompose_server_url(url)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use std::thread;

    fn client() -> Client {
        Client::new(ClientConfig::new(), Arc::new(MockTransport::new()))
    }

    #[test]
    fn run_twice_fails() {
        let client = client();
        let runner = client.clone();
        let handle = thread::spawn(move || runner.run());
        client.shutdown();
        handle.join().unwrap().unwrap();

        let err = client.run().unwrap_err();
        assert_eq!(err.as_logic_error(), Some(&LogicError::ClientAlreadyRunning));
    }

    #[test]
    fn shutdown_and_wait_without_run() {
        let client = client();
        client.shutdown_and_wait();
        assert!(!client.is_running());
        assert!(client.wait_for_session_terminations_or_client_stopped());
    }

    #[test]
    fn shutdown_and_wait_blocks_until_stopped() {
        let client = client();
        let runner = client.clone();
        let handle = thread::spawn(move || runner.run());
        while !client.is_running() {
            thread::yield_now();
        }
        client.shutdown_and_wait();
        assert!(!client.is_running());
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn decomposes_urls() {
        let url = Client::decompose_server_url("realms://sync.example.com/app").unwrap();
        assert_eq!(url.endpoint.port, 7801);
        assert_eq!(url.path, "/app");
    }
}
