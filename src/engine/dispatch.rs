//! Cross-thread dispatch onto an engine loop.
//!
//! Any thread may queue a closure for the engine loop through an
//! [`EngineHandle`]. Closures run one at a time on the loop thread, in the
//! order they were queued, each exactly once. Closures queued before the loop
//! starts wait in the mailbox until it does.

use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::Engine;

pub(crate) type EngineTask = Box<dyn FnOnce(&mut Engine) + Send>;

type DefaultTask = Box<dyn FnOnce() + Send>;

/// Name of the thread running [`dispatch_default`] closures.
pub const DEFAULT_LOOP_THREAD: &str = "tunnelgate-default";

struct Shared {
    /// `None` once the loop has exited.
    sender: Mutex<Option<mpsc::UnboundedSender<EngineTask>>>,
}

/// Cloneable, thread-safe handle to an engine loop.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<EngineTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(tx)),
            }),
        };
        (handle, rx)
    }

    /// Run `f` on the engine loop. Returns `false` if the loop is gone, in
    /// which case `f` is dropped without running.
    pub fn dispatch<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Engine) + Send + 'static,
    {
        let sender = self.shared.sender.lock();
        let Some(tx) = sender.as_ref() else {
            tracing::error!("Engine loop has stopped, dropping dispatched call");
            return false;
        };
        if tx.send(Box::new(f)).is_err() {
            tracing::error!("Engine mailbox closed, dropping dispatched call");
            return false;
        }
        true
    }

    /// Shut the engine down and end its loop.
    pub fn stop(&self) -> bool {
        self.dispatch(Engine::shutdown)
    }

    /// Whether the loop still accepts calls.
    pub fn is_open(&self) -> bool {
        self.shared
            .sender
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Resolve `dest` and exclude the resulting addresses from interception.
    pub async fn exclude_route(&self, dest: &str) -> bool {
        let mut addrs: Vec<IpAddr> = match tokio::net::lookup_host((dest, 0)).await {
            Ok(resolved) => resolved.map(|a| a.ip()).collect(),
            Err(e) => {
                tracing::warn!(dest, error = %e, "Failed to resolve route exclusion");
                return false;
            }
        };
        addrs.sort_unstable();
        addrs.dedup();

        let dest = dest.to_string();
        self.dispatch(move |engine| engine.exclude_resolved(&dest, &addrs))
    }

    pub(crate) fn close(&self) {
        self.shared.sender.lock().take();
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").field("open", &self.is_open()).finish()
    }
}

static DEFAULT_LOOP: Lazy<Mutex<Option<mpsc::UnboundedSender<DefaultTask>>>> = Lazy::new(|| Mutex::new(None));

/// Run `f` on the process-wide default loop, starting it on first use.
/// Returns `false` if the loop could not be started.
pub fn dispatch_default<F>(f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let mut sender = DEFAULT_LOOP.lock();
    if sender.as_ref().map_or(true, |tx| tx.is_closed()) {
        match start_default_loop() {
            Ok(tx) => *sender = Some(tx),
            Err(e) => {
                tracing::error!(error = %e, "Failed to start default loop");
                return false;
            }
        }
    }
    sender.as_ref().is_some_and(|tx| tx.send(Box::new(f)).is_ok())
}

fn start_default_loop() -> std::io::Result<mpsc::UnboundedSender<DefaultTask>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<DefaultTask>();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    std::thread::Builder::new()
        .name(DEFAULT_LOOP_THREAD.to_string())
        .spawn(move || {
            runtime.block_on(async move {
                while let Some(task) = rx.recv().await {
                    task();
                }
            });
        })?;

    tracing::debug!("Started default loop");
    Ok(tx)
}
