//! Event loops and event loop groups
//!
//! An `EventLoop` is one dedicated OS thread driving a current-thread tokio
//! reactor. Sockets and timers live on the loop that accepted them, so all
//! callbacks for a connection run serially on one thread. Cross-loop work is
//! submitted through the loop's runtime handle and completes asynchronously;
//! the submitter never blocks on another loop.

use crate::common::NamedSet;
use crate::registry::ConnectionRegistry;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A named single-threaded reactor.
#[derive(Debug)]
pub struct EventLoop {
    name: String,
    label: String,
    handle: Handle,
    cancel: CancellationToken,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EventLoop {
    /// Spin up the loop thread and wait for its reactor to come online.
    fn start(group: &str, name: &str) -> Result<Arc<Self>> {
        let label = format!("{}/{}", group, name);
        let cancel = CancellationToken::new();
        let thread_cancel = cancel.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("loop-{}", label))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(runtime.handle().clone()));
                // Parks until the loop is told to stop; spawned tasks are
                // driven in the meantime. Dropping the runtime afterwards
                // cancels whatever is still registered on this reactor.
                runtime.block_on(thread_cancel.cancelled());
            })?;

        let handle = rx
            .recv()
            .map_err(|_| Error::io_error("event loop thread exited during startup"))??;

        debug!("event loop {} started", label);

        Ok(Arc::new(EventLoop {
            name: name.to_string(),
            label,
            handle,
            cancel,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ownership tag, `group/loop`, used to scope registry entries.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Submit work to this loop. The future runs on the loop's thread.
    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    /// Stop the reactor and join its thread. Sockets still owned by the
    /// loop must have been closed through the registry beforehand.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(t) = self.thread.lock().take() {
            let _ = t.join();
        }
        debug!("event loop {} stopped", self.label);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Named, ordered pool of event loops with round-robin assignment.
pub struct EventLoopGroup {
    name: String,
    loops: RwLock<NamedSet<Arc<EventLoop>>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(EventLoopGroup {
            name: name.to_string(),
            loops: RwLock::new(NamedSet::new("event-loop")),
            next: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a loop. Fails AlreadyExists before any thread is spawned.
    pub fn add_loop(&self, name: &str) -> Result<Arc<EventLoop>> {
        let mut loops = self.loops.write();
        if loops.contains(name) {
            return Err(Error::already_exists(format!("event-loop {}", name)));
        }
        let el = EventLoop::start(&self.name, name)?;
        loops.insert(name.to_string(), el.clone())?;
        info!("event loop {} added", el.label());
        Ok(el)
    }

    /// Remove a loop: close every connection it owns, then stop the reactor.
    pub fn remove_loop(&self, name: &str, registry: &ConnectionRegistry) -> Result<()> {
        let el = self.loops.write().remove(name)?;
        let closed = registry.close_loop(el.label());
        if closed > 0 {
            info!("event loop {}: closed {} connections", el.label(), closed);
        }
        el.stop();
        info!("event loop {} removed", el.label());
        Ok(())
    }

    pub fn get_loop(&self, name: &str) -> Result<Arc<EventLoop>> {
        self.loops.read().require(name).map(Arc::clone)
    }

    /// Loops in creation order.
    pub fn list(&self) -> Vec<Arc<EventLoop>> {
        self.loops.read().iter().cloned().collect()
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.loops.read().names()
    }

    pub fn len(&self) -> usize {
        self.loops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.read().is_empty()
    }

    /// Round-robin assignment for new connections and timers.
    pub fn next_loop(&self) -> Result<Arc<EventLoop>> {
        let loops = self.loops.read();
        if loops.is_empty() {
            return Err(Error::not_found(format!(
                "no event loop in group {}",
                self.name
            )));
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        let chosen = loops.iter().nth(idx).expect("index within len").clone();
        Ok(chosen)
    }

    /// Stop every loop, closing owned connections first.
    pub fn stop_all(&self, registry: &ConnectionRegistry) {
        let names = self.loop_names();
        for name in names {
            let _ = self.remove_loop(&name, registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_duplicate_loop_fails() {
        let group = EventLoopGroup::new("elg0");
        group.add_loop("el0").unwrap();
        let err = group.add_loop("el0").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(group.len(), 1);
        let registry = ConnectionRegistry::new();
        group.stop_all(&registry);
    }

    #[test]
    fn test_remove_missing_loop_fails() {
        let group = EventLoopGroup::new("elg0");
        assert!(group.remove_loop("el0", &ConnectionRegistry::new()).is_err());
    }

    #[test]
    fn test_list_preserves_creation_order() {
        let group = EventLoopGroup::new("elg0");
        group.add_loop("b").unwrap();
        group.add_loop("a").unwrap();
        assert_eq!(group.loop_names(), vec!["b", "a"]);
        group.stop_all(&ConnectionRegistry::new());
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let group = EventLoopGroup::new("elg0");
        group.add_loop("el0").unwrap();
        group.add_loop("el1").unwrap();

        let first = group.next_loop().unwrap();
        let second = group.next_loop().unwrap();
        let third = group.next_loop().unwrap();
        assert_eq!(first.name(), "el0");
        assert_eq!(second.name(), "el1");
        assert_eq!(third.name(), "el0");

        group.stop_all(&ConnectionRegistry::new());
    }

    #[tokio::test]
    async fn test_submitted_work_runs_on_loop_thread() {
        let group = EventLoopGroup::new("elg0");
        let el = group.add_loop("el0").unwrap();

        let joined = el
            .spawn(async { thread::current().name().map(str::to_string) })
            .await
            .unwrap();
        assert_eq!(joined.as_deref(), Some("loop-elg0/el0"));

        group.stop_all(&ConnectionRegistry::new());
    }
}
