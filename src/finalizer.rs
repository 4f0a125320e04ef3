//! Deferred release of remote references.
//!
//! Dropping the last handle to a peer-owned object must not block or do
//! I/O, so [`RemoteObject`] drops only enqueue a task here. A single
//! background worker drains the queue and sends the RELEASE commands;
//! failures are logged and never raised, since the peer cleans up on
//! disconnect anyway.
//!
//! The queue is FIFO. Shutdown enqueues a [`FinalizeTask::Stop`] sentinel,
//! so the worker finishes every release queued before shutdown began and
//! then exits.
//!
//! [`RemoteObject`]: crate::object::RemoteObject

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::object::{BoxFuture, RemoteInner};
use crate::protocol::ObjectId;

/// Sink for RELEASE commands, implemented by the per-mode clients.
///
/// Takes `self: Arc<Self>` so a queued task can own its sender across the
/// await without borrowing.
pub trait ReleaseSender: Send + Sync + 'static {
    /// Send a RELEASE for `id` to the peer that owns it.
    fn send_release(self: Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<()>>;
}

/// Work item for the finalizer worker.
pub enum FinalizeTask {
    /// Release one remote reference through its owning client.
    Release {
        owner: Arc<dyn ReleaseSender>,
        id: ObjectId,
    },
    /// Drain everything enqueued so far, then exit.
    Stop,
}

/// Sending half of the finalizer queue.
#[derive(Clone)]
pub struct FinalizeHandle {
    tx: mpsc::UnboundedSender<FinalizeTask>,
}

impl FinalizeHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<FinalizeTask>) -> Self {
        Self { tx }
    }

    /// Enqueue without blocking. Safe to call from Drop.
    pub(crate) fn enqueue(&self, task: FinalizeTask) {
        if self.tx.send(task).is_err() {
            debug!("Finalizer already stopped; dropping release task");
        }
    }

    /// Enqueue the stop sentinel.
    pub(crate) fn stop(&self) {
        let _ = self.tx.send(FinalizeTask::Stop);
    }
}

/// Spawn the finalizer worker task.
///
/// Returns the queue handle and the worker's join handle. The worker runs
/// until it sees [`FinalizeTask::Stop`] or every handle is dropped.
pub fn spawn_finalizer() -> (FinalizeHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        debug!("Finalizer worker started");

        while let Some(task) = rx.recv().await {
            match task {
                FinalizeTask::Release { owner, id } => match owner.send_release(id).await {
                    Ok(()) => debug!("Released remote reference {}", id),
                    Err(e) => warn!("Failed to release remote reference {}: {}", id, e),
                },
                FinalizeTask::Stop => break,
            }
        }

        debug!("Finalizer worker stopped");
    });

    (FinalizeHandle::new(tx), task)
}

/// Table of live remote handles, keyed by registration.
///
/// Each tracked [`RemoteObject`] holds a key into this table; its entry is
/// consumed exactly once, by whichever of drop, explicit release or
/// teardown sweep gets there first. Consuming the entry is what arms (or
/// disarms) the release, so a handle never releases twice.
///
/// [`RemoteObject`]: crate::object::RemoteObject
#[derive(Clone)]
pub struct FinalizerTable {
    inner: Arc<Mutex<TableInner>>,
}

struct TableInner {
    entries: HashMap<u64, Weak<RemoteInner>>,
    next_key: u64,
}

impl FinalizerTable {
    /// Create an empty table.
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                entries: HashMap::new(),
                next_key: 0,
            })),
        }
    }

    /// Register a handle and return its key.
    pub(crate) fn add(&self, handle: Weak<RemoteInner>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.next_key;
        inner.next_key += 1;
        inner.entries.insert(key, handle);
        key
    }

    /// Consume an entry. True if it was still present.
    pub(crate) fn remove(&self, key: u64) -> bool {
        self.inner.lock().unwrap().entries.remove(&key).is_some()
    }

    /// Evict entries. `force` clears everything, disarming every pending
    /// drop notification (used at teardown, when the releases could no
    /// longer be delivered anyway); otherwise only entries whose handle
    /// already died are evicted.
    pub(crate) fn sweep(&self, force: bool) {
        let mut inner = self.inner.lock().unwrap();
        if force {
            inner.entries.clear();
        } else {
            inner.entries.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    /// Number of live registrations.
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender {
        sent: Mutex<Vec<ObjectId>>,
        failures: AtomicUsize,
        fail: bool,
    }

    impl CountingSender {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl ReleaseSender for CountingSender {
        fn send_release(self: Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                if self.fail {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                    return Err(crate::error::ObjwireError::ConnectionClosed);
                }
                self.sent.lock().unwrap().push(id);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_worker_drains_in_order_then_stops() {
        let (handle, worker) = spawn_finalizer();
        let owner = CountingSender::new(false);

        for n in 1..=3 {
            handle.enqueue(FinalizeTask::Release {
                owner: owner.clone(),
                id: ObjectId::new(n),
            });
        }
        handle.stop();

        worker.await.unwrap();
        assert_eq!(
            *owner.sent.lock().unwrap(),
            vec![ObjectId::new(1), ObjectId::new(2), ObjectId::new(3)]
        );
    }

    #[tokio::test]
    async fn test_worker_survives_send_failures() {
        let (handle, worker) = spawn_finalizer();
        let failing = CountingSender::new(true);
        let working = CountingSender::new(false);

        handle.enqueue(FinalizeTask::Release {
            owner: failing.clone(),
            id: ObjectId::new(1),
        });
        handle.enqueue(FinalizeTask::Release {
            owner: working.clone(),
            id: ObjectId::new(2),
        });
        handle.stop();

        worker.await.unwrap();
        assert_eq!(failing.failures.load(Ordering::SeqCst), 1);
        assert_eq!(*working.sent.lock().unwrap(), vec![ObjectId::new(2)]);
    }

    #[tokio::test]
    async fn test_worker_exits_when_handles_drop() {
        let (handle, worker) = spawn_finalizer();
        drop(handle);
        worker.await.unwrap();
    }

    #[test]
    fn test_enqueue_after_stop_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = FinalizeHandle::new(tx);
        drop(rx);
        handle.enqueue(FinalizeTask::Stop);
    }

    #[test]
    fn test_sweep_force_disarms_live_handles() {
        use crate::object::RemoteObject;
        use crate::protocol::RefKind;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = FinalizeHandle::new(tx);
        let table = FinalizerTable::new();
        let owner = CountingSender::new(false);

        let handle =
            RemoteObject::tracked(ObjectId::new(4), RefKind::Object, owner, queue, table.clone());
        assert_eq!(table.len(), 1);

        // Live entries survive a non-forced sweep.
        table.sweep(false);
        assert_eq!(table.len(), 1);

        table.sweep(true);
        assert_eq!(table.len(), 0);

        // Its entry is gone, so the drop no longer notifies.
        drop(handle);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_sweep_evicts_dead_entries() {
        let table = FinalizerTable::new();
        let dead: Weak<RemoteInner> = Weak::new();
        table.add(dead);
        assert_eq!(table.len(), 1);

        table.sweep(false);
        assert_eq!(table.len(), 0);
    }
}
