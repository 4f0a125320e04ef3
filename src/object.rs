//! Object handles on both sides of the bridge.
//!
//! Two handle types mirror the two directions of sharing:
//!
//! - [`LocalProxy`] wraps a local [`ProxyObject`] so it can be passed to
//!   the peer by reference. Registration is lazy: the object gets an id
//!   the first time it actually crosses the wire.
//! - [`RemoteObject`] is a handle to an object the peer owns. Dropping
//!   the last clone schedules a RELEASE for the peer's registry entry
//!   (when memory management is on); [`RemoteObject::release`] does the
//!   same eagerly.
//!
//! # Example
//!
//! ```ignore
//! use objwire::{BoxFuture, CallContext, ProxyObject, Result, Value};
//!
//! struct Adder;
//!
//! impl ProxyObject for Adder {
//!     fn invoke<'a>(
//!         &'a self,
//!         member: &'a str,
//!         args: Vec<Value>,
//!         _ctx: CallContext<'a>,
//!     ) -> BoxFuture<'a, Result<Value>> {
//!         Box::pin(async move {
//!             match member {
//!                 "add" => {
//!                     let a = args[0].as_i64().unwrap_or(0);
//!                     let b = args[1].as_i64().unwrap_or(0);
//!                     Ok(Value::from(a + b))
//!                 }
//!                 _ => Err(objwire::ObjwireError::Protocol(format!(
//!                     "No such member: {member}"
//!                 ))),
//!             }
//!         })
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use crate::codec::Value;
use crate::dispatch::CallContext;
use crate::error::Result;
use crate::finalizer::{FinalizeHandle, FinalizeTask, FinalizerTable, ReleaseSender};
use crate::protocol::{ObjectId, RefKind};
use crate::registry::ObjectRegistry;

/// Boxed future for trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A local object the peer may call into.
///
/// `invoke` runs on the connection task that received the call, so it can
/// call back to the peer through `ctx` over the same connection before
/// returning its result.
pub trait ProxyObject: Send + Sync + 'static {
    /// Handle a call from the peer.
    fn invoke<'a>(
        &'a self,
        member: &'a str,
        args: Vec<Value>,
        ctx: CallContext<'a>,
    ) -> BoxFuture<'a, Result<Value>>;
}

/// A local [`ProxyObject`] wrapped for pass-by-reference.
///
/// Clones share one registry slot: whichever clone crosses the wire first
/// assigns the id and every later crossing reuses it.
#[derive(Clone)]
pub struct LocalProxy {
    obj: Arc<dyn ProxyObject>,
    id: Arc<OnceLock<ObjectId>>,
}

impl LocalProxy {
    /// Wrap a local object for sharing.
    pub fn new(obj: Arc<dyn ProxyObject>) -> Self {
        Self {
            obj,
            id: Arc::new(OnceLock::new()),
        }
    }

    /// The wrapped object.
    pub fn object(&self) -> &Arc<dyn ProxyObject> {
        &self.obj
    }

    /// The assigned id, if this proxy has crossed the wire.
    pub fn id(&self) -> Option<ObjectId> {
        self.id.get().copied()
    }

    /// Wrap an object that already holds a registry slot, so re-encoding
    /// hands out the existing id instead of registering again.
    pub(crate) fn registered(obj: Arc<dyn ProxyObject>, id: ObjectId) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(id);
        Self {
            obj,
            id: Arc::new(cell),
        }
    }

    /// Assign an id on first crossing; later calls return the same id.
    pub(crate) fn ensure_id(&self, registry: &ObjectRegistry) -> ObjectId {
        *self.id.get_or_init(|| registry.put(self.obj.clone()))
    }
}

impl PartialEq for LocalProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.obj, &other.obj)
    }
}

impl fmt::Debug for LocalProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProxy").field("id", &self.id.get()).finish()
    }
}

/// Finalizer bookkeeping for a tracked remote handle.
pub(crate) struct GcRegistration {
    queue: FinalizeHandle,
    table: FinalizerTable,
    key: u64,
}

/// Shared state behind all clones of one [`RemoteObject`].
pub(crate) struct RemoteInner {
    id: ObjectId,
    kind: RefKind,
    owner: Option<Arc<dyn ReleaseSender>>,
    gc: Option<GcRegistration>,
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        let (Some(gc), Some(owner)) = (&self.gc, &self.owner) else {
            return;
        };
        // The table entry is consumed exactly once, by whichever of
        // drop, explicit release or sweep gets there first.
        if gc.table.remove(gc.key) {
            gc.queue.enqueue(FinalizeTask::Release {
                owner: owner.clone(),
                id: self.id,
            });
        }
    }
}

/// Handle to an object the peer owns.
///
/// Equality compares the peer-side identity (id and kind), so two handles
/// decoded from the same reference compare equal.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<RemoteInner>,
}

impl RemoteObject {
    /// Handle to a well-known peer object. Never released.
    pub(crate) fn sentinel(id: ObjectId) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id,
                kind: RefKind::Object,
                owner: None,
                gc: None,
            }),
        }
    }

    /// Handle without drop tracking. Explicit release still works.
    pub(crate) fn untracked(id: ObjectId, kind: RefKind, owner: Arc<dyn ReleaseSender>) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                id,
                kind,
                owner: Some(owner),
                gc: None,
            }),
        }
    }

    /// Handle whose last drop schedules an asynchronous RELEASE.
    pub(crate) fn tracked(
        id: ObjectId,
        kind: RefKind,
        owner: Arc<dyn ReleaseSender>,
        queue: FinalizeHandle,
        table: FinalizerTable,
    ) -> Self {
        // The table holds a weak back-reference; registering inside
        // new_cyclic makes the entry exist before any clone can drop.
        let inner = Arc::new_cyclic(|weak| {
            let key = table.add(weak.clone());
            RemoteInner {
                id,
                kind,
                owner: Some(owner),
                gc: Some(GcRegistration {
                    queue: queue.clone(),
                    table: table.clone(),
                    key,
                }),
            }
        });
        Self { inner }
    }

    /// Peer-side id of the referenced object.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Collection kind the reference was sent as.
    pub fn kind(&self) -> RefKind {
        self.inner.kind
    }

    /// Whether this handle names a well-known peer object.
    pub fn is_sentinel(&self) -> bool {
        self.inner.id.is_sentinel()
    }

    /// Release the peer's registry entry now instead of waiting for drop.
    ///
    /// Idempotent across clones: the first release wins, later releases
    /// and the eventual drop are no-ops. Sentinel handles never release.
    pub async fn release(self) -> Result<()> {
        let Some(owner) = self.inner.owner.clone() else {
            return Ok(());
        };
        if self.inner.id.is_sentinel() {
            return Ok(());
        }
        if let Some(gc) = &self.inner.gc {
            if !gc.table.remove(gc.key) {
                return Ok(());
            }
        }
        owner.send_release(self.inner.id).await
    }
}

impl PartialEq for RemoteObject {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id && self.inner.kind == other.inner.kind
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct Echo;

    impl ProxyObject for Echo {
        fn invoke<'a>(
            &'a self,
            _member: &'a str,
            mut args: Vec<Value>,
            _ctx: CallContext<'a>,
        ) -> BoxFuture<'a, Result<Value>> {
            Box::pin(async move { Ok(args.pop().unwrap_or(Value::Null)) })
        }
    }

    struct RecordingSender {
        released: Mutex<Vec<ObjectId>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                released: Mutex::new(Vec::new()),
            })
        }
    }

    impl ReleaseSender for RecordingSender {
        fn send_release(self: Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                self.released.lock().unwrap().push(id);
                Ok(())
            })
        }
    }

    #[test]
    fn test_ensure_id_assigns_once() {
        let registry = ObjectRegistry::new();
        let proxy = LocalProxy::new(Arc::new(Echo));

        assert_eq!(proxy.id(), None);
        let first = proxy.ensure_id(&registry);
        let second = proxy.ensure_id(&registry);
        assert_eq!(first, second);
        assert_eq!(proxy.id(), Some(first));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_clones_share_registration() {
        let registry = ObjectRegistry::new();
        let proxy = LocalProxy::new(Arc::new(Echo));
        let clone = proxy.clone();

        let id = proxy.ensure_id(&registry);
        assert_eq!(clone.ensure_id(&registry), id);
        assert_eq!(registry.size(), 1);
        assert_eq!(proxy, clone);
    }

    #[test]
    fn test_remote_equality_by_identity() {
        let a = RemoteObject::sentinel(ObjectId::new(-1));
        let b = RemoteObject::sentinel(ObjectId::new(-1));
        let c = RemoteObject::sentinel(ObjectId::new(-2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_last_drop_enqueues_release_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = FinalizeHandle::new(tx);
        let table = FinalizerTable::new();
        let owner = RecordingSender::new();

        let handle = RemoteObject::tracked(
            ObjectId::new(7),
            RefKind::Object,
            owner,
            queue,
            table.clone(),
        );
        let clone = handle.clone();
        assert_eq!(table.len(), 1);

        drop(handle);
        assert!(rx.try_recv().is_err());

        drop(clone);
        match rx.try_recv() {
            Ok(FinalizeTask::Release { id, .. }) => assert_eq!(id, ObjectId::new(7)),
            Ok(FinalizeTask::Stop) => panic!("Expected release task, got stop"),
            Err(_) => panic!("Expected release task, got empty queue"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_explicit_release_disarms_drop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = FinalizeHandle::new(tx);
        let table = FinalizerTable::new();
        let owner = RecordingSender::new();

        let handle = RemoteObject::tracked(
            ObjectId::new(9),
            RefKind::List,
            owner.clone(),
            queue,
            table.clone(),
        );
        let clone = handle.clone();

        handle.release().await.unwrap();
        assert_eq!(*owner.released.lock().unwrap(), vec![ObjectId::new(9)]);

        // The queue never sees it and a second release is a no-op.
        clone.release().await.unwrap();
        assert_eq!(owner.released.lock().unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_untracked_release_sends_directly() {
        let owner = RecordingSender::new();
        let handle = RemoteObject::untracked(ObjectId::new(3), RefKind::Map, owner.clone());
        assert_eq!(handle.kind(), RefKind::Map);

        handle.release().await.unwrap();
        assert_eq!(*owner.released.lock().unwrap(), vec![ObjectId::new(3)]);
    }

    #[tokio::test]
    async fn test_sentinel_release_is_noop() {
        let handle = RemoteObject::sentinel(ObjectId::new(-2));
        assert!(handle.is_sentinel());
        handle.release().await.unwrap();
    }
}
