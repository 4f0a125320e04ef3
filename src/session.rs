//! Shared per-gateway session state.
//!
//! One [`SessionState`] is shared by every connection of a gateway: the
//! codec, the registry of local objects the peer may call, the finalizer
//! wiring for remote handles, and the session-wide options. Connections
//! and dispatch tasks hold it behind an `Arc` and treat it as read-mostly.
//!
//! The session is also the [`RefBinder`]: inbound peer-owned ids become
//! [`RemoteObject`] handles here, wired to the owning client for release
//! and to the finalizer when memory management is on.

use std::sync::{Arc, OnceLock, Weak};

use crate::codec::{Codec, RefBinder, Value};
use crate::error::{ObjwireError, Result};
use crate::finalizer::{FinalizeHandle, FinalizerTable, ReleaseSender};
use crate::object::{ProxyObject, RemoteObject};
use crate::protocol::{CommandCode, Frame, ObjectId, RefKind, TaggedValue};
use crate::registry::ObjectRegistry;

/// State shared by all connections of one gateway.
pub struct SessionState {
    pub(crate) codec: Codec,
    pub(crate) registry: ObjectRegistry,
    pub(crate) finalizers: FinalizerTable,
    pub(crate) finalize_queue: FinalizeHandle,
    /// Client that owns this session's connections. Set once right after
    /// the client is built; weak, because the client holds the session.
    owner: OnceLock<Weak<dyn ReleaseSender>>,
    pub(crate) entry_point: Option<Arc<dyn ProxyObject>>,
    pub(crate) auth_token: Option<String>,
    pub(crate) memory_management: bool,
}

impl SessionState {
    pub(crate) fn new(
        codec: Codec,
        entry_point: Option<Arc<dyn ProxyObject>>,
        auth_token: Option<String>,
        memory_management: bool,
        finalize_queue: FinalizeHandle,
        finalizers: FinalizerTable,
    ) -> Self {
        Self {
            codec,
            registry: ObjectRegistry::new(),
            finalizers,
            finalize_queue,
            owner: OnceLock::new(),
            entry_point,
            auth_token,
            memory_management,
        }
    }

    /// Bind the owning client. Later calls are ignored.
    pub(crate) fn set_owner(&self, owner: Weak<dyn ReleaseSender>) {
        let _ = self.owner.set(owner);
    }

    fn owner(&self) -> Result<Arc<dyn ReleaseSender>> {
        self.owner
            .get()
            .and_then(Weak::upgrade)
            .ok_or(ObjwireError::ConnectionClosed)
    }

    /// Registry of local objects exposed to the peer.
    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    pub(crate) fn encode_value(&self, value: &Value) -> Result<TaggedValue> {
        self.codec.encode_value(value, &self.registry)
    }

    pub(crate) fn decode_value(&self, value: &TaggedValue) -> Result<Value> {
        self.codec.decode_value(value, &self.registry, self)
    }

    pub(crate) fn decode_args(&self, values: &[TaggedValue]) -> Result<Vec<Value>> {
        values.iter().map(|v| self.decode_value(v)).collect()
    }

    /// Assemble a CALL command: target reference, member name, encoded
    /// arguments, END.
    pub(crate) fn encode_call(
        &self,
        target: ObjectId,
        member: &str,
        args: &[Value],
    ) -> Result<Vec<TaggedValue>> {
        let mut values = Vec::with_capacity(args.len() + 4);
        values.push(TaggedValue::command(CommandCode::Call));
        values.push(TaggedValue::hand_back(target));
        values.push(TaggedValue::string(member));
        for arg in args {
            values.push(self.encode_value(arg)?);
        }
        values.push(TaggedValue::end());
        Ok(values)
    }

    /// Interpret the response to a call on `target.member`.
    pub(crate) fn interpret(&self, frame: &Frame, target: ObjectId, member: &str) -> Result<Value> {
        self.codec
            .interpret_response(frame, &self.registry, self, target, member)
    }
}

impl RefBinder for SessionState {
    fn bind(&self, id: ObjectId, kind: RefKind) -> Result<RemoteObject> {
        // Well-known ids resolve on every connection; nothing to release.
        if id.is_sentinel() {
            return Ok(RemoteObject::sentinel(id));
        }
        let owner = self.owner()?;
        if self.memory_management {
            Ok(RemoteObject::tracked(
                id,
                kind,
                owner,
                self.finalize_queue.clone(),
                self.finalizers.clone(),
            ))
        } else {
            Ok(RemoteObject::untracked(id, kind, owner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::BoxFuture;
    use crate::protocol::tag;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct RecordingSender {
        released: Mutex<Vec<ObjectId>>,
    }

    impl ReleaseSender for RecordingSender {
        fn send_release(self: Arc<Self>, id: ObjectId) -> BoxFuture<'static, Result<()>> {
            Box::pin(async move {
                self.released.lock().unwrap().push(id);
                Ok(())
            })
        }
    }

    fn session(memory_management: bool) -> SessionState {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionState::new(
            Codec::standard(),
            None,
            None,
            memory_management,
            FinalizeHandle::new(tx),
            FinalizerTable::new(),
        )
    }

    #[test]
    fn test_bind_sentinel_needs_no_owner() {
        let session = session(true);
        let handle = session
            .bind(crate::protocol::ENTRY_POINT_OBJECT_ID, RefKind::Object)
            .unwrap();
        assert!(handle.is_sentinel());
    }

    #[test]
    fn test_bind_before_owner_fails() {
        let session = session(true);
        let err = session.bind(ObjectId::new(4), RefKind::Object).unwrap_err();
        assert!(matches!(err, ObjwireError::ConnectionClosed));
    }

    #[test]
    fn test_bind_tracks_only_when_managed() {
        let owner: Arc<RecordingSender> = Arc::new(RecordingSender {
            released: Mutex::new(Vec::new()),
        });

        let managed = session(true);
        managed.set_owner(Arc::downgrade(&owner) as Weak<dyn ReleaseSender>);
        let tracked = managed.bind(ObjectId::new(1), RefKind::List).unwrap();
        assert_eq!(managed.finalizers.len(), 1);
        // Dropping the handle consumes its table entry.
        drop(tracked);
        assert_eq!(managed.finalizers.len(), 0);

        let manual = session(false);
        manual.set_owner(Arc::downgrade(&owner) as Weak<dyn ReleaseSender>);
        let untracked = manual.bind(ObjectId::new(1), RefKind::List).unwrap();
        assert_eq!(manual.finalizers.len(), 0);
        drop(untracked);
    }

    #[test]
    fn test_encode_call_layout() {
        let session = session(true);
        let values = session
            .encode_call(
                ObjectId::new(6),
                "get",
                &[Value::from(1i64), Value::from("key")],
            )
            .unwrap();

        assert_eq!(values.len(), 6);
        assert_eq!(values[0].tag(), tag::COMMAND);
        assert_eq!(values[1].tag(), tag::PROXY);
        assert_eq!(values[1].as_object_id().unwrap(), ObjectId::new(6));
        assert_eq!(values[2].as_str().unwrap(), "get");
        assert_eq!(values[3].tag(), tag::INTEGER);
        assert_eq!(values[4].tag(), tag::STRING);
        assert_eq!(values[5].tag(), tag::END);
    }
}
