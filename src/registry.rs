//! Registry of local objects shared with the peer.
//!
//! Every object passed to the peer by reference gets an entry here; the
//! id in the entry is what travels on the wire. Entries pin their object
//! alive until the peer releases them (or the registry is dropped at
//! shutdown). Ids are assigned sequentially starting from 1; negative
//! ids are reserved for well-known objects and never assigned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ObjwireError, Result};
use crate::object::ProxyObject;
use crate::protocol::ObjectId;

/// Registry mapping ids to the local objects the peer can call.
pub struct ObjectRegistry {
    inner: Mutex<Inner>,
}

struct Inner {
    objects: HashMap<ObjectId, Arc<dyn ProxyObject>>,
    next_id: i64,
}

impl ObjectRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Insert an object and return its assigned id.
    pub fn put(&self, obj: Arc<dyn ProxyObject>) -> ObjectId {
        let mut inner = self.inner.lock().unwrap();
        let id = ObjectId::new(inner.next_id);
        inner.next_id += 1;
        inner.objects.insert(id, obj);
        id
    }

    /// Look up an object by id.
    pub fn get(&self, id: ObjectId) -> Result<Arc<dyn ProxyObject>> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&id)
            .cloned()
            .ok_or(ObjwireError::NoSuchObject(id))
    }

    /// Remove an entry. Returns whether it existed; removing an unknown
    /// id is not an error, so RELEASE stays idempotent.
    pub fn remove(&self, id: ObjectId) -> bool {
        self.inner.lock().unwrap().objects.remove(&id).is_some()
    }

    /// Whether an id is currently registered.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.lock().unwrap().objects.contains_key(&id)
    }

    /// Number of live entries.
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().objects.len()
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::dispatch::CallContext;
    use crate::object::BoxFuture;

    struct Nop;

    impl ProxyObject for Nop {
        fn invoke<'a>(
            &'a self,
            _member: &'a str,
            _args: Vec<Value>,
            _ctx: CallContext<'a>,
        ) -> BoxFuture<'a, crate::error::Result<Value>> {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[test]
    fn test_ids_sequential_from_one() {
        let registry = ObjectRegistry::new();
        assert_eq!(registry.put(Arc::new(Nop)), ObjectId::new(1));
        assert_eq!(registry.put(Arc::new(Nop)), ObjectId::new(2));
        assert_eq!(registry.put(Arc::new(Nop)), ObjectId::new(3));
        assert_eq!(registry.size(), 3);
    }

    #[test]
    fn test_get_returns_registered_object() {
        let registry = ObjectRegistry::new();
        let obj: Arc<dyn ProxyObject> = Arc::new(Nop);
        let id = registry.put(obj.clone());

        let found = registry.get(id).unwrap();
        assert!(Arc::ptr_eq(&found, &obj));
    }

    #[test]
    fn test_get_unknown_id_fails() {
        let registry = ObjectRegistry::new();
        assert!(matches!(
            registry.get(ObjectId::new(99)),
            Err(ObjwireError::NoSuchObject(id)) if id == ObjectId::new(99)
        ));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ObjectRegistry::new();
        let id = registry.put(Arc::new(Nop));

        assert!(registry.contains(id));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.contains(id));
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let registry = ObjectRegistry::new();
        let first = registry.put(Arc::new(Nop));
        registry.remove(first);
        let second = registry.put(Arc::new(Nop));
        assert_ne!(first, second);
    }
}
