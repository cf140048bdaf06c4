//! Kernel-services registry: lets `send` resolve kernel-hosted targets
//! (§2 component table, §4.3 "kernel-hosted service") without routing
//! through a vat worker.
//!
//! Named services are requested by a subcluster's launch config
//! (`services?`, §6) and bound to a kernel object owned by a system vat,
//! the same way the teacher's tool registry maps a name to a boxed async
//! handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::capdata::CapData;
use crate::error::Result;
use crate::refs::KoRef;

/// A kernel-hosted object callable from `send`. Distinct from a vat
/// worker: invocation happens in-process, synchronously within the crank
/// that dispatched the send.
#[async_trait]
pub trait KernelService: Send + Sync {
    async fn invoke(&self, args: &CapData) -> Result<CapData>;
}

#[derive(Default)]
struct Inner {
    by_object: HashMap<KoRef, Arc<dyn KernelService>>,
    by_name: HashMap<String, KoRef>,
}

/// Maps service names to kernel objects, and kernel objects to their
/// in-process handler.
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Binds `name` to `ko`, backed by `handler`. Returns the previous
    /// binding for `name`, if any (re-registration replaces it).
    pub fn register(&self, name: &str, ko: KoRef, handler: Arc<dyn KernelService>) -> Option<KoRef> {
        let mut inner = self.inner.lock();
        inner.by_object.insert(ko, handler);
        inner.by_name.insert(name.to_string(), ko)
    }

    pub fn lookup(&self, ko: KoRef) -> Option<Arc<dyn KernelService>> {
        self.inner.lock().by_object.get(&ko).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<KoRef> {
        self.inner.lock().by_name.get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.lock().by_name.keys().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl KernelService for Echo {
        async fn invoke(&self, args: &CapData) -> Result<CapData> {
            Ok(args.clone())
        }
    }

    #[tokio::test]
    async fn register_and_invoke_by_name_lookup() {
        let registry = ServiceRegistry::new();
        let ko = KoRef(1);
        registry.register("echo", ko, Arc::new(Echo));

        let resolved = registry.lookup_by_name("echo").unwrap();
        assert_eq!(resolved, ko);

        let service = registry.lookup(resolved).unwrap();
        let args = CapData::new("\"hi\"", Vec::new());
        let result = service.invoke(&args).await.unwrap();
        assert_eq!(result, args);
    }

    #[test]
    fn lookup_unregistered_object_is_none() {
        let registry = ServiceRegistry::new();
        assert!(registry.lookup(KoRef(99)).is_none());
    }
}
