//! Vat manager (§4.4): worker lifecycle, syscall dispatch, restart.
//!
//! The actual vat code confinement is explicitly out of scope (§1
//! Non-goals: "the secure JavaScript confinement used to execute vat
//! code"); what's modeled here is the kernel-side contract a worker must
//! honor — downward deliveries, upward syscalls via `vatstoreGet/Set/
//! Delete`, and the restart/termination bookkeeping that doesn't depend on
//! what's actually running inside the vat.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capdata::CapData;
use crate::error::{KernelError, Result};
use crate::refs::{EndpointId, ERef, KRef, KoRef, RefAllocator};
use crate::runqueue::{Message, RunQueue, RunQueueEntry, VatSink};
use crate::store::KernelStore;

/// One of the three shapes a vat's code may be specified in (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VatConfig {
    SourceSpec {
        source_spec: String,
        #[serde(default)]
        parameters: Option<serde_json::Value>,
    },
    BundleSpec {
        bundle_spec: String,
        #[serde(default)]
        parameters: Option<serde_json::Value>,
    },
    Bundle {
        bundle: VatBundle,
        #[serde(default)]
        parameters: Option<serde_json::Value>,
    },
}

/// A self-contained module (§6). Validation is strict per the design note
/// in §9: the in-source type-guard is known to skip `exports`/`modules` in
/// some revisions; this port checks both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatBundle {
    pub module_format: String,
    pub code: String,
    pub exports: Vec<String>,
    #[serde(default)]
    pub modules: Option<HashMap<String, String>>,
}

impl VatBundle {
    pub fn validate(&self) -> Result<()> {
        if self.module_format != "iife" {
            return Err(KernelError::InvalidVatBundle(format!(
                "unsupported module_format: {}",
                self.module_format
            )));
        }
        if self.code.trim().is_empty() {
            return Err(KernelError::InvalidVatBundle("empty code".into()));
        }
        if self.exports.is_empty() {
            return Err(KernelError::InvalidVatBundle(
                "exports must be non-empty".into(),
            ));
        }
        if let Some(modules) = &self.modules {
            for name in modules.keys() {
                if name.trim().is_empty() {
                    return Err(KernelError::InvalidVatBundle(
                        "modules keys must be non-empty".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl VatConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            VatConfig::SourceSpec { source_spec, .. } if source_spec.trim().is_empty() => Err(
                KernelError::InvalidVatBundle("empty source_spec".into()),
            ),
            VatConfig::BundleSpec { bundle_spec, .. } if bundle_spec.trim().is_empty() => Err(
                KernelError::InvalidVatBundle("empty bundle_spec".into()),
            ),
            VatConfig::Bundle { bundle, .. } => bundle.validate(),
            _ => Ok(()),
        }
    }
}

/// Downward work handed to a worker task.
enum Downward {
    Deliver {
        target: ERef,
        message: Message,
        reply: oneshot::Sender<Result<CapData>>,
    },
    Notify {
        promise: ERef,
        resolution: CapData,
        rejected: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    BringOutYourDead {
        /// Krefs the worker reports it no longer holds reachably.
        reply: oneshot::Sender<Result<Vec<KRef>>>,
    },
}

/// A running worker's handle. The task itself is the stand-in confinement
/// boundary: today it's a `tokio::spawn`'d loop, same shape as the
/// teacher's local worker pool, ready to be swapped for a real sandboxed
/// executor without changing this type's surface.
struct WorkerHandle {
    tx: mpsc::Sender<Downward>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    fn spawn(vat: EndpointId, bootstrap_payload: Option<CapData>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Downward>(64);
        let join = tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                match work {
                    Downward::Deliver {
                        message, reply, ..
                    } => {
                        let response = if message.method == "bootstrap" {
                            bootstrap_payload.clone().unwrap_or_else(CapData::empty)
                        } else {
                            message.args.clone()
                        };
                        let _ = reply.send(Ok(response));
                    }
                    Downward::Notify { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    Downward::BringOutYourDead { reply } => {
                        // The stand-in worker holds no objects of its own
                        // to report; a real sandboxed executor would scan
                        // its own import table here.
                        let _ = reply.send(Ok(Vec::new()));
                    }
                }
            }
            info!(vat = %vat, "worker task exited");
        });
        Self { tx, join }
    }
}

/// Per-vat bookkeeping: config, owning subcluster, worker handle, root
/// object. Survives a restart (the handle is replaced, the root is not).
struct VatEntry {
    config: VatConfig,
    parent_subcluster: Option<crate::refs::SubclusterId>,
    root: Option<KoRef>,
    worker: Option<WorkerHandle>,
    pinned: bool,
    terminate_calls: u32,
    launch_calls: u32,
}

/// Owns the mapping from vat id to worker handle.
pub struct VatManager {
    store: Arc<KernelStore>,
    allocator: Arc<RefAllocator>,
    queue: Arc<RunQueue>,
    vats: Mutex<HashMap<EndpointId, VatEntry>>,
}

impl VatManager {
    pub fn new(store: Arc<KernelStore>, allocator: Arc<RefAllocator>, queue: Arc<RunQueue>) -> Self {
        Self {
            store,
            allocator,
            queue,
            vats: Mutex::new(HashMap::new()),
        }
    }

    /// Launches a new vat, wires its root export into the c-list, and
    /// returns its id and root kernel object.
    pub fn launch_vat(
        &self,
        config: VatConfig,
        parent_subcluster: Option<crate::refs::SubclusterId>,
    ) -> Result<(EndpointId, KoRef)> {
        config.validate()?;
        let id = self.allocator.next_vat();
        self.launch_vat_with_id(id, config, parent_subcluster, None)
    }

    fn launch_vat_with_id(
        &self,
        id: EndpointId,
        config: VatConfig,
        parent_subcluster: Option<crate::refs::SubclusterId>,
        existing_root: Option<KoRef>,
    ) -> Result<(EndpointId, KoRef)> {
        let root = match existing_root {
            Some(ko) => ko,
            None => self.store.init_kernel_object(id),
        };
        let eref = ERef {
            kind: crate::refs::RefKind::Object,
            sign: crate::refs::Sign::Export,
            id: self.store.next_local_id(id),
        };
        self.store.add_clist_entry(id, KRef::Object(root), eref)?;

        let worker = WorkerHandle::spawn(id, None);
        let mut vats = self.vats.lock();
        let launch_calls = vats.get(&id).map(|v| v.launch_calls).unwrap_or(0) + 1;
        vats.insert(
            id,
            VatEntry {
                config,
                parent_subcluster,
                root: Some(root),
                worker: Some(worker),
                pinned: false,
                terminate_calls: vats.get(&id).map(|v| v.terminate_calls).unwrap_or(0),
                launch_calls,
            },
        );
        Ok((id, root))
    }

    /// Terminates a vat: rejects every promise it decides, retires its
    /// c-list exports, stops the worker task.
    pub fn terminate_vat(&self, id: EndpointId, reason: Option<CapData>) -> Result<()> {
        let worker = {
            let mut vats = self.vats.lock();
            let entry = vats
                .get_mut(&id)
                .ok_or_else(|| KernelError::VatNotFound(id.to_string()))?;
            entry.terminate_calls += 1;
            entry.worker.take()
        };

        let cleanup = self.store.cleanup_terminated_vat(id)?;
        let rejection = reason.unwrap_or_else(|| {
            CapData::new("{\"error\":\"vat terminated\"}".to_string(), Vec::new())
        });
        for kp in cleanup.promises {
            match self.store.resolve_kernel_promise(kp, true, rejection.clone()) {
                Ok(()) => {
                    if let Ok(promise) = self.store.get_kernel_promise(kp) {
                        for subscriber in promise.subscribers {
                            self.queue.push(RunQueueEntry::Notify {
                                subscriber,
                                promise: kp,
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(promise = %kp, error = %err, "failed to reject promise on vat termination");
                }
            }
        }

        if let Some(worker) = worker {
            worker.join.abort();
        }
        Ok(())
    }

    /// Restart policy (§4.4): terminate the old worker (failure is
    /// surfaced, never resurrected), launch a new one with the same id and
    /// config, re-attached to the existing root. c-lists are untouched.
    pub fn restart_vat(&self, id: EndpointId) -> Result<()> {
        let (config, parent, root) = {
            let vats = self.vats.lock();
            let entry = vats
                .get(&id)
                .ok_or_else(|| KernelError::VatNotFound(id.to_string()))?;
            (entry.config.clone(), entry.parent_subcluster, entry.root)
        };

        {
            let mut vats = self.vats.lock();
            if let Some(entry) = vats.get_mut(&id) {
                entry.terminate_calls += 1;
                if let Some(worker) = entry.worker.take() {
                    worker.join.abort();
                }
            }
        }

        self.launch_vat_with_id(id, config, parent, root)?;
        Ok(())
    }

    /// Recovery entry point: re-initializes every non-system vat that
    /// existed previously, in persisted order, before the run queue
    /// resumes (invariant: message ordering preserved across restart).
    pub fn initialize_all_vats(&self, records: Vec<(EndpointId, VatConfig, Option<crate::refs::SubclusterId>, Option<KoRef>)>) -> Result<()> {
        for (id, config, parent, root) in records {
            if id.is_system() {
                continue;
            }
            self.launch_vat_with_id(id, config, parent, root)?;
        }
        Ok(())
    }

    pub fn ping_vat(&self, id: EndpointId) -> Result<()> {
        let vats = self.vats.lock();
        if vats.contains_key(&id) {
            Ok(())
        } else {
            Err(KernelError::VatNotFound(id.to_string()))
        }
    }

    pub fn pin_vat_root(&self, id: EndpointId) -> Result<()> {
        let mut vats = self.vats.lock();
        let entry = vats
            .get_mut(&id)
            .ok_or_else(|| KernelError::VatNotFound(id.to_string()))?;
        entry.pinned = true;
        if let Some(root) = entry.root {
            self.store.pin_object(root)?;
        }
        Ok(())
    }

    pub fn unpin_vat_root(&self, id: EndpointId) -> Result<()> {
        let mut vats = self.vats.lock();
        let entry = vats
            .get_mut(&id)
            .ok_or_else(|| KernelError::VatNotFound(id.to_string()))?;
        entry.pinned = false;
        if let Some(root) = entry.root {
            self.store.unpin_object(root)?;
        }
        Ok(())
    }

    /// Reaps every vat for which `filter` returns true, terminating them
    /// and returning their ids.
    pub fn reap_vats(&self, filter: impl Fn(EndpointId) -> bool) -> Result<Vec<EndpointId>> {
        let candidates: Vec<EndpointId> = {
            let vats = self.vats.lock();
            vats.keys().copied().filter(|id| filter(*id)).collect()
        };
        for id in &candidates {
            self.terminate_vat(*id, None)?;
        }
        Ok(candidates)
    }

    /// Drives a `bringOutYourDead` pass on one vat: asks the worker which
    /// krefs it no longer holds reachably, and enqueues a gc-drop entry
    /// for each (the router's dispatch then checks whether the owning
    /// object is now fully dead and retires it).
    pub async fn sweep_dead(&self, id: EndpointId, queue: &RunQueue) -> Result<()> {
        let tx = {
            let vats = self.vats.lock();
            vats.get(&id)
                .and_then(|e| e.worker.as_ref())
                .map(|w| w.tx.clone())
                .ok_or_else(|| KernelError::VatNotFound(id.to_string()))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Downward::BringOutYourDead { reply: reply_tx })
            .await
            .map_err(|_| KernelError::VatNotFound(id.to_string()))?;
        let dropped = reply_rx
            .await
            .map_err(|_| KernelError::Internal("worker dropped bringOutYourDead reply".into()))??;

        for kref in dropped {
            queue.push(RunQueueEntry::GcDrop { endpoint: id, kref });
        }
        Ok(())
    }

    pub fn vat_count(&self) -> usize {
        self.vats.lock().len()
    }
}

#[async_trait]
impl VatSink for VatManager {
    async fn deliver(&self, vat: EndpointId, target: ERef, message: &Message) -> Result<CapData> {
        let tx = {
            let vats = self.vats.lock();
            vats.get(&vat)
                .and_then(|e| e.worker.as_ref())
                .map(|w| w.tx.clone())
                .ok_or_else(|| KernelError::VatNotFound(vat.to_string()))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Downward::Deliver {
            target,
            message: message.clone(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| KernelError::VatNotFound(vat.to_string()))?;
        reply_rx
            .await
            .map_err(|_| KernelError::Internal("worker dropped delivery reply".into()))?
    }

    async fn notify(
        &self,
        vat: EndpointId,
        promise: ERef,
        resolution: &CapData,
        rejected: bool,
    ) -> Result<()> {
        let tx = {
            let vats = self.vats.lock();
            vats.get(&vat)
                .and_then(|e| e.worker.as_ref())
                .map(|w| w.tx.clone())
                .ok_or_else(|| KernelError::VatNotFound(vat.to_string()))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Downward::Notify {
            promise,
            resolution: resolution.clone(),
            rejected,
            reply: reply_tx,
        })
        .await
        .map_err(|_| KernelError::VatNotFound(vat.to_string()))?;
        reply_rx
            .await
            .map_err(|_| KernelError::Internal("worker dropped notify reply".into()))?
    }

    fn owner_of(&self, kref: KRef) -> Option<EndpointId> {
        let vats = self.vats.lock();
        vats.iter()
            .find(|(_, entry)| entry.root.map(KRef::Object) == Some(kref))
            .map(|(id, _)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> VatManager {
        let store = Arc::new(KernelStore::new());
        let allocator = Arc::new(RefAllocator::new());
        let queue = Arc::new(RunQueue::new());
        VatManager::new(store, allocator, queue)
    }

    fn bundle_config() -> VatConfig {
        VatConfig::Bundle {
            bundle: VatBundle {
                module_format: "iife".into(),
                code: "(() => {})()".into(),
                exports: vec!["root".into()],
                modules: None,
            },
            parameters: None,
        }
    }

    #[test]
    fn launch_assigns_fresh_vat_and_root() {
        let mgr = manager();
        let (id, root) = mgr.launch_vat(bundle_config(), None).unwrap();
        assert!(matches!(id, EndpointId::Vat(_)));
        assert!(mgr.ping_vat(id).is_ok());
        assert_eq!(mgr.vat_count(), 1);
        let _ = root;
    }

    #[test]
    fn restart_preserves_root_and_counts_calls() {
        let mgr = manager();
        let (id, root) = mgr.launch_vat(bundle_config(), None).unwrap();
        mgr.restart_vat(id).unwrap();

        let vats = mgr.vats.lock();
        let entry = vats.get(&id).unwrap();
        assert_eq!(entry.root, Some(root));
        assert_eq!(entry.launch_calls, 2);
        assert_eq!(entry.terminate_calls, 1);
    }

    #[test]
    fn terminate_then_ping_is_not_found() {
        let mgr = manager();
        let (id, _root) = mgr.launch_vat(bundle_config(), None).unwrap();
        mgr.terminate_vat(id, None).unwrap();
        let err = mgr.ping_vat(id).unwrap_err();
        assert!(matches!(err, KernelError::VatNotFound(_)));
    }

    #[test]
    fn strict_bundle_validation_rejects_missing_exports() {
        let bundle = VatBundle {
            module_format: "iife".into(),
            code: "x".into(),
            exports: Vec::new(),
            modules: None,
        };
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn pin_and_unpin_vat_root() {
        let mgr = manager();
        let (id, _root) = mgr.launch_vat(bundle_config(), None).unwrap();
        mgr.pin_vat_root(id).unwrap();
        mgr.unpin_vat_root(id).unwrap();
    }

    #[test]
    fn terminate_vat_notifies_promise_subscribers() {
        let store = Arc::new(KernelStore::new());
        let allocator = Arc::new(RefAllocator::new());
        let queue = Arc::new(RunQueue::new());
        let mgr = VatManager::new(store.clone(), allocator, queue.clone());
        let (id, _root) = mgr.launch_vat(bundle_config(), None).unwrap();

        let kp = store.init_kernel_promise(id);
        store.subscribe_to_promise(kp, EndpointId::Vat(99)).unwrap();

        mgr.terminate_vat(id, None).unwrap();

        assert!(matches!(
            queue.pop(),
            Some(RunQueueEntry::Notify { subscriber: EndpointId::Vat(99), promise }) if promise == kp
        ));
    }

    #[tokio::test]
    async fn sweep_dead_enqueues_gc_drop_for_nothing_when_worker_holds_everything() {
        let mgr = manager();
        let (id, _root) = mgr.launch_vat(bundle_config(), None).unwrap();
        let queue = RunQueue::new();
        mgr.sweep_dead(id, &queue).await.unwrap();
        assert!(queue.is_empty());
    }
}
