//! Run queue and router (§4.3): the crank-at-a-time scheduler.
//!
//! Exactly one run-queue entry is processed per crank; everything the
//! delivery triggers synchronously (further syscalls) is serviced before
//! the crank completes. `waitForCrank` lets observers (status queries,
//! store resets) await a consistent snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::capdata::CapData;
use crate::error::{KernelError, Result};
use crate::marshal::Marshal;
use crate::refs::{EndpointId, ERef, KRef, KoRef, KpRef};
use crate::services::ServiceRegistry;
use crate::store::{KernelStore, PromiseState};

/// A method invocation carried by a `send` entry.
#[derive(Debug, Clone)]
pub struct Message {
    pub method: String,
    pub args: CapData,
    /// The promise the caller is waiting on for the result, if any.
    pub result: Option<KpRef>,
}

/// One unit of kernel work (§3.2).
#[derive(Debug, Clone)]
pub enum RunQueueEntry {
    Send { target: KRef, message: Message },
    Notify { subscriber: EndpointId, promise: KpRef },
    GcDrop { endpoint: EndpointId, kref: KRef },
    GcRetire { endpoint: EndpointId, kref: KRef },
}

/// A durable FIFO of run-queue entries. Durability (crash-recovery of the
/// queue) is delegated to whatever the kernel store's backing is; this
/// type is the in-memory ordering structure the router drains.
#[derive(Default)]
pub struct RunQueue {
    entries: SyncMutex<VecDeque<RunQueueEntry>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: RunQueueEntry) {
        self.entries.lock().push_back(entry);
    }

    pub fn pop(&self) -> Option<RunQueueEntry> {
        self.entries.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Delivers work downward to a vat's worker. Implemented by whatever owns
/// the actual worker handles (the vat manager); the router only needs this
/// narrow surface.
#[async_trait]
pub trait VatSink: Send + Sync {
    async fn deliver(
        &self,
        vat: EndpointId,
        target: ERef,
        message: &Message,
    ) -> Result<CapData>;

    async fn notify(
        &self,
        vat: EndpointId,
        promise: ERef,
        resolution: &CapData,
        rejected: bool,
    ) -> Result<()>;

    /// The endpoint that owns a kernel object, used to route a `send` to
    /// the right worker.
    fn owner_of(&self, kref: KRef) -> Option<EndpointId>;
}

/// Takes one run-queue entry per crank and dispatches it per §4.3.
pub struct Router {
    store: Arc<KernelStore>,
    marshal: Arc<Marshal>,
    queue: Arc<RunQueue>,
    services: Arc<ServiceRegistry>,
    /// Sends pipelined onto a still-unresolved promise, replayed once it
    /// settles.
    pending_on_promise: SyncMutex<HashMap<KpRef, Vec<RunQueueEntry>>>,
    /// Enforces invariant 6: at most one crank in flight at any time.
    crank_lock: AsyncMutex<()>,
    crank_done: Notify,
}

impl Router {
    pub fn new(
        store: Arc<KernelStore>,
        marshal: Arc<Marshal>,
        queue: Arc<RunQueue>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            store,
            marshal,
            queue,
            services,
            pending_on_promise: SyncMutex::new(HashMap::new()),
            crank_lock: AsyncMutex::new(()),
            crank_done: Notify::new(),
        }
    }

    /// Pops one entry and runs a crank to completion, if the queue is
    /// nonempty. Returns `Ok(false)` when there was nothing to do.
    pub async fn run_one_crank(&self, sink: &dyn VatSink) -> Result<bool> {
        let _guard = self.crank_lock.lock().await;
        let Some(entry) = self.queue.pop() else {
            return Ok(false);
        };
        let result = self.dispatch(entry, sink).await;
        self.crank_done.notify_waiters();
        result.map(|()| true)
    }

    /// Returns once the crank in flight (if any) has drained. Does not
    /// guarantee the queue is empty — only that no crank is mid-flight at
    /// the moment it resolves.
    pub async fn wait_for_crank(&self) {
        let notified = self.crank_done.notified();
        if self.crank_lock.try_lock().is_ok() {
            return;
        }
        notified.await;
    }

    async fn dispatch(&self, entry: RunQueueEntry, sink: &dyn VatSink) -> Result<()> {
        match entry {
            RunQueueEntry::Send { target, message } => self.dispatch_send(target, message, sink).await,
            RunQueueEntry::Notify { subscriber, promise } => {
                self.dispatch_notify(subscriber, promise, sink).await
            }
            RunQueueEntry::GcDrop { endpoint, kref } => self.dispatch_gc_drop(endpoint, kref),
            RunQueueEntry::GcRetire { endpoint, kref } => self.dispatch_gc_retire(endpoint, kref),
        }
    }

    async fn dispatch_send(
        &self,
        target: KRef,
        message: Message,
        sink: &dyn VatSink,
    ) -> Result<()> {
        match target {
            KRef::Object(ko) => {
                if self.store.is_revoked(ko) {
                    self.settle(message.result, true, rejection("object revoked"));
                    return Ok(());
                }
                if let Some(handler) = self.services.lookup(ko) {
                    let outcome = handler.invoke(&message.args).await;
                    match outcome {
                        Ok(data) => self.settle(message.result, false, data),
                        Err(err) => self.settle(message.result, true, rejection(&err.to_string())),
                    }
                    return Ok(());
                }
                if let Some(kp) = message.result {
                    self.store.associate_promise_with_object(ko, kp)?;
                }
                let owner = sink
                    .owner_of(KRef::Object(ko))
                    .ok_or_else(|| KernelError::VatNotFound(ko.to_string()))?;
                let target_eref = self.store.kref_to_eref(owner, KRef::Object(ko))?;
                match sink.deliver(owner, target_eref, &message).await {
                    Ok(data) => self.settle(message.result, false, data),
                    Err(err) => self.settle(message.result, true, rejection(&err.to_string())),
                }
                Ok(())
            }
            KRef::Promise(kp) => {
                let promise = self.store.get_kernel_promise(kp)?;
                match promise.state {
                    PromiseState::Unresolved { .. } => {
                        debug!(promise = %kp, "pipelining send onto unresolved promise");
                        self.pending_on_promise
                            .lock()
                            .entry(kp)
                            .or_default()
                            .push(RunQueueEntry::Send {
                                target: KRef::Promise(kp),
                                message,
                            });
                        Ok(())
                    }
                    PromiseState::Fulfilled { data } => {
                        self.settle(message.result, false, data);
                        Ok(())
                    }
                    PromiseState::Rejected { data } => {
                        self.settle(message.result, true, data);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn dispatch_notify(
        &self,
        subscriber: EndpointId,
        promise: KpRef,
        sink: &dyn VatSink,
    ) -> Result<()> {
        let settled = self.store.get_kernel_promise(promise)?;
        let (rejected, data) = match settled.state {
            PromiseState::Unresolved { .. } => {
                warn!(promise = %promise, "notify dispatched before promise settled");
                return Ok(());
            }
            PromiseState::Fulfilled { data } => (false, data),
            PromiseState::Rejected { data } => (true, data),
        };
        let eref = self
            .store
            .kref_to_eref(subscriber, KRef::Promise(promise))
            .unwrap_or(ERef {
                kind: crate::refs::RefKind::Promise,
                sign: crate::refs::Sign::Import,
                id: self.store.next_local_id(subscriber),
            });
        sink.notify(subscriber, eref, &data, rejected).await?;

        if let Some(pending) = self.pending_on_promise.lock().remove(&promise) {
            for entry in pending {
                self.queue.push(entry);
            }
        }
        Ok(())
    }

    fn dispatch_gc_drop(&self, endpoint: EndpointId, kref: KRef) -> Result<()> {
        self.store.clear_reachable_flag(endpoint, kref)?;
        self.store.forget_kref(endpoint, kref)?;
        if let KRef::Object(ko) = kref {
            self.retire_if_dead(ko);
        }
        Ok(())
    }

    fn dispatch_gc_retire(&self, endpoint: EndpointId, kref: KRef) -> Result<()> {
        let _ = self.store.clear_reachable_flag(endpoint, kref);
        self.store.forget_kref(endpoint, kref)?;
        if let KRef::Object(ko) = kref {
            self.retire_if_dead(ko);
        }
        Ok(())
    }

    /// Removes `ko` once it's both unreachable and unrecognizable,
    /// notifying subscribers of whichever owned promises got rejected in
    /// the cascade (§4.3 gc-drop/gc-retire contract).
    fn retire_if_dead(&self, ko: KoRef) {
        match self.store.try_retire_object(ko) {
            Ok(Some(cascaded)) => {
                for kp in cascaded {
                    self.notify_subscribers(kp);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(object = %ko, error = %err, "failed to check object for retirement"),
        }
    }

    fn settle(&self, result: Option<KpRef>, rejected: bool, data: CapData) {
        let Some(kp) = result else { return };
        match self.store.resolve_kernel_promise(kp, rejected, data) {
            Ok(()) => self.notify_subscribers(kp),
            Err(err) => warn!(promise = %kp, error = %err, "failed to settle result promise"),
        }
    }

    /// Pushes one `Notify` entry per subscriber, in insertion order (§4.3).
    fn notify_subscribers(&self, kp: KpRef) {
        let subscribers = match self.store.get_kernel_promise(kp) {
            Ok(promise) => promise.subscribers,
            Err(err) => {
                warn!(promise = %kp, error = %err, "settled promise vanished before notify");
                return;
            }
        };
        for subscriber in subscribers {
            self.queue.push(RunQueueEntry::Notify {
                subscriber,
                promise: kp,
            });
        }
    }

    /// Upward `subscribe` syscall (§6): registers `subscriber` for `kp`'s
    /// eventual settlement, firing an immediate notify if it already
    /// settled before the subscription was registered.
    pub fn subscribe(&self, subscriber: EndpointId, kp: KpRef) -> Result<()> {
        self.store.subscribe_to_promise(kp, subscriber)?;
        if self.store.get_kernel_promise(kp)?.is_settled() {
            self.queue.push(RunQueueEntry::Notify {
                subscriber,
                promise: kp,
            });
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

fn rejection(reason: &str) -> CapData {
    CapData::new(format!("{{\"error\":\"{reason}\"}}"), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSink {
        deliveries: AtomicUsize,
    }

    #[async_trait]
    impl VatSink for NullSink {
        async fn deliver(
            &self,
            _vat: EndpointId,
            _target: ERef,
            _message: &Message,
        ) -> Result<CapData> {
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(CapData::empty())
        }

        async fn notify(
            &self,
            _vat: EndpointId,
            _promise: ERef,
            _resolution: &CapData,
            _rejected: bool,
        ) -> Result<()> {
            Ok(())
        }

        fn owner_of(&self, _kref: KRef) -> Option<EndpointId> {
            Some(EndpointId::Vat(1))
        }
    }

    fn router() -> (Router, Arc<KernelStore>) {
        let store = Arc::new(KernelStore::new());
        let marshal = Arc::new(Marshal::new(store.clone()));
        let queue = Arc::new(RunQueue::new());
        let services = Arc::new(ServiceRegistry::new());
        (Router::new(store.clone(), marshal, queue, services), store)
    }

    #[tokio::test]
    async fn send_to_object_delivers_once() {
        let (router, store) = router();
        let owner = EndpointId::Vat(1);
        let ko = store.init_kernel_object(owner);
        let sink = NullSink {
            deliveries: AtomicUsize::new(0),
        };

        router
            .dispatch(
                RunQueueEntry::Send {
                    target: KRef::Object(ko),
                    message: Message {
                        method: "ping".into(),
                        args: CapData::empty(),
                        result: None,
                    },
                },
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_to_unresolved_promise_pipelines() {
        let (router, store) = router();
        let decider = EndpointId::Vat(1);
        let kp = store.init_kernel_promise(decider);
        let sink = NullSink {
            deliveries: AtomicUsize::new(0),
        };

        router
            .dispatch(
                RunQueueEntry::Send {
                    target: KRef::Promise(kp),
                    message: Message {
                        method: "ping".into(),
                        args: CapData::empty(),
                        result: None,
                    },
                },
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(router.pending_on_promise.lock().get(&kp).unwrap().len(), 1);
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_one_crank_reports_empty_queue() {
        let (router, _store) = router();
        let sink = NullSink {
            deliveries: AtomicUsize::new(0),
        };
        assert!(!router.run_one_crank(&sink).await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_crank_returns_when_idle() {
        let (router, _store) = router();
        router.wait_for_crank().await;
    }

    #[tokio::test]
    async fn settle_notifies_real_subscribers_instead_of_a_fake_one() {
        let (router, store) = router();
        let decider = EndpointId::Vat(1);
        let kp = store.init_kernel_promise(decider);
        router.subscribe(EndpointId::Vat(2), kp).unwrap();
        router.subscribe(EndpointId::Vat(3), kp).unwrap();

        router.settle(Some(kp), false, CapData::empty());

        let mut queued = Vec::new();
        while let Some(entry) = router.queue.pop() {
            queued.push(entry);
        }
        assert_eq!(queued.len(), 2);
        assert!(matches!(
            queued[0],
            RunQueueEntry::Notify { subscriber: EndpointId::Vat(2), promise } if promise == kp
        ));
        assert!(matches!(
            queued[1],
            RunQueueEntry::Notify { subscriber: EndpointId::Vat(3), promise } if promise == kp
        ));
    }

    #[tokio::test]
    async fn subscribe_to_already_settled_promise_fires_immediately() {
        let (router, store) = router();
        let kp = store.init_kernel_promise(EndpointId::Vat(1));
        store
            .resolve_kernel_promise(kp, false, CapData::empty())
            .unwrap();

        router.subscribe(EndpointId::Vat(2), kp).unwrap();

        assert!(matches!(
            router.queue.pop(),
            Some(RunQueueEntry::Notify { subscriber: EndpointId::Vat(2), promise }) if promise == kp
        ));
    }

    #[tokio::test]
    async fn gc_retire_removes_dead_object_and_cascades_owned_promise() {
        let (router, store) = router();
        let owner = EndpointId::Vat(1);
        let ko = store.init_kernel_object(owner);
        let kp = store.init_kernel_promise(owner);
        store.associate_promise_with_object(ko, kp).unwrap();
        router.subscribe(EndpointId::Vat(2), kp).unwrap();
        let eref = ERef {
            kind: crate::refs::RefKind::Object,
            sign: crate::refs::Sign::Export,
            id: store.next_local_id(owner),
        };
        store.add_clist_entry(owner, KRef::Object(ko), eref).unwrap();

        let sink = NullSink {
            deliveries: AtomicUsize::new(0),
        };
        router
            .dispatch(RunQueueEntry::GcRetire { endpoint: owner, kref: KRef::Object(ko) }, &sink)
            .await
            .unwrap();

        assert!(store.try_retire_object(ko).unwrap().is_none());
        let promise = store.get_kernel_promise(kp).unwrap();
        assert!(promise.is_settled());
        assert!(matches!(
            router.queue.pop(),
            Some(RunQueueEntry::Notify { subscriber: EndpointId::Vat(2), promise: p }) if p == kp
        ));
    }
}
