//! Kernel store: the durable key-value view of kernel state (§4.1).
//!
//! Every mutator either completes fully or leaves state unchanged — a
//! crank is the atomic commit boundary, so the store itself never needs
//! partial-write recovery beyond what `parking_lot::Mutex` already gives
//! a single in-process writer.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::capdata::CapData;
use crate::error::{KernelError, Result};
use crate::refs::{EndpointId, ERef, KRef, KoRef, KpRef, RefAllocator, RefHighWaterMarks};

/// A kernel object's identity record (§3.2).
#[derive(Debug, Clone)]
pub struct KernelObject {
    pub owner: EndpointId,
    pub revoked: bool,
    pub reachable_count: u32,
    pub recognizable_count: u32,
    /// Result promises created for a `send` targeting this object, so a
    /// gc-retire can reject whichever of them are still outstanding.
    pub owned_promises: Vec<KpRef>,
}

/// Settlement state of a kernel promise (§3.2).
#[derive(Debug, Clone)]
pub enum PromiseState {
    Unresolved { decider: EndpointId },
    Fulfilled { data: CapData },
    Rejected { data: CapData },
}

#[derive(Debug, Clone)]
pub struct KernelPromise {
    pub state: PromiseState,
    /// Subscribers in insertion order — notification tie-breaks (§4.3).
    pub subscribers: Vec<EndpointId>,
}

impl KernelPromise {
    pub fn is_settled(&self) -> bool {
        !matches!(self.state, PromiseState::Unresolved { .. })
    }
}

#[derive(Default)]
struct CList {
    fwd: HashMap<ERef, KRef>,
    rev: HashMap<KRef, ERef>,
    reachable: HashMap<KRef, bool>,
    next_local_id: u64,
}

/// What `cleanup_terminated_vat` hands back so callers (the vat manager)
/// can retire exports and reject outstanding promises.
#[derive(Debug, Clone, Default)]
pub struct TerminatedVatCleanup {
    pub exports: Vec<KRef>,
    pub imports: Vec<KRef>,
    pub promises: Vec<KpRef>,
}

struct Inner {
    objects: HashMap<KoRef, KernelObject>,
    promises: HashMap<KpRef, KernelPromise>,
    clists: HashMap<EndpointId, CList>,
    pinned: HashSet<KoRef>,
    vatstore: HashMap<String, String>,
    allocator: RefAllocator,
}

/// The kernel's durable key-value view of all kernel state.
///
/// In-process today (guarded by a single mutex, consistent with §5's
/// single-writer-per-crank model); `reset`/`clear` and the `vatstore_*`
/// accessors are namespaced the way a real backing store would be, so
/// swapping in a persisted backend later doesn't change the key shape.
pub struct KernelStore {
    inner: Mutex<Inner>,
}

impl KernelStore {
    pub fn new() -> Self {
        Self::with_high_water_marks(RefHighWaterMarks::default())
    }

    /// Rebuild a store whose ref allocator resumes past every previously
    /// issued id — used on restart once the store's own persisted snapshot
    /// (not modeled here) reports its high-water marks.
    pub fn with_high_water_marks(marks: RefHighWaterMarks) -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                promises: HashMap::new(),
                clists: HashMap::new(),
                pinned: HashSet::new(),
                vatstore: HashMap::new(),
                allocator: RefAllocator::resume_from(marks),
            }),
        }
    }

    pub fn init_kernel_object(&self, owner: EndpointId) -> KoRef {
        let mut inner = self.inner.lock();
        let ko = inner.allocator.next_ko();
        inner.objects.insert(
            ko,
            KernelObject {
                owner,
                revoked: false,
                reachable_count: 0,
                recognizable_count: 0,
                owned_promises: Vec::new(),
            },
        );
        ko
    }

    /// Records that `kp` is the result promise of a `send` targeting `ko`,
    /// so a later gc-retire of `ko` knows which promises to cascade.
    pub fn associate_promise_with_object(&self, ko: KoRef, kp: KpRef) -> Result<()> {
        let mut inner = self.inner.lock();
        let obj = inner
            .objects
            .get_mut(&ko)
            .ok_or_else(|| KernelError::UnknownSlot(ko.to_string()))?;
        if !obj.owned_promises.contains(&kp) {
            obj.owned_promises.push(kp);
        }
        Ok(())
    }

    /// Retires `ko` once both its reachable and recognizable counts have
    /// hit zero: removes the `KernelObject` and rejects whichever of its
    /// owned promises are still unresolved, returning those for the
    /// caller to notify. Returns `None` if `ko` is still alive or unknown.
    pub fn try_retire_object(&self, ko: KoRef) -> Result<Option<Vec<KpRef>>> {
        let mut inner = self.inner.lock();
        let dead = match inner.objects.get(&ko) {
            Some(obj) => obj.reachable_count == 0 && obj.recognizable_count == 0,
            None => return Ok(None),
        };
        if !dead {
            return Ok(None);
        }
        let obj = inner.objects.remove(&ko).expect("checked above");
        let mut cascaded = Vec::new();
        for kp in obj.owned_promises {
            if let Some(promise) = inner.promises.get_mut(&kp) {
                if !promise.is_settled() {
                    promise.state = PromiseState::Rejected {
                        data: CapData::new("{\"error\":\"object retired\"}".to_string(), Vec::new()),
                    };
                    cascaded.push(kp);
                }
            }
        }
        Ok(Some(cascaded))
    }

    /// Invariant 7: removes `sv*` c-lists left by an earlier incarnation
    /// that `live_system_vats` no longer claims, before the run queue
    /// resumes after a restart.
    pub fn purge_stale_system_clists(&self, live_system_vats: &HashSet<EndpointId>) {
        let mut inner = self.inner.lock();
        let stale: Vec<EndpointId> = inner
            .clists
            .keys()
            .copied()
            .filter(|id| id.is_system() && !live_system_vats.contains(id))
            .collect();
        for id in stale {
            inner.clists.remove(&id);
        }
    }

    pub fn init_kernel_promise(&self, decider: EndpointId) -> KpRef {
        let mut inner = self.inner.lock();
        let kp = inner.allocator.next_kp();
        inner.promises.insert(
            kp,
            KernelPromise {
                state: PromiseState::Unresolved { decider },
                subscribers: Vec::new(),
            },
        );
        kp
    }

    /// Records a bidirectional c-list entry. Invariant 1: every entry is
    /// consistent across both directions by construction — there is no API
    /// to write only one side. Invariant 3: a freshly reachable entry bumps
    /// the owning object's `reachable_count` right here, not in a separate
    /// step a caller might forget.
    pub fn add_clist_entry(&self, endpoint: EndpointId, kref: KRef, eref: ERef) -> Result<()> {
        use std::collections::hash_map::Entry;

        let mut inner = self.inner.lock();
        let newly_reachable = {
            let clist = inner.clists.entry(endpoint).or_default();
            clist.fwd.insert(eref, kref);
            clist.rev.insert(kref, eref);
            match clist.reachable.entry(kref) {
                Entry::Vacant(v) => {
                    v.insert(true);
                    true
                }
                Entry::Occupied(_) => false,
            }
        };
        if newly_reachable {
            if let KRef::Object(ko) = kref {
                if let Some(obj) = inner.objects.get_mut(&ko) {
                    obj.reachable_count += 1;
                }
            }
        }
        Ok(())
    }

    pub fn eref_to_kref(&self, endpoint: EndpointId, eref: ERef) -> Result<KRef> {
        let inner = self.inner.lock();
        inner
            .clists
            .get(&endpoint)
            .and_then(|c| c.fwd.get(&eref).copied())
            .ok_or_else(|| KernelError::UnknownSlot(format!("{endpoint}:{eref}")))
    }

    pub fn kref_to_eref(&self, endpoint: EndpointId, kref: KRef) -> Result<ERef> {
        let inner = self.inner.lock();
        inner
            .clists
            .get(&endpoint)
            .and_then(|c| c.rev.get(&kref).copied())
            .ok_or_else(|| KernelError::UnknownSlot(format!("{endpoint}:{kref}")))
    }

    pub fn forget_kref(&self, endpoint: EndpointId, kref: KRef) -> Result<()> {
        let mut inner = self.inner.lock();
        let clist = inner
            .clists
            .get_mut(&endpoint)
            .ok_or_else(|| KernelError::VatNotFound(endpoint.to_string()))?;
        if let Some(eref) = clist.rev.remove(&kref) {
            clist.fwd.remove(&eref);
        }
        clist.reachable.remove(&kref);
        Ok(())
    }

    pub fn get_reachable_flag(&self, endpoint: EndpointId, kref: KRef) -> Result<bool> {
        let inner = self.inner.lock();
        inner
            .clists
            .get(&endpoint)
            .and_then(|c| c.reachable.get(&kref).copied())
            .ok_or_else(|| KernelError::UnknownSlot(format!("{endpoint}:{kref}")))
    }

    pub fn clear_reachable_flag(&self, endpoint: EndpointId, kref: KRef) -> Result<()> {
        let mut inner = self.inner.lock();
        let was_set = {
            let clist = inner
                .clists
                .get_mut(&endpoint)
                .ok_or_else(|| KernelError::VatNotFound(endpoint.to_string()))?;
            let flag = clist
                .reachable
                .get_mut(&kref)
                .ok_or_else(|| KernelError::UnknownSlot(format!("{endpoint}:{kref}")))?;
            let was_set = *flag;
            *flag = false;
            was_set
        };
        if was_set {
            if let KRef::Object(ko) = kref {
                if let Some(obj) = inner.objects.get_mut(&ko) {
                    obj.reachable_count = obj.reachable_count.saturating_sub(1);
                }
            }
        }
        Ok(())
    }

    pub fn increment_reachable(&self, kref: KRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if let KRef::Object(ko) = kref {
            let obj = inner
                .objects
                .get_mut(&ko)
                .ok_or_else(|| KernelError::UnknownSlot(ko.to_string()))?;
            obj.reachable_count += 1;
        }
        Ok(())
    }

    pub fn decrement_reachable(&self, kref: KRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if let KRef::Object(ko) = kref {
            let obj = inner
                .objects
                .get_mut(&ko)
                .ok_or_else(|| KernelError::UnknownSlot(ko.to_string()))?;
            obj.reachable_count = obj.reachable_count.saturating_sub(1);
        }
        Ok(())
    }

    pub fn get_kernel_promise(&self, kp: KpRef) -> Result<KernelPromise> {
        let inner = self.inner.lock();
        inner
            .promises
            .get(&kp)
            .cloned()
            .ok_or_else(|| KernelError::UnknownSlot(kp.to_string()))
    }

    /// Resolves a promise exactly once. Invariant 4: a resolved promise
    /// never becomes unresolved again; a second attempt is a fatal error
    /// (§4.3 tie-breaks note — only the decider may resolve).
    pub fn resolve_kernel_promise(&self, kp: KpRef, rejected: bool, data: CapData) -> Result<()> {
        let mut inner = self.inner.lock();
        let promise = inner
            .promises
            .get_mut(&kp)
            .ok_or_else(|| KernelError::UnknownSlot(kp.to_string()))?;
        if promise.is_settled() {
            return Err(KernelError::PromiseAlreadyResolved(kp.to_string()));
        }
        promise.state = if rejected {
            PromiseState::Rejected { data }
        } else {
            PromiseState::Fulfilled { data }
        };
        Ok(())
    }

    /// Registers `subscriber` to be notified when `kp` settles, preserving
    /// insertion order for the notify tie-break rule.
    pub fn subscribe_to_promise(&self, kp: KpRef, subscriber: EndpointId) -> Result<()> {
        let mut inner = self.inner.lock();
        let promise = inner
            .promises
            .get_mut(&kp)
            .ok_or_else(|| KernelError::UnknownSlot(kp.to_string()))?;
        if !promise.subscribers.contains(&subscriber) {
            promise.subscribers.push(subscriber);
        }
        Ok(())
    }

    pub fn get_promises_by_decider(&self, endpoint: EndpointId) -> Vec<KpRef> {
        let inner = self.inner.lock();
        inner
            .promises
            .iter()
            .filter_map(|(kp, p)| match p.state {
                PromiseState::Unresolved { decider } if decider == endpoint => Some(*kp),
                _ => None,
            })
            .collect()
    }

    /// Removes a terminated endpoint's c-list and returns what it owned, so
    /// the caller can reject promises and retire exports (§4.4 termination
    /// policy).
    pub fn cleanup_terminated_vat(&self, endpoint: EndpointId) -> Result<TerminatedVatCleanup> {
        let mut inner = self.inner.lock();
        let clist = inner.clists.remove(&endpoint).unwrap_or_default();

        let mut exports = Vec::new();
        let mut imports = Vec::new();
        for (eref, kref) in clist.fwd.iter() {
            match eref.sign {
                crate::refs::Sign::Export => exports.push(*kref),
                crate::refs::Sign::Import => imports.push(*kref),
            }
        }

        let promises = inner
            .promises
            .iter()
            .filter_map(|(kp, p)| match p.state {
                PromiseState::Unresolved { decider } if decider == endpoint => Some(*kp),
                _ => None,
            })
            .collect();

        Ok(TerminatedVatCleanup {
            exports,
            imports,
            promises,
        })
    }

    pub fn revoke(&self, ko: KoRef) -> Result<()> {
        let mut inner = self.inner.lock();
        let obj = inner
            .objects
            .get_mut(&ko)
            .ok_or_else(|| KernelError::UnknownSlot(ko.to_string()))?;
        obj.revoked = true;
        Ok(())
    }

    pub fn is_revoked(&self, ko: KoRef) -> bool {
        let inner = self.inner.lock();
        inner.objects.get(&ko).map(|o| o.revoked).unwrap_or(false)
    }

    pub fn pin_object(&self, ko: KoRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.objects.contains_key(&ko) {
            return Err(KernelError::UnknownSlot(ko.to_string()));
        }
        inner.pinned.insert(ko);
        Ok(())
    }

    pub fn unpin_object(&self, ko: KoRef) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pinned.remove(&ko);
        Ok(())
    }

    pub fn is_pinned(&self, ko: KoRef) -> bool {
        self.inner.lock().pinned.contains(&ko)
    }

    /// Drops all state except keys in `except` (by exact key match against
    /// a vatstore-style `<endpoint>.vs.<key>` namespace).
    pub fn reset(&self, except: &HashSet<String>) {
        let mut inner = self.inner.lock();
        inner.objects.clear();
        inner.promises.clear();
        inner.clists.clear();
        inner.pinned.clear();
        inner.vatstore.retain(|k, _| except.contains(k));
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.objects.clear();
        inner.promises.clear();
        inner.clists.clear();
        inner.pinned.clear();
        inner.vatstore.clear();
    }

    /// Namespaced view over the vatstore syscall surface (`vatstoreGet/Set/
    /// Delete`, §6): keys live under `<endpoint>.vs.<key>`.
    pub fn vatstore_get(&self, endpoint: EndpointId, key: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner.vatstore.get(&vatstore_key(endpoint, key)).cloned()
    }

    pub fn vatstore_set(&self, endpoint: EndpointId, key: &str, value: String) {
        let mut inner = self.inner.lock();
        inner.vatstore.insert(vatstore_key(endpoint, key), value);
    }

    pub fn vatstore_delete(&self, endpoint: EndpointId, key: &str) {
        let mut inner = self.inner.lock();
        inner.vatstore.remove(&vatstore_key(endpoint, key));
    }

    /// All endpoints with a live c-list, for reachability sweeps and
    /// `bringOutYourDead` driving.
    pub fn live_endpoints(&self) -> Vec<EndpointId> {
        self.inner.lock().clists.keys().copied().collect()
    }

    pub fn allocate_ko(&self, owner: EndpointId) -> KoRef {
        self.init_kernel_object(owner)
    }

    /// Mints the next endpoint-local ref id for `endpoint`, monotonic and
    /// never reused for the lifetime of that endpoint's c-list.
    pub fn next_local_id(&self, endpoint: EndpointId) -> u64 {
        let mut inner = self.inner.lock();
        let clist = inner.clists.entry(endpoint).or_default();
        clist.next_local_id += 1;
        clist.next_local_id
    }
}

impl Default for KernelStore {
    fn default() -> Self {
        Self::new()
    }
}

fn vatstore_key(endpoint: EndpointId, key: &str) -> String {
    format!("{endpoint}.vs.{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::{RefKind, Sign};

    fn eref(kind: RefKind, sign: Sign, id: u64) -> ERef {
        ERef { kind, sign, id }
    }

    #[test]
    fn eref_kref_round_trip() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        let ko = store.init_kernel_object(vat);
        let e = eref(RefKind::Object, Sign::Export, 1);
        store.add_clist_entry(vat, KRef::Object(ko), e).unwrap();

        let kref = store.eref_to_kref(vat, e).unwrap();
        let back = store.kref_to_eref(vat, kref).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn promise_settles_once() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        let kp = store.init_kernel_promise(vat);
        store
            .resolve_kernel_promise(kp, false, CapData::empty())
            .unwrap();
        let err = store
            .resolve_kernel_promise(kp, false, CapData::empty())
            .unwrap_err();
        assert!(matches!(err, KernelError::PromiseAlreadyResolved(_)));
    }

    #[test]
    fn reachability_tracks_clear_flag() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        let ko = store.init_kernel_object(vat);
        let e = eref(RefKind::Object, Sign::Export, 1);
        store.add_clist_entry(vat, KRef::Object(ko), e).unwrap();

        assert!(store.get_reachable_flag(vat, KRef::Object(ko)).unwrap());
        store.clear_reachable_flag(vat, KRef::Object(ko)).unwrap();
        assert!(!store.get_reachable_flag(vat, KRef::Object(ko)).unwrap());
    }

    #[test]
    fn add_clist_entry_bumps_reachable_count_once() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        let ko = store.init_kernel_object(vat);
        store
            .add_clist_entry(vat, KRef::Object(ko), eref(RefKind::Object, Sign::Export, 1))
            .unwrap();

        let count = store.inner.lock().objects.get(&ko).unwrap().reachable_count;
        assert_eq!(count, 1);

        // Re-adding the same kref under a second eref must not double-count
        // an already-reachable entry.
        store
            .add_clist_entry(vat, KRef::Object(ko), eref(RefKind::Object, Sign::Import, 2))
            .unwrap();
        let count = store.inner.lock().objects.get(&ko).unwrap().reachable_count;
        assert_eq!(count, 1);
    }

    #[test]
    fn cleanup_terminated_vat_splits_exports_and_imports() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        let ko_export = store.init_kernel_object(vat);
        let ko_import = store.init_kernel_object(EndpointId::Vat(2));
        store
            .add_clist_entry(
                vat,
                KRef::Object(ko_export),
                eref(RefKind::Object, Sign::Export, 1),
            )
            .unwrap();
        store
            .add_clist_entry(
                vat,
                KRef::Object(ko_import),
                eref(RefKind::Object, Sign::Import, 2),
            )
            .unwrap();

        let cleanup = store.cleanup_terminated_vat(vat).unwrap();
        assert_eq!(cleanup.exports, vec![KRef::Object(ko_export)]);
        assert_eq!(cleanup.imports, vec![KRef::Object(ko_import)]);
    }

    #[test]
    fn vatstore_round_trip() {
        let store = KernelStore::new();
        let vat = EndpointId::Vat(1);
        assert_eq!(store.vatstore_get(vat, "k"), None);
        store.vatstore_set(vat, "k", "v".to_string());
        assert_eq!(store.vatstore_get(vat, "k").as_deref(), Some("v"));
        store.vatstore_delete(vat, "k");
        assert_eq!(store.vatstore_get(vat, "k"), None);
    }

    #[test]
    fn revoke_and_pin() {
        let store = KernelStore::new();
        let ko = store.init_kernel_object(EndpointId::Vat(1));
        assert!(!store.is_revoked(ko));
        store.revoke(ko).unwrap();
        assert!(store.is_revoked(ko));

        store.pin_object(ko).unwrap();
        assert!(store.is_pinned(ko));
        store.unpin_object(ko).unwrap();
        assert!(!store.is_pinned(ko));
    }
}
