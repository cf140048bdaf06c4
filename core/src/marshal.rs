//! Marshal / slot translation (§4.2).
//!
//! Converts between `CapData` (a structured body plus an ordered slot
//! list) and the kernel's internal kref representation. The marshaller
//! itself never inspects the body; it only ever touches `slots`.

use std::sync::Arc;

use crate::capdata::{CapData, Standin};
use crate::error::{KernelError, Result};
use crate::refs::{EndpointId, ERef, KRef, RefKind, Sign};
use crate::store::KernelStore;

/// Direction of a translation, which determines how an unseen slot is
/// allocated: exports mint a fresh kernel object owned by the endpoint,
/// imports mint a fresh local alias for an existing kernel ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Endpoint → kernel: the endpoint is handing out one of its own
    /// values.
    Export,
    /// Kernel → endpoint: the endpoint is receiving a reference it may not
    /// have seen before.
    Import,
}

/// Translates `CapData` between an endpoint's local slot strings and the
/// kernel's interned ref space. One instance serves every endpoint; it
/// carries no per-call state beyond the shared store.
pub struct Marshal {
    store: Arc<KernelStore>,
}

impl Marshal {
    pub fn new(store: Arc<KernelStore>) -> Self {
        Self { store }
    }

    /// vat → kernel: the sending endpoint's local refs become kernel refs.
    pub fn vat_to_kernel(&self, endpoint: EndpointId, data: &CapData) -> Result<CapData> {
        self.to_kernel(endpoint, data, false)
    }

    /// remote → kernel: same translation, but slots are printed in the
    /// `ro±N`/`rp±N` remote ref shape rather than `o±N`/`p±N`.
    pub fn remote_to_kernel(&self, endpoint: EndpointId, data: &CapData) -> Result<CapData> {
        self.to_kernel(endpoint, data, true)
    }

    fn to_kernel(&self, endpoint: EndpointId, data: &CapData, remote: bool) -> Result<CapData> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for slot in &data.slots {
            let eref = parse_local_slot(slot, remote)?;
            let kref = match self.store.eref_to_kref(endpoint, eref) {
                Ok(kref) => kref,
                Err(_) => self.allocate_for_export(endpoint, eref)?,
            };
            slots.push(kref.to_string());
        }
        Ok(CapData::new(data.body.clone(), slots))
    }

    /// kernel → vat: kernel refs become (or reuse) the receiving endpoint's
    /// local aliases.
    pub fn kernel_to_vat(&self, endpoint: EndpointId, data: &CapData) -> Result<CapData> {
        self.from_kernel(endpoint, data, false)
    }

    /// kernel → remote: same, printed in the remote ref shape.
    pub fn kernel_to_remote(&self, endpoint: EndpointId, data: &CapData) -> Result<CapData> {
        self.from_kernel(endpoint, data, true)
    }

    fn from_kernel(&self, endpoint: EndpointId, data: &CapData, remote: bool) -> Result<CapData> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for slot in &data.slots {
            let kref: KRef = slot
                .parse()
                .map_err(|_| KernelError::UnknownSlot(slot.clone()))?;
            self.reject_if_revoked(kref)?;
            let eref = match self.store.kref_to_eref(endpoint, kref) {
                Ok(eref) => eref,
                Err(_) => self.allocate_for_import(endpoint, kref)?,
            };
            let printed = if remote {
                let rref: crate::refs::RRef = eref.into();
                rref.to_string()
            } else {
                eref.to_string()
            };
            slots.push(printed);
        }
        Ok(CapData::new(data.body.clone(), slots))
    }

    fn allocate_for_export(&self, endpoint: EndpointId, eref: ERef) -> Result<KRef> {
        let kref = match eref.kind {
            RefKind::Object => KRef::Object(self.store.init_kernel_object(endpoint)),
            RefKind::Promise => KRef::Promise(self.store.init_kernel_promise(endpoint)),
        };
        self.store.add_clist_entry(endpoint, kref, eref)?;
        Ok(kref)
    }

    fn allocate_for_import(&self, endpoint: EndpointId, kref: KRef) -> Result<ERef> {
        let kind = match kref {
            KRef::Object(_) => RefKind::Object,
            KRef::Promise(_) => RefKind::Promise,
        };
        let id = self.store.next_local_id(endpoint);
        let eref = ERef {
            kind,
            sign: Sign::Import,
            id,
        };
        self.store.add_clist_entry(endpoint, kref, eref)?;
        Ok(eref)
    }

    fn reject_if_revoked(&self, kref: KRef) -> Result<()> {
        if let KRef::Object(ko) = kref {
            if self.store.is_revoked(ko) {
                return Err(KernelError::RevokedObject(ko.to_string()));
            }
        }
        Ok(())
    }

    /// Produces a `Standin` for a kernel ref, for code that wants a typed
    /// in-memory handle rather than a formatted slot string.
    pub fn standin_for(&self, kref: KRef) -> Standin {
        Standin::new(kref)
    }
}

fn parse_local_slot(slot: &str, remote: bool) -> Result<ERef> {
    if remote {
        slot.parse::<crate::refs::RRef>()
            .map(ERef::from)
            .map_err(|_| KernelError::UnknownSlot(slot.to_string()))
    } else {
        slot.parse::<ERef>()
            .map_err(|_| KernelError::UnknownSlot(slot.to_string()))
    }
}
