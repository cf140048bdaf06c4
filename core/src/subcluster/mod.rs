//! Subcluster manager (§4.5): group provisioning, bootstrap, persistence.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capdata::CapData;
use crate::error::{KernelError, Result};
use crate::refs::{EndpointId, KRef, KoRef, RefAllocator, SubclusterId};
use crate::runqueue::{Message, RunQueue, RunQueueEntry, Router};
use crate::store::KernelStore;
use crate::vat::{VatConfig, VatManager};

/// The declarative config a subcluster is launched from (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubclusterConfig {
    pub bootstrap: String,
    pub vats: HashMap<String, VatConfig>,
    #[serde(default)]
    pub bundles: Option<HashMap<String, String>>,
    #[serde(default)]
    pub services: Option<Vec<String>>,
}

impl SubclusterConfig {
    fn validate(&self) -> Result<()> {
        if self.vats.is_empty() {
            return Err(KernelError::InvalidClusterConfig);
        }
        if !self.vats.contains_key(&self.bootstrap) {
            return Err(KernelError::InvalidBootstrapVatName);
        }
        for config in self.vats.values() {
            config.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SubclusterState {
    Running,
    Terminated,
}

/// In-memory lifecycle record for a launched subcluster.
pub struct SubclusterRecord {
    pub config: SubclusterConfig,
    pub bootstrap_vat: EndpointId,
    pub vat_ids: HashMap<String, EndpointId>,
    pub root: KoRef,
    pub state: SubclusterState,
    pub launched_at: chrono::DateTime<chrono::Utc>,
}

/// Read-only projection of a `SubclusterRecord`, returned by
/// `get_subcluster` instead of a borrow into the manager's lock.
#[derive(Debug, Clone, Serialize)]
pub struct SubclusterStatus {
    pub bootstrap_vat: EndpointId,
    pub vat_ids: HashMap<String, EndpointId>,
    pub root: KoRef,
    pub state: SubclusterState,
    pub launched_at: chrono::DateTime<chrono::Utc>,
}

impl From<&SubclusterRecord> for SubclusterStatus {
    fn from(record: &SubclusterRecord) -> Self {
        Self {
            bootstrap_vat: record.bootstrap_vat,
            vat_ids: record.vat_ids.clone(),
            root: record.root,
            state: record.state.clone(),
            launched_at: record.launched_at,
        }
    }
}

/// Serializable snapshot used for on-disk persistence (§4.5 persistence,
/// recovered on restart).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSubcluster {
    pub id: String,
    pub config: SubclusterConfig,
    pub bootstrap_vat: String,
    pub vat_ids: HashMap<String, String>,
    pub root: String,
    /// System subclusters are recreated only while still named in the
    /// current system config; unconfigured ones are orphan-cleaned rather
    /// than relaunched (their vats may have side effects on launch).
    pub is_system: bool,
    pub launched_at: chrono::DateTime<chrono::Utc>,
}

pub struct LaunchOutcome {
    pub subcluster_id: SubclusterId,
    pub root_kref: KoRef,
    pub bootstrap_result: CapData,
    /// Correlates this launch attempt across log lines; distinct from
    /// `subcluster_id`; not persisted.
    pub launch_id: uuid::Uuid,
}

/// A named group of vats launched together from one config with one
/// bootstrap vat.
pub struct SubclusterManager {
    store: Arc<KernelStore>,
    allocator: Arc<RefAllocator>,
    vats: Arc<VatManager>,
    queue: Arc<RunQueue>,
    router: Arc<Router>,
    records: Mutex<HashMap<SubclusterId, SubclusterRecord>>,
}

impl SubclusterManager {
    pub fn new(
        store: Arc<KernelStore>,
        allocator: Arc<RefAllocator>,
        vats: Arc<VatManager>,
        queue: Arc<RunQueue>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            store,
            allocator,
            vats,
            queue,
            router,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Launch protocol (§4.5):
    /// 1. Validate config.
    /// 2. Allocate a fresh subcluster id; launch each vat and wire its
    ///    root export into the c-list.
    /// 3. Enqueue a single bootstrap message with argument records naming
    ///    the other vats' roots and any requested kernel services.
    /// 4. Return the settled bootstrap result.
    pub async fn launch_subcluster(&self, config: SubclusterConfig) -> Result<LaunchOutcome> {
        config.validate()?;

        let subcluster_id = self.allocator.next_subcluster();
        let mut vat_ids = HashMap::new();
        let mut roots = HashMap::new();
        for (name, vat_config) in &config.vats {
            let (id, root) = self
                .vats
                .launch_vat(vat_config.clone(), Some(subcluster_id))?;
            vat_ids.insert(name.clone(), id);
            roots.insert(name.clone(), root);
        }

        let bootstrap_vat = *vat_ids.get(&config.bootstrap).expect("validated above");
        let root = *roots.get(&config.bootstrap).expect("validated above");

        let other_roots: HashMap<String, String> = roots
            .iter()
            .filter(|(name, _)| *name != &config.bootstrap)
            .map(|(name, ko)| (name.clone(), ko.to_string()))
            .collect();
        let services = config.services.clone().unwrap_or_default();
        let bootstrap_args = CapData::new(
            serde_json::json!({ "vats": other_roots, "services": services }).to_string(),
            Vec::new(),
        );

        let kp = self.store.init_kernel_promise(bootstrap_vat);
        self.router.subscribe(bootstrap_vat, kp)?;
        self.queue.push(RunQueueEntry::Send {
            target: KRef::Object(root),
            message: Message {
                method: "bootstrap".to_string(),
                args: bootstrap_args,
                result: Some(kp),
            },
        });

        let bootstrap_result = self.drain_until_settled(kp).await?;
        let launched_at = chrono::Utc::now();

        self.records.lock().insert(
            subcluster_id,
            SubclusterRecord {
                config,
                bootstrap_vat,
                vat_ids,
                root,
                state: SubclusterState::Running,
                launched_at,
            },
        );

        Ok(LaunchOutcome {
            subcluster_id,
            root_kref: root,
            bootstrap_result,
            launch_id: uuid::Uuid::new_v4(),
        })
    }

    async fn drain_until_settled(&self, kp: crate::refs::KpRef) -> Result<CapData> {
        const MAX_CRANKS: usize = 10_000;
        for _ in 0..MAX_CRANKS {
            let promise = self.store.get_kernel_promise(kp)?;
            match promise.state {
                crate::store::PromiseState::Fulfilled { data } => return Ok(data),
                crate::store::PromiseState::Rejected { data } => return Ok(data),
                crate::store::PromiseState::Unresolved { .. } => {
                    if !self.router.run_one_crank(self.vats.as_ref()).await? {
                        break;
                    }
                }
            }
        }
        Err(KernelError::Internal(
            "bootstrap promise never settled".to_string(),
        ))
    }

    pub fn terminate_subcluster(&self, id: SubclusterId) -> Result<()> {
        let record = {
            let mut records = self.records.lock();
            records
                .get_mut(&id)
                .ok_or(KernelError::SubclusterNotFound)
                .map(|r| {
                    r.state = SubclusterState::Terminated;
                    (r.vat_ids.clone(),)
                })?
        };
        for vat_id in record.0.values() {
            if let Err(err) = self.vats.terminate_vat(*vat_id, None) {
                warn!(vat = %vat_id, error = %err, "error terminating vat during subcluster teardown");
            }
        }
        Ok(())
    }

    pub async fn reload_subcluster(&self, id: SubclusterId) -> Result<LaunchOutcome> {
        let config = {
            let records = self.records.lock();
            records
                .get(&id)
                .ok_or(KernelError::SubclusterNotFound)?
                .config
                .clone()
        };
        self.terminate_subcluster(id)?;
        self.launch_subcluster(config).await
    }

    pub async fn reload_all(&self) -> Result<Vec<LaunchOutcome>> {
        let ids: Vec<SubclusterId> = self.records.lock().keys().copied().collect();
        let mut outcomes = Vec::new();
        for id in ids {
            outcomes.push(self.reload_subcluster(id).await?);
        }
        Ok(outcomes)
    }

    /// A status projection of one subcluster, for introspection callers
    /// that want more than just its vat map.
    pub fn get_subcluster(&self, id: SubclusterId) -> Result<SubclusterStatus> {
        let records = self.records.lock();
        records
            .get(&id)
            .map(SubclusterStatus::from)
            .ok_or(KernelError::SubclusterNotFound)
    }

    pub fn get_subcluster_vats(&self, id: SubclusterId) -> Result<HashMap<String, EndpointId>> {
        let records = self.records.lock();
        records
            .get(&id)
            .map(|r| r.vat_ids.clone())
            .ok_or(KernelError::SubclusterNotFound)
    }

    pub fn get_subclusters(&self) -> Vec<SubclusterId> {
        self.records.lock().keys().copied().collect()
    }

    pub fn is_vat_in_subcluster(&self, id: SubclusterId, vat: EndpointId) -> bool {
        self.records
            .lock()
            .get(&id)
            .map(|r| r.vat_ids.values().any(|v| *v == vat))
            .unwrap_or(false)
    }

    /// Startup recovery: validates every persisted record (fatal corruption
    /// if a bootstrap vat or its root is missing), orphan-cleans system
    /// subclusters no longer present in `configured_system_names` without
    /// starting their vats, and otherwise relaunches from the persisted
    /// config.
    pub async fn recover(
        &self,
        persisted: Vec<PersistedSubcluster>,
        configured_system_names: &[String],
    ) -> Result<Vec<SubclusterId>> {
        let mut recovered = Vec::new();
        for record in persisted {
            if record.vat_ids.get(&record.bootstrap_vat).is_none() {
                return Err(KernelError::CorruptSubcluster(format!(
                    "subcluster {} missing bootstrap vat {}",
                    record.id, record.bootstrap_vat
                )));
            }
            if record.root.parse::<KoRef>().is_err() {
                return Err(KernelError::CorruptSubcluster(format!(
                    "subcluster {} has no valid root object",
                    record.id
                )));
            }

            if record.is_system && !configured_system_names.contains(&record.id) {
                info!(subcluster = %record.id, "removing orphaned system subcluster without starting vats");
                continue;
            }

            let outcome = self.launch_subcluster(record.config).await?;
            recovered.push(outcome.subcluster_id);
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::Marshal;
    use crate::services::ServiceRegistry;
    use crate::vat::VatBundle;

    fn bundle(name: &str) -> VatConfig {
        VatConfig::Bundle {
            bundle: VatBundle {
                module_format: "iife".into(),
                code: format!("(() => {{ /* {name} */ }})()"),
                exports: vec!["root".into()],
                modules: None,
            },
            parameters: None,
        }
    }

    fn manager() -> SubclusterManager {
        let store = Arc::new(KernelStore::new());
        let allocator = Arc::new(RefAllocator::new());
        let marshal = Arc::new(Marshal::new(store.clone()));
        let queue = Arc::new(RunQueue::new());
        let services = Arc::new(ServiceRegistry::new());
        let router = Arc::new(Router::new(store.clone(), marshal, queue.clone(), services));
        let vats = Arc::new(VatManager::new(store.clone(), allocator.clone(), queue.clone()));
        SubclusterManager::new(store, allocator, vats, queue, router)
    }

    fn single_vat_config() -> SubclusterConfig {
        let mut vats = HashMap::new();
        vats.insert("alice".to_string(), bundle("alice"));
        SubclusterConfig {
            bootstrap: "alice".to_string(),
            vats,
            bundles: None,
            services: None,
        }
    }

    #[tokio::test]
    async fn launch_resolves_with_bootstrap_result() {
        let mgr = manager();
        let outcome = mgr.launch_subcluster(single_vat_config()).await.unwrap();
        assert!(matches!(outcome.subcluster_id, SubclusterId::Normal(_)));
        assert_eq!(outcome.bootstrap_result, CapData::empty());
    }

    #[tokio::test]
    async fn empty_vats_rejected() {
        let mgr = manager();
        let config = SubclusterConfig {
            bootstrap: "alice".into(),
            vats: HashMap::new(),
            bundles: None,
            services: None,
        };
        let err = mgr.launch_subcluster(config).await.unwrap_err();
        assert!(matches!(err, KernelError::InvalidClusterConfig));
    }

    #[tokio::test]
    async fn bad_bootstrap_name_rejected() {
        let mgr = manager();
        let mut vats = HashMap::new();
        vats.insert("alice".to_string(), bundle("alice"));
        let config = SubclusterConfig {
            bootstrap: "not-alice".into(),
            vats,
            bundles: None,
            services: None,
        };
        let err = mgr.launch_subcluster(config).await.unwrap_err();
        assert!(matches!(err, KernelError::InvalidBootstrapVatName));
    }

    #[tokio::test]
    async fn reload_nonexistent_subcluster_errors() {
        let mgr = manager();
        let err = mgr
            .reload_subcluster(SubclusterId::Normal(999))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::SubclusterNotFound));
    }

    #[tokio::test]
    async fn get_subcluster_returns_status_for_known_id() {
        let mgr = manager();
        let outcome = mgr.launch_subcluster(single_vat_config()).await.unwrap();
        let status = mgr.get_subcluster(outcome.subcluster_id).unwrap();
        assert_eq!(status.state, SubclusterState::Running);
        assert_eq!(status.root, outcome.root_kref);

        let err = mgr.get_subcluster(SubclusterId::Normal(999)).unwrap_err();
        assert!(matches!(err, KernelError::SubclusterNotFound));
    }

    #[tokio::test]
    async fn is_vat_in_subcluster_reflects_membership() {
        let mgr = manager();
        let outcome = mgr.launch_subcluster(single_vat_config()).await.unwrap();
        let vats = mgr.get_subcluster_vats(outcome.subcluster_id).unwrap();
        let alice = *vats.get("alice").unwrap();
        assert!(mgr.is_vat_in_subcluster(outcome.subcluster_id, alice));
        assert!(!mgr.is_vat_in_subcluster(outcome.subcluster_id, EndpointId::Vat(9999)));
    }
}
