//! Top-level kernel facade: wires the store, marshaller, run queue,
//! router, vat manager, subcluster manager, and service registry into one
//! handle a host process can drive.

use std::sync::Arc;

use tracing::info;

use crate::config::KernelConfig;
use crate::error::Result;
use crate::marshal::Marshal;
use crate::refs::{EndpointId, KoRef, RefAllocator, SubclusterId};
use crate::runqueue::{Router, RunQueue};
use crate::services::ServiceRegistry;
use crate::status::{self, KernelStatus};
use crate::store::KernelStore;
use crate::subcluster::{LaunchOutcome, PersistedSubcluster, SubclusterConfig, SubclusterManager};
use crate::transport::RemoteTransport;
use crate::vat::{VatConfig, VatManager};
use crate::wake::WakeDetector;

/// Owns every kernel subsystem for one incarnation. Transport and the wake
/// detector are optional: a kernel with no remote peers configured never
/// constructs them.
pub struct Kernel {
    pub config: KernelConfig,
    pub store: Arc<KernelStore>,
    pub marshal: Arc<Marshal>,
    pub queue: Arc<RunQueue>,
    pub router: Arc<Router>,
    pub vats: Arc<VatManager>,
    pub subclusters: Arc<SubclusterManager>,
    pub services: Arc<ServiceRegistry>,
    pub allocator: Arc<RefAllocator>,
    pub transport: Option<Arc<RemoteTransport>>,
    wake: Option<Arc<WakeDetector>>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        let store = Arc::new(KernelStore::new());
        let allocator = Arc::new(RefAllocator::new());
        let marshal = Arc::new(Marshal::new(store.clone()));
        let queue = Arc::new(RunQueue::new());
        let services = Arc::new(ServiceRegistry::new());
        let router = Arc::new(Router::new(store.clone(), marshal.clone(), queue.clone(), services.clone()));
        let vats = Arc::new(VatManager::new(store.clone(), allocator.clone(), queue.clone()));
        let subclusters = Arc::new(SubclusterManager::new(
            store.clone(),
            allocator.clone(),
            vats.clone(),
            queue.clone(),
            router.clone(),
        ));

        Self {
            config,
            store,
            marshal,
            queue,
            router,
            vats,
            subclusters,
            services,
            allocator,
            transport: None,
            wake: None,
        }
    }

    /// Attaches a remote transport, using this kernel's `RemoteConfig`, and
    /// starts its wake detector so backoff resets after a host suspend.
    pub fn attach_transport(&mut self, transport: Arc<RemoteTransport>) {
        let weak = Arc::downgrade(&transport);
        let detector = WakeDetector::start(
            std::time::Duration::from_millis(self.config.wake.sample_interval_ms),
            std::time::Duration::from_millis(self.config.wake.jump_threshold_ms),
            move || {
                if let Some(transport) = weak.upgrade() {
                    transport.reset_all_backoff();
                }
            },
        );
        self.transport = Some(transport);
        self.wake = Some(detector);
        info!("remote transport attached, wake detector running");
    }

    pub async fn launch_subcluster(&self, config: SubclusterConfig) -> Result<LaunchOutcome> {
        self.subclusters.launch_subcluster(config).await
    }

    /// Startup recovery: re-initializes vats that survive a restart by
    /// their original id, purges any `sv*` c-lists the previous
    /// incarnation left behind that no configured system subcluster still
    /// claims (invariant 7), and only then hands persisted subclusters to
    /// `SubclusterManager::recover` — in that order, so the run queue
    /// doesn't resume against stale state.
    pub async fn recover(
        &self,
        persisted_vats: Vec<(EndpointId, VatConfig, Option<SubclusterId>, Option<KoRef>)>,
        persisted_subclusters: Vec<PersistedSubcluster>,
        configured_system_names: &[String],
    ) -> Result<Vec<SubclusterId>> {
        self.vats.initialize_all_vats(persisted_vats)?;

        let live_system_vats: std::collections::HashSet<EndpointId> = persisted_subclusters
            .iter()
            .filter(|record| record.is_system && configured_system_names.contains(&record.id))
            .flat_map(|record| record.vat_ids.values())
            .filter_map(|raw| raw.parse::<EndpointId>().ok())
            .filter(EndpointId::is_system)
            .collect();
        self.store.purge_stale_system_clists(&live_system_vats);

        self.subclusters
            .recover(persisted_subclusters, configured_system_names)
            .await
    }

    /// Drives the run queue until it empties, one crank at a time. A real
    /// host loops this forever; tests and short-lived tools can call it
    /// once to settle whatever was already enqueued.
    pub async fn drain(&self) -> Result<usize> {
        let mut cranks = 0;
        while self.router.run_one_crank(self.vats.as_ref()).await? {
            cranks += 1;
        }
        Ok(cranks)
    }

    pub fn status(&self) -> KernelStatus {
        let known_peers: Vec<String> = Vec::new();
        status::snapshot(
            &self.router,
            &self.vats,
            &self.subclusters,
            self.transport.as_deref(),
            &known_peers,
        )
    }

    pub async fn shutdown(&self) {
        if let Some(transport) = &self.transport {
            transport.stop().await;
        }
        if let Some(wake) = &self.wake {
            wake.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vat::{VatBundle, VatConfig};
    use std::collections::HashMap;

    fn bundle() -> VatConfig {
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

    #[tokio::test]
    async fn launch_subcluster_through_facade_settles() {
        let kernel = Kernel::new(KernelConfig::default());
        let mut vats = HashMap::new();
        vats.insert("alice".to_string(), bundle());
        let outcome = kernel
            .launch_subcluster(SubclusterConfig {
                bootstrap: "alice".to_string(),
                vats,
                bundles: None,
                services: None,
            })
            .await
            .unwrap();

        assert_eq!(kernel.status().vat_count, 1);
        assert_eq!(kernel.status().subcluster_count, 1);
        let _ = outcome;
    }

    #[tokio::test]
    async fn recover_purges_unconfigured_stale_system_vats() {
        use crate::refs::RefKind;

        let kernel = Kernel::new(KernelConfig::default());
        let stale = EndpointId::SystemVat(7);
        let eref = crate::refs::ERef {
            kind: RefKind::Object,
            sign: crate::refs::Sign::Export,
            id: 0,
        };
        let ko = kernel.store.init_kernel_object(stale);
        kernel
            .store
            .add_clist_entry(stale, crate::refs::KRef::Object(ko), eref)
            .unwrap();

        kernel.recover(Vec::new(), Vec::new(), &[]).await.unwrap();

        assert!(kernel.store.eref_to_kref(stale, eref).is_err());
    }
}
