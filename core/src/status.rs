//! Kernel status introspection (SPEC_FULL.md §C): a point-in-time snapshot
//! assembled from the live manager handles, not a persisted record.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::refs::SubclusterId;
use crate::runqueue::Router;
use crate::subcluster::SubclusterManager;
use crate::transport::{PeerConnState, RemoteTransport};
use crate::vat::VatManager;

#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub peer: String,
    pub state: String,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelStatus {
    pub run_queue_depth: usize,
    pub vat_count: usize,
    pub subcluster_count: usize,
    pub subclusters: Vec<String>,
    pub peers: Vec<PeerStatus>,
}

/// Assembles a `KernelStatus` from whichever peers are currently known;
/// callers that don't run a transport pass an empty peer list.
pub fn snapshot(
    router: &Router,
    vats: &VatManager,
    subclusters: &SubclusterManager,
    transport: Option<&RemoteTransport>,
    known_peers: &[String],
) -> KernelStatus {
    let subcluster_ids: Vec<SubclusterId> = subclusters.get_subclusters();
    let peers = transport
        .map(|transport| {
            known_peers
                .iter()
                .map(|peer| PeerStatus {
                    peer: peer.clone(),
                    state: peer_state_label(transport.state_of(peer)),
                    reconnect_attempts: transport.reconnect_attempts(peer),
                })
                .collect()
        })
        .unwrap_or_default();

    KernelStatus {
        run_queue_depth: router.queue_depth(),
        vat_count: vats.vat_count(),
        subcluster_count: subcluster_ids.len(),
        subclusters: subcluster_ids.iter().map(|id| id.to_string()).collect(),
        peers,
    }
}

fn peer_state_label(state: Option<PeerConnState>) -> String {
    match state {
        Some(PeerConnState::Idle) => "idle",
        Some(PeerConnState::Reconnecting) => "reconnecting",
        Some(PeerConnState::PermanentlyFailed) => "permanently_failed",
        None => "unknown",
    }
    .to_string()
}
