//! Remote transport core (§4.6): dial, reconnect, rate limits,
//! wake-detection. One bidirectional byte-framed channel per peer, with
//! transient failures hidden behind reconnection.

mod backoff;
mod rate_limit;

pub use backoff::calculate_reconnection_backoff;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RemoteConfig;
use crate::error::{KernelError, Result};
use crate::retry::{retry, RetryOptions, RetryOutcome};
use rate_limit::SlidingWindow;

/// SCTP-style abort code for a user-initiated (intentional) disconnect.
pub const ABORT_CODE_USER_INITIATED: u32 = 12;

/// A single bidirectional byte-framed channel to a peer. The actual wire
/// protocol is out of scope (§1 Non-goals): any implementation satisfying
/// this trait can be dialed.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<()>;
    async fn close(&self);
    /// Distinguishes two channel instances so a race between an inbound
    /// and an outbound connection can tell whether it already holds the
    /// winner (§4.6.6).
    fn identity(&self) -> u64;
}

/// Dials a peer and performs the outbound handshake.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &str, hints: &HashSet<String>) -> Result<Arc<dyn Channel>>;
    async fn handshake(&self, channel: &Arc<dyn Channel>) -> Result<()>;
}

/// Upward callback invoked once a peer transitions to `permanently_failed`.
#[async_trait]
pub trait GiveUpHandler: Send + Sync {
    async fn give_up(&self, peer: &str);
}

/// Upward callback for inbound frames.
#[async_trait]
pub trait RemoteMessageHandler: Send + Sync {
    async fn handle(&self, from: &str, bytes: &[u8]);
}

/// Reconnection state machine states (§4.6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnState {
    Idle,
    Reconnecting,
    PermanentlyFailed,
}

struct PeerRecord {
    channel: Option<Arc<dyn Channel>>,
    location_hints: HashSet<String>,
    last_activity: Instant,
    intentionally_closed: bool,
    error_history: VecDeque<(u32, Instant)>,
    reconnect_attempts: u32,
    state: PeerConnState,
    message_limiter: SlidingWindow,
    connection_limiter: SlidingWindow,
}

impl PeerRecord {
    fn new(config: &RemoteConfig) -> Self {
        Self {
            channel: None,
            location_hints: HashSet::new(),
            last_activity: Instant::now(),
            intentionally_closed: false,
            error_history: VecDeque::new(),
            reconnect_attempts: 0,
            state: PeerConnState::Idle,
            message_limiter: SlidingWindow::new(
                Duration::from_secs(1),
                config.max_messages_per_second,
            ),
            connection_limiter: SlidingWindow::new(
                Duration::from_secs(60),
                config.max_connection_attempts_per_minute,
            ),
        }
    }

    fn record_error(&mut self, code: u32) {
        self.error_history.push_back((code, Instant::now()));
        while self.error_history.len() > 64 {
            self.error_history.pop_front();
        }
    }

    /// (c) sustained fatal pattern: more than `threshold` consecutive
    /// occurrences of `code` within `window`, with nothing else in between.
    fn has_sustained_fatal_pattern(&self, code: u32, threshold: usize, window: Duration) -> bool {
        let now = Instant::now();
        let mut run = 0;
        for &(c, ts) in self.error_history.iter().rev() {
            if now.duration_since(ts) > window {
                break;
            }
            if c == code {
                run += 1;
                if run > threshold {
                    return true;
                }
            } else {
                break;
            }
        }
        false
    }
}

/// Owns every peer's reconnection state, rate limiters, and the single
/// channel it may currently hold.
pub struct RemoteTransport {
    config: RemoteConfig,
    peers: Mutex<HashMap<String, PeerRecord>>,
    dialer: Arc<dyn Dialer>,
    give_up: Option<Arc<dyn GiveUpHandler>>,
    message_handler: Option<Arc<dyn RemoteMessageHandler>>,
    stopped: Mutex<bool>,
    cancel: CancellationToken,
}

impl RemoteTransport {
    pub fn new(config: RemoteConfig, dialer: Arc<dyn Dialer>, give_up: Option<Arc<dyn GiveUpHandler>>) -> Self {
        Self {
            config,
            peers: Mutex::new(HashMap::new()),
            dialer,
            give_up,
            message_handler: None,
            stopped: Mutex::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Installs the upward handler for inbound frames. Without one,
    /// `on_inbound_message` still resets backoff bookkeeping but discards
    /// the payload — a transport with no kernel attached yet has nowhere
    /// to route it.
    pub fn set_message_handler(&mut self, handler: Arc<dyn RemoteMessageHandler>) {
        self.message_handler = Some(handler);
    }

    /// Routes an inbound frame to the installed handler and records the
    /// traffic (§4.6.3: any successful read resets backoff same as a send).
    pub async fn on_inbound_message(&self, peer: &str, bytes: &[u8]) {
        self.on_traffic(peer);
        if let Some(handler) = &self.message_handler {
            handler.handle(peer, bytes).await;
        }
    }

    /// Drives reconnection for `peer` through the shared retry primitive
    /// until it connects, is given up on as permanently failed, or `stop()`
    /// fires. Connection-rate overflow and other retryable errors share the
    /// same backoff curve as every other retrying operation in the kernel.
    pub async fn run_reconnect_loop(&self, peer: &str) {
        let opts = RetryOptions {
            max_attempts: self.config.max_retry_attempts,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: true,
        };
        let outcome = retry(
            |_attempt| self.dial_and_register(peer),
            opts,
            |err| err.is_retryable(),
            |attempt, err| warn!(peer, attempt, error = %err, "reconnect attempt failed"),
            Some(self.cancel.clone()),
        )
        .await;

        match outcome {
            Ok(()) => info!(peer, "reconnected"),
            Err(RetryOutcome::Aborted) => info!(peer, "reconnect loop cancelled"),
            Err(RetryOutcome::GaveUp(_)) | Err(RetryOutcome::ExhaustedAttempts(_)) => {
                self.give_up_if_permanent(peer).await;
            }
        }
    }

    fn entry<'a>(
        peers: &'a mut HashMap<String, PeerRecord>,
        config: &RemoteConfig,
        peer: &str,
    ) -> &'a mut PeerRecord {
        peers
            .entry(peer.to_string())
            .or_insert_with(|| PeerRecord::new(config))
    }

    pub fn register_location_hints(&self, peer: &str, hints: HashSet<String>) {
        let mut peers = self.peers.lock();
        let record = Self::entry(&mut peers, &self.config, peer);
        record.location_hints.extend(hints);
    }

    /// Marks a peer intentionally closed and drops its channel. No further
    /// reconnection is attempted until an explicit `reconnect_peer`.
    pub async fn close_connection(&self, peer: &str) {
        let channel = {
            let mut peers = self.peers.lock();
            let record = Self::entry(&mut peers, &self.config, peer);
            record.intentionally_closed = true;
            record.state = PeerConnState::Idle;
            record.channel.take()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    pub fn reconnect_peer(&self, peer: &str, hints: HashSet<String>) {
        let mut peers = self.peers.lock();
        let record = Self::entry(&mut peers, &self.config, peer);
        record.location_hints.extend(hints);
        record.intentionally_closed = false;
        record.state = PeerConnState::Reconnecting;
    }

    pub async fn stop(&self) {
        *self.stopped.lock() = true;
        self.cancel.cancel();
        let channels: Vec<Arc<dyn Channel>> = {
            let mut peers = self.peers.lock();
            peers.values_mut().filter_map(|p| p.channel.take()).collect()
        };
        for channel in channels {
            channel.close().await;
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Rate-limited send (§4.6 upward operation). A sliding-window
    /// overflow surfaces as a retryable `ResourceLimitError`.
    pub async fn send_remote_message(&self, peer: &str, payload: &[u8]) -> Result<()> {
        let channel = {
            let mut peers = self.peers.lock();
            let record = Self::entry(&mut peers, &self.config, peer);
            record
                .message_limiter
                .try_admit(Instant::now())
                .map_err(|(current, limit)| KernelError::ResourceLimit {
                    limit_type: "messagesPerSecond",
                    current,
                    limit,
                })?;
            record.channel.clone()
        };
        let channel = channel.ok_or_else(|| KernelError::RetryableNetwork(format!("no channel to {peer}")))?;
        let result = channel.send(payload).await;
        if result.is_ok() {
            self.on_traffic(peer);
        }
        result
    }

    /// Marks successful traffic: resets backoff for this peer (§4.6.3).
    pub fn on_traffic(&self, peer: &str) {
        let mut peers = self.peers.lock();
        if let Some(record) = peers.get_mut(peer) {
            record.last_activity = Instant::now();
            record.reconnect_attempts = 0;
        }
    }

    /// Resets backoff for every known peer — invoked when the wake
    /// detector fires (§4.6.3, §4.7).
    pub fn reset_all_backoff(&self) {
        let mut peers = self.peers.lock();
        for record in peers.values_mut() {
            record.reconnect_attempts = 0;
        }
    }

    /// Channel registration and handshake (§4.6.6). Performs the dial,
    /// rate-limits the attempt, runs the outbound handshake, and resolves
    /// any inbound race before attaching the new channel.
    pub async fn dial_and_register(&self, peer: &str) -> Result<()> {
        if self.is_stopped() {
            return Err(KernelError::Abort);
        }

        {
            let mut peers = self.peers.lock();
            let record = Self::entry(&mut peers, &self.config, peer);
            if record.intentionally_closed {
                return Err(KernelError::NonRetryable(format!(
                    "peer {peer} is intentionally closed"
                )));
            }
            let admitted = record.connection_limiter.try_admit(Instant::now());
            if admitted.is_err() {
                let (current, limit) = admitted.unwrap_err();
                // Connection-rate overflow does not consume a reconnect
                // attempt — no dial occurred.
                return Err(KernelError::ResourceLimit {
                    limit_type: "connectionAttemptsPerMinute",
                    current,
                    limit,
                });
            }
            record.reconnect_attempts += 1;
        }

        let hints = {
            let peers = self.peers.lock();
            peers
                .get(peer)
                .map(|r| r.location_hints.clone())
                .unwrap_or_default()
        };

        let dialed = match self.dialer.dial(peer, &hints).await {
            Ok(channel) => channel,
            Err(err) => {
                self.note_failure(peer, &err);
                return Err(err);
            }
        };

        if let Err(err) = self.dialer.handshake(&dialed).await {
            dialed.close().await;
            self.note_failure(peer, &err);
            return Err(err);
        }

        // Re-check the concurrent-connection limit before attaching
        // (§4.6.6 step 5) — the count of peers with a live channel right
        // now, not the attempts-per-minute admission window above.
        let open_connections = {
            let peers = self.peers.lock();
            peers.values().filter(|r| r.channel.is_some()).count() as u64
        };
        if open_connections >= self.config.max_concurrent_connections as u64 {
            dialed.close().await;
            return Err(KernelError::ResourceLimit {
                limit_type: "maxConcurrentConnections",
                current: open_connections + 1,
                limit: self.config.max_concurrent_connections as u64,
            });
        }

        let previous = {
            let mut peers = self.peers.lock();
            let record = Self::entry(&mut peers, &self.config, peer);
            match &record.channel {
                Some(existing) if existing.identity() != dialed.identity() => {
                    // Inbound race already won; keep the existing channel.
                    Some(dialed.clone())
                }
                _ => {
                    let old = record.channel.replace(dialed.clone());
                    record.state = PeerConnState::Idle;
                    record.reconnect_attempts = 0;
                    record.last_activity = Instant::now();
                    old
                }
            }
        };

        if let Some(stale) = previous {
            stale.close().await;
        }
        Ok(())
    }

    fn note_failure(&self, peer: &str, err: &KernelError) {
        let mut peers = self.peers.lock();
        let record = Self::entry(&mut peers, &self.config, peer);
        if err.is_permanent_transport_failure() {
            record.state = PeerConnState::PermanentlyFailed;
            return;
        }
        record.record_error(1);
        record.state = PeerConnState::Reconnecting;

        let exceeded_max_attempts = self.config.max_retry_attempts != 0
            && record.reconnect_attempts >= self.config.max_retry_attempts;
        let sustained_fatal =
            record.has_sustained_fatal_pattern(1, 5, Duration::from_secs(30));
        if exceeded_max_attempts || sustained_fatal {
            record.state = PeerConnState::PermanentlyFailed;
        }
    }

    /// After `note_failure` marks a peer permanently failed, the caller's
    /// reconnection driver should call this once to invoke the upward
    /// callback and stop retrying.
    pub async fn give_up_if_permanent(&self, peer: &str) -> bool {
        let is_permanent = {
            let peers = self.peers.lock();
            peers
                .get(peer)
                .map(|r| r.state == PeerConnState::PermanentlyFailed)
                .unwrap_or(false)
        };
        if is_permanent {
            if let Some(handler) = &self.give_up {
                handler.give_up(peer).await;
            }
            warn!(peer, "peer permanently failed, giving up");
        }
        is_permanent
    }

    /// Handles an inbound connection attempt. Intentionally-closed peers
    /// are rejected without attachment (§4.6.6).
    pub fn accept_inbound(&self, peer: &str, channel: Arc<dyn Channel>) -> Result<()> {
        let mut peers = self.peers.lock();
        let record = Self::entry(&mut peers, &self.config, peer);
        if record.intentionally_closed {
            return Err(KernelError::NonRetryable(format!(
                "peer {peer} rejected inbound connection: intentionally closed"
            )));
        }
        if record.channel.is_none() {
            record.channel = Some(channel);
            record.state = PeerConnState::Idle;
            record.last_activity = Instant::now();
        }
        Ok(())
    }

    /// Classifies a read failure (§4.6.7). Abort code 12 marks the peer
    /// intentionally closed and suppresses reconnection; anything else
    /// triggers the reconnection path.
    pub fn on_read_failure(&self, peer: &str, abort_code: Option<u32>) -> ReadFailureOutcome {
        let mut peers = self.peers.lock();
        let record = Self::entry(&mut peers, &self.config, peer);
        record.channel = None;

        if abort_code == Some(ABORT_CODE_USER_INITIATED) {
            record.intentionally_closed = true;
            record.state = PeerConnState::Idle;
            info!(peer, "peer disconnect was user-initiated, not reconnecting");
            ReadFailureOutcome::IntentionalClose
        } else {
            record.state = PeerConnState::Reconnecting;
            ReadFailureOutcome::ShouldReconnect
        }
    }

    pub fn state_of(&self, peer: &str) -> Option<PeerConnState> {
        self.peers.lock().get(peer).map(|r| r.state)
    }

    pub fn reconnect_attempts(&self, peer: &str) -> u32 {
        self.peers.lock().get(peer).map(|r| r.reconnect_attempts).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureOutcome {
    IntentionalClose,
    ShouldReconnect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeChannel {
        id: u64,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn send(&self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn identity(&self) -> u64 {
            self.id
        }
    }

    struct FakeDialer {
        next_id: AtomicU64,
        fail_handshake: bool,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, _peer: &str, _hints: &HashSet<String>) -> Result<Arc<dyn Channel>> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeChannel {
                id,
                closed: std::sync::atomic::AtomicBool::new(false),
            }))
        }

        async fn handshake(&self, _channel: &Arc<dyn Channel>) -> Result<()> {
            if self.fail_handshake {
                Err(KernelError::RetryableNetwork("handshake failed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn transport(fail_handshake: bool) -> RemoteTransport {
        RemoteTransport::new(
            RemoteConfig::default(),
            Arc::new(FakeDialer {
                next_id: AtomicU64::new(1),
                fail_handshake,
            }),
            None,
        )
    }

    #[tokio::test]
    async fn dial_and_register_attaches_channel() {
        let transport = transport(false);
        transport.dial_and_register("peer1").await.unwrap();
        assert_eq!(transport.state_of("peer1"), Some(PeerConnState::Idle));
    }

    #[tokio::test]
    async fn dial_and_register_enforces_real_concurrent_connection_count() {
        let transport = RemoteTransport::new(
            RemoteConfig {
                max_concurrent_connections: 1,
                ..RemoteConfig::default()
            },
            Arc::new(FakeDialer {
                next_id: AtomicU64::new(1),
                fail_handshake: false,
            }),
            None,
        );

        transport.dial_and_register("peer1").await.unwrap();
        let err = transport.dial_and_register("peer2").await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::ResourceLimit { limit_type: "maxConcurrentConnections", .. }
        ));
    }

    #[tokio::test]
    async fn handshake_failure_is_retryable_and_marks_reconnecting() {
        let transport = transport(true);
        let err = transport.dial_and_register("peer1").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.state_of("peer1"), Some(PeerConnState::Reconnecting));
    }

    #[tokio::test]
    async fn intentional_close_rejects_inbound_without_registration() {
        let transport = transport(false);
        transport.close_connection("peer1").await;

        let channel: Arc<dyn Channel> = Arc::new(FakeChannel {
            id: 1,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let err = transport.accept_inbound("peer1", channel).unwrap_err();
        assert!(matches!(err, KernelError::NonRetryable(_)));
    }

    #[tokio::test]
    async fn abort_code_12_marks_intentional_and_suppresses_reconnect() {
        let transport = transport(false);
        transport.dial_and_register("peer1").await.unwrap();

        let outcome = transport.on_read_failure("peer1", Some(ABORT_CODE_USER_INITIATED));
        assert_eq!(outcome, ReadFailureOutcome::IntentionalClose);

        let channel: Arc<dyn Channel> = Arc::new(FakeChannel {
            id: 99,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        assert!(transport.accept_inbound("peer1", channel).is_err());
    }

    #[tokio::test]
    async fn other_read_failure_triggers_reconnect_path() {
        let transport = transport(false);
        transport.dial_and_register("peer1").await.unwrap();
        let outcome = transport.on_read_failure("peer1", None);
        assert_eq!(outcome, ReadFailureOutcome::ShouldReconnect);
        assert_eq!(transport.state_of("peer1"), Some(PeerConnState::Reconnecting));
    }

    #[tokio::test]
    async fn connection_rate_overflow_does_not_consume_attempt() {
        let mut config = RemoteConfig::default();
        config.max_connection_attempts_per_minute = 1;
        let transport = RemoteTransport::new(
            config,
            Arc::new(FakeDialer {
                next_id: AtomicU64::new(1),
                fail_handshake: false,
            }),
            None,
        );

        transport.dial_and_register("peer1").await.unwrap();
        let attempts_after_first = transport.reconnect_attempts("peer1");

        let err = transport.dial_and_register("peer1").await.unwrap_err();
        assert!(matches!(
            err,
            KernelError::ResourceLimit {
                limit_type: "connectionAttemptsPerMinute",
                ..
            }
        ));
        // connection-rate overflow happened before the attempt counter was
        // touched, so it is unchanged from the prior successful dial.
        assert_eq!(transport.reconnect_attempts("peer1"), attempts_after_first);
    }

    #[tokio::test]
    async fn reset_all_backoff_zeros_every_peer() {
        let transport = transport(true);
        let _ = transport.dial_and_register("peer1").await;
        assert!(transport.reconnect_attempts("peer1") > 0);
        transport.reset_all_backoff();
        assert_eq!(transport.reconnect_attempts("peer1"), 0);
    }

    #[tokio::test]
    async fn reconnect_loop_connects_on_first_attempt() {
        let transport = transport(false);
        transport.run_reconnect_loop("peer1").await;
        assert_eq!(transport.state_of("peer1"), Some(PeerConnState::Idle));
    }

    #[tokio::test]
    async fn inbound_message_reaches_installed_handler() {
        struct RecordingHandler {
            seen: Mutex<Vec<(String, Vec<u8>)>>,
        }
        #[async_trait]
        impl RemoteMessageHandler for RecordingHandler {
            async fn handle(&self, from: &str, bytes: &[u8]) {
                self.seen.lock().push((from.to_string(), bytes.to_vec()));
            }
        }

        let mut transport = transport(false);
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        transport.set_message_handler(handler.clone());

        transport.on_inbound_message("peer1", b"hello").await;
        assert_eq!(
            handler.seen.lock().as_slice(),
            &[("peer1".to_string(), b"hello".to_vec())]
        );
    }

    #[tokio::test]
    async fn stop_cancels_in_flight_reconnect_loop() {
        let transport = Arc::new(transport(true));
        let runner = transport.clone();
        let handle = tokio::spawn(async move { runner.run_reconnect_loop("peer1").await });

        tokio::task::yield_now().await;
        transport.stop().await;
        handle.await.unwrap();
    }
}
