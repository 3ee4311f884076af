//! Mesh connection lifecycle
//!
//! [`ConnectionManager`] owns the mesh link and everything about its state:
//! the [`ConnectionState`], the manual-disconnect flag, reconnect backoff and
//! the task forwarding received packets to the bridge. All of it lives in a
//! single mutex-guarded struct; the lock is never held across an `.await`.
//!
//! ```text
//! Disconnected --connect ok--> Connected
//! Connected --probe/send fails--> Disconnected --reconnect ok--> Connected
//! * --disconnect(manual)--> Disconnected   (pinned until an operator connect)
//! ```
//!
//! While an automatic reconnect is running the state reads `Reconnecting`.
//! A manual disconnect issued during that attempt wins: the freshly opened
//! link is closed and dropped when the attempt returns.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BackoffPolicy, MeshAddress, MAX_BACKOFF};
use crate::directory::NodeDirectory;
use crate::error::{BridgeError, Result};
use crate::interface::{
    ConnectionState, KnownNode, MeshConnector, MeshLink, MeshPacket, ModemPreset, OutgoingText,
};

/// Exponent cap of the backoff interval
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Wait required between automatic reconnect attempts
///
/// With [`BackoffPolicy::ElapsedIdle`] the exponent is the number of whole
/// minutes since the previous attempt; with
/// [`BackoffPolicy::ConsecutiveFailures`] it is the number of failed
/// attempts since the last successful connect. Either way the result is
/// `min(2^min(exponent, 10), 300)` seconds.
pub fn backoff_interval(policy: BackoffPolicy, since_last_attempt: Duration, failures: u32) -> Duration {
    let exponent = match policy {
        BackoffPolicy::ElapsedIdle => (since_last_attempt.as_secs() / 60).min(u64::from(MAX_BACKOFF_EXPONENT)) as u32,
        BackoffPolicy::ConsecutiveFailures => failures.min(MAX_BACKOFF_EXPONENT),
    };
    Duration::from_secs(2u64.pow(exponent)).min(MAX_BACKOFF)
}

/// Why an automatic reconnect did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Operator disconnected manually
    ManualDisconnect,
    /// Another attempt is still running
    InFlight,
    /// The link is up
    AlreadyConnected,
    /// The backoff interval has not elapsed
    Backoff {
        /// Time left until the next attempt is allowed
        remaining: Duration,
    },
}

/// Result of [`ConnectionManager::attempt_reconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// Nothing was attempted
    Skipped(SkipReason),
    /// The link is back up
    Connected,
    /// The connect failed
    Failed,
    /// The connect succeeded but the operator took over meanwhile
    Discarded,
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Whether automatic reconnection is suppressed
    pub manual_disconnect: bool,
    /// Address used for connects
    pub address: MeshAddress,
    /// When the current link came up
    pub connected_since: Option<DateTime<Utc>>,
    /// Failed automatic attempts since the last successful connect
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Operator,
    Automatic,
}

struct ConnectionInner {
    state: ConnectionState,
    manual_disconnect: bool,
    address: MeshAddress,
    link: Option<Arc<dyn MeshLink>>,
    forwarder: Option<JoinHandle<()>>,
    connected_since: Option<DateTime<Utc>>,
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
    reconnect_in_flight: bool,
    // Bumped by every operator connect/disconnect
    generation: u64,
}

impl ConnectionInner {
    fn take_link(&mut self) -> (Option<Arc<dyn MeshLink>>, Option<JoinHandle<()>>) {
        self.state = ConnectionState::Disconnected;
        self.connected_since = None;
        (self.link.take(), self.forwarder.take())
    }
}

/// Owns the mesh link and its reconnect policy
pub struct ConnectionManager {
    connector: Arc<dyn MeshConnector>,
    directory: Arc<NodeDirectory>,
    packets: mpsc::Sender<MeshPacket>,
    backoff: BackoffPolicy,
    inner: Mutex<ConnectionInner>,
}

impl ConnectionManager {
    /// Create a manager; received packets are forwarded into `packets`
    pub fn new(
        connector: Arc<dyn MeshConnector>,
        directory: Arc<NodeDirectory>,
        address: MeshAddress,
        backoff: BackoffPolicy,
        packets: mpsc::Sender<MeshPacket>,
    ) -> Self {
        Self {
            connector,
            directory,
            packets,
            backoff,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                manual_disconnect: false,
                address,
                link: None,
                forwarder: None,
                connected_since: None,
                last_attempt: None,
                consecutive_failures: 0,
                reconnect_in_flight: false,
                generation: 0,
            }),
        }
    }

    /// Operator connect: clears the manual-disconnect flag, replaces any
    /// existing link and connects to `address`
    pub async fn connect(&self, address: MeshAddress) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock();
            if inner.manual_disconnect {
                info!("Manual disconnect cleared by operator connect");
            }
            inner.manual_disconnect = false;
            inner.address = address.clone();
            inner.generation += 1;
            inner.generation
        };
        self.establish(address, Origin::Operator, generation).await
    }

    /// Operator connect to the current address
    pub async fn reconnect_now(&self) -> Result<()> {
        let address = self.address();
        self.connect(address).await
    }

    /// Close the link; `manual` pins the disconnected state
    pub async fn disconnect(&self, manual: bool) {
        let (link, forwarder) = {
            let mut inner = self.inner.lock();
            if manual {
                inner.manual_disconnect = true;
                inner.generation += 1;
            }
            inner.take_link()
        };
        if manual {
            info!("Manual disconnect, automatic reconnection suspended");
        }
        Self::teardown(link, forwarder).await;
    }

    /// Record a transport failure on `failed`
    ///
    /// Closes the link and moves to `Disconnected` without touching the
    /// manual flag; the next control tick will try to reconnect. Errors from
    /// a link that has already been replaced are ignored.
    pub async fn mark_disconnected(&self, failed: &Arc<dyn MeshLink>, reason: &BridgeError) {
        let (link, forwarder) = {
            let mut inner = self.inner.lock();
            let current = inner
                .link
                .as_ref()
                .is_some_and(|link| Arc::ptr_eq(link, failed));
            if !current {
                debug!(link = failed.name(), error = %reason, "Ignoring error from replaced link");
                return;
            }
            inner.take_link()
        };
        warn!(error = %reason, code = reason.error_code(), "Mesh link lost");
        Self::teardown(link, forwarder).await;
    }

    /// Probe the link, reconnecting when it is down
    ///
    /// Returns true if the link is healthy.
    pub async fn check_health(&self) -> bool {
        let link = self.inner.lock().link.clone();
        match link {
            Some(link) => match link.probe().await {
                Ok(()) => {
                    debug!(link = link.name(), "Mesh link healthy");
                    return true;
                }
                Err(e) => self.mark_disconnected(&link, &e).await,
            },
            None => debug!("Mesh link down"),
        }
        self.attempt_reconnect().await;
        false
    }

    /// Try an automatic reconnect, subject to the manual flag and backoff
    pub async fn attempt_reconnect(&self) -> ReconnectOutcome {
        let (address, generation) = {
            let mut inner = self.inner.lock();
            if inner.manual_disconnect {
                debug!("Reconnect skipped: manual disconnect");
                return ReconnectOutcome::Skipped(SkipReason::ManualDisconnect);
            }
            if inner.reconnect_in_flight {
                return ReconnectOutcome::Skipped(SkipReason::InFlight);
            }
            if inner.link.is_some() {
                return ReconnectOutcome::Skipped(SkipReason::AlreadyConnected);
            }
            let now = Instant::now();
            if let Some(last) = inner.last_attempt {
                let since = now.duration_since(last);
                let wait = backoff_interval(self.backoff, since, inner.consecutive_failures);
                if since < wait {
                    let remaining = wait - since;
                    debug!(?remaining, "Reconnect skipped: backing off");
                    return ReconnectOutcome::Skipped(SkipReason::Backoff { remaining });
                }
            }
            inner.last_attempt = Some(now);
            inner.reconnect_in_flight = true;
            inner.state = ConnectionState::Reconnecting;
            (inner.address.clone(), inner.generation)
        };

        info!(address = %address, "Attempting to reconnect to mesh");
        let result = self.establish(address, Origin::Automatic, generation).await;

        let outcome = {
            let mut inner = self.inner.lock();
            inner.reconnect_in_flight = false;
            match &result {
                Ok(()) if inner.link.is_some() => ReconnectOutcome::Connected,
                Ok(()) => ReconnectOutcome::Discarded,
                Err(_) => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    ReconnectOutcome::Failed
                }
            }
        };

        match outcome {
            ReconnectOutcome::Connected => {
                info!("Reconnected to mesh");
                self.refresh_nodes();
            }
            ReconnectOutcome::Failed => {
                if let Err(e) = result {
                    warn!(error = %e, "Reconnect failed");
                }
            }
            _ => {}
        }
        outcome
    }

    /// Copy the link's node table into the directory
    pub fn refresh_nodes(&self) -> usize {
        match self.link() {
            Some(link) => self.directory.refresh(&link.known_nodes()),
            None => 0,
        }
    }

    /// Send one text packet over the current link
    ///
    /// A transport failure marks the link disconnected before the error is
    /// returned.
    pub async fn send_text(&self, message: &OutgoingText) -> Result<u32> {
        let link = self.link().ok_or(BridgeError::NotConnected)?;
        match link.send_text(message).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if e.is_transport_failure() {
                    self.mark_disconnected(&link, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Write a modem preset to the radio
    pub async fn set_modem_preset(&self, preset: ModemPreset, slot: u8) -> Result<()> {
        let link = self.link().ok_or(BridgeError::NotConnected)?;
        link.set_modem_preset(preset, slot).await
    }

    /// Resolve a node from the link's table, falling back to the directory
    pub fn lookup_node(&self, num: u32) -> Option<KnownNode> {
        self.link()
            .and_then(|link| link.lookup_node(num))
            .or_else(|| self.directory.node(num))
    }

    /// Current link, if connected
    pub fn link(&self) -> Option<Arc<dyn MeshLink>> {
        self.inner.lock().link.clone()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Check if a link is up
    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::Connected
    }

    /// Check if automatic reconnection is suppressed
    pub fn is_manually_disconnected(&self) -> bool {
        self.inner.lock().manual_disconnect
    }

    /// Address used for connects
    pub fn address(&self) -> MeshAddress {
        self.inner.lock().address.clone()
    }

    /// Snapshot for status reporting
    pub fn status(&self) -> ConnectionStatus {
        let inner = self.inner.lock();
        ConnectionStatus {
            state: inner.state,
            manual_disconnect: inner.manual_disconnect,
            address: inner.address.clone(),
            connected_since: inner.connected_since,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    async fn establish(&self, address: MeshAddress, origin: Origin, generation: u64) -> Result<()> {
        // Unsubscribe and close the previous link before opening a new one
        let (old_link, old_forwarder) = {
            let mut inner = self.inner.lock();
            let taken = (inner.link.take(), inner.forwarder.take());
            inner.connected_since = None;
            taken
        };
        Self::teardown(old_link, old_forwarder).await;

        info!(address = %address, ?origin, "Connecting to mesh");
        let result = self.connector.connect(&address).await;

        let link = match result {
            Ok(link) => link,
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.link.is_none() {
                    inner.state = ConnectionState::Disconnected;
                }
                drop(inner);
                error!(address = %address, error = %e, "Mesh connect failed");
                return Err(e);
            }
        };

        let stale = {
            let mut inner = self.inner.lock();
            let superseded = inner.generation != generation;
            let pinned = origin == Origin::Automatic && inner.manual_disconnect;
            if superseded || pinned {
                true
            } else {
                let subscription = link.subscribe();
                inner.forwarder = Some(tokio::spawn(forward_packets(
                    link.name().to_string(),
                    subscription,
                    self.packets.clone(),
                )));
                inner.link = Some(link.clone());
                inner.state = ConnectionState::Connected;
                inner.connected_since = Some(Utc::now());
                inner.consecutive_failures = 0;
                false
            }
        };

        if stale {
            info!(link = link.name(), "Discarding link opened during operator takeover");
            if let Err(e) = link.close().await {
                debug!(error = %e, "Error closing discarded link");
            }
            return Ok(());
        }

        info!(link = link.name(), "Mesh link up");
        Ok(())
    }

    async fn teardown(link: Option<Arc<dyn MeshLink>>, forwarder: Option<JoinHandle<()>>) {
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(link) = link {
            if let Err(e) = link.close().await {
                warn!(link = link.name(), error = %e, "Error closing mesh link");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &inner.state)
            .field("manual_disconnect", &inner.manual_disconnect)
            .field("address", &inner.address)
            .field("backoff", &self.backoff)
            .finish()
    }
}

async fn forward_packets(
    link: String,
    mut subscription: broadcast::Receiver<MeshPacket>,
    packets: mpsc::Sender<MeshPacket>,
) {
    loop {
        match subscription.recv().await {
            Ok(packet) => {
                if packets.send(packet).await.is_err() {
                    debug!(link = %link, "Packet consumer gone, stopping forwarder");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(link = %link, missed, "Packet forwarder lagged, packets dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
