//! Tunnel event loop
//!
//! One cooperative task multiplexes both endpoints:
//!
//! ```text
//!            +------+   ready    +---------+  local packet   +------------------------------+
//!  start --> | Idle | ---------> | Waiting | --------------> | Dispatching(LocalToRemote)   |
//!            +------+            +---------+                 +------------------------------+
//!               ^                  |  |  |   remote packet   +------------------------------+
//!               |                  |  |  +----------------> | Dispatching(RemoteToLocal)   |
//!               +------------------+--+--- (done / tick) ----+------------------------------+
//!                                  |
//!                cancel / closed   v
//!                              +---------+
//!                              | Stopped |
//!                              +---------+
//! ```
//!
//! The readiness wait is bounded by the poll interval so cancellation and
//! periodic reporting are observed even when the link is silent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::encap::Encapsulator;
use crate::error::Result;
use crate::stats::StatusReport;
use crate::transport::PacketEndpoint;

/// Which way a packet is flowing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inner packet from the local endpoint, out to the peer
    LocalToRemote,
    /// Outer datagram from the peer, in to the local endpoint
    RemoteToLocal,
}

/// Dispatcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Waiting,
    Dispatching(Direction),
    Stopped,
}

/// Why the dispatcher stopped without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
}

/// Loop tuning
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    pub stats_interval: Option<Duration>,
    pub status_file: Option<PathBuf>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl From<&DispatcherConfig> for DispatcherSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            stats_interval: config.stats_interval(),
            status_file: config.status_file.clone(),
        }
    }
}

enum Event {
    Cancelled,
    Tick,
    Local(Result<bytes::Bytes>),
    Remote(Result<bytes::Bytes>),
}

/// Moves packets between a local and a remote endpoint through an [`Encapsulator`]
pub struct Dispatcher<L, R> {
    local: L,
    remote: R,
    encap: Arc<Encapsulator>,
    settings: DispatcherSettings,
    state: watch::Sender<DispatcherState>,
    started: Instant,
    last_report: Instant,
    /// Which endpoint gets first look on the next wait; flips every iteration
    local_first: bool,
}

impl<L: PacketEndpoint, R: PacketEndpoint> Dispatcher<L, R> {
    pub fn new(local: L, remote: R, encap: Arc<Encapsulator>, settings: DispatcherSettings) -> Self {
        let (state, _) = watch::channel(DispatcherState::Idle);
        let now = Instant::now();
        Self {
            local,
            remote,
            encap,
            settings,
            state,
            started: now,
            last_report: now,
            local_first: true,
        }
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    /// Observe state transitions, including the final `Stopped`
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Run until cancelled or until an endpoint closes. Both endpoints are
    /// released when this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<StopReason> {
        info!(
            "Dispatcher started: {} <-> {} ({} -> {}, protocol {})",
            self.local.name(),
            self.remote.name(),
            self.encap.peer().local_address,
            self.encap.peer().remote_address,
            self.encap.peer().protocol,
        );

        let result = self.run_loop(&cancel).await;
        self.set_state(DispatcherState::Stopped);

        match &result {
            Ok(reason) => info!("Dispatcher stopped: {:?}", reason),
            Err(e) => warn!("Dispatcher stopped: {}", e),
        }
        self.report();
        result
    }

    async fn run_loop(&mut self, cancel: &CancellationToken) -> Result<StopReason> {
        loop {
            self.set_state(DispatcherState::Waiting);
            let event = self.wait(cancel).await;

            match event {
                Event::Cancelled => return Ok(StopReason::Cancelled),
                Event::Tick => trace!("Dispatcher idle tick"),
                Event::Local(Err(e)) | Event::Remote(Err(e)) if !e.is_fatal() => {
                    debug!("Receive failed, retrying: {}", e);
                }
                Event::Local(packet) => {
                    let packet = packet?;
                    self.set_state(DispatcherState::Dispatching(Direction::LocalToRemote));
                    self.outbound(&packet).await?;
                }
                Event::Remote(datagram) => {
                    let datagram = datagram?;
                    self.set_state(DispatcherState::Dispatching(Direction::RemoteToLocal));
                    self.inbound(&datagram).await?;
                }
            }

            self.set_state(DispatcherState::Idle);
            self.maybe_report();
        }
    }

    /// Wait for the next event. Cancellation is always checked first; the two
    /// endpoints take turns being polled first so neither can starve the other.
    async fn wait(&mut self, cancel: &CancellationToken) -> Event {
        let poll_interval = self.settings.poll_interval;
        let local_first = self.local_first;
        self.local_first = !local_first;

        if local_first {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                packet = self.local.recv() => Event::Local(packet),
                datagram = self.remote.recv() => Event::Remote(datagram),
                _ = tokio::time::sleep(poll_interval) => Event::Tick,
            }
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                datagram = self.remote.recv() => Event::Remote(datagram),
                packet = self.local.recv() => Event::Local(packet),
                _ = tokio::time::sleep(poll_interval) => Event::Tick,
            }
        }
    }

    async fn outbound(&mut self, packet: &[u8]) -> Result<()> {
        let datagram = match self.encap.encapsulate(packet) {
            Ok(d) => d,
            Err(e) => {
                debug!("Dropped outbound packet: {}", e);
                return Ok(());
            }
        };
        match self.remote.send(&datagram).await {
            Err(e) if !e.is_fatal() => {
                debug!("Outbound datagram not sent: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn inbound(&mut self, datagram: &[u8]) -> Result<()> {
        let packet = match self.encap.decapsulate(datagram) {
            Ok(p) => p,
            Err(e) => {
                debug!("Dropped inbound datagram: {}", e);
                return Ok(());
            }
        };
        match self.local.send(&packet).await {
            Err(e) if !e.is_fatal() => {
                debug!("Inbound packet not delivered: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    fn set_state(&self, next: DispatcherState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            trace!("Dispatcher {:?} -> {:?}", current, next);
            *current = next;
            true
        });
    }

    fn maybe_report(&mut self) {
        let Some(interval) = self.settings.stats_interval else {
            return;
        };
        if self.last_report.elapsed() >= interval {
            self.last_report = Instant::now();
            self.report();
        }
    }

    fn report(&self) {
        let stats = self.encap.stats().snapshot();
        info!(
            "Tunnel stats: tx {} pkts / {} bytes, rx {} pkts / {} bytes, dropped {}",
            stats.tx_packets, stats.tx_bytes, stats.rx_packets, stats.rx_bytes, stats.total_dropped()
        );

        if let Some(path) = &self.settings.status_file {
            let status = StatusReport {
                interface: self.local.name().to_string(),
                peer: *self.encap.peer(),
                uptime_secs: self.started.elapsed().as_secs(),
                generated_at: Utc::now(),
                stats,
            };
            if let Err(e) = status.write_to(path) {
                warn!("Failed to write status file {:?}: {}", path, e);
            }
        }
    }
}

/// Wire an encapsulator between two endpoints and run until `cancel` fires
pub async fn run_tunnel<L, R>(
    local: L,
    remote: R,
    encap: Arc<Encapsulator>,
    settings: DispatcherSettings,
    cancel: CancellationToken,
) -> Result<StopReason>
where
    L: PacketEndpoint,
    R: PacketEndpoint,
{
    Dispatcher::new(local, remote, encap, settings).run(cancel).await
}
