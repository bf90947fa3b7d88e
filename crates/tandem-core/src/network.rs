//! Connectivity detection.
//!
//! Three signals feed the monitor: the platform's own online flag, a
//! lightweight reachability probe, and the realtime channel's state. The
//! combined status is debounced so flapping links do not trigger sync storms.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::debounce::Debouncer;
use crate::realtime::ChannelState;
use crate::util::join_url;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Cheap "can we reach the server" check.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probes `GET {base}/health`; any HTTP answer counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(api_base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            url: join_url(api_base_url, "health"),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(error = %error, "Reachability probe failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Signals {
    platform_online: bool,
    probe_ok: bool,
    channel_connected: bool,
}

impl Signals {
    const fn status(self) -> NetworkStatus {
        if !self.platform_online {
            NetworkStatus::Offline
        } else if self.channel_connected || self.probe_ok {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        }
    }
}

pub struct NetworkMonitor {
    signals: Mutex<Signals>,
    raw: Arc<watch::Sender<NetworkStatus>>,
    debounced: Arc<watch::Sender<NetworkStatus>>,
    debouncer: Debouncer,
    probe: Option<Arc<dyn ReachabilityProbe>>,
}

impl NetworkMonitor {
    /// Starts optimistic (online) until a signal says otherwise.
    pub fn new(probe: Option<Arc<dyn ReachabilityProbe>>, debounce: Duration) -> Self {
        let (raw, _) = watch::channel(NetworkStatus::Online);
        let (debounced, _) = watch::channel(NetworkStatus::Online);
        Self {
            signals: Mutex::new(Signals {
                platform_online: true,
                probe_ok: true,
                channel_connected: false,
            }),
            raw: Arc::new(raw),
            debounced: Arc::new(debounced),
            debouncer: Debouncer::new(debounce),
            probe,
        }
    }

    /// Platform-level online/offline notification.
    pub fn report_platform(&self, online: bool) {
        self.update(|signals| signals.platform_online = online);
    }

    /// Feed the realtime channel's state.
    ///
    /// An exhausted channel counts as evidence of lost connectivity until the
    /// next successful probe.
    pub fn report_channel(&self, state: &ChannelState) {
        self.update(|signals| match state {
            ChannelState::Connected => {
                signals.channel_connected = true;
                signals.probe_ok = true;
            }
            ChannelState::Failed { .. } => {
                signals.channel_connected = false;
                // Only a reachability check can clear this again
                if self.probe.is_some() {
                    signals.probe_ok = false;
                }
            }
            ChannelState::Disconnected | ChannelState::Connecting { .. } => {
                signals.channel_connected = false;
            }
        });
    }

    /// Run the reachability probe once and fold in its answer.
    pub async fn probe(&self) -> NetworkStatus {
        if let Some(probe) = &self.probe {
            let reachable = probe.is_reachable().await;
            self.update(|signals| signals.probe_ok = reachable);
        }
        self.raw_status()
    }

    /// Probe forever at `interval`.
    pub async fn run_probe_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe().await;
        }
    }

    /// Debounced status.
    pub fn status(&self) -> NetworkStatus {
        *self.debounced.borrow()
    }

    /// Undebounced status.
    pub fn raw_status(&self) -> NetworkStatus {
        *self.raw.borrow()
    }

    /// Debounced status changes.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.debounced.subscribe()
    }

    fn update(&self, change: impl FnOnce(&mut Signals)) {
        let status = {
            let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
            change(&mut signals);
            signals.status()
        };
        let changed = self.raw.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if !changed {
            return;
        }
        tracing::debug!(?status, "Raw network status changed");

        let raw = Arc::clone(&self.raw);
        let debounced = Arc::clone(&self.debounced);
        self.debouncer.schedule(async move {
            if *raw.borrow() != status {
                return;
            }
            let published = debounced.send_if_modified(|current| {
                if *current == status {
                    false
                } else {
                    *current = status;
                    true
                }
            });
            if published {
                tracing::info!(?status, "Network status changed");
            }
        });
    }
}
