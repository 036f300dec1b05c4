//! Network reachability tracking for the message router

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Snapshot of the device's network state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    pub is_connected: bool,
    /// `None` while reachability has not been determined yet.
    pub is_internet_reachable: Option<bool>,
}

impl Connectivity {
    pub const ONLINE: Connectivity = Connectivity {
        is_connected: true,
        is_internet_reachable: Some(true),
    };

    pub const OFFLINE: Connectivity = Connectivity {
        is_connected: false,
        is_internet_reachable: Some(false),
    };

    /// Connected, and the internet is not known to be unreachable.
    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable != Some(false)
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::ONLINE
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Any HTTP response from this URL counts as reachable.
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// Publishes connectivity changes to any number of watchers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<Connectivity>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::default())
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Record a new observation. Watchers are only woken on change.
    pub fn update(&self, connectivity: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == connectivity {
                return false;
            }
            *current = connectivity;
            true
        });
        if changed {
            info!(
                "Connectivity changed: connected={}, reachable={:?}",
                connectivity.is_connected, connectivity.is_internet_reachable
            );
        }
    }

    /// Periodically probe `config.url` and publish the result.
    pub fn spawn_probe(&self, client: reqwest::Client, config: ProbeConfig) -> ProbeHandle {
        let token = CancellationToken::new();
        let monitor = self.clone();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let observed = probe(&client, &config).await;
                        monitor.update(observed);
                    }
                }
            }
            debug!("Connectivity probe stopped");
        });

        ProbeHandle {
            token,
            task: Some(task),
        }
    }
}

async fn probe(client: &reqwest::Client, config: &ProbeConfig) -> Connectivity {
    match client
        .head(&config.url)
        .timeout(config.timeout)
        .send()
        .await
    {
        Ok(_) => Connectivity::ONLINE,
        Err(e) if e.is_connect() => {
            debug!("Connectivity probe could not connect: {}", e);
            Connectivity::OFFLINE
        }
        Err(e) => {
            // Some network is up, but the internet is not answering.
            debug!("Connectivity probe failed: {}", e);
            Connectivity {
                is_connected: true,
                is_internet_reachable: Some(false),
            }
        }
    }
}

/// Stops the probe when dropped.
pub struct ProbeHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProbeHandle {
    /// Cancel the probe and wait for it to exit.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
