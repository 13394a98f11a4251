//! Network connectivity observer.
//!
//! Polls the dispatch server health endpoint and tracks online/offline
//! transitions. On a transition back to online it immediately triggers one
//! queue drain, in addition to whatever the sync engine's periodic loop
//! does. There is no debouncing: rapid flapping may fire several drain
//! requests, and the engine's re-entrancy guard absorbs the overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::sync::SyncEngine;

/// Tracks the last observed connectivity state. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct NetworkObserver {
    api: ApiClient,
    online: Arc<AtomicBool>,
    is_running: Arc<AtomicBool>,
}

impl NetworkObserver {
    /// The observer starts pessimistic: offline until the first probe.
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            online: Arc::new(AtomicBool::new(false)),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Last observed connectivity state (no network round-trip).
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Probe the health endpoint now and record the result. Returns
    /// `(online, came_online)` where `came_online` is true only on an
    /// offline-to-online transition.
    pub async fn check_now(&self) -> (bool, bool) {
        let online = self.api.probe_health().await;
        let was_online = self.online.swap(online, Ordering::SeqCst);
        let came_online = online && !was_online;
        if online != was_online {
            if online {
                info!("connectivity restored");
            } else {
                info!("connectivity lost");
            }
        }
        (online, came_online)
    }

    /// Start the observer loop: probe every `interval_secs` and trigger one
    /// drain pass on each offline-to-online transition.
    pub fn start(&self, engine: Arc<SyncEngine>, interval_secs: u64) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("network observer already running");
            return;
        }

        let observer = self.clone();
        tokio::spawn(async move {
            info!("Network observer started (interval: {interval_secs}s)");
            loop {
                if !observer.is_running.load(Ordering::SeqCst) {
                    info!("Network observer stopped");
                    break;
                }

                tokio::time::sleep(Duration::from_secs(interval_secs)).await;

                if !observer.is_running.load(Ordering::SeqCst) {
                    info!("Network observer stopped");
                    break;
                }

                let (_, came_online) = observer.check_now().await;
                if came_online {
                    info!("triggering queue drain after reconnect");
                    if let Err(e) = engine.process_queue(None).await {
                        warn!("post-reconnect drain failed: {e}");
                    }
                }
            }
        });
    }

    /// Signal the observer loop to exit after its current cycle.
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryVault, SessionVault, KEY_SERVER_URL};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn observer_for(server_url: &str) -> NetworkObserver {
        let vault = Arc::new(MemoryVault::new());
        vault.set(KEY_SERVER_URL, server_url).unwrap();
        NetworkObserver::new(ApiClient::new(vault).unwrap())
    }

    #[tokio::test]
    async fn test_observer_detects_online_transition_once() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let observer = observer_for(&server.uri());
        assert!(!observer.is_online(), "starts pessimistic");

        let (online, came_online) = observer.check_now().await;
        assert!(online);
        assert!(came_online, "first healthy probe is a transition");

        let (online, came_online) = observer.check_now().await;
        assert!(online);
        assert!(!came_online, "staying online is not a transition");
    }

    #[tokio::test]
    async fn test_observer_reports_offline_on_unreachable_server() {
        // Nothing listens on the loopback discard port, so the connect
        // fails fast instead of waiting out the probe timeout.
        let observer = observer_for("http://127.0.0.1:9");
        let (online, came_online) = observer.check_now().await;
        assert!(!online);
        assert!(!came_online);
        assert!(!observer.is_online());
    }

    #[tokio::test]
    async fn test_observer_health_error_counts_as_offline() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let observer = observer_for(&server.uri());
        let (online, _) = observer.check_now().await;
        assert!(!online, "5xx health responses are treated as offline");
    }
}
