//! Per-connector mapping from instance URI to its refresher.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::ConnectorOptions;
use crate::control_plane::ControlPlaneClient;
use crate::instance_uri::InstanceUri;
use crate::refresher::Refresher;

/// Owns every [`Refresher`] created by one connector. Not global: each `Connector` instance
/// gets its own cache, so unrelated connectors in the same process never share state.
pub struct Cache {
    refreshers: Mutex<HashMap<InstanceUri, Arc<Refresher>>>,
    control_plane: Arc<ControlPlaneClient>,
    options: Arc<ConnectorOptions>,
    eviction_tx: mpsc::UnboundedSender<InstanceUri>,
}

impl Cache {
    pub fn new(control_plane: Arc<ControlPlaneClient>, options: Arc<ConnectorOptions>) -> Arc<Self> {
        let (eviction_tx, mut eviction_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(Self {
            refreshers: Mutex::new(HashMap::new()),
            control_plane,
            options,
            eviction_tx,
        });

        let watcher = cache.clone();
        tokio::spawn(async move {
            while let Some(uri) = eviction_rx.recv().await {
                info!(instance = %uri.instance, "evicting refresher after terminal control-plane error");
                watcher.evict(&uri).await;
            }
        });

        cache
    }

    /// Returns the refresher for `uri`, creating one (without blocking on its first fetch)
    /// if none exists yet.
    pub async fn get(&self, uri: &InstanceUri) -> Arc<Refresher> {
        let mut refreshers = self.refreshers.lock().await;
        if let Some(refresher) = refreshers.get(uri) {
            return refresher.clone();
        }

        let refresher = Arc::new(Refresher::spawn(
            uri.clone(),
            self.control_plane.clone(),
            self.options.clone(),
            self.eviction_tx.clone(),
        ));
        refreshers.insert(uri.clone(), refresher.clone());
        refresher
    }

    /// Removes and closes the refresher for `uri`, if present. A no-op if absent.
    pub async fn evict(&self, uri: &InstanceUri) {
        let removed = self.refreshers.lock().await.remove(uri);
        if let Some(refresher) = removed {
            refresher.close().await;
        }
    }

    /// Evicts every entry, used when the owning connector is closed.
    pub async fn evict_all(&self) {
        let removed: Vec<_> = self.refreshers.lock().await.drain().map(|(_, r)| r).collect();
        for refresher in removed {
            refresher.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.refreshers.lock().await.len()
    }
}
