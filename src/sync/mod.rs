//! Request Sync Loop
//!
//! Keeps issue and redeem records in step with the contract:
//! - discovers requests opened since the newest stored one
//! - refreshes every tracked non-terminal request on a fixed interval
//! - correlates the BTC transaction that settles each request
//!
//! Each change is stored and published on the event bus. One failing request
//! never stops the others.

pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::bitcoin::EsploraError;
use crate::contract::{BridgeContract, ContractError};
use crate::events::{BridgeEvent, EventBus};
use crate::storage::{RequestStore, StorageError};
use crate::types::{now_secs, BridgeRequest, RequestId, RequestKind, RequestStatus};

pub use strategy::{IssueRequestStrategy, RedeemRequestStrategy, RequestStrategy};

/// Requests tracked per kind by default
pub const DEFAULT_TRACKED_CAPACITY: usize = 10_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("network error: {0}")]
    Network(#[from] EsploraError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Sync loop settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub interval: Duration,
    pub capacity: usize,
    /// Look up the settling BTC transaction of each request
    pub correlate: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            capacity: DEFAULT_TRACKED_CAPACITY,
            correlate: true,
        }
    }
}

/// Bounded set of non-terminal requests awaiting refresh
#[derive(Debug)]
pub struct TrackedRequests {
    capacity: usize,
    entries: HashMap<RequestId, BridgeRequest>,
}

impl TrackedRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    /// Track or refresh `request`; terminal requests are evicted instead
    pub fn insert(&mut self, request: BridgeRequest) -> bool {
        if request.status.is_terminal() {
            self.entries.remove(&request.id);
            return false;
        }

        if !self.entries.contains_key(&request.id) && self.entries.len() >= self.capacity {
            warn!(
                target: "vault::sync",
                id = %request.id,
                capacity = self.capacity,
                "Tracked requests full, not tracking request"
            );
            return false;
        }

        self.entries.insert(request.id, request);
        true
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<BridgeRequest> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot ordered by opentime, then id
    pub fn sorted(&self) -> Vec<BridgeRequest> {
        let mut items: Vec<BridgeRequest> = self.entries.values().cloned().collect();
        items.sort_by(|a, b| (a.opentime, a.id).cmp(&(b.opentime, b.id)));
        items
    }
}

/// Sync loop for one request kind
pub struct RequestSync {
    strategy: Arc<dyn RequestStrategy>,
    contract: Arc<dyn BridgeContract>,
    store: Arc<dyn RequestStore>,
    events: EventBus,
    settings: SyncSettings,
    tracked: Mutex<TrackedRequests>,
    last_update: Mutex<Option<u64>>,
}

impl RequestSync {
    pub fn new(
        strategy: Arc<dyn RequestStrategy>,
        contract: Arc<dyn BridgeContract>,
        store: Arc<dyn RequestStore>,
        events: EventBus,
        settings: SyncSettings,
    ) -> Self {
        let tracked = Mutex::new(TrackedRequests::new(settings.capacity));
        Self {
            strategy,
            contract,
            store,
            events,
            settings,
            tracked,
            last_update: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.strategy.kind()
    }

    /// Load stored non-terminal requests into the tracked set
    pub async fn start(&self) -> Result<usize, SyncError> {
        let pending = self.store.non_terminal_requests(self.kind()).await?;
        let mut tracked = self.tracked.lock().await;
        for request in pending {
            tracked.insert(request);
        }

        info!(target: "vault::sync", kind = %self.kind(), tracked = tracked.len(), "Request sync started");
        Ok(tracked.len())
    }

    /// Record a newly seen request and announce it
    pub async fn add(&self, mut request: BridgeRequest) -> Result<BridgeRequest, SyncError> {
        match self.strategy.fetch_status(&request).await {
            Ok(RequestStatus::None) => {}
            Ok(status) => request.status = status,
            Err(e) => {
                warn!(target: "vault::sync", id = %request.id, error = %e, "Status lookup failed, keeping reported status");
            }
        }

        if request.btc_tx.is_none() {
            request.btc_tx = self.correlate(&request).await;
        }

        request.last_update = now_secs();
        self.store.upsert_request(&request).await?;
        self.tracked.lock().await.insert(request.clone());
        self.events.publish(BridgeEvent::RequestAdded(request.clone()));

        debug!(target: "vault::sync", kind = %request.kind, id = %request.id, status = ?request.status, "Request added");
        Ok(request)
    }

    /// Settling txid, if correlation is enabled and the lookup succeeds
    async fn correlate(&self, request: &BridgeRequest) -> Option<String> {
        if !self.settings.correlate {
            return None;
        }
        match self.strategy.correlate_transaction(request).await {
            Ok(txid) => txid,
            Err(e) => {
                warn!(target: "vault::sync", id = %request.id, error = %e, "Transaction correlation failed");
                None
            }
        }
    }

    /// Pull requests opened since the newest stored one
    pub async fn discover(&self) -> Result<usize, SyncError> {
        let since = self
            .store
            .latest_opentime(self.kind())
            .await?
            .unwrap_or(0);
        let requests = self.contract.requests(self.kind(), since).await?;

        let mut added = 0;
        for request in requests {
            if self.store.get_request(request.kind, &request.id).await?.is_some() {
                continue;
            }
            match self.add(request).await {
                Ok(_) => added += 1,
                Err(e) => error!(target: "vault::sync", kind = %self.kind(), error = %e, "Failed to add request"),
            }
        }
        Ok(added)
    }

    /// Re-read one tracked request; returns it when something changed
    async fn refresh(&self, item: &BridgeRequest) -> Result<Option<BridgeRequest>, SyncError> {
        let mut updated = item.clone();

        match self.strategy.fetch_status(item).await? {
            RequestStatus::None => {}
            status => updated.status = status,
        }

        if updated.btc_tx.is_none() {
            updated.btc_tx = self.correlate(&updated).await;
        }

        if updated.status == item.status && updated.btc_tx == item.btc_tx {
            return Ok(None);
        }

        updated.last_update = now_secs();
        self.store.upsert_request(&updated).await?;
        Ok(Some(updated))
    }

    /// One discovery and refresh pass
    pub async fn sync_once(&self) {
        if let Err(e) = self.discover().await {
            error!(target: "vault::sync", kind = %self.kind(), error = %e, "Request discovery failed");
        }

        let items = self.tracked.lock().await.sorted();
        for item in items {
            match self.refresh(&item).await {
                Ok(Some(updated)) => {
                    self.tracked.lock().await.insert(updated.clone());
                    self.events.publish(BridgeEvent::RequestUpdated(updated));
                }
                Ok(None) => {}
                Err(e) => {
                    error!(target: "vault::sync", kind = %self.kind(), id = %item.id, error = %e, "Request refresh failed");
                }
            }
        }

        *self.last_update.lock().await = Some(now_secs());
    }

    /// Sync on a fixed interval until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.sync_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(target: "vault::sync", kind = %self.kind(), "Request sync stopped");
    }

    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    pub async fn last_update(&self) -> Option<u64> {
        *self.last_update.lock().await
    }
}
