//! Persistent URL work queue.
//!
//! Owns the frontier state machine: enqueue/dequeue/complete/fail/requeue and
//! the completeness probes the phase router relies on. The claim operation is
//! the only thing in the core that multiple workers mutate concurrently, so
//! `dequeue` goes through a single mutex-guarded ordered index: two
//! concurrent dequeues can never return the same item.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CrawlError, Result};
use crate::model::{UrlId, UrlQueueItem, UrlStatus};

/// Predicate over frontier items, supplied by the phase router.
pub type ItemPredicate<'a> = &'a (dyn Fn(&UrlQueueItem) -> bool + Send + Sync);

#[async_trait]
pub trait UrlQueue: Send + Sync {
    /// Insert one pending item. Fails with `InvalidItem` on an empty URL.
    async fn enqueue(&self, item: UrlQueueItem) -> Result<UrlId>;

    async fn enqueue_batch(&self, items: Vec<UrlQueueItem>) -> Result<Vec<UrlId>>;

    /// Insert the item unless the execution has already seen its URL.
    /// Returns `None` for a repeat URL. Discovered children go through this,
    /// so re-running a discovery node (item retry, resume) cannot duplicate
    /// the frontier.
    async fn enqueue_if_new(&self, item: UrlQueueItem) -> Result<Option<UrlId>>;

    /// Atomically claim one claimable item (status to `processing`), honoring
    /// priority desc, then depth asc, then insertion order. Returns `None`
    /// when nothing is currently claimable; callers distinguish "drained"
    /// from "transient" via `active_count`.
    async fn dequeue(&self, execution_id: &str) -> Result<Option<UrlQueueItem>>;

    async fn mark_completed(&self, id: &str) -> Result<()>;

    /// Retryable failures re-enter as pending with `retry_count + 1`, up to
    /// `max_retries`; beyond that, or when not retryable, the item goes
    /// terminal `failed`.
    async fn mark_failed(&self, id: &str, reason: &str, retryable: bool, max_retries: u32) -> Result<()>;

    /// Return a processing item to the claimable set without touching
    /// `retry_count`. Used when the item's phase cannot run yet; on the next
    /// dequeue it is indistinguishable from a normal pending item.
    async fn requeue_for_later(&self, id: &str) -> Result<()>;

    /// Pin the item to its routed phase.
    async fn assign_phase(&self, id: &str, phase_id: &str) -> Result<()>;

    /// Number of currently claimable items.
    async fn pending_count(&self, execution_id: &str) -> Result<usize>;

    /// Pending + requeued + processing; zero means the run has drained.
    async fn active_count(&self, execution_id: &str) -> Result<usize>;

    /// True if any active item other than `exclude` satisfies the discovery
    /// predicate. Gates extraction phases.
    async fn has_pending_discovery_urls(
        &self,
        execution_id: &str,
        exclude: Option<&str>,
        is_discovery: ItemPredicate<'_>,
    ) -> Result<bool>;

    /// Resume path: return items stranded in `processing` by a crashed run to
    /// `pending`. Returns how many were reset.
    async fn reset_stale_processing(&self, execution_id: &str) -> Result<usize>;

    async fn get(&self, id: &str) -> Result<Option<UrlQueueItem>>;

    /// Every item of the execution, for analytics and tests.
    async fn items(&self, execution_id: &str) -> Result<Vec<UrlQueueItem>>;
}

/// Claim ordering: priority desc, depth asc, insertion seq asc. Derived
/// lexicographic `Ord` over these fields gives exactly that once priority is
/// negated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ClaimKey {
    neg_priority: i64,
    depth: u32,
    seq: u64,
    id: UrlId,
}

impl ClaimKey {
    fn of(item: &UrlQueueItem) -> Self {
        Self {
            neg_priority: -(item.priority as i64),
            depth: item.depth,
            seq: item.seq,
            id: item.id.clone(),
        }
    }
}

/// Sled-backed queue. Items live in a sled tree keyed by id; the claimable
/// set is an in-memory index rebuilt from the tree on open, so a restart
/// resumes where the store left off.
pub struct SledUrlQueue {
    _db: sled::Db,
    items: sled::Tree,
    seq: AtomicU64,
    index: Mutex<HashMap<String, BTreeSet<ClaimKey>>>,
    /// Every URL each execution has ever enqueued, any status. Rebuilt from
    /// the tree on open; guards `enqueue_if_new`.
    seen: Mutex<HashMap<String, HashSet<String>>>,
}

impl SledUrlQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let items = db.open_tree("url_queue")?;

        let mut index: HashMap<String, BTreeSet<ClaimKey>> = HashMap::new();
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        let mut max_seq = 0u64;
        for entry in items.iter() {
            let (_, bytes) = entry?;
            let item: UrlQueueItem = serde_json::from_slice(&bytes)?;
            max_seq = max_seq.max(item.seq);
            seen.entry(item.execution_id.clone())
                .or_default()
                .insert(item.url.clone());
            if item.status.is_claimable() {
                index
                    .entry(item.execution_id.clone())
                    .or_default()
                    .insert(ClaimKey::of(&item));
            }
        }

        Ok(Self {
            _db: db,
            items,
            seq: AtomicU64::new(max_seq + 1),
            index: Mutex::new(index),
            seen: Mutex::new(seen),
        })
    }

    fn load(&self, id: &str) -> Result<UrlQueueItem> {
        let bytes = self
            .items
            .get(id)?
            .ok_or_else(|| CrawlError::ItemNotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn store(&self, item: &UrlQueueItem) -> Result<()> {
        let bytes = serde_json::to_vec(item)?;
        self.items.insert(item.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn store_updated(&self, item: &mut UrlQueueItem) -> Result<()> {
        item.updated_at = chrono::Utc::now();
        self.store(item)
    }

    async fn insert_pending(&self, mut item: UrlQueueItem) -> Result<UrlId> {
        item.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        item.status = UrlStatus::Pending;
        self.store(&item)?;

        let mut index = self.index.lock().await;
        index
            .entry(item.execution_id.clone())
            .or_default()
            .insert(ClaimKey::of(&item));
        debug!(id = %item.id, url = %item.url, depth = item.depth, "enqueued");
        Ok(item.id)
    }
}

#[async_trait]
impl UrlQueue for SledUrlQueue {
    async fn enqueue(&self, item: UrlQueueItem) -> Result<UrlId> {
        if item.url.trim().is_empty() {
            return Err(CrawlError::InvalidItem("empty url".to_string()));
        }
        {
            let mut seen = self.seen.lock().await;
            seen.entry(item.execution_id.clone())
                .or_default()
                .insert(item.url.clone());
        }
        self.insert_pending(item).await
    }

    async fn enqueue_batch(&self, items: Vec<UrlQueueItem>) -> Result<Vec<UrlId>> {
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(self.enqueue(item).await?);
        }
        Ok(ids)
    }

    async fn enqueue_if_new(&self, item: UrlQueueItem) -> Result<Option<UrlId>> {
        if item.url.trim().is_empty() {
            return Err(CrawlError::InvalidItem("empty url".to_string()));
        }
        {
            // The insert into `seen` is the claim on the URL; concurrent
            // callers cannot both pass.
            let mut seen = self.seen.lock().await;
            if !seen
                .entry(item.execution_id.clone())
                .or_default()
                .insert(item.url.clone())
            {
                debug!(url = %item.url, "url already on the frontier, skipping");
                return Ok(None);
            }
        }
        self.insert_pending(item).await.map(Some)
    }

    async fn dequeue(&self, execution_id: &str) -> Result<Option<UrlQueueItem>> {
        let mut index = self.index.lock().await;
        let Some(keys) = index.get_mut(execution_id) else {
            return Ok(None);
        };
        while let Some(key) = keys.iter().next().cloned() {
            keys.remove(&key);
            let mut item = match self.load(&key.id) {
                Ok(item) => item,
                Err(CrawlError::ItemNotFound(_)) => {
                    warn!(id = %key.id, "claim index entry without stored item");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !item.status.is_claimable() {
                continue;
            }
            item.status = UrlStatus::Processing;
            self.store_updated(&mut item)?;
            debug!(id = %item.id, url = %item.url, "claimed");
            return Ok(Some(item));
        }
        Ok(None)
    }

    async fn mark_completed(&self, id: &str) -> Result<()> {
        let mut item = self.load(id)?;
        if item.status != UrlStatus::Processing {
            return Err(CrawlError::InvalidTransition {
                item_id: id.to_string(),
                status: item.status.as_str().to_string(),
                expected: "processing".to_string(),
            });
        }
        item.status = UrlStatus::Completed;
        item.error = None;
        self.store_updated(&mut item)
    }

    async fn mark_failed(&self, id: &str, reason: &str, retryable: bool, max_retries: u32) -> Result<()> {
        let mut item = self.load(id)?;
        if item.status != UrlStatus::Processing {
            return Err(CrawlError::InvalidTransition {
                item_id: id.to_string(),
                status: item.status.as_str().to_string(),
                expected: "processing".to_string(),
            });
        }
        item.error = Some(reason.to_string());
        if retryable && item.retry_count < max_retries {
            item.retry_count += 1;
            item.status = UrlStatus::Pending;
            self.store_updated(&mut item)?;
            let mut index = self.index.lock().await;
            index
                .entry(item.execution_id.clone())
                .or_default()
                .insert(ClaimKey::of(&item));
            debug!(id = %id, retry = item.retry_count, "failed, re-entering as pending");
        } else {
            item.status = UrlStatus::Failed;
            self.store_updated(&mut item)?;
            debug!(id = %id, "failed terminally");
        }
        Ok(())
    }

    async fn requeue_for_later(&self, id: &str) -> Result<()> {
        let mut item = self.load(id)?;
        if item.status != UrlStatus::Processing {
            return Err(CrawlError::InvalidTransition {
                item_id: id.to_string(),
                status: item.status.as_str().to_string(),
                expected: "processing".to_string(),
            });
        }
        item.status = UrlStatus::Requeued;
        self.store_updated(&mut item)?;
        let mut index = self.index.lock().await;
        index
            .entry(item.execution_id.clone())
            .or_default()
            .insert(ClaimKey::of(&item));
        debug!(id = %id, "requeued without penalty");
        Ok(())
    }

    async fn assign_phase(&self, id: &str, phase_id: &str) -> Result<()> {
        let mut item = self.load(id)?;
        item.phase_id = Some(phase_id.to_string());
        self.store_updated(&mut item)
    }

    async fn pending_count(&self, execution_id: &str) -> Result<usize> {
        let index = self.index.lock().await;
        Ok(index.get(execution_id).map_or(0, |keys| keys.len()))
    }

    async fn active_count(&self, execution_id: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.items.iter() {
            let (_, bytes) = entry?;
            let item: UrlQueueItem = serde_json::from_slice(&bytes)?;
            if item.execution_id == execution_id && item.status.is_active() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn has_pending_discovery_urls(
        &self,
        execution_id: &str,
        exclude: Option<&str>,
        is_discovery: ItemPredicate<'_>,
    ) -> Result<bool> {
        for entry in self.items.iter() {
            let (_, bytes) = entry?;
            let item: UrlQueueItem = serde_json::from_slice(&bytes)?;
            if item.execution_id != execution_id || !item.status.is_active() {
                continue;
            }
            if exclude == Some(item.id.as_str()) {
                continue;
            }
            if is_discovery(&item) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reset_stale_processing(&self, execution_id: &str) -> Result<usize> {
        let mut reset = 0;
        let mut index = self.index.lock().await;
        for entry in self.items.iter() {
            let (_, bytes) = entry?;
            let mut item: UrlQueueItem = serde_json::from_slice(&bytes)?;
            if item.execution_id != execution_id || item.status != UrlStatus::Processing {
                continue;
            }
            item.status = UrlStatus::Pending;
            self.store_updated(&mut item)?;
            index
                .entry(item.execution_id.clone())
                .or_default()
                .insert(ClaimKey::of(&item));
            reset += 1;
        }
        if reset > 0 {
            warn!(execution_id, reset, "reset stale processing items");
        }
        Ok(reset)
    }

    async fn get(&self, id: &str) -> Result<Option<UrlQueueItem>> {
        match self.load(id) {
            Ok(item) => Ok(Some(item)),
            Err(CrawlError::ItemNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn items(&self, execution_id: &str) -> Result<Vec<UrlQueueItem>> {
        let mut out = Vec::new();
        for entry in self.items.iter() {
            let (_, bytes) = entry?;
            let item: UrlQueueItem = serde_json::from_slice(&bytes)?;
            if item.execution_id == execution_id {
                out.push(item);
            }
        }
        out.sort_by_key(|i| i.seq);
        Ok(out)
    }
}
