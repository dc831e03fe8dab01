//! Proxy request/response history
//!
//! Every completed exchange gets a strictly increasing id and is indexed by
//! site (`scheme://host:port`) and path. Records are immutable once stored.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::http::HttpMessage;

pub const DEFAULT_MAX_HISTORY_ITEMS: usize = 100_000;
pub const DEFAULT_CURSOR_BATCH: usize = 256;

/// A single completed exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Unique ID
    pub id: u64,

    /// Site key, `scheme://host:port`
    pub site: String,

    /// Request path
    pub path: String,

    /// When the record was stored
    pub recorded_at: DateTime<Utc>,

    pub message: HttpMessage,
}

/// External storage for history records
pub trait HistoryPersistence: Send + Sync {
    fn record(&self, record: &HistoryRecord) -> std::io::Result<()>;
    fn fetch(&self, id: u64) -> std::io::Result<Option<HistoryRecord>>;
}

/// Appends one JSON object per record to a file
pub struct JsonlPersistence {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlPersistence {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

impl HistoryPersistence for JsonlPersistence {
    fn record(&self, record: &HistoryRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()
    }

    fn fetch(&self, id: u64) -> std::io::Result<Option<HistoryRecord>> {
        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: HistoryRecord = serde_json::from_str(&line)?;
            if record.id == id {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

#[derive(Default)]
struct Index {
    records: HashMap<u64, Arc<HistoryRecord>>,
    /// Ids currently in memory, oldest first
    order: BTreeSet<u64>,
    sites: BTreeMap<String, BTreeMap<String, BTreeSet<u64>>>,
    pins: HashMap<u64, usize>,
}

impl Index {
    fn remove(&mut self, id: u64) {
        let Some(record) = self.records.remove(&id) else { return };
        self.order.remove(&id);
        if let Some(paths) = self.sites.get_mut(&record.site) {
            if let Some(ids) = paths.get_mut(&record.path) {
                ids.remove(&id);
                if ids.is_empty() {
                    paths.remove(&record.path);
                }
            }
            if paths.is_empty() {
                self.sites.remove(&record.site);
            }
        }
    }
}

/// Selects a subtree of the site map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteFilter {
    /// Exact site key; `None` matches every site
    pub site: Option<String>,
    /// Path prefix within the site
    pub path_prefix: Option<String>,
}

impl SiteFilter {
    pub fn site(site: &str) -> Self {
        Self {
            site: Some(site.to_string()),
            path_prefix: None,
        }
    }

    pub fn subtree(site: &str, path_prefix: &str) -> Self {
        Self {
            site: Some(site.to_string()),
            path_prefix: Some(path_prefix.to_string()),
        }
    }

    fn matches(&self, record: &HistoryRecord) -> bool {
        self.site.as_deref().map_or(true, |s| s == record.site)
            && self.path_prefix.as_deref().map_or(true, |p| record.path.starts_with(p))
    }
}

/// Batched iteration in id order. Records added after the cursor was
/// created are picked up by later batches.
#[derive(Debug, Clone)]
pub struct HistoryCursor {
    filter: SiteFilter,
    after: u64,
    batch_size: usize,
}

impl HistoryCursor {
    pub fn next_batch(&mut self, store: &HistoryStore) -> Vec<Arc<HistoryRecord>> {
        let index = store.index.read();
        let batch: Vec<Arc<HistoryRecord>> = index
            .order
            .range(self.after.saturating_add(1)..)
            .filter_map(|id| index.records.get(id))
            .filter(|r| self.filter.matches(r))
            .take(self.batch_size)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            self.after = last.id;
        }
        batch
    }
}

/// Proxy history manager
pub struct HistoryStore {
    next_id: AtomicU64,
    index: RwLock<Index>,
    max_items: usize,
    persistence: Option<Arc<dyn HistoryPersistence>>,
}

impl HistoryStore {
    pub fn new(max_items: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            index: RwLock::new(Index::default()),
            max_items: max_items.max(1),
            persistence: None,
        }
    }

    pub fn with_persistence(max_items: usize, persistence: Arc<dyn HistoryPersistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::new(max_items)
        }
    }

    /// Store a completed exchange and return its shared, read-only record
    pub fn record(&self, mut message: HttpMessage) -> Arc<HistoryRecord> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        message.history_id = Some(id);
        let target = message.request_header.resolved();
        let record = Arc::new(HistoryRecord {
            id,
            site: target.origin(),
            path: target.path,
            recorded_at: Utc::now(),
            message,
        });

        {
            let mut index = self.index.write();
            index.records.insert(id, Arc::clone(&record));
            index.order.insert(id);
            index
                .sites
                .entry(record.site.clone())
                .or_default()
                .entry(record.path.clone())
                .or_default()
                .insert(id);
            self.evict(&mut index);
        }

        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.record(&record) {
                warn!(id, error = %e, "Failed to persist history record");
            }
        }
        record
    }

    fn evict(&self, index: &mut Index) {
        while index.records.len() > self.max_items {
            let oldest = index.order.iter().copied().find(|id| !index.pins.contains_key(id));
            match oldest {
                Some(id) => {
                    index.remove(id);
                    debug!(id, "Evicted history record from memory");
                }
                None => break,
            }
        }
    }

    /// Record by id, falling back to persistence for evicted records
    pub fn get(&self, id: u64) -> Option<Arc<HistoryRecord>> {
        if let Some(record) = self.index.read().records.get(&id) {
            return Some(Arc::clone(record));
        }
        let persistence = self.persistence.as_ref()?;
        match persistence.fetch(id) {
            Ok(record) => record.map(Arc::new),
            Err(e) => {
                warn!(id, error = %e, "Failed to fetch history record");
                None
            }
        }
    }

    pub fn sites(&self) -> Vec<String> {
        self.index.read().sites.keys().cloned().collect()
    }

    pub fn paths(&self, site: &str) -> Vec<String> {
        self.index
            .read()
            .sites
            .get(site)
            .map(|paths| paths.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Ids under a site subtree, ascending
    pub fn ids(&self, filter: &SiteFilter) -> Vec<u64> {
        let index = self.index.read();
        let mut ids: Vec<u64> = match &filter.site {
            Some(site) => index
                .sites
                .get(site)
                .into_iter()
                .flat_map(|paths| paths.iter())
                .filter(|(path, _)| filter.path_prefix.as_deref().map_or(true, |p| path.starts_with(p)))
                .flat_map(|(_, ids)| ids.iter().copied())
                .collect(),
            None => index
                .order
                .iter()
                .copied()
                .filter(|id| index.records.get(id).map_or(false, |r| filter.matches(r)))
                .collect(),
        };
        ids.sort_unstable();
        ids
    }

    pub fn cursor(&self, filter: SiteFilter, batch_size: usize) -> HistoryCursor {
        HistoryCursor {
            filter,
            after: 0,
            batch_size: batch_size.max(1),
        }
    }

    /// Keep `ids` in memory until the guard is dropped
    pub fn pin(self: &Arc<Self>, ids: &[u64]) -> PinGuard {
        let mut index = self.index.write();
        for id in ids {
            *index.pins.entry(*id).or_insert(0) += 1;
        }
        PinGuard {
            store: Arc::clone(self),
            ids: ids.to_vec(),
        }
    }

    fn unpin(&self, ids: &[u64]) {
        let mut index = self.index.write();
        for id in ids {
            if let Some(count) = index.pins.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    index.pins.remove(id);
                }
            }
        }
        self.evict(&mut index);
    }

    pub fn len(&self) -> usize {
        self.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().records.is_empty()
    }

    /// Id the next record will receive
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

/// Releases pinned history records on drop
pub struct PinGuard {
    store: Arc<HistoryStore>,
    ids: Vec<u64>,
}

impl PinGuard {
    pub fn ids(&self) -> &[u64] {
        &self.ids
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.store.unpin(&self.ids);
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGuard").field("ids", &self.ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Initiator, RequestHeader};

    fn message(url: &str) -> HttpMessage {
        HttpMessage::new(RequestHeader::new("GET", url).unwrap(), Body::empty(), Initiator::Proxy)
    }

    #[test]
    fn test_ids_are_strictly_increasing_and_indexed() {
        let store = HistoryStore::new(100);
        let a = store.record(message("http://example.com/a"));
        let b = store.record(message("http://example.com/b/c"));
        let c = store.record(message("https://other.test/"));

        assert!(a.id < b.id && b.id < c.id);
        assert_eq!(b.message.history_id, Some(b.id));
        assert_eq!(store.sites(), vec!["http://example.com:80", "https://other.test:443"]);
        assert_eq!(store.paths("http://example.com:80"), vec!["/a", "/b/c"]);
        assert_eq!(store.ids(&SiteFilter::subtree("http://example.com:80", "/b")), vec![b.id]);
    }

    #[test]
    fn test_cursor_batches_and_sees_new_records() {
        let store = HistoryStore::new(100);
        for i in 0..5 {
            store.record(message(&format!("http://example.com/{}", i)));
        }
        let mut cursor = store.cursor(SiteFilter::default(), 2);
        assert_eq!(cursor.next_batch(&store).len(), 2);
        assert_eq!(cursor.next_batch(&store).len(), 2);
        assert_eq!(cursor.next_batch(&store).len(), 1);
        assert!(cursor.next_batch(&store).is_empty());

        store.record(message("http://example.com/late"));
        assert_eq!(cursor.next_batch(&store).len(), 1);
    }

    #[test]
    fn test_eviction_skips_pinned_and_never_reuses_ids() {
        let store = Arc::new(HistoryStore::new(2));
        let first = store.record(message("http://example.com/1"));
        let guard = store.pin(&[first.id]);

        let second = store.record(message("http://example.com/2"));
        let third = store.record(message("http://example.com/3"));
        assert_eq!(store.len(), 2);
        assert!(store.get(first.id).is_some());
        assert!(store.get(second.id).is_none());

        drop(guard);
        store.record(message("http://example.com/4"));
        assert!(store.get(first.id).is_none());
        assert!(store.get(third.id).is_some());
        assert_eq!(store.next_id(), 5);
    }

    #[test]
    fn test_jsonl_persistence_serves_evicted_records() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(JsonlPersistence::open(&dir.path().join("history.jsonl")).unwrap());
        let store = HistoryStore::with_persistence(1, persistence);

        let first = store.record(message("http://example.com/first"));
        store.record(message("http://example.com/second"));

        let restored = store.get(first.id).unwrap();
        assert_eq!(restored.path, "/first");
        assert_eq!(restored.message.url(), "http://example.com/first");
    }
}
