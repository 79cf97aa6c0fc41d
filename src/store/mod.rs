mod queue;

pub use queue::{ListenerGuard, ProcQueue, QueueState};

use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::relations::RelationTable;
use crate::Asn;

/// Identifier for one batch of BGP paths, typically a RIB snapshot name.
pub type Tag = String;

/// Pub/sub channel announcing finished inferences; payloads are the
/// literal `"<ribtag>|<dst>"` event tags.
pub const QUERY_STATUS_CHANNEL: &str = "inference:query_status";

pub fn event_tag(tag: &str, dst: &str) -> String {
    format!("{}|{}", tag, dst)
}

pub fn queue_name(tag: &str) -> String {
    format!("procqueue:{}", tag)
}

/// User-visible name of a result-cache entry.
pub fn result_name(tag_key: &str, dst: &str) -> String {
    format!("result:{}:inferred_to:{}", tag_key, dst)
}

/// Result-cache key for a RIB-tag list.
pub fn result_key(tags: &[Tag]) -> String {
    tags.join("_")
}

#[derive(Debug)]
pub enum StoreError {
    Io(PathBuf, io::Error),
    Format(PathBuf, serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Io(path, err) => write!(f, "store {}: {}", path.display(), err),
            StoreError::Format(path, err) => {
                write!(f, "store {} is not a valid snapshot: {}", path.display(), err)
            }
        }
    }
}

impl Error for StoreError {}

/// Observation metadata carried on AS entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AsAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_after: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_before: Option<String>,
}

/// Observation metadata carried on directed links.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

/// A set of ASes plus their directed adjacencies. Every raw adjacency is
/// inserted in both directions, so `links[u]` containing `v` implies
/// `links[v]` contains `u`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkSet {
    pub ases: BTreeMap<Asn, AsAttrs>,
    links: BTreeMap<Asn, BTreeMap<Asn, LinkAttrs>>,
}

impl LinkSet {
    pub fn add_as(&mut self, asn: &str, attrs: AsAttrs) {
        self.ases.entry(asn.to_string()).or_insert(attrs);
    }

    /// Insert the adjacency in both directions; attributes are first-wins.
    pub fn add_link(&mut self, u: &str, v: &str, attrs: LinkAttrs) {
        self.links
            .entry(u.to_string())
            .or_insert_with(BTreeMap::new)
            .entry(v.to_string())
            .or_insert_with(|| attrs.clone());
        self.links
            .entry(v.to_string())
            .or_insert_with(BTreeMap::new)
            .entry(u.to_string())
            .or_insert(attrs);
    }

    pub fn neighbors(&self, u: &str) -> impl Iterator<Item = &Asn> {
        self.links.get(u).into_iter().flat_map(|m| m.keys())
    }

    fn merge_into(&self, merged: &mut BTreeMap<Asn, BTreeSet<Asn>>) {
        for (asn, peers) in &self.links {
            let entry = merged.entry(asn.clone()).or_default();
            entry.extend(peers.keys().cloned());
        }
        for asn in self.ases.keys() {
            merged.entry(asn.clone()).or_default();
        }
    }

    /// Adjacency sets of this link set alone.
    pub fn neighbor_sets(&self) -> BTreeMap<Asn, BTreeSet<Asn>> {
        let mut merged = BTreeMap::new();
        self.merge_into(&mut merged);
        merged
    }

    pub fn link_count(&self) -> usize {
        self.links.values().map(|m| m.len()).sum()
    }

    pub fn as_count(&self) -> usize {
        self.ases.len()
    }
}

/// Location of one sure path inside the stored-path arena.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct PathSpan {
    path: usize,
    start: usize,
    end: usize,
}

/// Per-tag index of observed path segments: for every observed BGP path
/// `[A0..Ak]` and every `i < j`, `[Ai..Aj]` is a sure path from `Ai` to
/// `Aj`. Only full observed paths are stored; the `(src, dest)` index
/// references spans of them, first-wins.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SurePathIndex {
    paths: Vec<Vec<Asn>>,
    // dest -> src -> span
    spans: BTreeMap<Asn, BTreeMap<Asn, PathSpan>>,
}

impl SurePathIndex {
    /// Index all subsequences of an observed path. Returns the number of
    /// new `(src, dest)` entries.
    pub fn insert_observed(&mut self, path: &[Asn]) -> usize {
        if path.len() < 2 {
            return 0;
        }
        let arena_idx = self.paths.len();
        let mut added = 0;
        for i in 0..path.len() {
            for j in (i + 1)..path.len() {
                let slot = self
                    .spans
                    .entry(path[j].clone())
                    .or_insert_with(BTreeMap::new)
                    .entry(path[i].clone());
                if let btree_map::Entry::Vacant(vacant) = slot {
                    vacant.insert(PathSpan {
                        path: arena_idx,
                        start: i,
                        end: j + 1,
                    });
                    added += 1;
                }
            }
        }
        if added > 0 {
            self.paths.push(path.to_vec());
        }
        added
    }

    fn slice(&self, span: &PathSpan) -> &[Asn] {
        &self.paths[span.path][span.start..span.end]
    }

    /// The sure path from `src` to `dest`, when one was observed.
    pub fn lookup(&self, src: &str, dest: &str) -> Option<&[Asn]> {
        self.spans
            .get(dest)
            .and_then(|m| m.get(src))
            .map(|span| self.slice(span))
    }

    /// Every `(src, sure path)` pair anchored at `dest`.
    pub fn sources_for(&self, dest: &str) -> Vec<(&Asn, &[Asn])> {
        match self.spans.get(dest) {
            Some(by_src) => by_src
                .iter()
                .map(|(src, span)| (src, self.slice(span)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All indexed sure paths, in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = &[Asn]> + '_ {
        self.spans
            .values()
            .flat_map(move |by_src| by_src.values().map(move |span| self.slice(span)))
    }

    /// Number of indexed `(src, dest)` pairs.
    pub fn len(&self) -> usize {
        self.spans.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// AS set, link set and sure paths contributed by one RIB snapshot,
/// layered above the base link set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RibOverlay {
    pub graph: LinkSet,
    pub sure_paths: SurePathIndex,
}

/// Outcome of a result-cache probe. An absent destination entry means
/// "not yet searched"; a present entry without the source means
/// "searched, no path found".
#[derive(Clone, Debug, PartialEq)]
pub enum CacheLookup {
    NotSearched,
    SearchedNoPath,
    Path(String),
}

/// Destination-indexed inferred-path cache: `(tag key, dst)` maps each
/// source AS to its rendered path. Write-once per destination.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResultCache {
    entries: BTreeMap<String, BTreeMap<Asn, BTreeMap<Asn, String>>>,
}

impl ResultCache {
    pub fn lookup(&self, tag_key: &str, dst: &str, src: &str) -> CacheLookup {
        match self.entries.get(tag_key).and_then(|m| m.get(dst)) {
            None => CacheLookup::NotSearched,
            Some(by_src) => match by_src.get(src) {
                Some(path) => CacheLookup::Path(path.clone()),
                None => CacheLookup::SearchedNoPath,
            },
        }
    }

    pub fn contains(&self, tag_key: &str, dst: &str) -> bool {
        self.entries
            .get(tag_key)
            .map(|m| m.contains_key(dst))
            .unwrap_or(false)
    }

    /// Install the inferred paths for a destination. The cache is
    /// write-once per `(tag key, dst)`; a second write is ignored.
    pub fn insert(&mut self, tag_key: &str, dst: &str, paths: BTreeMap<Asn, String>) -> bool {
        let by_dst = self.entries.entry(tag_key.to_string()).or_default();
        match by_dst.entry(dst.to_string()) {
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(paths);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn destination_count(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }
}

/// On-disk image of the whole graph store. Ingest commands open, modify
/// and save it; the inference service loads it at startup and writes the
/// result cache and queue state back on shutdown.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub base: LinkSet,
    pub tags: BTreeMap<Tag, RibOverlay>,
    pub relations: RelationTable,
    #[serde(default)]
    pub results: ResultCache,
    #[serde(default)]
    pub queues: BTreeMap<Tag, QueueState>,
}

impl Snapshot {
    /// Load a snapshot, or start empty when the file does not exist yet.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        match File::open(path) {
            Ok(file) => {
                let snapshot = serde_json::from_reader(BufReader::new(file))
                    .map_err(|e| StoreError::Format(path.to_path_buf(), e))?;
                Ok(snapshot)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(StoreError::Io(path.to_path_buf(), err)),
        }
    }

    /// Atomically persist: write a temporary file next to the target and
    /// rename it into place.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        {
            let file =
                File::create(&tmp).map_err(|e| StoreError::Io(tmp.clone(), e))?;
            serde_json::to_writer(BufWriter::new(file), self)
                .map_err(|e| StoreError::Format(tmp.clone(), e))?;
        }
        fs::rename(&tmp, path).map_err(|e| StoreError::Io(path.to_path_buf(), e))?;
        debug!("Saved snapshot to {}", path.display());
        Ok(())
    }

    /// Merged neighbor sets of the base link set and the given overlays.
    /// The path-vector builder consumes these, never raw store entries.
    pub fn composite_links(&self, tags: &[Tag]) -> BTreeMap<Asn, BTreeSet<Asn>> {
        let mut merged = BTreeMap::new();
        self.base.merge_into(&mut merged);
        for tag in tags {
            if let Some(overlay) = self.tags.get(tag) {
                overlay.graph.merge_into(&mut merged);
            }
        }
        merged
    }
}

/// Runtime view of the snapshot used by the inference service: the graph
/// data is read-only, the result cache sits behind a `RwLock`, each
/// served tag gets a processing queue, and completions fan out over a
/// broadcast channel standing in for `inference:query_status`.
pub struct GraphStore {
    pub base: LinkSet,
    pub tags: BTreeMap<Tag, RibOverlay>,
    pub relations: RelationTable,
    results: RwLock<ResultCache>,
    queues: HashMap<Tag, Arc<ProcQueue>>,
    events: broadcast::Sender<String>,
}

impl GraphStore {
    /// Build the runtime store, creating a processing queue for each
    /// served tag and restoring any persisted queue contents.
    pub fn new(mut snapshot: Snapshot, serve_tags: &[Tag]) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut queues = HashMap::new();
        for tag in serve_tags {
            let state = snapshot.queues.remove(tag).unwrap_or_default();
            queues.insert(tag.clone(), Arc::new(ProcQueue::new(tag, state, false)));
        }
        Self {
            base: snapshot.base,
            tags: snapshot.tags,
            relations: snapshot.relations,
            results: RwLock::new(snapshot.results),
            queues,
            events,
        }
    }

    pub fn queue(&self, tag: &str) -> Option<&Arc<ProcQueue>> {
        self.queues.get(tag)
    }

    pub async fn lookup_result(&self, tag_key: &str, dst: &str, src: &str) -> CacheLookup {
        self.results.read().await.lookup(tag_key, dst, src)
    }

    pub async fn result_exists(&self, tag_key: &str, dst: &str) -> bool {
        self.results.read().await.contains(tag_key, dst)
    }

    /// Single writer per `(tag key, dst)`: the worker that computed it.
    pub async fn write_results(
        &self,
        tag_key: &str,
        dst: &str,
        paths: BTreeMap<Asn, String>,
    ) -> bool {
        let written = self.results.write().await.insert(tag_key, dst, paths);
        if !written {
            info!("Results for {} already present; keeping the first write", result_name(tag_key, dst));
        }
        written
    }

    pub fn publish(&self, event: String) {
        // No subscriber just means nothing is waiting on the channel.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Reassemble a snapshot for persistence on shutdown.
    pub async fn to_snapshot(&self) -> Snapshot {
        let mut queues = BTreeMap::new();
        for (tag, queue) in &self.queues {
            queues.insert(tag.clone(), queue.state());
        }
        Snapshot {
            base: self.base.clone(),
            tags: self.tags.clone(),
            relations: self.relations.clone(),
            results: self.results.read().await.clone(),
            queues,
        }
    }

    /// Sure-path seeds for a destination across the given overlays;
    /// first tag wins for a source appearing in several.
    pub fn seeds_for(&self, tags: &[Tag], dest: &str) -> Vec<(Asn, Vec<Asn>)> {
        let mut seeds: Vec<(Asn, Vec<Asn>)> = Vec::new();
        let mut seen: BTreeSet<&Asn> = BTreeSet::new();
        for tag in tags {
            if let Some(overlay) = self.tags.get(tag) {
                for (src, path) in overlay.sure_paths.sources_for(dest) {
                    if seen.insert(src) {
                        seeds.push((src.clone(), path.to_vec()));
                    }
                }
            }
        }
        seeds
    }

    pub fn composite_links(&self, tags: &[Tag]) -> BTreeMap<Asn, BTreeSet<Asn>> {
        let mut merged = BTreeMap::new();
        self.base.merge_into(&mut merged);
        for tag in tags {
            if let Some(overlay) = self.tags.get(tag) {
                overlay.graph.merge_into(&mut merged);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(hops: &[&str]) -> Vec<Asn> {
        hops.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_links_are_bidirectional() {
        let mut set = LinkSet::default();
        set.add_as("1", AsAttrs::default());
        set.add_as("2", AsAttrs::default());
        set.add_link("1", "2", LinkAttrs::default());
        assert_eq!(set.neighbors("1").collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(set.neighbors("2").collect::<Vec<_>>(), vec!["1"]);
    }

    #[test]
    fn test_sure_path_subsequences() {
        let mut index = SurePathIndex::default();
        let added = index.insert_observed(&path(&["1", "2", "3"]));
        // (1,2), (1,3), (2,3)
        assert_eq!(added, 3);
        assert_eq!(index.lookup("1", "3").unwrap(), &path(&["1", "2", "3"])[..]);
        assert_eq!(index.lookup("2", "3").unwrap(), &path(&["2", "3"])[..]);
        assert!(index.lookup("3", "1").is_none());
    }

    #[test]
    fn test_sure_path_first_wins() {
        let mut index = SurePathIndex::default();
        index.insert_observed(&path(&["1", "2", "3"]));
        index.insert_observed(&path(&["1", "4", "3"]));
        assert_eq!(index.lookup("1", "3").unwrap(), &path(&["1", "2", "3"])[..]);
        // The second observation still contributed its new pairs.
        assert_eq!(index.lookup("4", "3").unwrap(), &path(&["4", "3"])[..]);
    }

    #[test]
    fn test_sources_for_destination() {
        let mut index = SurePathIndex::default();
        index.insert_observed(&path(&["1", "2", "3"]));
        index.insert_observed(&path(&["4", "3"]));
        let sources = index.sources_for("3");
        let names: Vec<&str> = sources.iter().map(|(s, _)| s.as_str()).collect();
        assert_eq!(names, vec!["1", "2", "4"]);
    }

    #[test]
    fn test_cache_absence_vs_unsearched() {
        let mut cache = ResultCache::default();
        assert_eq!(cache.lookup("T", "3", "1"), CacheLookup::NotSearched);
        let mut paths = BTreeMap::new();
        paths.insert("1".to_string(), "1 2 3".to_string());
        assert!(cache.insert("T", "3", paths));
        assert_eq!(cache.lookup("T", "3", "1"), CacheLookup::Path("1 2 3".into()));
        assert_eq!(cache.lookup("T", "3", "9"), CacheLookup::SearchedNoPath);
    }

    #[test]
    fn test_cache_write_once() {
        let mut cache = ResultCache::default();
        let mut first = BTreeMap::new();
        first.insert("1".to_string(), "1 2 3".to_string());
        assert!(cache.insert("T", "3", first));
        let mut second = BTreeMap::new();
        second.insert("1".to_string(), "1 4 3".to_string());
        assert!(!cache.insert("T", "3", second));
        assert_eq!(cache.lookup("T", "3", "1"), CacheLookup::Path("1 2 3".into()));
    }

    #[test]
    fn test_key_names() {
        assert_eq!(queue_name("T"), "procqueue:T");
        assert_eq!(event_tag("T", "9"), "T|9");
        assert_eq!(result_name("T", "9"), "result:T:inferred_to:9");
        assert_eq!(result_key(&["a".to_string(), "b".to_string()]), "a_b");
    }
}
