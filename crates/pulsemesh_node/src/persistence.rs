//! `PersistenceLayer` — a typed record store, one sub-namespace per `kind`
//! (spec §4.5).
//!
//! A single worker task owns the on-disk state and an in-memory
//! write-through cache; callers submit `(Op, oneshot::Sender<Reply>)` pairs
//! over an `mpsc` channel and await the reply. The teacher has no
//! worker-queue store verbatim — this is grounded on the *combination* of
//! its atomic-write discipline (`ReputationManager`/`Config` read-modify-
//! write, generalized here into an explicit temp-then-rename helper since
//! the teacher writes its single files directly) and
//! `swedishembedded-sven`'s one-crate-per-concern storage layout.

use pulsemesh_core::consent::{Consent, ConsentContext};
use pulsemesh_core::ids::{NodeId, RecordId};
use pulsemesh_core::signer::{Signature, Signer};
use pulsemesh_core::vector::{ContentVector, EmotionalScalars, EmotionalVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Experience,
    Dream,
    Reflection,
    Fold,
}

impl RecordKind {
    fn dir_name(self) -> &'static str {
        match self {
            RecordKind::Experience => "experience",
            RecordKind::Dream => "dream",
            RecordKind::Reflection => "reflection",
            RecordKind::Fold => "fold",
        }
    }

    fn all() -> [RecordKind; 4] {
        [
            RecordKind::Experience,
            RecordKind::Dream,
            RecordKind::Reflection,
            RecordKind::Fold,
        ]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    pub record_id: RecordId,
    pub author_node_id: NodeId,
    pub author_name: String,
    pub kind: RecordKind,
    pub content: String,
    pub content_vector: Option<ContentVector>,
    pub emotional_vector: Option<EmotionalVector>,
    pub signature: Option<Signature>,
    pub consent_level: u8,
    pub lineage: Vec<RecordId>,
    pub scale_level: String,
    pub fold_pattern: String,
    pub tags: Vec<String>,
    pub created_at: f64,
    pub modified_at: f64,
    pub location: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Clone)]
pub struct RecordQuery {
    pub record_id: Option<RecordId>,
    pub kind: Option<RecordKind>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
}

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("persistence worker is no longer running")]
    WorkerGone,
}

enum Op {
    Store(Record),
    Retrieve(RecordQuery),
    Update(Record),
    Delete(RecordId),
}

enum Reply {
    Stored(Record),
    Records(Vec<Record>),
    Deleted(bool),
    Err(PersistenceError),
}

struct Worker {
    base_path: PathBuf,
    cache: HashMap<RecordId, Record>,
}

impl Worker {
    fn path_for(&self, kind: RecordKind, record_id: &RecordId) -> PathBuf {
        self.base_path.join(kind.dir_name()).join(record_id.as_str())
    }

    fn write_atomic(&self, path: &Path, record: &Record) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn store(&mut self, record: Record) -> Result<Record, PersistenceError> {
        let path = self.path_for(record.kind, &record.record_id);
        self.write_atomic(&path, &record)?;
        self.cache.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    fn update(&mut self, mut record: Record) -> Result<Record, PersistenceError> {
        let path = self.path_for(record.kind, &record.record_id);
        if !path.exists() {
            return Err(PersistenceError::NotFound(record.record_id.to_string()));
        }
        record.modified_at = now_secs();
        self.write_atomic(&path, &record)?;
        self.cache.insert(record.record_id.clone(), record.clone());
        Ok(record)
    }

    fn delete(&mut self, record_id: &RecordId) -> bool {
        self.cache.remove(record_id);
        for kind in RecordKind::all() {
            let path = self.path_for(kind, record_id);
            if path.exists() {
                let _ = fs::remove_file(path);
                return true;
            }
        }
        false
    }

    /// The cache is advisory: a miss falls through to disk rather than
    /// being treated as authoritative absence (spec §4.5).
    fn load_one(&mut self, kind: RecordKind, record_id: &RecordId) -> Option<Record> {
        if let Some(cached) = self.cache.get(record_id) {
            return Some(cached.clone());
        }
        let path = self.path_for(kind, record_id);
        let content = fs::read_to_string(path).ok()?;
        let record: Record = serde_json::from_str(&content).ok()?;
        self.cache.insert(record_id.clone(), record.clone());
        Some(record)
    }

    fn retrieve(&mut self, query: RecordQuery) -> Vec<Record> {
        if let Some(record_id) = &query.record_id {
            let kinds = query.kind.map(|k| vec![k]).unwrap_or_else(|| RecordKind::all().to_vec());
            for kind in kinds {
                if let Some(record) = self.load_one(kind, record_id) {
                    return vec![record];
                }
            }
            return Vec::new();
        }

        let kinds = query.kind.map(|k| vec![k]).unwrap_or_else(|| RecordKind::all().to_vec());
        let mut out = Vec::new();
        for kind in kinds {
            let dir = self.base_path.join(kind.dir_name());
            let entries = match fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    continue;
                }
                let content = match fs::read_to_string(&path) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let record: Record = match serde_json::from_str(&content) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                if !query.tags.is_empty() && !query.tags.iter().any(|t| record.tags.contains(t)) {
                    continue;
                }
                self.cache.insert(record.record_id.clone(), record.clone());
                out.push(record);
            }
        }
        out.sort_by(|a, b| b.created_at.partial_cmp(&a.created_at).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(query.limit.unwrap_or(10));
        out
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::Sender<(Op, oneshot::Sender<Reply>)>,
    local_node_id: NodeId,
    local_node_name: String,
    signer: Option<Arc<dyn Signer>>,
    consent: Option<Arc<dyn Consent>>,
}

impl PersistenceHandle {
    async fn call(&self, op: Op) -> Result<Reply, PersistenceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((op, reply_tx))
            .await
            .map_err(|_| PersistenceError::WorkerGone)?;
        reply_rx.await.map_err(|_| PersistenceError::WorkerGone)
    }

    /// Computes `signature`/`consent_level` via the signer/consent ports
    /// before a record is written (spec §4.5, consent_level per spec §3:
    /// granted→5, partial→3, otherwise→1).
    pub async fn store(&self, mut record: Record) -> Result<Record, PersistenceError> {
        if record.author_node_id.as_str().is_empty() {
            record.author_node_id = self.local_node_id.clone();
        }
        if record.author_name.is_empty() {
            record.author_name = self.local_node_name.clone();
        }

        if record.signature.is_none() {
            if let Some(signer) = &self.signer {
                let emotion = record
                    .emotional_vector
                    .clone()
                    .unwrap_or_else(|| EmotionalVector::from_scalars(EmotionalScalars::neutral()));
                record.signature = Some(signer.sign(&record.author_node_id, &emotion, &record.scale_level));
            }
        }

        if let Some(consent) = &self.consent {
            let vector = record.content_vector.clone().unwrap_or_else(|| ContentVector::new(Vec::new()));
            let context = ConsentContext {
                scale_level: record.scale_level.clone(),
                fold_pattern: record.fold_pattern.clone(),
            };
            let result = consent.verify(&vector, &context);
            record.consent_level = result.kind.record_level();
        }

        match self.call(Op::Store(record)).await? {
            Reply::Stored(r) => Ok(r),
            Reply::Err(e) => Err(e),
            _ => unreachable!("store always replies Stored or Err"),
        }
    }

    pub async fn retrieve(&self, query: RecordQuery) -> Result<Vec<Record>, PersistenceError> {
        match self.call(Op::Retrieve(query)).await? {
            Reply::Records(r) => Ok(r),
            Reply::Err(e) => Err(e),
            _ => unreachable!("retrieve always replies Records or Err"),
        }
    }

    pub async fn update(&self, record: Record) -> Result<Record, PersistenceError> {
        match self.call(Op::Update(record)).await? {
            Reply::Stored(r) => Ok(r),
            Reply::Err(e) => Err(e),
            _ => unreachable!("update always replies Stored or Err"),
        }
    }

    pub async fn delete(&self, record_id: RecordId) -> Result<bool, PersistenceError> {
        match self.call(Op::Delete(record_id)).await? {
            Reply::Deleted(d) => Ok(d),
            Reply::Err(e) => Err(e),
            _ => unreachable!("delete always replies Deleted or Err"),
        }
    }

    /// Convenience wrapper defaulting `kind=dream` and enriching tags.
    pub async fn store_dream(
        &self,
        content: String,
        emotional_vector: Option<EmotionalVector>,
        tags: Vec<String>,
    ) -> Result<Record, PersistenceError> {
        let mut tags = tags;
        if !tags.contains(&"dream".to_string()) {
            tags.push("dream".to_string());
        }
        self.store(blank_record(RecordKind::Dream, content, emotional_vector, tags))
            .await
    }

    /// Convenience wrapper defaulting `kind=reflection`.
    pub async fn store_reflection(
        &self,
        content: String,
        emotional_vector: Option<EmotionalVector>,
        tags: Vec<String>,
    ) -> Result<Record, PersistenceError> {
        let mut tags = tags;
        if !tags.contains(&"reflection".to_string()) {
            tags.push("reflection".to_string());
        }
        self.store(blank_record(RecordKind::Reflection, content, emotional_vector, tags))
            .await
    }
}

fn blank_record(
    kind: RecordKind,
    content: String,
    emotional_vector: Option<EmotionalVector>,
    tags: Vec<String>,
) -> Record {
    let now = now_secs();
    Record {
        record_id: RecordId::generate(),
        author_node_id: NodeId::from(""),
        author_name: String::new(),
        kind,
        content,
        content_vector: None,
        emotional_vector,
        signature: None,
        consent_level: 1,
        lineage: Vec::new(),
        scale_level: String::new(),
        fold_pattern: String::new(),
        tags,
        created_at: now,
        modified_at: now,
        location: None,
        metadata: serde_json::Map::new(),
    }
}

pub struct PersistenceLayer;

impl PersistenceLayer {
    pub fn start(
        base_path: PathBuf,
        local_node_id: NodeId,
        local_node_name: String,
        signer: Option<Arc<dyn Signer>>,
        consent: Option<Arc<dyn Consent>>,
    ) -> PersistenceHandle {
        let (tx, mut rx) = mpsc::channel::<(Op, oneshot::Sender<Reply>)>(256);
        let mut worker = Worker {
            base_path,
            cache: HashMap::new(),
        };

        tokio::spawn(async move {
            while let Some((op, reply_tx)) = rx.recv().await {
                let reply = match op {
                    Op::Store(record) => match worker.store(record) {
                        Ok(r) => Reply::Stored(r),
                        Err(e) => Reply::Err(e),
                    },
                    Op::Retrieve(query) => Reply::Records(worker.retrieve(query)),
                    Op::Update(record) => match worker.update(record) {
                        Ok(r) => Reply::Stored(r),
                        Err(e) => Reply::Err(e),
                    },
                    Op::Delete(record_id) => Reply::Deleted(worker.delete(&record_id)),
                };
                if reply_tx.send(reply).is_err() {
                    warn!("persistence caller dropped before reply was sent");
                }
            }
        });

        PersistenceHandle {
            tx,
            local_node_id,
            local_node_name,
            signer,
            consent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (PersistenceHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let handle = PersistenceLayer::start(dir.path().to_path_buf(), NodeId::generate(), "node-a".into(), None, None);
        (handle, dir)
    }

    #[tokio::test]
    async fn store_computes_signature_and_consent_level_from_ports() {
        use pulsemesh_core::consent::AlwaysGrantConsent;
        use pulsemesh_core::signer::NullSigner;

        let dir = tempfile::tempdir().unwrap();
        let handle = PersistenceLayer::start(
            dir.path().to_path_buf(),
            NodeId::generate(),
            "node-a".into(),
            Some(Arc::new(NullSigner)),
            Some(Arc::new(AlwaysGrantConsent)),
        );

        let record = blank_record(RecordKind::Experience, "hello".into(), None, vec![]);
        let stored = handle.store(record).await.unwrap();
        assert!(stored.signature.is_some());
        assert_eq!(stored.consent_level, 5);
    }

    #[tokio::test]
    async fn store_then_retrieve_by_id_round_trips() {
        let (handle, _dir) = handle();
        let record = blank_record(RecordKind::Experience, "hello".into(), None, vec!["a".into()]);
        let stored = handle.store(record).await.unwrap();

        let found = handle
            .retrieve(RecordQuery {
                record_id: Some(stored.record_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].content, "hello");
    }

    #[tokio::test]
    async fn update_bumps_modified_at_and_requires_existing_record() {
        let (handle, _dir) = handle();
        let record = blank_record(RecordKind::Reflection, "v1".into(), None, vec![]);
        let stored = handle.store(record).await.unwrap();

        let mut updated = stored.clone();
        updated.content = "v2".into();
        let result = handle.update(updated).await.unwrap();
        assert_eq!(result.content, "v2");
        assert!(result.modified_at >= stored.created_at);

        let missing = blank_record(RecordKind::Reflection, "nope".into(), None, vec![]);
        assert!(handle.update(missing).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_record_from_any_kind_directory() {
        let (handle, _dir) = handle();
        let record = blank_record(RecordKind::Fold, "gone soon".into(), None, vec![]);
        let stored = handle.store(record).await.unwrap();

        assert!(handle.delete(stored.record_id.clone()).await.unwrap());
        let found = handle
            .retrieve(RecordQuery {
                record_id: Some(stored.record_id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn retrieve_filters_by_tag_and_respects_limit() {
        let (handle, _dir) = handle();
        for i in 0..5 {
            let tags = if i % 2 == 0 { vec!["keep".to_string()] } else { vec!["drop".to_string()] };
            handle
                .store(blank_record(RecordKind::Experience, format!("r{i}"), None, tags))
                .await
                .unwrap();
        }

        let found = handle
            .retrieve(RecordQuery {
                tags: vec!["keep".into()],
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r.tags.contains(&"keep".to_string())));
    }
}
