//! High-level database interface.

use std::path::PathBuf;

use directories::ProjectDirs;
use netsieve_core::{BlobHandle, BlobStore, RuleMatch, RuleStore, RuleType, StoreError, VerdictEvent};
use tracing::info;

use crate::error::{Result, StorageError};
use crate::models::{NewRule, NewVerdict, Rule, StoredBlob, VerdictCounts, VerdictRecord};
use crate::pool::ConnectionPool;
use crate::repository::{BlobsRepo, RulesRepo, VerdictsRepo};

/// High-level database interface for Netsieve.
///
/// Implements [`RuleStore`] and [`BlobStore`] so it can back an
/// [`netsieve_core::InterceptEngine`] directly.
#[derive(Clone, Debug)]
pub struct Database {
    pool: ConnectionPool,
}

impl Database {
    /// Create a new database in the default app data directory.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_db_path()?)
    }

    /// Create a new database at a specific path.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        info!("Opening database at: {:?}", path);
        let pool = ConnectionPool::new(&path)?;

        Ok(Self { pool })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let pool = ConnectionPool::in_memory()?;
        Ok(Self { pool })
    }

    /// Get the default database path.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "netsieve", "netsieve")
            .ok_or_else(|| StorageError::Config("Could not determine app data directory".into()))?;

        Ok(proj_dirs.data_dir().join("netsieve.db"))
    }

    // === Rules ===

    /// Add a rule and return its id.
    pub fn add_rule(&self, rule: NewRule) -> Result<i64> {
        let conn = self.pool.get()?;
        RulesRepo::insert(&conn, rule)
    }

    /// Get a rule by ID.
    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let conn = self.pool.read()?;
        RulesRepo::get_by_id(&conn, id)
    }

    /// List rules, optionally of one type.
    pub fn list_rules(&self, rule_type: Option<RuleType>) -> Result<Vec<Rule>> {
        let conn = self.pool.read()?;
        RulesRepo::list(&conn, rule_type)
    }

    /// Enable or disable a rule.
    pub fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let conn = self.pool.get()?;
        RulesRepo::set_enabled(&conn, id, enabled)
    }

    /// Delete a rule.
    pub fn remove_rule(&self, id: i64) -> Result<()> {
        let conn = self.pool.get()?;
        RulesRepo::delete(&conn, id)
    }

    /// Find the enabled rule of `rule_type` matching `value`.
    pub fn find_rule_match(&self, rule_type: RuleType, value: &str) -> Result<Option<RuleMatch>> {
        let conn = self.pool.read()?;
        RulesRepo::find_match(&conn, rule_type, value)
    }

    // === Blobs ===

    /// Store a body and return its hash.
    pub fn store_blob(&self, data: &[u8], mime_type: &str) -> Result<String> {
        let conn = self.pool.get()?;
        BlobsRepo::put(&conn, data, mime_type)
    }

    /// Get a stored body.
    pub fn get_blob(&self, hash: &str) -> Result<Option<StoredBlob>> {
        let conn = self.pool.read()?;
        BlobsRepo::get(&conn, hash)
    }

    // === Verdicts ===

    /// Log a published event. Only the copy on the `all` channel is stored;
    /// returns `None` for the others.
    pub fn log_verdict(&self, event: &VerdictEvent) -> Result<Option<i64>> {
        let Some(verdict) = NewVerdict::from_event(event) else {
            return Ok(None);
        };
        let conn = self.pool.get()?;
        VerdictsRepo::insert(&conn, &verdict).map(Some)
    }

    /// Get recent verdicts, newest first.
    pub fn recent_verdicts(&self, limit: i64, offset: i64) -> Result<Vec<VerdictRecord>> {
        let conn = self.pool.read()?;
        VerdictsRepo::recent(&conn, limit, offset)
    }

    /// Count verdicts by classification.
    pub fn verdict_counts(&self) -> Result<VerdictCounts> {
        let conn = self.pool.read()?;
        VerdictsRepo::counts(&conn)
    }

    /// Delete verdicts older than `days` days.
    pub fn prune_verdicts(&self, days: i64) -> Result<usize> {
        let conn = self.pool.get()?;
        VerdictsRepo::prune_older_than(&conn, days)
    }
}

impl RuleStore for Database {
    fn query(&self, rule_type: RuleType, value: &str) -> std::result::Result<Option<RuleMatch>, StoreError> {
        Ok(self.find_rule_match(rule_type, value)?)
    }
}

impl BlobStore for Database {
    fn store(&self, bytes: &[u8], mime_type: &str) -> std::result::Result<BlobHandle, StoreError> {
        Ok(BlobHandle(self.store_blob(bytes, mime_type)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use std::sync::Mutex;

    use netsieve_core::{Channel, Classification, EngineConfig, FlowId, InterceptEngine, Side};

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<VerdictEvent>>,
    }

    impl netsieve_core::VerdictSink for CollectingSink {
        fn publish(&self, event: VerdictEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn rule_crud() {
        let db = Database::in_memory().unwrap();
        let id = db.add_rule(NewRule::new(RuleType::Domain, "Ads.Test")).unwrap();
        assert_eq!(db.get_rule(id).unwrap().unwrap().value, "ads.test");
        assert_eq!(db.list_rules(None).unwrap().len(), 1);

        db.set_rule_enabled(id, false).unwrap();
        assert!(db.find_rule_match(RuleType::Domain, "ads.test").unwrap().is_none());

        db.remove_rule(id).unwrap();
        assert!(db.get_rule(id).unwrap().is_none());
    }

    #[test]
    fn with_path_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("netsieve.db");
        let db = Database::with_path(&path).unwrap();
        db.add_rule(NewRule::new(RuleType::Keyword, "ads")).unwrap();
        assert!(path.exists());

        let found = RuleStore::query(&db, RuleType::Keyword, "https://x.test/ADS.js").unwrap();
        assert_eq!(found, Some(RuleMatch::new(RuleType::Keyword, "ads")));
    }

    #[test]
    fn implements_blob_store() {
        let db = Database::in_memory().unwrap();
        let handle = BlobStore::store(&db, b"payload", "text/plain").unwrap();
        let blob = db.get_blob(handle.as_str()).unwrap().unwrap();
        assert_eq!(blob.data, b"payload");
        assert_eq!(blob.size, 7);
    }

    #[test]
    fn log_verdict_keeps_one_copy_per_event() {
        let db = Database::in_memory().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let engine = InterceptEngine::new(
            EngineConfig::default(),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::clone(&sink) as Arc<dyn netsieve_core::VerdictSink>,
        )
        .unwrap();

        engine.on_bytes(
            FlowId::plain(1),
            Side::Request,
            b"GET / HTTP/1.1\r\nHost: clean.test\r\n\r\n",
        );
        engine.on_bytes(
            FlowId::plain(1),
            Side::Response,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );

        let events = sink.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        let logged: Vec<_> = events
            .iter()
            .filter_map(|event| db.log_verdict(event).unwrap())
            .collect();
        assert_eq!(logged.len(), 1);

        let recent = db.recent_verdicts(10, 0).unwrap();
        assert_eq!(recent[0].url, "http://clean.test/");
        assert_eq!(recent[0].status, Some(200));
        assert_eq!(db.verdict_counts().unwrap().passed, 1);
        assert!(events.iter().any(|e| e.channel == Channel::Passed));
    }

    #[test]
    fn engine_blocks_with_stored_rules() {
        let db = Database::in_memory().unwrap();
        db.add_rule(NewRule::new(RuleType::Domain, "tracker.test")).unwrap();
        let sink = Arc::new(CollectingSink::default());
        let engine = InterceptEngine::new(
            EngineConfig::default().with_blob_threshold(4),
            Arc::new(db.clone()),
            Arc::new(db.clone()),
            Arc::clone(&sink) as Arc<dyn netsieve_core::VerdictSink>,
        )
        .unwrap();

        let disposition = engine.on_bytes(
            FlowId::tls(2),
            Side::Request,
            b"POST /collect HTTP/1.1\r\nHost: eu.tracker.test\r\nContent-Length: 10\r\n\r\n0123456789",
        );
        assert!(disposition.is_abort());

        let events = sink.events.lock().unwrap().clone();
        let blocked = events.iter().find(|e| e.channel == Channel::All).unwrap();
        assert_eq!(blocked.classification, Classification::Blocked);
        db.log_verdict(blocked).unwrap();

        let recent = db.recent_verdicts(1, 0).unwrap();
        let handle = recent[0].request_blob.clone().unwrap();
        assert_eq!(db.get_blob(&handle).unwrap().unwrap().data, b"0123456789");
        assert_eq!(db.verdict_counts().unwrap().blocked, 1);
    }

    #[test]
    fn storage_errors_map_to_store_errors() {
        let err: StoreError = StorageError::InvalidInput("empty".into()).into();
        assert!(matches!(err, StoreError::Rejected(_)));
        let err: StoreError = StorageError::NotFound("x".into()).into();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
