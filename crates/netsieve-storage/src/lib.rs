//! Netsieve Storage - SQLite persistence layer.
//!
//! This crate provides the concrete collaborators the engine queries:
//!
//! - Block rules (URL, domain, keyword) with matching done in SQL
//! - Content-addressed body blobs (SHA-256)
//! - A verdict log
//!
//! [`Database`] implements [`netsieve_core::RuleStore`] and
//! [`netsieve_core::BlobStore`].
//!
//! # Example
//!
//! ```no_run
//! use netsieve_core::RuleType;
//! use netsieve_storage::{Database, NewRule};
//!
//! let db = Database::in_memory().unwrap();
//! db.add_rule(NewRule::new(RuleType::Domain, "ads.example")).unwrap();
//! assert!(db.find_rule_match(RuleType::Domain, "cdn.ads.example").unwrap().is_some());
//! ```

mod database;
pub mod error;
pub mod models;
mod pool;
pub mod repository;
mod schema;

pub use database::Database;
pub use error::{Result, StorageError};
pub use models::{NewRule, NewVerdict, Rule, StoredBlob, VerdictCounts, VerdictRecord};
pub use pool::ConnectionPool;
pub use repository::{hash_body, BlobsRepo, RulesRepo, VerdictsRepo};
