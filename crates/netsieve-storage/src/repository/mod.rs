//! Database repositories for each table.

pub mod blobs;
pub mod rules;
pub mod verdicts;

pub use blobs::{hash_body, BlobsRepo};
pub use rules::RulesRepo;
pub use verdicts::VerdictsRepo;

use chrono::{DateTime, Utc};

/// Parse a datetime from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
