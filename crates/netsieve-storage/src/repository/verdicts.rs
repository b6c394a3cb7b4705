//! Verdict log repository.

use chrono::{SecondsFormat, Utc};
use netsieve_core::{Classification, RuleMatch, RuleType, Transport};
use rusqlite::{params, Connection, Row};

use super::parse_datetime;
use crate::error::Result;
use crate::models::{NewVerdict, VerdictCounts, VerdictRecord};

const VERDICT_COLUMNS: &str = "id, transport, classification, method, url, canonical, status, \
     rule_type, rule_value, dns_host, request_blob, response_blob, created_at";

/// Repository for the verdict log.
pub struct VerdictsRepo;

impl VerdictsRepo {
    /// Insert a verdict.
    pub fn insert(conn: &Connection, verdict: &NewVerdict) -> Result<i64> {
        conn.execute(
            "INSERT INTO verdict_log (transport, classification, method, url, canonical, status,
             rule_type, rule_value, dns_host, request_blob, response_blob, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                verdict.transport.as_str(),
                verdict.classification.as_str(),
                verdict.method,
                verdict.url,
                verdict.canonical,
                verdict.status,
                verdict.rule.as_ref().map(|r| r.rule_type.as_str()),
                verdict.rule.as_ref().map(|r| r.address.as_str()),
                verdict.dns_host,
                verdict.request_blob,
                verdict.response_blob,
                verdict.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent verdicts, newest first.
    pub fn recent(conn: &Connection, limit: i64, offset: i64) -> Result<Vec<VerdictRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERDICT_COLUMNS} FROM verdict_log
             ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
        ))?;

        let verdicts = stmt
            .query_map([limit, offset], row_to_verdict)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(verdicts)
    }

    /// Count verdicts by classification.
    pub fn counts(conn: &Connection) -> Result<VerdictCounts> {
        let mut stmt =
            conn.prepare("SELECT classification, COUNT(*) FROM verdict_log GROUP BY classification")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = VerdictCounts::default();
        for row in rows {
            let (classification, count) = row?;
            match Classification::parse(&classification) {
                Some(Classification::Blocked) => counts.blocked += count,
                Some(Classification::Passed) => counts.passed += count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Delete verdicts older than `days` days. Returns the number deleted.
    pub fn prune_older_than(conn: &Connection, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::days(days)).to_rfc3339_opts(SecondsFormat::Micros, true);
        let deleted = conn.execute("DELETE FROM verdict_log WHERE created_at < ?1", [cutoff])?;
        Ok(deleted)
    }
}

fn row_to_verdict(row: &Row<'_>) -> rusqlite::Result<VerdictRecord> {
    let transport: String = row.get(1)?;
    let classification: String = row.get(2)?;
    let rule_type: Option<String> = row.get(7)?;
    let rule_value: Option<String> = row.get(8)?;

    let rule = match (rule_type.as_deref().and_then(RuleType::parse), rule_value) {
        (Some(rule_type), Some(address)) => Some(RuleMatch::new(rule_type, address)),
        _ => None,
    };

    Ok(VerdictRecord {
        id: row.get(0)?,
        transport: Transport::parse(&transport).unwrap_or(Transport::Plaintext),
        classification: Classification::parse(&classification).unwrap_or(Classification::Passed),
        method: row.get(3)?,
        url: row.get(4)?,
        canonical: row.get(5)?,
        status: row.get(6)?,
        rule,
        dns_host: row.get(9)?,
        request_blob: row.get(10)?,
        response_blob: row.get(11)?,
        created_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::run_migrations;
    use chrono::Duration;

    fn setup_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn verdict(url: &str, rule: Option<RuleMatch>) -> NewVerdict {
        NewVerdict {
            transport: Transport::Tls,
            classification: Classification::from_match(rule.as_ref()),
            method: "GET".into(),
            url: url.into(),
            canonical: url.into(),
            status: None,
            rule,
            dns_host: None,
            request_blob: None,
            response_blob: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn insert_and_read_back() {
        let conn = setup_db();
        let rule = RuleMatch::new(RuleType::Domain, "ads.test");
        let mut blocked = verdict("https://ads.test/", Some(rule.clone()));
        blocked.created_at = Utc::now() - Duration::seconds(5);
        VerdictsRepo::insert(&conn, &blocked).unwrap();
        let mut passed = verdict("https://ok.test/", None);
        passed.status = Some(204);
        VerdictsRepo::insert(&conn, &passed).unwrap();

        let recent = VerdictsRepo::recent(&conn, 10, 0).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].url, "https://ok.test/");
        assert_eq!(recent[0].status, Some(204));
        assert_eq!(recent[1].rule, Some(rule));
        assert_eq!(recent[1].classification, Classification::Blocked);
        assert_eq!(recent[1].transport, Transport::Tls);
    }

    #[test]
    fn counts_by_classification() {
        let conn = setup_db();
        let rule = Some(RuleMatch::new(RuleType::Keyword, "ads"));
        VerdictsRepo::insert(&conn, &verdict("https://a.test/ads", rule.clone())).unwrap();
        VerdictsRepo::insert(&conn, &verdict("https://b.test/ads", rule)).unwrap();
        VerdictsRepo::insert(&conn, &verdict("https://c.test/", None)).unwrap();

        assert_eq!(
            VerdictsRepo::counts(&conn).unwrap(),
            VerdictCounts {
                blocked: 2,
                passed: 1
            }
        );
    }

    #[test]
    fn prune_removes_old_entries() {
        let conn = setup_db();
        let mut old = verdict("https://old.test/", None);
        old.created_at = Utc::now() - Duration::days(40);
        VerdictsRepo::insert(&conn, &old).unwrap();
        VerdictsRepo::insert(&conn, &verdict("https://new.test/", None)).unwrap();

        assert_eq!(VerdictsRepo::prune_older_than(&conn, 30).unwrap(), 1);
        assert_eq!(VerdictsRepo::recent(&conn, 10, 0).unwrap().len(), 1);
    }
}
