//! Rules repository.

use netsieve_core::{RuleMatch, RuleType};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::parse_datetime;
use crate::error::{Result, StorageError};
use crate::models::{NewRule, Rule};

const RULE_COLUMNS: &str = "id, rule_type, value, enabled, note, created_at";

/// Repository for rule operations.
pub struct RulesRepo;

impl RulesRepo {
    /// Insert a rule, or return the id of the identical rule already stored.
    ///
    /// An existing disabled rule is re-enabled.
    pub fn insert(conn: &Connection, rule: NewRule) -> Result<i64> {
        let value = rule.rule_type.normalize(&rule.value);
        if value.is_empty() {
            return Err(StorageError::InvalidInput(format!(
                "empty {} rule",
                rule.rule_type
            )));
        }

        conn.execute(
            "INSERT INTO rules (rule_type, value, note) VALUES (?1, ?2, ?3)
             ON CONFLICT (rule_type, value) DO UPDATE SET enabled = 1",
            params![rule.rule_type.as_str(), value, rule.note],
        )?;

        let id = conn.query_row(
            "SELECT id FROM rules WHERE rule_type = ?1 AND value = ?2",
            params![rule.rule_type.as_str(), value],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Get a rule by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Rule>> {
        let rule = conn
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                [id],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// Get all rules, optionally of one type.
    pub fn list(conn: &Connection, rule_type: Option<RuleType>) -> Result<Vec<Rule>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM rules
             WHERE ?1 IS NULL OR rule_type = ?1
             ORDER BY rule_type, value"
        ))?;

        let rules = stmt
            .query_map([rule_type.map(|t| t.as_str())], row_to_rule)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(rules)
    }

    /// Enable or disable a rule.
    pub fn set_enabled(conn: &Connection, id: i64, enabled: bool) -> Result<()> {
        let updated = conn.execute(
            "UPDATE rules SET enabled = ?1 WHERE id = ?2",
            params![enabled as i32, id],
        )?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!("Rule with id {}", id)));
        }

        Ok(())
    }

    /// Delete a rule.
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        let deleted = conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("Rule with id {}", id)));
        }

        Ok(())
    }

    /// Count total rules.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM rules", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Find the most specific enabled rule of `rule_type` matching `value`.
    ///
    /// - URL: the value equals the rule or starts with it
    /// - Domain: the value equals the rule or ends with `.` + rule
    /// - Keyword: the lower-cased value contains the rule
    pub fn find_match(conn: &Connection, rule_type: RuleType, value: &str) -> Result<Option<RuleMatch>> {
        let condition = match rule_type {
            RuleType::Url => "substr(?1, 1, length(value)) = value",
            RuleType::Domain => {
                "(?1 = value OR (length(?1) > length(value) AND substr(?1, -length(value) - 1) = '.' || value))"
            }
            RuleType::Keyword => "instr(lower(?1), value) > 0",
        };

        let found: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT value FROM rules
                     WHERE enabled = 1 AND rule_type = ?2 AND value != '' AND {condition}
                     ORDER BY length(value) DESC
                     LIMIT 1"
                ),
                params![value, rule_type.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.map(|address| RuleMatch::new(rule_type, address)))
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let rule_type: String = row.get(1)?;
    Ok(Rule {
        id: row.get(0)?,
        rule_type: RuleType::parse(&rule_type).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown rule type {rule_type:?}").into(),
            )
        })?,
        value: row.get(2)?,
        enabled: row.get::<_, i32>(3)? != 0,
        note: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}
