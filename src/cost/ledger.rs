//! SQLite-backed append-only usage ledger.
//!
//! The ledger is the source of truth for spend; counter caches are derived
//! from it and self-heal by re-summing windows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{Error, Result};

/// One row per LLM invocation, success or failure. Write-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub operation: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub quality_score: Option<f64>,
    pub attempts: u32,
    pub success: bool,
    pub document_id: Option<String>,
    pub graph_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    /// New record with a fresh id and current timestamp.
    pub fn new(operation: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            operation: operation.into(),
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            quality_score: None,
            attempts: 1,
            success: false,
            document_id: None,
            graph_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-user aggregation over a time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_cost: f64,
    pub operation_count: u64,
    pub average_cost_per_operation: f64,
}

/// Spend share of one operation within a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCost {
    pub operation: String,
    pub total_cost: f64,
    pub percentage: f64,
}

/// Append-only ledger over the `ai_usage` table.
pub struct UsageLedger {
    conn: Arc<Mutex<Connection>>,
}

impl UsageLedger {
    /// Open or create a ledger at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::CostTracking(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::CostTracking(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::CostTracking(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::CostTracking(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("failed to lock ledger connection: {e}")))?;
        f(&conn).map_err(|e| Error::CostTracking(e.to_string()))
    }

    /// Append a usage record.
    pub fn append(&self, record: &UsageRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ai_usage (
                    id, user_id, operation, model, input_tokens, output_tokens,
                    total_tokens, cost, quality_score, attempts, success,
                    document_id, graph_id, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    record.id,
                    record.user_id,
                    record.operation,
                    record.model,
                    record.input_tokens as i64,
                    record.output_tokens as i64,
                    record.total_tokens() as i64,
                    record.cost,
                    record.quality_score,
                    record.attempts as i64,
                    record.success,
                    record.document_id,
                    record.graph_id,
                    record.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Total cost for a user inside [start, end).
    pub fn sum_cost(
        &self,
        user_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<f64> {
        self.with_conn(|conn| match user_id {
            Some(user) => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM ai_usage
                 WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![user, start.to_rfc3339(), end.to_rfc3339()],
                |row| row.get(0),
            ),
            None => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0) FROM ai_usage
                 WHERE user_id IS NULL AND timestamp >= ?1 AND timestamp < ?2",
                params![start.to_rfc3339(), end.to_rfc3339()],
                |row| row.get(0),
            ),
        })
    }

    /// Cost and operation-count summary for a user inside [start, end).
    pub fn summary(
        &self,
        user_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UsageSummary> {
        let (total_cost, operation_count): (f64, u64) = self.with_conn(|conn| match user_id {
            Some(user) => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0), COUNT(*) FROM ai_usage
                 WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp < ?3",
                params![user, start.to_rfc3339(), end.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
            ),
            None => conn.query_row(
                "SELECT COALESCE(SUM(cost), 0.0), COUNT(*) FROM ai_usage
                 WHERE user_id IS NULL AND timestamp >= ?1 AND timestamp < ?2",
                params![start.to_rfc3339(), end.to_rfc3339()],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
            ),
        })?;

        let average_cost_per_operation = if operation_count > 0 {
            total_cost / operation_count as f64
        } else {
            0.0
        };

        Ok(UsageSummary {
            total_cost,
            operation_count,
            average_cost_per_operation,
        })
    }

    /// Per-operation cost breakdown for a user inside [start, end),
    /// most expensive first.
    pub fn breakdown(
        &self,
        user_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OperationCost>> {
        let rows: Vec<(String, f64)> = self.with_conn(|conn| {
            let (sql, binds): (&str, Vec<Box<dyn rusqlite::ToSql>>) = match user_id {
                Some(user) => (
                    "SELECT operation, COALESCE(SUM(cost), 0.0) FROM ai_usage
                     WHERE user_id = ?1 AND timestamp >= ?2 AND timestamp < ?3
                     GROUP BY operation ORDER BY 2 DESC",
                    vec![
                        Box::new(user.to_string()),
                        Box::new(start.to_rfc3339()),
                        Box::new(end.to_rfc3339()),
                    ],
                ),
                None => (
                    "SELECT operation, COALESCE(SUM(cost), 0.0) FROM ai_usage
                     WHERE user_id IS NULL AND timestamp >= ?1 AND timestamp < ?2
                     GROUP BY operation ORDER BY 2 DESC",
                    vec![Box::new(start.to_rfc3339()), Box::new(end.to_rfc3339())],
                ),
            };
            let params_refs: Vec<&dyn rusqlite::ToSql> =
                binds.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(sql)?;
            let mapped = stmt.query_map(params_refs.as_slice(), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            mapped.collect()
        })?;

        let total: f64 = rows.iter().map(|(_, c)| c).sum();
        Ok(rows
            .into_iter()
            .map(|(operation, total_cost)| OperationCost {
                operation,
                total_cost,
                percentage: if total > 0.0 {
                    total_cost / total * 100.0
                } else {
                    0.0
                },
            })
            .collect())
    }

    /// Number of rows in the ledger.
    pub fn count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM ai_usage", [], |row| {
                row.get::<_, i64>(0).map(|c| c as u64)
            })
        })
    }
}

fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    // WAL for concurrent readers while a writer appends
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ai_usage (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            operation TEXT NOT NULL,
            model TEXT NOT NULL,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            cost REAL NOT NULL DEFAULT 0.0,
            quality_score REAL,
            attempts INTEGER NOT NULL DEFAULT 1,
            success INTEGER NOT NULL DEFAULT 0,
            document_id TEXT,
            graph_id TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ai_usage_user_ts ON ai_usage(user_id, timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ai_usage_operation ON ai_usage(operation)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ai_usage_ts ON ai_usage(timestamp)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn record(user: &str, operation: &str, cost: f64) -> UsageRecord {
        UsageRecord {
            user_id: Some(user.to_string()),
            cost,
            success: true,
            ..UsageRecord::new(operation, "claude-haiku")
        }
    }

    #[test]
    fn test_append_and_sum_window() {
        let ledger = UsageLedger::in_memory().unwrap();
        ledger
            .append(&record("u1", "graph-generation", 0.25))
            .unwrap();
        ledger
            .append(&record("u1", "quiz-generation", 0.10))
            .unwrap();
        ledger
            .append(&record("u2", "graph-generation", 5.0))
            .unwrap();

        let now = Utc::now();
        let sum = ledger
            .sum_cost(Some("u1"), now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert!((sum - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_window_bounds_exclude_outside_rows() {
        let ledger = UsageLedger::in_memory().unwrap();
        let mut old = record("u1", "graph-generation", 1.0);
        old.timestamp = Utc::now() - Duration::days(2);
        ledger.append(&old).unwrap();
        ledger
            .append(&record("u1", "graph-generation", 0.5))
            .unwrap();

        let now = Utc::now();
        let sum = ledger
            .sum_cost(Some("u1"), now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert!((sum - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_summary_and_breakdown() {
        let ledger = UsageLedger::in_memory().unwrap();
        ledger
            .append(&record("u1", "graph-generation", 0.30))
            .unwrap();
        ledger
            .append(&record("u1", "graph-generation", 0.30))
            .unwrap();
        ledger
            .append(&record("u1", "quiz-generation", 0.40))
            .unwrap();

        let now = Utc::now();
        let start = now - Duration::hours(1);
        let end = now + Duration::hours(1);

        let summary = ledger.summary(Some("u1"), start, end).unwrap();
        assert_eq!(summary.operation_count, 3);
        assert!((summary.total_cost - 1.0).abs() < 1e-9);
        assert!((summary.average_cost_per_operation - 1.0 / 3.0).abs() < 1e-9);

        let breakdown = ledger.breakdown(Some("u1"), start, end).unwrap();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].operation, "graph-generation");
        assert!((breakdown[0].percentage - 60.0).abs() < 1e-9);
        assert!((breakdown[1].percentage - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_anonymous_rows_isolated_from_users() {
        let ledger = UsageLedger::in_memory().unwrap();
        let mut anon = UsageRecord::new("graph-generation", "claude-haiku");
        anon.cost = 0.2;
        ledger.append(&anon).unwrap();
        ledger
            .append(&record("u1", "graph-generation", 0.7))
            .unwrap();

        let now = Utc::now();
        let start = now - Duration::hours(1);
        let end = now + Duration::hours(1);
        assert!((ledger.sum_cost(None, start, end).unwrap() - 0.2).abs() < 1e-9);
        assert!((ledger.sum_cost(Some("u1"), start, end).unwrap() - 0.7).abs() < 1e-9);
    }
}
