use rusqlite::params;

use crate::errors::StorageResult;
use crate::types::AccountId;

use super::models::DecisionLog;
use super::Database;

/// Fields needed to write a new `DecisionLog` row. Separate from the
/// persisted `DecisionLog` type since `id` is assigned by SQLite.
#[derive(Debug, Clone)]
pub struct NewDecisionLog {
    pub account_id: AccountId,
    pub decided_at: String,
    pub operation: String,
    pub symbol: String,
    pub previous_portion: Option<f64>,
    pub target_portion: Option<f64>,
    pub total_balance: f64,
    pub executed: bool,
    pub broker_order_id: Option<String>,
    pub prompt_snapshot: Option<String>,
    pub reasoning_snapshot: Option<String>,
    pub raw_snapshot: Option<String>,
    pub reason: Option<String>,
}

impl Database {
    pub fn insert_decision_log(&self, entry: &NewDecisionLog) -> StorageResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ai_decision_logs
                (account_id, decided_at, operation, symbol, previous_portion, target_portion,
                 total_balance, executed, broker_order_id, prompt_snapshot, reasoning_snapshot,
                 raw_snapshot, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.account_id.0,
                entry.decided_at,
                entry.operation,
                entry.symbol,
                entry.previous_portion,
                entry.target_portion,
                entry.total_balance,
                entry.executed,
                entry.broker_order_id,
                entry.prompt_snapshot,
                entry.reasoning_snapshot,
                entry.raw_snapshot,
                entry.reason,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_decisions(&self, account_id: AccountId, limit: u32) -> StorageResult<Vec<DecisionLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, decided_at, operation, symbol, previous_portion,
                    target_portion, total_balance, executed, broker_order_id, prompt_snapshot,
                    reasoning_snapshot, raw_snapshot, reason
             FROM ai_decision_logs
             WHERE account_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id.0, limit], row_to_decision_log)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_decision_log(row: &rusqlite::Row) -> rusqlite::Result<DecisionLog> {
    Ok(DecisionLog {
        id: row.get(0)?,
        account_id: AccountId(row.get(1)?),
        decided_at: row.get(2)?,
        operation: row.get(3)?,
        symbol: row.get(4)?,
        previous_portion: row.get(5)?,
        target_portion: row.get(6)?,
        total_balance: row.get(7)?,
        executed: row.get(8)?,
        broker_order_id: row.get(9)?,
        prompt_snapshot: row.get(10)?,
        reasoning_snapshot: row.get(11)?,
        raw_snapshot: row.get(12)?,
        reason: row.get(13)?,
    })
}
