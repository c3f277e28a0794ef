use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::info;

use crate::errors::StorageResult;
use crate::types::AccountId;

use super::models::AssetSnapshot;
use super::Database;

impl Database {
    pub fn insert_asset_snapshot(
        &self,
        account_id: AccountId,
        total_assets: f64,
        cash: f64,
        positions_value: f64,
        trigger_symbol: Option<&str>,
    ) -> StorageResult<i64> {
        let conn = self.conn.lock();
        let taken_at = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO account_asset_snapshots (account_id, taken_at, total_assets, cash, positions_value, trigger_symbol)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![account_id.0, taken_at, total_assets, cash, positions_value, trigger_symbol],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_asset_snapshots(&self, account_id: AccountId, limit: u32) -> StorageResult<Vec<AssetSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, account_id, taken_at, total_assets, cash, positions_value, trigger_symbol
             FROM account_asset_snapshots
             WHERE account_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id.0, limit], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete asset snapshots older than `retention_days`. Returns the
    /// number of rows removed.
    pub fn purge_asset_snapshots_older_than(&self, retention_days: i64) -> StorageResult<usize> {
        let cutoff = (Utc::now() - Duration::days(retention_days)).to_rfc3339();
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM account_asset_snapshots WHERE taken_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, retention_days, "purged expired asset snapshots");
        }
        Ok(removed)
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<AssetSnapshot> {
    Ok(AssetSnapshot {
        id: row.get(0)?,
        account_id: AccountId(row.get(1)?),
        taken_at: row.get(2)?,
        total_assets: row.get(3)?,
        cash: row.get(4)?,
        positions_value: row.get(5)?,
        trigger_symbol: row.get(6)?,
    })
}
