// =============================================================================
// Persistent tick store (part of C2)
// =============================================================================
//
// Every successful market-stream fetch is appended here. Retention is a
// rolling 1h window per symbol, swept on every write rather than on a
// separate timer, matching the asset-snapshot retention sweep's pattern of
// "prune inline with the write that would otherwise grow the table".
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::errors::StorageResult;

use super::Database;

impl Database {
    /// Append a tick and prune ticks for this symbol older than `retention`.
    pub fn insert_price_tick(
        &self,
        symbol: &str,
        venue: &str,
        price: f64,
        recorded_at: DateTime<Utc>,
        retention: Duration,
    ) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO price_ticks (symbol, venue, price, recorded_at) VALUES (?1, ?2, ?3, ?4)",
            params![symbol, venue, price, recorded_at.to_rfc3339()],
        )?;
        let cutoff = (recorded_at - retention).to_rfc3339();
        conn.execute(
            "DELETE FROM price_ticks WHERE symbol = ?1 AND recorded_at < ?2",
            params![symbol, cutoff],
        )?;
        Ok(())
    }

    /// Return the most recent `limit` ticks for `symbol`, newest first.
    pub fn recent_price_ticks(&self, symbol: &str, limit: u32) -> StorageResult<Vec<(f64, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT price, recorded_at FROM price_ticks
             WHERE symbol = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit], |row| {
                Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
