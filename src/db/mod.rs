// =============================================================================
// Persistence layer (L1) — SQLite-backed repositories
// =============================================================================
//
// Schema is bootstrapped on open via `CREATE TABLE IF NOT EXISTS`; there is
// no separate migration runner (none of the tables have shipped with a
// prior shape to migrate from). WAL journal mode is set for better
// concurrent read/write behaviour, matching the pattern used for SQLite
// elsewhere in this ecosystem.
//
// `Database` wraps the connection in `parking_lot::Mutex`. Every query here
// is a small, single-row SQLite operation; rather than route each one
// through `spawn_blocking`, calls are made synchronously from async
// contexts, the same tradeoff this codebase already makes for config
// load/save. If a heavier query profile emerges this should move to
// `spawn_blocking`.
// =============================================================================

pub mod models;

mod accounts_repo;
mod decisions_repo;
mod prompts_repo;
mod snapshots_repo;
mod ticks_repo;

pub use accounts_repo::*;
pub use decisions_repo::*;
pub use prompts_repo::*;
pub use snapshots_repo::*;
pub use ticks_repo::*;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::errors::StorageResult;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (creating if necessary) the database at `path` and bootstrap the
    /// schema.
    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.bootstrap_schema()?;
        info!(path, "database opened and schema bootstrapped");
        Ok(db)
    }

    /// Open an in-memory database, used by tests.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.bootstrap_schema()?;
        Ok(db)
    }

    fn bootstrap_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                auto_trading INTEGER NOT NULL DEFAULT 1,
                broker_api_key TEXT,
                broker_secret_key TEXT,
                oracle_base_url TEXT NOT NULL,
                oracle_api_key TEXT NOT NULL,
                oracle_model TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_strategy_configs (
                account_id INTEGER PRIMARY KEY REFERENCES accounts(id),
                enabled INTEGER NOT NULL DEFAULT 1,
                trigger_mode TEXT NOT NULL DEFAULT 'interval',
                symbols TEXT NOT NULL DEFAULT '[]',
                interval_seconds INTEGER NOT NULL DEFAULT 300,
                tick_batch_size INTEGER NOT NULL DEFAULT 10,
                last_trigger_at TEXT
            );

            CREATE TABLE IF NOT EXISTS prompt_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                template_text TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS account_prompt_bindings (
                account_id INTEGER PRIMARY KEY REFERENCES accounts(id),
                prompt_template_id INTEGER NOT NULL REFERENCES prompt_templates(id)
            );

            CREATE TABLE IF NOT EXISTS ai_decision_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                decided_at TEXT NOT NULL,
                operation TEXT NOT NULL,
                symbol TEXT NOT NULL,
                previous_portion REAL,
                target_portion REAL,
                total_balance REAL NOT NULL,
                executed INTEGER NOT NULL,
                broker_order_id TEXT,
                prompt_snapshot TEXT,
                reasoning_snapshot TEXT,
                raw_snapshot TEXT,
                reason TEXT
            );

            CREATE TABLE IF NOT EXISTS account_asset_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                taken_at TEXT NOT NULL,
                total_assets REAL NOT NULL,
                cash REAL NOT NULL,
                positions_value REAL NOT NULL DEFAULT 0,
                trigger_symbol TEXT
            );

            CREATE TABLE IF NOT EXISTS price_ticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                venue TEXT NOT NULL,
                price REAL NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_decision_logs_account
                ON ai_decision_logs(account_id, decided_at);
            CREATE INDEX IF NOT EXISTS idx_asset_snapshots_account
                ON account_asset_snapshots(account_id, taken_at);
            CREATE INDEX IF NOT EXISTS idx_price_ticks_symbol
                ON price_ticks(symbol, recorded_at);
            "#,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_bootstraps_all_tables() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='accounts'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
