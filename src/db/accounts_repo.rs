use rusqlite::{params, OptionalExtension};

use crate::errors::{StorageError, StorageResult};
use crate::types::{AccountId, TriggerMode};

use super::models::{Account, StrategyConfig};
use super::Database;

impl Database {
    /// Return every active account, regardless of `auto_trading`.
    pub fn list_accounts(&self) -> StorageResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, active, auto_trading, broker_api_key, broker_secret_key,
                    oracle_base_url, oracle_api_key, oracle_model, created_at
             FROM accounts ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Return accounts eligible for the trigger engine: active, auto-trading
    /// enabled, and (per strategy config) `enabled = true`.
    pub fn list_tradeable_accounts(&self) -> StorageResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.active, a.auto_trading, a.broker_api_key, a.broker_secret_key,
                    a.oracle_base_url, a.oracle_api_key, a.oracle_model, a.created_at
             FROM accounts a
             JOIN account_strategy_configs s ON s.account_id = a.id
             WHERE a.active = 1 AND a.auto_trading = 1 AND s.enabled = 1
             ORDER BY a.id",
        )?;
        let rows = stmt
            .query_map([], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_account(&self, id: AccountId) -> StorageResult<Account> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, active, auto_trading, broker_api_key, broker_secret_key,
                    oracle_base_url, oracle_api_key, oracle_model, created_at
             FROM accounts WHERE id = ?1",
            params![id.0],
            row_to_account,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    pub fn insert_account(&self, account: &Account) -> StorageResult<AccountId> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (name, active, auto_trading, broker_api_key, broker_secret_key,
                                    oracle_base_url, oracle_api_key, oracle_model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                account.name,
                account.active,
                account.auto_trading,
                account.broker_api_key,
                account.broker_secret_key,
                account.oracle_base_url,
                account.oracle_api_key,
                account.oracle_model,
                account.created_at,
            ],
        )?;
        Ok(AccountId(conn.last_insert_rowid()))
    }

    pub fn get_strategy_config(&self, account_id: AccountId) -> StorageResult<StrategyConfig> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT account_id, enabled, trigger_mode, symbols, interval_seconds,
                    tick_batch_size, last_trigger_at
             FROM account_strategy_configs WHERE account_id = ?1",
            params![account_id.0],
            row_to_strategy_config,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }

    pub fn upsert_strategy_config(&self, cfg: &StrategyConfig) -> StorageResult<()> {
        let conn = self.conn.lock();
        let symbols_json = serde_json::to_string(&cfg.symbols).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "INSERT INTO account_strategy_configs
                (account_id, enabled, trigger_mode, symbols, interval_seconds, tick_batch_size, last_trigger_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id) DO UPDATE SET
                enabled = excluded.enabled,
                trigger_mode = excluded.trigger_mode,
                symbols = excluded.symbols,
                interval_seconds = excluded.interval_seconds,
                tick_batch_size = excluded.tick_batch_size,
                last_trigger_at = excluded.last_trigger_at",
            params![
                cfg.account_id.0,
                cfg.enabled,
                trigger_mode_str(cfg.trigger_mode),
                symbols_json,
                cfg.interval_seconds,
                cfg.tick_batch_size,
                cfg.last_trigger_at,
            ],
        )?;
        Ok(())
    }

    /// Persist a new `last_trigger_at` for one account's strategy config.
    /// Called by the trigger engine immediately after a successful oracle
    /// reply, mirroring the in-memory update on `StrategyState`.
    pub fn touch_last_trigger_at(&self, account_id: AccountId, at: &str) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE account_strategy_configs SET last_trigger_at = ?2 WHERE account_id = ?1",
            params![account_id.0, at],
        )?;
        Ok(())
    }
}

fn trigger_mode_str(mode: TriggerMode) -> &'static str {
    match mode {
        TriggerMode::Realtime => "realtime",
        TriggerMode::Interval => "interval",
        TriggerMode::TickBatch => "tick_batch",
    }
}

fn parse_trigger_mode(s: &str) -> TriggerMode {
    match s {
        "realtime" => TriggerMode::Realtime,
        "tick_batch" => TriggerMode::TickBatch,
        _ => TriggerMode::Interval,
    }
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: AccountId(row.get(0)?),
        name: row.get(1)?,
        active: row.get(2)?,
        auto_trading: row.get(3)?,
        broker_api_key: row.get(4)?,
        broker_secret_key: row.get(5)?,
        oracle_base_url: row.get(6)?,
        oracle_api_key: row.get(7)?,
        oracle_model: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn row_to_strategy_config(row: &rusqlite::Row) -> rusqlite::Result<StrategyConfig> {
    let symbols_json: String = row.get(3)?;
    let symbols: Vec<String> = serde_json::from_str(&symbols_json).unwrap_or_default();
    let mode_str: String = row.get(2)?;
    Ok(StrategyConfig {
        account_id: AccountId(row.get(0)?),
        enabled: row.get(1)?,
        trigger_mode: parse_trigger_mode(&mode_str),
        symbols,
        interval_seconds: row.get(4)?,
        tick_batch_size: row.get(5)?,
        last_trigger_at: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_account() -> Account {
        Account {
            id: AccountId(0),
            name: "test-account".to_string(),
            active: true,
            auto_trading: true,
            broker_api_key: Some("key".to_string()),
            broker_secret_key: Some("secret".to_string()),
            oracle_base_url: "https://api.openai.com/v1".to_string(),
            oracle_api_key: "sk-real".to_string(),
            oracle_model: "gpt-4o".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn insert_and_fetch_account_roundtrips() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_account(&sample_account()).unwrap();
        let fetched = db.get_account(id).unwrap();
        assert_eq!(fetched.name, "test-account");
        assert!(fetched.is_oracle_configured());
        assert!(fetched.has_broker_credentials());
    }

    #[test]
    fn missing_account_returns_not_found() {
        let db = Database::open_in_memory().unwrap();
        let err = db.get_account(AccountId(999)).unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[test]
    fn strategy_config_upsert_then_read_preserves_symbols() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_account(&sample_account()).unwrap();
        let cfg = StrategyConfig {
            account_id: id,
            symbols: vec!["BTC".to_string(), "ETH".to_string()],
            trigger_mode: TriggerMode::TickBatch,
            tick_batch_size: 5,
            ..StrategyConfig::default()
        };
        db.upsert_strategy_config(&cfg).unwrap();
        let fetched = db.get_strategy_config(id).unwrap();
        assert_eq!(fetched.symbols, vec!["BTC", "ETH"]);
        assert_eq!(fetched.trigger_mode, TriggerMode::TickBatch);
        assert_eq!(fetched.tick_batch_size, 5);
    }

    #[test]
    fn list_tradeable_accounts_excludes_disabled_strategy() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_account(&sample_account()).unwrap();
        let mut cfg = StrategyConfig {
            account_id: id,
            ..StrategyConfig::default()
        };
        cfg.enabled = false;
        db.upsert_strategy_config(&cfg).unwrap();
        assert!(db.list_tradeable_accounts().unwrap().is_empty());
    }
}
