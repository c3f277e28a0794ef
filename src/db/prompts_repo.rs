use rusqlite::{params, OptionalExtension};

use crate::errors::{StorageError, StorageResult};
use crate::types::AccountId;

use super::models::PromptTemplate;
use super::Database;

const FALLBACK_TEMPLATE: &str = "\
You are managing account {account_name} on model {model_name}.\n\
{session_context}\n\
{account_state}\n\
{market_snapshot}\n\
{news_section}\n\
{decision_task}\n\
{output_format}";

impl Database {
    /// Return the prompt template bound to `account_id`, falling back to the
    /// default template (creating one if none exists) when no binding is
    /// present — mirrors the original's `ensure_default_prompt` fallback.
    pub fn get_prompt_for_account(&self, account_id: AccountId) -> StorageResult<PromptTemplate> {
        let bound = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT t.id, t.name, t.template_text, t.is_default
                 FROM account_prompt_bindings b
                 JOIN prompt_templates t ON t.id = b.prompt_template_id
                 WHERE b.account_id = ?1",
                params![account_id.0],
                row_to_template,
            )
            .optional()?
        };
        match bound {
            Some(t) => Ok(t),
            None => self.ensure_default_prompt(),
        }
    }

    pub fn ensure_default_prompt(&self) -> StorageResult<PromptTemplate> {
        let existing = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id, name, template_text, is_default FROM prompt_templates WHERE is_default = 1 LIMIT 1",
                [],
                row_to_template,
            )
            .optional()?
        };
        if let Some(t) = existing {
            return Ok(t);
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prompt_templates (name, template_text, is_default) VALUES (?1, ?2, 1)",
            params!["default", FALLBACK_TEMPLATE],
        )?;
        let id = conn.last_insert_rowid();
        Ok(PromptTemplate {
            id,
            name: "default".to_string(),
            template_text: FALLBACK_TEMPLATE.to_string(),
            is_default: true,
        })
    }

    pub fn bind_prompt_to_account(&self, account_id: AccountId, template_id: i64) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO account_prompt_bindings (account_id, prompt_template_id) VALUES (?1, ?2)
             ON CONFLICT(account_id) DO UPDATE SET prompt_template_id = excluded.prompt_template_id",
            params![account_id.0, template_id],
        )?;
        Ok(())
    }

    pub fn get_prompt_template(&self, id: i64) -> StorageResult<PromptTemplate> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, template_text, is_default FROM prompt_templates WHERE id = ?1",
            params![id],
            row_to_template,
        )
        .optional()?
        .ok_or(StorageError::NotFound)
    }
}

fn row_to_template(row: &rusqlite::Row) -> rusqlite::Result<PromptTemplate> {
    Ok(PromptTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        template_text: row.get(2)?,
        is_default: row.get(3)?,
    })
}
