//! Store Writer (C3): schema bootstrap, typed batch appends, and the two
//! read/write SQL entry points the detection side uses against the same
//! ClickHouse instance the ingester writes to.

use clickhouse::{Client, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::migrations;

#[derive(Clone)]
pub struct Store {
    client: Client,
}

impl Store {
    pub fn new(cfg: &StoreConfig) -> Self {
        let client = Client::default()
            .with_url(&cfg.url)
            .with_database(&cfg.database)
            .with_user(&cfg.user)
            .with_password(&cfg.password);
        Self { client }
    }

    /// Idempotently ensures the database, five analytic tables, and four
    /// engine tables exist. Safe to call on every startup.
    pub async fn bootstrap(&self, cfg: &StoreConfig) -> anyhow::Result<()> {
        migrations::run(&cfg.url, &cfg.user, &cfg.password).await
    }

    /// Appends a batch of rows as one typed columnar INSERT. Empty batches
    /// are a no-op. Partial failure (a write error mid-stream) aborts the
    /// whole batch; the caller does not retry rows individually.
    pub async fn append<T>(&self, table: &str, rows: &[T]) -> anyhow::Result<()>
    where
        T: Row + Serialize,
    {
        if rows.is_empty() {
            return Ok(());
        }
        let mut insert = self.client.insert(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }

    /// Typed read query for the detection side's own SQL (baselines,
    /// anomaly windows, alert history aggregates).
    pub async fn fetch_all<T>(&self, sql: &str) -> anyhow::Result<Vec<T>>
    where
        T: Row + DeserializeOwned,
    {
        match self.client.query(sql).fetch_all::<T>().await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                tracing::warn!("store read error, returning empty result set: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// `INSERT`/`UPDATE` against the engine tables. Logged and swallowed on
    /// failure per the error-handling design: engine state may be briefly
    /// inconsistent but self-heals on the next detection tick.
    pub async fn execute_write(&self, sql: &str) -> bool {
        match self.client.query(sql).execute().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("store write failed: {e}\nsql: {sql}");
                false
            }
        }
    }

    /// Generic JSON-rows read for the investigator's `execute_sql` tool,
    /// where the shape of the result isn't known ahead of time. Truncates
    /// to `limit` rows.
    pub async fn execute_read_json(
        &self,
        sql: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let mut cursor = self.client.query(sql).fetch_bytes("JSONEachRow")?;
        let mut out = Vec::new();
        let mut leftover = Vec::new();
        while let Some(chunk) = cursor.next().await? {
            leftover.extend_from_slice(&chunk);
            while let Some(pos) = leftover.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = leftover.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                if out.len() < limit
                    && let Ok(v) = serde_json::from_slice::<serde_json::Value>(line) {
                        out.push(v);
                    }
            }
        }
        if !leftover.is_empty() && out.len() < limit
            && let Ok(v) = serde_json::from_slice::<serde_json::Value>(&leftover) {
                out.push(v);
            }
        Ok(out)
    }
}
