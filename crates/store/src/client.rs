//! Single client interface for the replicated store (spec §4.2, §9
//! REDESIGN FLAG "centralize this behind a single client interface with
//! two operations"). `query` is read-only and goes through the store's
//! CLI; `exec` is the only mutation path and goes through the store's
//! local HTTP transaction endpoint, because only the HTTP path fires the
//! subscription events the DNS server listens to. There is deliberately
//! no CLI-based mutation method on this type.

use crate::error::{Result, StoreError};
use serde::Deserialize;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct StoreClientConfig {
    pub cli_path: String,
    pub store_config_path: String,
    pub api_port: u16,
}

#[derive(Debug, Clone)]
pub struct StoreClient {
    cfg: StoreClientConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    results: Vec<TransactionResult>,
}

#[derive(Debug, Deserialize)]
struct TransactionResult {
    rows_affected: u64,
}

impl StoreClient {
    pub fn new(cfg: StoreClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client builds with a finite timeout");
        Self { cfg, http }
    }

    /// Read-only query via the store's CLI. Output is parsed as
    /// pipe-delimited rows — never used for mutation.
    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        let output = Command::new(&self.cfg.cli_path)
            .arg("--config")
            .arg(&self.cfg.store_config_path)
            .arg("query")
            .arg(sql)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(StoreError::CliExec)?;

        if !output.status.success() {
            return Err(StoreError::CliStatus(
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.split('|').map(str::to_owned).collect())
            .collect())
    }

    /// The only mutation path: POSTs a JSON array of SQL statements to the
    /// store's local transaction endpoint, returning the rows-affected
    /// count per statement.
    pub async fn exec(&self, statements: &[String]) -> Result<Vec<u64>> {
        let url = format!(
            "http://127.0.0.1:{}/v1/transactions",
            self.cfg.api_port
        );
        let resp = self
            .http
            .post(url)
            .json(&json!(statements))
            .send()
            .await?;
        let parsed: TransactionResponse = resp.json().await?;
        Ok(parsed.results.into_iter().map(|r| r.rows_affected).collect())
    }

    /// Ownership-checked mutation: refuses to include a statement whose
    /// bound `server_id` (or row `id` for the `server` table itself) is
    /// not `self_id`, with the single exception of GC statements deleting
    /// rows belonging to an offline server (spec §3 "Ownership model").
    pub async fn exec_owned(
        &self,
        self_id: &str,
        statements: Vec<OwnedStatement>,
    ) -> Result<Vec<u64>> {
        for stmt in &statements {
            if !stmt.is_gc_exception && stmt.owner.as_deref() != Some(self_id) {
                return Err(StoreError::NotOwner {
                    self_id: self_id.to_owned(),
                    owner: stmt.owner.clone(),
                });
            }
        }
        let sql: Vec<String> = statements.into_iter().map(|s| s.sql).collect();
        self.exec(&sql).await
    }
}

/// A single SQL statement plus the ownership metadata `exec_owned` checks
/// before sending it. `owner` is the `server_id` the statement targets;
/// `is_gc_exception` marks the one case (GC of an offline server's rows)
/// where writing a non-self-owned row is legitimate.
#[derive(Debug, Clone)]
pub struct OwnedStatement {
    pub sql: String,
    pub owner: Option<String>,
    pub is_gc_exception: bool,
}

impl OwnedStatement {
    pub fn own(sql: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            owner: Some(owner.into()),
            is_gc_exception: false,
        }
    }

    pub fn gc_exception(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            owner: None,
            is_gc_exception: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exec_owned_rejects_foreign_writes() {
        let client = StoreClient::new(StoreClientConfig {
            cli_path: "true".into(),
            store_config_path: "/dev/null".into(),
            api_port: 1,
        });
        let result = client
            .exec_owned(
                "host-a",
                vec![OwnedStatement::own("UPDATE server SET x=1", "host-b")],
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotOwner { .. })));
    }
}
