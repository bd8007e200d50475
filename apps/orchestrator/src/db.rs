use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = include_str!("../migrations/0001_orchestrator.sql");

#[derive(Clone)]
pub struct OrchestratorDb {
    client: Arc<Mutex<Client>>,
}

impl OrchestratorDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "orchestrator postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    /// Provisions the `orchestrator` schema. Every statement is idempotent.
    pub async fn apply_migrations(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply orchestrator schema")?;
        tracing::info!("orchestrator schema applied");
        Ok(())
    }
}
