use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::OffsetDateTime;

use crate::device::DeviceConfig;
use crate::ports::{ConfigStore, Credential};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/drip/controller.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device config
    // ----------------------------

    pub async fn load_device_config(&self) -> Result<Option<DeviceConfig>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM device_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await
                .context("load_device_config failed")?;

        document
            .map(|d| serde_json::from_str(&d).context("stored device config is corrupt"))
            .transpose()
    }

    pub async fn save_device_config(&self, config: &DeviceConfig) -> Result<()> {
        let document = serde_json::to_string(config).context("failed to encode device config")?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO device_config (id, document, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              document=excluded.document,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(document)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("save_device_config failed")?;
        Ok(())
    }

    // ----------------------------
    // Credentials
    // ----------------------------

    pub async fn store_credentials(&self, kind: Credential, creds: &Credentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (kind, username, secret) VALUES (?, ?, ?)
            ON CONFLICT(kind) DO UPDATE SET
              username=excluded.username,
              secret=excluded.secret
            "#,
        )
        .bind(kind.as_str())
        .bind(creds.username.as_str())
        .bind(creds.secret.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("store_credentials failed kind={}", kind.as_str()))?;
        Ok(())
    }

    pub async fn load_credentials(&self, kind: Credential) -> Result<Option<Credentials>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT username, secret FROM credentials WHERE kind = ?")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("load_credentials failed kind={}", kind.as_str()))?;

        Ok(row.map(|(username, secret)| Credentials { username, secret }))
    }

    /// Stored credentials of `kind`, or `seed` persisted when none are
    /// stored yet. An existing row always wins over the seed.
    pub async fn seed_credentials(
        &self,
        kind: Credential,
        seed: Option<&Credentials>,
    ) -> Result<Option<Credentials>> {
        if let Some(stored) = self.load_credentials(kind).await? {
            return Ok(Some(stored));
        }
        let Some(seed) = seed else {
            return Ok(None);
        };
        self.store_credentials(kind, seed).await?;
        tracing::info!(kind = kind.as_str(), "credentials seeded from config");
        Ok(Some(seed.clone()))
    }

    pub async fn delete_credentials(&self, kind: Credential) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete_credentials failed kind={}", kind.as_str()))?;
        Ok(())
    }
}

impl ConfigStore for Db {
    async fn load_config(&self) -> Result<Option<DeviceConfig>> {
        self.load_device_config().await
    }

    async fn save_config(&self, config: &DeviceConfig) -> Result<()> {
        self.save_device_config(config).await
    }

    async fn reset_credentials(&self, credential: Credential) -> Result<()> {
        self.delete_credentials(credential).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
