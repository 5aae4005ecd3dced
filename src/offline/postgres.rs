//! PostgreSQL message store.
//!
//! Batches are written in one transaction; `msg_id` is the primary key and
//! conflicting rows are skipped, so replayed batches are harmless.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::NoTls;

use super::{ConversationType, OfflineStorer, StorageRecord};
use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const INSERT_MESSAGE: &str = r#"
    INSERT INTO offline_messages (
        msg_id, user_id, sender_id, conversation_id, conversation_type,
        content, sequence, sent_at_ms, created_at, expires_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    ON CONFLICT (msg_id) DO NOTHING
"#;

/// [`OfflineStorer`] backed by a pooled PostgreSQL connection.
pub struct PgOfflineStore {
    pool: Pool,
}

impl PgOfflineStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from `config`. No connection is made until first use.
    pub fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| DatabaseError::Pool("DATABASE_URL is not set".to_string()))?;

        let mut pg = deadpool_postgres::Config {
            url: Some(url),
            ..Default::default()
        };
        pg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));
        let pool = pg.create_pool(Some(Runtime::Tokio1), NoTls)?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        let mut client = self.conn().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = %migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    /// Stored messages for a user, oldest conversation sequence first.
    pub async fn pending_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<StorageRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT msg_id, user_id, sender_id, conversation_id, conversation_type,
                       content, sequence, sent_at_ms, created_at, expires_at
                FROM offline_messages
                WHERE user_id = $1 AND expires_at > NOW()
                ORDER BY conversation_id, sequence
                LIMIT $2
                "#,
                &[&user_id, &limit],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("conversation_type");
                let conversation_type = kind
                    .parse::<ConversationType>()
                    .map_err(DatabaseError::Query)?;
                Ok(StorageRecord {
                    msg_id: row.get("msg_id"),
                    user_id: row.get("user_id"),
                    sender_id: row.get("sender_id"),
                    conversation_id: row.get("conversation_id"),
                    conversation_type,
                    content: row.get("content"),
                    sequence: row.get("sequence"),
                    timestamp: row.get("sent_at_ms"),
                    created_at: row.get::<_, DateTime<Utc>>("created_at"),
                    expires_at: row.get::<_, DateTime<Utc>>("expires_at"),
                })
            })
            .collect()
    }

    /// Delete expired messages. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let removed = conn
            .execute("DELETE FROM offline_messages WHERE expires_at <= NOW()", &[])
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Purged expired offline messages");
        }
        Ok(removed)
    }
}

#[async_trait]
impl OfflineStorer for PgOfflineStore {
    async fn batch_insert(&self, records: &[StorageRecord]) -> Result<(), DatabaseError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut client = self.conn().await?;
        let tx = client.transaction().await?;
        let stmt = tx.prepare_cached(INSERT_MESSAGE).await?;

        let mut inserted = 0u64;
        for r in records {
            inserted += tx
                .execute(
                    &stmt,
                    &[
                        &r.msg_id,
                        &r.user_id,
                        &r.sender_id,
                        &r.conversation_id,
                        &r.conversation_type.as_str(),
                        &r.content,
                        &r.sequence,
                        &r.timestamp,
                        &r.created_at,
                        &r.expires_at,
                    ],
                )
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(
            batch = records.len(),
            inserted,
            skipped = records.len() as u64 - inserted,
            "Offline batch written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_requires_url() {
        let result = PgOfflineStore::connect(&DatabaseConfig::default());
        assert!(matches!(result, Err(DatabaseError::Pool(_))));
    }

    #[tokio::test]
    async fn test_connect_builds_lazy_pool() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost:1/offline".to_string()),
            pool_size: 4,
        };
        let store = PgOfflineStore::connect(&config).expect("pool builds without connecting");
        assert_eq!(store.pool.status().max_size, 4);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_database() {
        let config = DatabaseConfig {
            url: Some("postgres://localhost:1/offline".to_string()),
            pool_size: 1,
        };
        let store = PgOfflineStore::connect(&config).unwrap();
        store.batch_insert(&[]).await.unwrap();
    }
}
