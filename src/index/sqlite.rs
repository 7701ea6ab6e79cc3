//! SQLite implementation of the search index and config ledger

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use super::{escape_like, MAX_SEARCH_LIMIT, SCHEMA};
use crate::domain::{
    ConfigChange, ConfigHistoryEntry, ConfigInfo, ConfigLedger, IndexRow, RowStatus, SearchIndex,
    SearchPage, ServiceDescriptor, ServiceSummary,
};
use crate::error::{Error, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Connection settings for the relational index
#[derive(Debug, Clone)]
pub struct SqlIndexConfig {
    /// sqlx connection URL, e.g. `sqlite://registry.db` or `sqlite::memory:`
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for SqlIndexConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// SQL Index
// =============================================================================

/// Relational projection backed by a SQLite pool
#[derive(Debug, Clone)]
pub struct SqlIndex {
    pool: SqlitePool,
}

impl SqlIndex {
    /// Connect and create the schema
    pub async fn connect(config: &SqlIndexConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::InvalidParam(format!("invalid database url: {}", e)))?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout);
        if config.url.contains(":memory:") {
            // A private in-memory database lives exactly as long as its connection.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| Error::from_db(e, "connect index db fail"))?;
        let index = Self { pool };
        index.migrate().await?;
        info!(url = %config.url, "relational index ready");
        Ok(index)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&SqlIndexConfig::default()).await
    }

    /// Wrap an existing pool; the schema must already exist
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::from_db(e, "create index schema fail"))?;
        }
        Ok(())
    }

    async fn upsert(&self, descriptors: &[ServiceDescriptor], verified: bool) -> Result<()> {
        if descriptors.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::from_db(e, "update db fail"))?;

        // Unchanged active rows keep their verification flag and timestamp so
        // repeated heartbeats do not reorder search results.
        for desc in descriptors {
            sqlx::query(
                r#"
                INSERT INTO services
                    (status, service, zone, typ, proto, description, content_hash,
                     hash_status, create_time, modify_time)
                VALUES (0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (service, zone) DO UPDATE SET
                    hash_status = CASE
                        WHEN services.status = 0 AND services.content_hash = excluded.content_hash
                        THEN MAX(services.hash_status, excluded.hash_status)
                        ELSE excluded.hash_status END,
                    modify_time = CASE
                        WHEN services.status = 0 AND services.content_hash = excluded.content_hash
                        THEN services.modify_time
                        ELSE excluded.modify_time END,
                    status = 0,
                    typ = excluded.typ,
                    proto = excluded.proto,
                    description = excluded.description,
                    content_hash = excluded.content_hash
                "#,
            )
            .bind(&desc.service)
            .bind(&desc.zone)
            .bind(&desc.typ)
            .bind(&desc.proto)
            .bind(&desc.description)
            .bind(&desc.content_hash)
            .bind(i64::from(verified))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::from_db(e, "update db fail"))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::from_db(e, "commit db fail"))?;
        debug!(count = descriptors.len(), verified, "index rows upserted");
        Ok(())
    }
}

fn index_row(row: &SqliteRow) -> std::result::Result<IndexRow, sqlx::Error> {
    Ok(IndexRow {
        id: row.try_get("id")?,
        service: row.try_get("service")?,
        zone: row.try_get("zone")?,
        typ: row.try_get("typ")?,
        proto: row.try_get("proto")?,
        description: row.try_get("description")?,
        content_hash: row.try_get("content_hash")?,
        status: RowStatus::from_db(row.try_get("status")?),
        hash_verified: row.try_get::<i64, _>("hash_status")? == 1,
        create_time: row.try_get("create_time")?,
        modify_time: row.try_get("modify_time")?,
    })
}

const INDEX_COLUMNS: &str = "id, status, service, zone, typ, proto, description, content_hash, \
                             hash_status, create_time, modify_time";

#[async_trait]
impl SearchIndex for SqlIndex {
    async fn upsert_pending(&self, descriptors: &[ServiceDescriptor]) -> Result<()> {
        self.upsert(descriptors, false).await
    }

    async fn mark_verified(&self, descriptors: &[ServiceDescriptor]) -> Result<()> {
        for desc in descriptors {
            sqlx::query(
                "UPDATE services SET hash_status = 1 \
                 WHERE service = ? AND zone = ? AND content_hash = ? AND status = 0",
            )
            .bind(&desc.service)
            .bind(&desc.zone)
            .bind(&desc.content_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::from_db(e, "update db fail"))?;
        }
        Ok(())
    }

    async fn upsert_verified(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        self.upsert(std::slice::from_ref(descriptor), true).await
    }

    async fn soft_delete(&self, service: &str, zone: Option<&str>) -> Result<u64> {
        let now = Utc::now();
        let result = match zone {
            Some(zone) => {
                sqlx::query(
                    "UPDATE services SET status = -1, modify_time = ? \
                     WHERE service = ? AND zone = ? AND status = 0",
                )
                .bind(now)
                .bind(service)
                .bind(zone)
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE services SET status = -1, modify_time = ? \
                     WHERE service = ? AND status = 0",
                )
                .bind(now)
                .bind(service)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| Error::from_db(e, "delete service db items fail"))?;
        Ok(result.rows_affected())
    }

    async fn search(&self, query: &str, skip: i64, limit: i64) -> Result<SearchPage> {
        if limit > MAX_SEARCH_LIMIT {
            return Err(Error::InvalidParam(format!(
                "limit {} exceeds {}",
                limit, MAX_SEARCH_LIMIT
            )));
        }
        if skip < 0 || limit < 0 {
            return Err(Error::InvalidParam("negative skip or limit".into()));
        }
        let pattern = format!("%{}%", escape_like(query));

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM services \
             WHERE status = 0 AND hash_status = 1 AND service LIKE ? ESCAPE '\\'",
        )
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "query db services fail"))?;

        let mut page = SearchPage {
            services: Vec::new(),
            total,
        };
        if total > skip && limit > 0 {
            let rows = sqlx::query(
                "SELECT service, zone, typ FROM services \
                 WHERE status = 0 AND hash_status = 1 AND service LIKE ? ESCAPE '\\' \
                 ORDER BY modify_time DESC, id DESC LIMIT ? OFFSET ?",
            )
            .bind(&pattern)
            .bind(limit)
            .bind(skip)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::from_db(e, "query db services fail"))?;

            page.services = rows
                .iter()
                .map(|row| -> std::result::Result<ServiceSummary, sqlx::Error> {
                    Ok(ServiceSummary {
                        service: row.try_get("service")?,
                        zone: row.try_get("zone")?,
                        typ: row.try_get("typ")?,
                    })
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::from_db(e, "query db services fail"))?;
        }
        Ok(page)
    }

    async fn find(&self, service: &str, zone: &str) -> Result<Option<IndexRow>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM services WHERE service = ? AND zone = ?",
            INDEX_COLUMNS
        ))
        .bind(service)
        .bind(zone)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "query db services fail"))?;

        row.as_ref()
            .map(index_row)
            .transpose()
            .map_err(|e| Error::from_db(e, "query db services fail"))
    }

    async fn page_after(&self, after_id: i64, limit: i64) -> Result<Vec<IndexRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM services WHERE id > ? ORDER BY id LIMIT ?",
            INDEX_COLUMNS
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "query db services fail"))?;

        rows.iter()
            .map(index_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::from_db(e, "query db services fail"))
    }
}

// =============================================================================
// Config Ledger
// =============================================================================

#[async_trait]
impl ConfigLedger for SqlIndex {
    async fn record_put(&self, change: &ConfigChange) -> Result<()> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::from_db(e, "new db tx fail"))?;

        sqlx::query(
            r#"
            INSERT INTO configs (status, tag, name, value, create_time, modify_time)
            VALUES (0, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                status = 0, tag = excluded.tag, value = excluded.value,
                modify_time = excluded.modify_time
            "#,
        )
        .bind(&change.tag)
        .bind(&change.name)
        .bind(&change.value)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::from_db(e, "update db config fail"))?;

        sqlx::query(
            "INSERT INTO config_histories (tag, name, app_id, remark, value, create_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&change.tag)
        .bind(&change.name)
        .bind(change.app_id)
        .bind(&change.remark)
        .bind(&change.value)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::from_db(e, "insert db config history fail"))?;

        tx.commit()
            .await
            .map_err(|e| Error::from_db(e, "commit db fail"))
    }

    async fn mark_deleted(&self, name: &str) -> Result<()> {
        sqlx::query("UPDATE configs SET status = -1, modify_time = ? WHERE name = ?")
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::from_db(e, "delete config fail"))?;
        Ok(())
    }

    async fn record_observed(&self, app_id: i64, node: &str, name: &str, version: i64) -> Result<()> {
        if app_id <= 0 {
            return Ok(());
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO app_config_states
                (app_id, app_node, config_name, version, create_time, modify_time)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (app_id, app_node, config_name) DO UPDATE SET
                version = excluded.version, modify_time = excluded.modify_time
            "#,
        )
        .bind(app_id)
        .bind(node)
        .bind(name)
        .bind(version)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "change app config state fail"))?;
        Ok(())
    }

    async fn observed_version(&self, app_id: i64, node: &str, name: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT version FROM app_config_states \
             WHERE app_id = ? AND app_node = ? AND config_name = ?",
        )
        .bind(app_id)
        .bind(node)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "query app config state fail"))
    }

    async fn list(
        &self,
        tag: &str,
        prefix: &str,
        skip: i64,
        limit: i64,
    ) -> Result<(i64, Vec<ConfigInfo>)> {
        let pattern = format!("{}%", escape_like(prefix));
        let filter = "status = 0 AND (? = '' OR tag = ?) AND (? = '' OR name LIKE ? ESCAPE '\\')";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM configs WHERE {}", filter))
            .bind(tag)
            .bind(tag)
            .bind(prefix)
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::from_db(e, "get configs count fail"))?;

        let rows = sqlx::query(&format!(
            "SELECT tag, name, modify_time FROM configs WHERE {} \
             ORDER BY modify_time DESC, id DESC LIMIT ? OFFSET ?",
            filter
        ))
        .bind(tag)
        .bind(tag)
        .bind(prefix)
        .bind(&pattern)
        .bind(limit)
        .bind(skip)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "get configs fail"))?;

        let items = rows
            .iter()
            .map(|row| -> std::result::Result<ConfigInfo, sqlx::Error> {
                let tag: String = row.try_get("tag")?;
                Ok(ConfigInfo {
                    tag: (!tag.is_empty()).then_some(tag),
                    name: row.try_get("name")?,
                    modify_time: row.try_get::<DateTime<Utc>, _>("modify_time")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::from_db(e, "get configs fail"))?;
        Ok((total, items))
    }

    async fn history(&self, name: &str) -> Result<Vec<ConfigHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT id, tag, name, app_id, remark, value, create_time \
             FROM config_histories WHERE name = ? ORDER BY id",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::from_db(e, "get config histories fail"))?;

        rows.iter()
            .map(|row| -> std::result::Result<ConfigHistoryEntry, sqlx::Error> {
                Ok(ConfigHistoryEntry {
                    id: row.try_get("id")?,
                    tag: row.try_get("tag")?,
                    name: row.try_get("name")?,
                    app_id: row.try_get("app_id")?,
                    remark: row.try_get("remark")?,
                    value: row.try_get("value")?,
                    create_time: row.try_get("create_time")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::from_db(e, "get config histories fail"))
    }
}
