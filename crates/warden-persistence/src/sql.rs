//! ---
//! warden_section: "03-persistence-logging"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Persistence abstractions and storage bindings."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! [`Store`] over a shared SQL database, so redundant controllers see one lease.
//!
//! Timestamps are stored as Unix milliseconds so lease expiry is a plain integer
//! comparison on every backend.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};
use warden_common::config::DatabaseConfig;

use crate::model::{
    ElectionRecord, FencerConfig, FencerKind, Host, HostId, HostState, HostStatus, NewFencer,
};
use crate::store::Store;
use crate::{PersistenceError, Result};

/// SQL flavour behind a connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Single-file database; suits one controller or shared storage.
    Sqlite,
    /// Network database shared by every controller.
    Postgres,
}

impl SqlDialect {
    /// Dialect named by the URL scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        match url.split_once(':').map(|(scheme, _)| scheme) {
            Some("sqlite") => Ok(SqlDialect::Sqlite),
            Some("postgres" | "postgresql") => Ok(SqlDialect::Postgres),
            _ => Err(PersistenceError::Backend(format!(
                "unsupported database url '{url}'"
            ))),
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
            SqlDialect::Postgres => "BIGSERIAL PRIMARY KEY",
        }
    }

    fn schema(self) -> Vec<String> {
        let id = self.id_column();
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS hosts (
                    id {id},
                    name TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    disabled BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS host_states (
                    id {id},
                    host_id BIGINT NOT NULL REFERENCES hosts(id),
                    tag TEXT NOT NULL,
                    failed_times BIGINT NOT NULL DEFAULT 0,
                    updated_at BIGINT NOT NULL,
                    UNIQUE (host_id, tag)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS fencers (
                    id {id},
                    host_id BIGINT NOT NULL REFERENCES hosts(id),
                    kind TEXT NOT NULL,
                    address TEXT NOT NULL,
                    port BIGINT NOT NULL,
                    username TEXT NOT NULL,
                    password TEXT NOT NULL
                )"
            ),
            "CREATE TABLE IF NOT EXISTS leader_election (
                election_name TEXT PRIMARY KEY,
                leader_name TEXT NOT NULL,
                last_update BIGINT NOT NULL
            )"
            .to_owned(),
        ]
    }
}

const CLAIM_LEASE: &str = "INSERT INTO leader_election (election_name, leader_name, last_update)
    VALUES ($1, $2, $3)
    ON CONFLICT (election_name) DO UPDATE SET
        leader_name = excluded.leader_name,
        last_update = CASE
            WHEN excluded.last_update > leader_election.last_update THEN excluded.last_update
            ELSE leader_election.last_update
        END
    WHERE leader_election.leader_name = excluded.leader_name
        OR leader_election.last_update < $4";

/// Store backed by sqlite or postgres through the sqlx `Any` driver.
#[derive(Debug, Clone)]
pub struct SqlStore {
    pool: AnyPool,
    dialect: SqlDialect,
}

impl SqlStore {
    /// Open a connection pool. Call [`SqlStore::sync_schema`] before first use.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let dialect = SqlDialect::from_url(&config.url)?;
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        debug!(?dialect, max_connections = config.max_connections, "database pool opened");
        Ok(Self { pool, dialect })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Create any missing tables. Safe to run on every start.
    pub async fn sync_schema(&self) -> Result<()> {
        for statement in self.dialect.schema() {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!(dialect = ?self.dialect, "database schema in sync");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PersistenceError::Backend(format!("timestamp {ms} out of range")))
}

fn to_id(raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| PersistenceError::Backend(format!("negative id {raw}")))
}

fn to_sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| PersistenceError::Backend(format!("id {id} out of range")))
}

fn missing_host(err: sqlx::Error, host_id: HostId) -> PersistenceError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => PersistenceError::NotFound {
            kind: "host",
            id: host_id.to_string(),
        },
        _ => err.into(),
    }
}

fn host_from_row(row: &AnyRow) -> Result<Host> {
    let status: String = row.try_get("status")?;
    Ok(Host {
        id: to_id(row.try_get("id")?)?,
        name: row.try_get("name")?,
        status: HostStatus::from_str(&status)
            .map_err(|_| PersistenceError::Backend(format!("unknown host status '{status}'")))?,
        disabled: row.try_get::<i64, _>("disabled")? != 0,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn state_from_row(row: &AnyRow) -> Result<HostState> {
    let failed_times: i64 = row.try_get("failed_times")?;
    Ok(HostState {
        id: to_id(row.try_get("id")?)?,
        host_id: to_id(row.try_get("host_id")?)?,
        tag: row.try_get("tag")?,
        failed_times: u32::try_from(failed_times).unwrap_or(u32::MAX),
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

fn fencer_from_row(row: &AnyRow) -> Result<FencerConfig> {
    let kind: String = row.try_get("kind")?;
    let port: i64 = row.try_get("port")?;
    Ok(FencerConfig {
        id: to_id(row.try_get("id")?)?,
        host_id: to_id(row.try_get("host_id")?)?,
        kind: FencerKind::from_str(&kind)
            .map_err(|_| PersistenceError::Backend(format!("unknown fencer kind '{kind}'")))?,
        address: row.try_get("address")?,
        port: u16::try_from(port)
            .map_err(|_| PersistenceError::Backend(format!("fencer port {port} out of range")))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
    })
}

const HOST_COLUMNS: &str = "id, name, status, disabled, updated_at";
const STATE_COLUMNS: &str = "id, host_id, tag, failed_times, updated_at";
const FENCER_COLUMNS: &str = "id, host_id, kind, address, port, username, password";

#[async_trait]
impl Store for SqlStore {
    async fn host_by_name(&self, name: &str) -> Result<Option<Host>> {
        let row = sqlx::query(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn host_by_id(&self, id: HostId) -> Result<Option<Host>> {
        let row = sqlx::query(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = $1"))
            .bind(to_sql_id(id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(host_from_row).transpose()
    }

    async fn insert_host(&self, name: &str, now: DateTime<Utc>) -> Result<Host> {
        let row = sqlx::query(&format!(
            "INSERT INTO hosts (name, status, disabled, updated_at) VALUES ($1, $2, 0, $3)
             RETURNING {HOST_COLUMNS}"
        ))
        .bind(name)
        .bind(HostStatus::Initial.as_ref())
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;
        let host = host_from_row(&row)?;
        debug!(host = %host.name, id = host.id, "host inserted");
        Ok(host)
    }

    async fn hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(host_from_row).collect()
    }

    async fn update_host(&self, host: &Host) -> Result<()> {
        let done = sqlx::query(
            "UPDATE hosts SET status = $1, disabled = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(host.status.as_ref())
        .bind(i64::from(host.disabled))
        .bind(millis(host.updated_at))
        .bind(to_sql_id(host.id)?)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                kind: "host",
                id: host.id.to_string(),
            });
        }
        Ok(())
    }

    async fn host_states(&self, host_id: HostId) -> Result<Vec<HostState>> {
        let rows = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM host_states WHERE host_id = $1 ORDER BY id"
        ))
        .bind(to_sql_id(host_id)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn insert_host_state(
        &self,
        host_id: HostId,
        tag: &str,
        now: DateTime<Utc>,
    ) -> Result<HostState> {
        let row = sqlx::query(&format!(
            "INSERT INTO host_states (host_id, tag, failed_times, updated_at) VALUES ($1, $2, 0, $3)
             RETURNING {STATE_COLUMNS}"
        ))
        .bind(to_sql_id(host_id)?)
        .bind(tag)
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| missing_host(err, host_id))?;
        state_from_row(&row)
    }

    async fn update_host_state(&self, state: &HostState) -> Result<()> {
        let done = sqlx::query(
            "UPDATE host_states SET failed_times = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(i64::from(state.failed_times))
        .bind(millis(state.updated_at))
        .bind(to_sql_id(state.id)?)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                kind: "host state",
                id: state.id.to_string(),
            });
        }
        Ok(())
    }

    async fn fencers_for_host(&self, host_id: HostId) -> Result<Vec<FencerConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {FENCER_COLUMNS} FROM fencers WHERE host_id = $1 ORDER BY id"
        ))
        .bind(to_sql_id(host_id)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fencer_from_row).collect()
    }

    async fn insert_fencer(&self, fencer: NewFencer) -> Result<FencerConfig> {
        let row = sqlx::query(&format!(
            "INSERT INTO fencers (host_id, kind, address, port, username, password)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {FENCER_COLUMNS}"
        ))
        .bind(to_sql_id(fencer.host_id)?)
        .bind(fencer.kind.as_ref())
        .bind(&fencer.address)
        .bind(i64::from(fencer.port))
        .bind(&fencer.username)
        .bind(&fencer.password)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| missing_host(err, fencer.host_id))?;
        fencer_from_row(&row)
    }

    async fn delete_fencer(&self, id: u64) -> Result<()> {
        let done = sqlx::query("DELETE FROM fencers WHERE id = $1")
            .bind(to_sql_id(id)?)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(PersistenceError::NotFound {
                kind: "fencer",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_lease(
        &self,
        election: &str,
        leader: &str,
        now: DateTime<Utc>,
        term: Duration,
    ) -> Result<bool> {
        let term_ms = i64::try_from(term.as_millis()).unwrap_or(i64::MAX);
        let cutoff = millis(now).saturating_sub(term_ms);
        let done = sqlx::query(CLAIM_LEASE)
            .bind(election)
            .bind(leader)
            .bind(millis(now))
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn lease(&self, election: &str) -> Result<Option<ElectionRecord>> {
        let row = sqlx::query(
            "SELECT election_name, leader_name, last_update FROM leader_election
             WHERE election_name = $1",
        )
        .bind(election)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(ElectionRecord {
                election_name: row.try_get("election_name")?,
                leader_name: row.try_get("leader_name")?,
                last_update: from_millis(row.try_get("last_update")?)?,
            })
        })
        .transpose()
    }

    async fn release_lease(&self, election: &str, leader: &str) -> Result<bool> {
        let done = sqlx::query(
            "DELETE FROM leader_election WHERE election_name = $1 AND leader_name = $2",
        )
        .bind(election)
        .bind(leader)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_follows_the_url_scheme() {
        assert_eq!(
            SqlDialect::from_url("sqlite:///var/lib/warden/warden.db?mode=rwc").unwrap(),
            SqlDialect::Sqlite
        );
        assert_eq!(
            SqlDialect::from_url("postgres://warden@db/warden").unwrap(),
            SqlDialect::Postgres
        );
        assert!(SqlDialect::from_url("mysql://db/warden").is_err());
    }

    #[test]
    fn postgres_schema_uses_serial_ids() {
        let schema = SqlDialect::Postgres.schema();
        assert_eq!(schema.len(), 4);
        assert!(schema[0].contains("BIGSERIAL PRIMARY KEY"));
        assert!(!schema.iter().any(|stmt| stmt.contains("AUTOINCREMENT")));
    }
}
