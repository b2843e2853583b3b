//! Persisted stores (`Sessions`, `SessionMeta`, `Approvals`, `Workspaces`,
//! `Worktrees`, `WorkspaceGroups`, `AppState`, `Notes`, `WorkflowRuns`).
//!
//! Grounded on `storage::Storage::new` for the pool/migration/pragma idiom
//! (WAL journal mode, Normal synchronous, `include_str!` migrations,
//! `with_timeout` query guard, `#[derive(sqlx::FromRow)]` row structs). The
//! schema itself is new — the teacher's schema is domain-specific to its own
//! session/message model. Workspaces/Worktrees/WorkspaceGroups/AppState/
//! Notes/WorkflowRuns are out of scope per spec §1 and are implemented as
//! small JSON-blob record stores sufficient for the core to compile and be
//! exercised by tests, not as full business-logic collaborators.

use anyhow::Result;
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::model::{Approval, RecordSource, Session, SessionMeta, SessionRecord};

const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "store query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Clone)]
pub struct Stores {
    pool: SqlitePool,
}

impl Stores {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("archon.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    pub fn sessions(&self) -> SessionStore {
        SessionStore { pool: self.pool.clone() }
    }
    pub fn meta(&self) -> MetaStore {
        MetaStore { pool: self.pool.clone() }
    }
    pub fn approvals(&self) -> ApprovalStore {
        ApprovalStore { pool: self.pool.clone() }
    }
    pub fn kv(&self) -> KvStore {
        KvStore { pool: self.pool.clone() }
    }
}

// ─── Sessions (SessionRecord index) ──────────────────────────────────────────

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        with_timeout(async {
            let session_json = serde_json::to_string(&record.session)?;
            let source = format!("{:?}", record.source).to_lowercase();
            sqlx::query(
                "INSERT INTO sessions (id, provider, status, source, data, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                   provider=excluded.provider, status=excluded.status,
                   source=excluded.source, data=excluded.data",
            )
            .bind(&record.session.id)
            .bind(record.session.provider.as_str())
            .bind(record.session.status.as_str())
            .bind(source)
            .bind(session_json)
            .bind(record.session.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        with_timeout(async {
            let row = sqlx::query("SELECT data, source FROM sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(|r| row_to_record(&r)).transpose()?.flatten())
        })
        .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM sessions WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT data, source FROM sessions")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .filter_map(|r| row_to_record(r).ok().flatten())
                .collect())
        })
        .await
    }

    /// Lists codex-sourced records for reconciliation; internal records are
    /// never touched by the syncer.
    pub async fn list_by_source(&self, source: RecordSource) -> Result<Vec<SessionRecord>> {
        let tag = format!("{source:?}").to_lowercase();
        with_timeout(async {
            let rows = sqlx::query("SELECT data, source FROM sessions WHERE source = ?")
                .bind(tag)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .filter_map(|r| row_to_record(r).ok().flatten())
                .collect())
        })
        .await
    }

    pub async fn count(&self) -> Result<u64> {
        with_timeout(async {
            let row = sqlx::query("SELECT COUNT(*) as c FROM sessions")
                .fetch_one(&self.pool)
                .await?;
            Ok(row.try_get::<i64, _>("c")? as u64)
        })
        .await
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<Option<SessionRecord>> {
    let data: String = row.try_get("data")?;
    let source_str: String = row.try_get("source")?;
    let session: Session = serde_json::from_str(&data)?;
    let source = match source_str.as_str() {
        "internal" => RecordSource::Internal,
        "codex" => RecordSource::Codex,
        _ => RecordSource::Unknown,
    };
    Ok(Some(SessionRecord { session, source }))
}

// ─── SessionMeta ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MetaStore {
    pool: SqlitePool,
}

impl MetaStore {
    pub async fn upsert(&self, meta: &SessionMeta) -> Result<()> {
        with_timeout(async {
            let data = serde_json::to_string(meta)?;
            sqlx::query(
                "INSERT INTO session_meta (session_id, data) VALUES (?, ?)
                 ON CONFLICT(session_id) DO UPDATE SET data=excluded.data",
            )
            .bind(&meta.session_id)
            .bind(data)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionMeta>> {
        with_timeout(async {
            let row = sqlx::query("SELECT data FROM session_meta WHERE session_id = ?")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(match row {
                Some(r) => {
                    let data: String = r.try_get("data")?;
                    Some(serde_json::from_str(&data)?)
                }
                None => None,
            })
        })
        .await
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM session_meta WHERE session_id = ?")
                .bind(session_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<SessionMeta>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT data FROM session_meta")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .filter_map(|r| r.try_get::<String, _>("data").ok())
                .filter_map(|d| serde_json::from_str(&d).ok())
                .collect())
        })
        .await
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ApprovalStore {
    pool: SqlitePool,
}

impl ApprovalStore {
    pub async fn upsert(&self, approval: &Approval) -> Result<()> {
        with_timeout(async {
            let params = serde_json::to_string(&approval.params)?;
            sqlx::query(
                "INSERT INTO approvals (session_id, request_id, method, params, created_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(session_id, request_id) DO UPDATE SET
                   method=excluded.method, params=excluded.params",
            )
            .bind(&approval.session_id)
            .bind(approval.request_id as i64)
            .bind(&approval.method)
            .bind(params)
            .bind(approval.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn delete(&self, session_id: &str, request_id: u64) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM approvals WHERE session_id = ? AND request_id = ?")
                .bind(session_id)
                .bind(request_id as i64)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Approval>> {
        with_timeout(async {
            let rows = sqlx::query(
                "SELECT session_id, request_id, method, params, created_at
                 FROM approvals WHERE session_id = ? ORDER BY request_id",
            )
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_approval).collect()
        })
        .await
    }

    /// Reconciles the local store against an authoritative provider-side
    /// listing, deleting entries the provider no longer lists.
    pub async fn reconcile(&self, session_id: &str, live_request_ids: &[u64]) -> Result<()> {
        with_timeout(async {
            let existing = self.list_for_session(session_id).await?;
            for a in existing {
                if !live_request_ids.contains(&a.request_id) {
                    self.delete(session_id, a.request_id).await?;
                }
            }
            Ok(())
        })
        .await
    }
}

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<Approval> {
    let params_str: String = row.try_get("params")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Approval {
        session_id: row.try_get("session_id")?,
        request_id: row.try_get::<i64, _>("request_id")? as u64,
        method: row.try_get("method")?,
        params: serde_json::from_str(&params_str)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&chrono::Utc),
    })
}

// ─── Generic JSON-blob stores (Workspaces/Worktrees/WorkspaceGroups/AppState/
// Notes/WorkflowRuns) — out-of-scope business logic; minimal CRUD only. ──────

#[derive(Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

impl KvStore {
    pub async fn upsert(&self, namespace: &str, id: &str, data: &serde_json::Value) -> Result<()> {
        with_timeout(async {
            let json = serde_json::to_string(data)?;
            sqlx::query(
                "INSERT INTO kv_records (namespace, id, data) VALUES (?, ?, ?)
                 ON CONFLICT(namespace, id) DO UPDATE SET data=excluded.data",
            )
            .bind(namespace)
            .bind(id)
            .bind(json)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, namespace: &str, id: &str) -> Result<Option<serde_json::Value>> {
        with_timeout(async {
            let row = sqlx::query("SELECT data FROM kv_records WHERE namespace = ? AND id = ?")
                .bind(namespace)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(match row {
                Some(r) => Some(serde_json::from_str(&r.try_get::<String, _>("data")?)?),
                None => None,
            })
        })
        .await
    }

    pub async fn list(&self, namespace: &str) -> Result<Vec<serde_json::Value>> {
        with_timeout(async {
            let rows = sqlx::query("SELECT data FROM kv_records WHERE namespace = ?")
                .bind(namespace)
                .fetch_all(&self.pool)
                .await?;
            Ok(rows
                .iter()
                .filter_map(|r| r.try_get::<String, _>("data").ok())
                .filter_map(|d| serde_json::from_str(&d).ok())
                .collect())
        })
        .await
    }

    pub async fn delete(&self, namespace: &str, id: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query("DELETE FROM kv_records WHERE namespace = ? AND id = ?")
                .bind(namespace)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
