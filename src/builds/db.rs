use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the build store.
///
/// Wraps `BuildDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. Each call sees one record state
/// atomically; there is no other locking between the executor and readers.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BuildDb>>,
}

impl DbHandle {
    pub fn new(db: BuildDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BuildDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for startup and tests;
    /// never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BuildDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct BuildDb {
    conn: Connection,
}

const BUILD_COLUMNS: &str = "id, app, status, logs, created_at, ended_at";

impl BuildDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS builds (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL,
                    app TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'created',
                    logs TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    ended_at TEXT,
                    UNIQUE(app, id)
                );

                CREATE INDEX IF NOT EXISTS idx_builds_app ON builds(app, seq);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Build CRUD ────────────────────────────────────────────────────

    /// Persist a fresh build for `app` in the `created` state.
    pub fn create_build(&self, app: &str) -> Result<Build> {
        let id = new_build_id();
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.conn
            .execute(
                "INSERT INTO builds (id, app, status, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, app, BuildStatus::Created.as_str(), created],
            )
            .context("Failed to insert build")?;
        self.get_build(app, &id)?
            .context("Build not found after insert")
    }

    /// Builds for `app` in store (creation) order, narrowed by `filter`.
    pub fn list_builds(&self, app: &str, filter: &BuildFilter) -> Result<Vec<Build>> {
        let sql = format!(
            "SELECT {} FROM builds
             WHERE app = ?1
               AND (?2 IS NULL OR id = ?2)
               AND (?3 IS NULL OR created_at = ?3)
             ORDER BY seq",
            BUILD_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_builds")?;
        let rows = stmt
            .query_map(params![app, filter.id(), filter.created()], BuildRow::from_row)
            .context("Failed to query builds")?;
        let mut builds = Vec::new();
        for row in rows {
            let r = row.context("Failed to read build row")?;
            builds.push(r.into_build()?);
        }
        if let Some(limit) = filter.limit
            && builds.len() > limit
        {
            builds.drain(..builds.len() - limit);
        }
        Ok(builds)
    }

    pub fn get_build(&self, app: &str, id: &str) -> Result<Option<Build>> {
        let sql = format!("SELECT {} FROM builds WHERE app = ?1 AND id = ?2", BUILD_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![app, id], BuildRow::from_row)
            .optional()
            .context("Failed to query build")?;
        row.map(BuildRow::into_build).transpose()
    }

    /// Append `text` to a build's logs. Returns `false` when the build does
    /// not exist or has already reached a terminal status (logs are frozen).
    pub fn append_logs(&self, app: &str, id: &str, text: &str) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE builds SET logs = logs || ?1
                 WHERE app = ?2 AND id = ?3 AND status IN ('created', 'running')",
                params![text, app, id],
            )
            .context("Failed to append build logs")?;
        Ok(count > 0)
    }

    /// Move a build to `status`. Returns `false` (and changes nothing) when
    /// the build is not currently in one of the status's predecessors.
    pub fn update_status(&self, app: &str, id: &str, status: BuildStatus) -> Result<bool> {
        let allowed = status
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        if allowed.is_empty() {
            return Ok(false);
        }

        let ended = status
            .is_terminal()
            .then(|| chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));
        let sql = format!(
            "UPDATE builds SET status = ?1, ended_at = COALESCE(?2, ended_at)
             WHERE app = ?3 AND id = ?4 AND status IN ({})",
            allowed
        );
        let count = self
            .conn
            .execute(&sql, params![status.as_str(), ended, app, id])
            .context("Failed to update build status")?;
        Ok(count > 0)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

struct BuildRow {
    id: String,
    app: String,
    status: String,
    logs: String,
    created_at: String,
    ended_at: Option<String>,
}

impl BuildRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            app: row.get(1)?,
            status: row.get(2)?,
            logs: row.get(3)?,
            created_at: row.get(4)?,
            ended_at: row.get(5)?,
        })
    }

    fn into_build(self) -> Result<Build> {
        let status = self
            .status
            .parse::<BuildStatus>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(Build {
            id: self.id,
            app: self.app,
            status,
            logs: self.logs,
            created: self.created_at,
            ended: self.ended_at,
        })
    }
}
