// Database connection and result persistence
// SQLite through sqlx: schema bootstrap, run bookkeeping and the transactional
// sink the results handler writes through.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crawling::results_handler::{PersistenceError, ResultSink};
use crate::domain::ResultBatch;

#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Opens (and creates if needed) the SQLite database at `database_url`
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        if db_path != ":memory:" && !db_path.is_empty() {
            let path = Path::new(db_path);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PersistenceError::Database(sqlx::Error::Io(e)))?;
            }
            if !path.exists() {
                tokio::fs::File::create(path)
                    .await
                    .map_err(|e| PersistenceError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        let create_runs_sql = r"
            CREATE TABLE IF NOT EXISTS scrape_run (
                id TEXT PRIMARY KEY,
                started_at DATETIME NOT NULL,
                finished_at DATETIME,
                status TEXT NOT NULL DEFAULT 'running',
                scrape_method TEXT NOT NULL,
                search_type TEXT NOT NULL,
                num_keywords INTEGER NOT NULL,
                num_workers INTEGER NOT NULL
            )
        ";

        let create_pages_sql = r"
            CREATE TABLE IF NOT EXISTS serp_page (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                requested_at DATETIME NOT NULL,
                num_results INTEGER NOT NULL,
                num_results_for_keyword TEXT,
                search_query TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                FOREIGN KEY (run_id) REFERENCES scrape_run (id)
            )
        ";

        let create_links_sql = r"
            CREATE TABLE IF NOT EXISTS link (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                snippet TEXT NOT NULL,
                rank INTEGER NOT NULL,
                domain TEXT NOT NULL,
                serp_id INTEGER NOT NULL,
                FOREIGN KEY (serp_id) REFERENCES serp_page (id) ON DELETE CASCADE
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_serp_page_run_id ON serp_page (run_id);
            CREATE INDEX IF NOT EXISTS idx_serp_page_query ON serp_page (search_query);
            CREATE INDEX IF NOT EXISTS idx_link_serp_id ON link (serp_id);
        ";

        sqlx::query(create_runs_sql).execute(&self.pool).await?;
        sqlx::query(create_pages_sql).execute(&self.pool).await?;
        sqlx::query(create_links_sql).execute(&self.pool).await?;
        sqlx::raw_sql(create_indexes_sql).execute(&self.pool).await?;

        debug!("Database schema ready");
        Ok(())
    }

    pub async fn record_run_started(
        &self,
        run_id: Uuid,
        scrape_method: &str,
        search_type: &str,
        num_keywords: usize,
        num_workers: usize,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO scrape_run (id, started_at, status, scrape_method, search_type, num_keywords, num_workers)
             VALUES (?, ?, 'running', ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(Utc::now())
        .bind(scrape_method)
        .bind(search_type)
        .bind(i64::try_from(num_keywords).unwrap_or(i64::MAX))
        .bind(i64::try_from(num_workers).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_run_finished(&self, run_id: Uuid, status: &str) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE scrape_run SET finished_at = ?, status = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(status)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<Option<String>, PersistenceError> {
        let row = sqlx::query("SELECT status FROM scrape_run WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<String, _>("status")))
    }

    pub async fn count_pages_for_run(&self, run_id: Uuid) -> Result<i64, PersistenceError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM serp_page WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_links_for_run(&self, run_id: Uuid) -> Result<i64, PersistenceError> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM link JOIN serp_page ON link.serp_id = serp_page.id WHERE serp_page.run_id = ?",
        )
        .bind(run_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Transactional sink for the results handler of run `run_id`
    #[must_use]
    pub fn result_sink(&self, run_id: Uuid) -> SqliteResultSink {
        SqliteResultSink {
            pool: self.pool.clone(),
            run_id: run_id.to_string(),
            tx: None,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Writes result batches inside one open transaction until `commit`
pub struct SqliteResultSink {
    pool: SqlitePool,
    run_id: String,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteResultSink {
    async fn transaction(&mut self) -> Result<&mut Transaction<'static, Sqlite>, PersistenceError> {
        if self.tx.is_none() {
            self.tx = Some(self.pool.begin().await?);
        }
        self.tx
            .as_mut()
            .ok_or_else(|| PersistenceError::Database(sqlx::Error::Protocol("transaction not open".into())))
    }
}

/// Page row plus its links; the caller owns the surrounding savepoint
async fn write_batch(
    tx: &mut Transaction<'static, Sqlite>,
    run_id: &str,
    batch: &ResultBatch,
) -> Result<i64, PersistenceError> {
    let page = &batch.page;

    let page_id = sqlx::query(
        "INSERT INTO serp_page (run_id, page_number, requested_at, num_results, num_results_for_keyword, search_query, requested_by)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(page.page_number)
    .bind(page.requested_at)
    .bind(page.num_results)
    .bind(&page.num_results_for_keyword)
    .bind(&page.search_query)
    .bind(&page.requested_by)
    .execute(&mut **tx)
    .await?
    .last_insert_rowid();

    for link in &batch.links {
        sqlx::query(
            "INSERT INTO link (title, url, snippet, rank, domain, serp_id) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&link.title)
        .bind(&link.url)
        .bind(&link.snippet)
        .bind(link.rank)
        .bind(&link.domain)
        .bind(page_id)
        .execute(&mut **tx)
        .await?;
    }

    Ok(page_id)
}

#[async_trait]
impl ResultSink for SqliteResultSink {
    /// Each batch runs inside its own savepoint, so a failing batch is undone
    /// without touching the batches written before it.
    async fn insert_batch(&mut self, batch: &ResultBatch) -> Result<i64, PersistenceError> {
        let run_id = self.run_id.clone();
        let tx = self.transaction().await?;

        sqlx::query("SAVEPOINT result_batch").execute(&mut **tx).await?;
        match write_batch(tx, &run_id, batch).await {
            Ok(page_id) => {
                sqlx::query("RELEASE SAVEPOINT result_batch").execute(&mut **tx).await?;
                Ok(page_id)
            }
            Err(e) => {
                warn!(
                    query = %batch.page.search_query,
                    page = batch.page.page_number,
                    error = %e,
                    "Rolling back failed result batch"
                );
                sqlx::query("ROLLBACK TO SAVEPOINT result_batch").execute(&mut **tx).await?;
                sqlx::query("RELEASE SAVEPOINT result_batch").execute(&mut **tx).await?;
                Err(e)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), PersistenceError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }
}

/// Produces a ready-to-use storage handle for a run
#[async_trait]
pub trait StorageBootstrap: Send + Sync {
    async fn bootstrap(&self) -> Result<DatabaseConnection, PersistenceError>;
}

/// Connects to the configured SQLite URL and ensures the schema exists
#[derive(Debug, Clone)]
pub struct SqliteBootstrap {
    database_url: String,
}

impl SqliteBootstrap {
    #[must_use]
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl StorageBootstrap for SqliteBootstrap {
    async fn bootstrap(&self) -> Result<DatabaseConnection, PersistenceError> {
        let db = DatabaseConnection::connect(&self.database_url).await?;
        db.migrate().await?;
        info!("🗄️ Storage ready: {}", self.database_url);
        Ok(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawling::queues::result_channel;
    use crate::crawling::queues::test_support::batch;
    use crate::crawling::results_handler::ResultsHandler;
    use std::num::NonZeroUsize;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn scratch_db(dir: &tempfile::TempDir) -> DatabaseConnection {
        let url = format!("sqlite:{}", dir.path().join("nested").join("test.db").display());
        SqliteBootstrap::new(url).bootstrap().await.unwrap()
    }

    #[tokio::test]
    async fn bootstrap_creates_file_and_schema() {
        let dir = tempdir().unwrap();
        let db = scratch_db(&dir).await;

        assert!(dir.path().join("nested").join("test.db").exists());
        for table in ["scrape_run", "serp_page", "link"] {
            let found = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
                .bind(table)
                .fetch_optional(db.pool())
                .await
                .unwrap();
            assert!(found.is_some(), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn sink_links_rows_to_their_page_and_commits() {
        let dir = tempdir().unwrap();
        let db = scratch_db(&dir).await;
        let run_id = Uuid::new_v4();
        db.record_run_started(run_id, "http", "normal", 2, 1).await.unwrap();

        let mut sink = db.result_sink(run_id);
        let first = sink.insert_batch(&batch("alpha", 1, 3)).await.unwrap();
        let second = sink.insert_batch(&batch("beta", 1, 2)).await.unwrap();
        assert_ne!(first, second);
        sink.commit().await.unwrap();

        assert_eq!(db.count_pages_for_run(run_id).await.unwrap(), 2);
        assert_eq!(db.count_links_for_run(run_id).await.unwrap(), 5);

        let links_of_first: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM link WHERE serp_id = ?")
            .bind(first)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(links_of_first, 3);
    }

    #[tokio::test]
    async fn uncommitted_batches_are_not_visible() {
        let dir = tempdir().unwrap();
        let db = scratch_db(&dir).await;
        let run_id = Uuid::new_v4();
        db.record_run_started(run_id, "http", "normal", 1, 1).await.unwrap();

        let mut sink = db.result_sink(run_id);
        sink.insert_batch(&batch("pending", 1, 1)).await.unwrap();
        drop(sink);

        assert_eq!(db.count_pages_for_run(run_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_batch_keeps_earlier_batches_committable() {
        let dir = tempdir().unwrap();
        let db = scratch_db(&dir).await;
        let run_id = Uuid::new_v4();
        db.record_run_started(run_id, "http", "normal", 3, 1).await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON link
             WHEN NEW.title LIKE 'poison%'
             BEGIN SELECT RAISE(ABORT, 'poisoned link'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let (producer, terminator, receiver) = result_channel();
        let handler = ResultsHandler::new(
            db.result_sink(run_id),
            receiver,
            NonZeroUsize::new(10).unwrap(),
            CancellationToken::new(),
        );
        producer.put(batch("ok1", 1, 2)).unwrap();
        producer.put(batch("ok2", 1, 2)).unwrap();
        producer.put(batch("poison", 1, 2)).unwrap();
        drop(producer);
        terminator.finish().unwrap();

        assert!(handler.run().await.is_err());

        // the poisoned page row was inserted before its link failed; it must be gone
        assert_eq!(db.count_pages_for_run(run_id).await.unwrap(), 2);
        assert_eq!(db.count_links_for_run(run_id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn run_bookkeeping_tracks_status() {
        let dir = tempdir().unwrap();
        let db = scratch_db(&dir).await;
        let run_id = Uuid::new_v4();

        db.record_run_started(run_id, "sel", "news", 7, 3).await.unwrap();
        assert_eq!(db.run_status(run_id).await.unwrap().as_deref(), Some("running"));

        db.record_run_finished(run_id, "completed").await.unwrap();
        assert_eq!(db.run_status(run_id).await.unwrap().as_deref(), Some("completed"));
    }
}
