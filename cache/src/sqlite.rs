//! Persistent cache driver backed by an SQLite database.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqliteConnection;

use cache_driver::{CacheDriver, CacheError, CacheErrorKind, Claim};

const ENGINE: &str = "sqlite";

/// Embedded migrations, run on every connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECTIONS: u32 = 5;

// A claim can lose its race against a delete of the winning location. It is
// retried a few times before giving up.
const CLAIM_ATTEMPTS: usize = 4;

fn error_kind(err: &sqlx::Error) -> CacheErrorKind {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => CacheErrorKind::Unavailable,
        sqlx::Error::Database(db) if db.message().contains("locked") => {
            CacheErrorKind::Unavailable
        }
        sqlx::Error::Io(_) => CacheErrorKind::Io,
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => CacheErrorKind::Corrupt,
        _ => CacheErrorKind::Other,
    }
}

fn sqlx_error(err: sqlx::Error) -> CacheError {
    CacheError::new(ENGINE, error_kind(&err), err)
}

fn with_digest(digest: &str, path: Option<&Utf8Path>) -> impl FnOnce(sqlx::Error) -> CacheError {
    let digest = digest.to_owned();
    let path = path.map(|p| p.to_string());
    move |err| {
        let mut builder = CacheError::builder(ENGINE, error_kind(&err), err).digest(digest);
        if let Some(path) = path {
            builder = builder.path(path);
        }
        builder.build()
    }
}

/// Cache driver storing digest locations in an SQLite database.
///
/// The database runs in WAL mode so the scrubber and uploads can read while a
/// single writer records new locations.
#[derive(Debug, Clone)]
pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    async fn new(options: SqliteConnectOptions, max: u32) -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            // Query-based pragmas must run on every pooled connection.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max)
            .connect_with(options)
            .await
            .map_err(sqlx_error)?;
        let cache = Self { pool };
        cache.migrate().await?;
        Ok(cache)
    }

    /// Open the cache database at `path`, creating it if it does not exist.
    #[tracing::instrument]
    pub async fn connect(path: &Utf8Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                CacheError::builder(ENGINE, CacheErrorKind::Io, err)
                    .path(parent.as_str())
                    .context("creating cache directory")
                    .build()
            })?;
        }

        let options = Self::base_options()
            .filename(path.as_std_path())
            .create_if_missing(true);
        let cache = Self::new(options, MAX_CONNECTIONS).await?;
        tracing::debug!(%path, "opened cache database");
        Ok(cache)
    }

    /// Open a private in-memory database.
    ///
    /// An in-memory database is per-connection, so the pool is limited to a
    /// single connection.
    pub async fn connect_in_memory() -> Result<Self, CacheError> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, 1).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Concurrent pushes of the same layer contend on the write lock.
            .busy_timeout(Duration::from_millis(1500))
    }

    async fn apply_pragmas(
        conn: &mut SqliteConnection,
        _meta: PoolConnectionMetadata,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn migrate(&self) -> Result<(), CacheError> {
        MIGRATOR.run(&self.pool).await.map_err(|err| {
            CacheError::builder(ENGINE, CacheErrorKind::Unavailable, err)
                .context("running cache migrations")
                .build()
        })
    }

    /// Close the connection pool, waiting for connections to be returned.
    pub async fn close(&self) {
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }

    async fn original(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT path FROM blob_locations WHERE digest = ?1 ORDER BY seq ASC LIMIT 1",
        )
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(with_digest(digest, None))?;
        Ok(row.map(|(path,)| Utf8PathBuf::from(path)))
    }
}

#[async_trait::async_trait]
impl CacheDriver for SqliteCache {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn put_if_absent(&self, digest: &str, path: &Utf8Path) -> Result<Claim, CacheError> {
        if digest.is_empty() {
            return Err(CacheError::builder(ENGINE, CacheErrorKind::InvalidRequest, "empty digest")
                .path(path.as_str())
                .build());
        }

        for _ in 0..CLAIM_ATTEMPTS {
            // A single statement is atomic under the database write lock, so
            // exactly one concurrent claim inserts the first row.
            let result = sqlx::query(
                "INSERT INTO blob_locations (digest, path) \
                 SELECT ?1, ?2 WHERE NOT EXISTS \
                 (SELECT 1 FROM blob_locations WHERE digest = ?1)",
            )
            .bind(digest)
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(with_digest(digest, Some(path)))?;

            if result.rows_affected() == 1 {
                return Ok(Claim::Inserted);
            }

            if let Some(original) = self.original(digest).await? {
                return Ok(Claim::Existing(original));
            }
            tracing::trace!(digest, "cache entry vanished while claiming, retrying");
        }

        Err(CacheError::builder(ENGINE, CacheErrorKind::Unavailable, "claim kept losing to deletes")
            .digest(digest)
            .path(path.as_str())
            .build())
    }

    async fn put(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        sqlx::query("INSERT OR IGNORE INTO blob_locations (digest, path) VALUES (?1, ?2)")
            .bind(digest)
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(with_digest(digest, Some(path)))?;
        Ok(())
    }

    async fn get(&self, digest: &str) -> Result<Option<Utf8PathBuf>, CacheError> {
        self.original(digest).await
    }

    async fn locations(&self, digest: &str) -> Result<Vec<Utf8PathBuf>, CacheError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM blob_locations WHERE digest = ?1 ORDER BY seq ASC")
                .bind(digest)
                .fetch_all(&self.pool)
                .await
                .map_err(with_digest(digest, None))?;
        Ok(rows.into_iter().map(|(path,)| Utf8PathBuf::from(path)).collect())
    }

    async fn contains(&self, digest: &str, path: &Utf8Path) -> Result<bool, CacheError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM blob_locations WHERE digest = ?1 AND path = ?2")
                .bind(digest)
                .bind(path.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(with_digest(digest, Some(path)))?;
        Ok(row.is_some())
    }

    async fn delete(&self, digest: &str, path: &Utf8Path) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM blob_locations WHERE digest = ?1 AND path = ?2")
            .bind(digest)
            .bind(path.as_str())
            .execute(&self.pool)
            .await
            .map_err(with_digest(digest, Some(path)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_then_existing() {
        let cache = SqliteCache::connect_in_memory().await.unwrap();
        let a = Utf8Path::new("a/blobs/sha256/abc");
        let b = Utf8Path::new("b/blobs/sha256/abc");

        assert_eq!(cache.put_if_absent("sha256:abc", a).await.unwrap(), Claim::Inserted);
        assert_eq!(
            cache.put_if_absent("sha256:abc", b).await.unwrap(),
            Claim::Existing(a.to_owned())
        );
        assert!(!cache.contains("sha256:abc", b).await.unwrap());

        cache.put("sha256:abc", b).await.unwrap();
        cache.put("sha256:abc", b).await.unwrap();
        assert_eq!(
            cache.locations("sha256:abc").await.unwrap(),
            vec![a.to_owned(), b.to_owned()]
        );
        cache.close().await;
    }

    #[tokio::test]
    async fn delete_promotes_next_location() {
        let cache = SqliteCache::connect_in_memory().await.unwrap();
        let a = Utf8Path::new("a/blobs/sha256/abc");
        let b = Utf8Path::new("b/blobs/sha256/abc");
        cache.put("sha256:abc", a).await.unwrap();
        cache.put("sha256:abc", b).await.unwrap();

        cache.delete("sha256:abc", a).await.unwrap();
        assert_eq!(cache.get("sha256:abc").await.unwrap().as_deref(), Some(b));

        cache.delete("sha256:abc", b).await.unwrap();
        assert!(cache.get("sha256:abc").await.unwrap().is_none());
        assert!(cache.locations("sha256:abc").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_insert_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("cache.db")).unwrap();
        let cache = SqliteCache::connect(&path).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let path = Utf8PathBuf::from(format!("repo{i}/blobs/sha256/abc"));
                cache.put_if_absent("sha256:abc", &path).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap().is_inserted() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(cache.locations("sha256:abc").await.unwrap().len(), 1);
        cache.close().await;
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("nested/cache.db")).unwrap();
        let original = Utf8Path::new("library/alpine/blobs/sha256/abc");

        let cache = SqliteCache::connect(&path).await.unwrap();
        cache.put_if_absent("sha256:abc", original).await.unwrap();
        cache.close().await;

        let cache = SqliteCache::connect(&path).await.unwrap();
        assert_eq!(cache.get("sha256:abc").await.unwrap().as_deref(), Some(original));
        cache.close().await;
    }
}
