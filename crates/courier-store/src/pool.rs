//! Connection pool over one WAL database file.
//!
//! WAL mode plus the per-connection busy timeout already lets several
//! [`Database`] handles operate on the same file; the pool just recycles
//! those handles so concurrent callers each get their own connection
//! instead of serializing on a shared one. Checked-out connections return
//! to the idle list on drop; when the list is empty a fresh connection is
//! opened on demand.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::database::{self, Database};
use crate::error::Result;

#[derive(Clone)]
pub struct DatabasePool {
    inner: Arc<PoolShared>,
}

struct PoolShared {
    path: PathBuf,
    idle: Mutex<Vec<Database>>,
}

impl DatabasePool {
    /// Open a pool over the default application database.
    pub fn new() -> Result<Self> {
        let path = database::default_path()?;
        Self::open_at(&path)
    }

    /// Open a pool over an explicit database file. Migrations run once,
    /// on the first connection, before the pool is handed out.
    pub fn open_at(path: &Path) -> Result<Self> {
        let first = Database::open_at(path)?;
        Ok(Self {
            inner: Arc::new(PoolShared {
                path: path.to_path_buf(),
                idle: Mutex::new(vec![first]),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Check out a connection: an idle one when available, a freshly
    /// opened one otherwise. The connection returns to the pool when the
    /// guard drops.
    pub fn get(&self) -> Result<PooledConnection> {
        let idle = self
            .inner
            .idle
            .lock()
            .expect("pool lock poisoned")
            .pop();

        let db = match idle {
            Some(db) => db,
            None => Database::open_at(&self.inner.path)?,
        };

        Ok(PooledConnection {
            db: Some(db),
            pool: Arc::clone(&self.inner),
        })
    }
}

/// A checked-out [`Database`]; derefs to the typed CRUD helpers.
pub struct PooledConnection {
    db: Option<Database>,
    pool: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Database;

    fn deref(&self) -> &Database {
        self.db.as_ref().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(db) = self.db.take() {
            self.pool
                .idle
                .lock()
                .expect("pool lock poisoned")
                .push(db);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::types::UserId;

    fn pool() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_at(&dir.path().join("pool.db")).unwrap();
        (dir, pool)
    }

    fn conn_addr(conn: &PooledConnection) -> usize {
        conn.conn() as *const _ as usize
    }

    #[test]
    fn dropped_connections_are_recycled() {
        let (_dir, pool) = pool();

        let first = {
            let conn = pool.get().unwrap();
            conn_addr(&conn)
        };
        let again = pool.get().unwrap();
        assert_eq!(first, conn_addr(&again));
    }

    #[test]
    fn simultaneous_checkouts_get_distinct_connections() {
        let (_dir, pool) = pool();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert_ne!(conn_addr(&a), conn_addr(&b));
    }

    #[test]
    fn one_checkout_does_not_block_another() {
        // A connection held by one caller must not serialize the rest:
        // a second checkout writes and reads while the first is out.
        let (_dir, pool) = pool();
        let held = pool.get().unwrap();

        let other = pool.get().unwrap();
        let conversation = other
            .find_or_create_conversation(&UserId::from("u1"), &UserId::from("u2"))
            .unwrap();

        // Both connections see the same WAL database.
        assert!(held.get_conversation(&conversation.id).is_ok());
    }
}
