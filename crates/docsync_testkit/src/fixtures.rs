//! Test fixtures and database helpers.

use docsync_codec::Value;
use docsync_core::{ConcurrencyPolicy, Database, Document, Revision};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Arc<Database>,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self {
            db: Arc::new(Database::open_in_memory().expect("Failed to open in-memory database")),
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(temp_dir.path()).expect("Failed to open file database");
        Self {
            db: Arc::new(db),
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database directory if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns a shared handle to the database.
    pub fn handle(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Creates a new in-memory test database.
pub fn memory_database() -> TestDatabase {
    TestDatabase::memory()
}

/// Creates a new file-backed test database.
pub fn temp_database() -> TestDatabase {
    TestDatabase::file()
}

/// Saves a document with the given top-level properties, overwriting any
/// current revision.
pub fn save_doc<K, V, I>(db: &Database, id: &str, props: I) -> Revision
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    let mut doc = match db.get_document(id).expect("Failed to read document") {
        Some(doc) => doc,
        None => Document::with_id(id).expect("Invalid document id"),
    };
    for (key, value) in props {
        doc.set(key, value);
    }
    db.save(&mut doc, ConcurrencyPolicy::LastWriteWins)
        .expect("Failed to save document")
}

/// Deletes the current revision of a document.
pub fn delete_doc(db: &Database, id: &str) -> Revision {
    let mut doc = db
        .get_document(id)
        .expect("Failed to read document")
        .expect("Document does not exist");
    db.delete(&mut doc, ConcurrencyPolicy::LastWriteWins)
        .expect("Failed to delete document")
}

/// Polls `cond` until it holds or `timeout` elapses. Returns the last
/// result.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
