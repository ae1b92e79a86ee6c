use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::{corruption, validate_schema, SchemaCheck, Session, StoreError, SCHEMA_V1};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the connection to one history database file.
///
/// The engine is single-threaded. Disposal is explicit and final: every
/// later call, a second [`Engine::dispose`] included, fails with
/// [`StoreError::EngineDisposed`].
#[derive(Debug)]
pub struct Engine {
    path: PathBuf,
    conn: RefCell<Option<Connection>>,
    disposed: Cell<bool>,
}

impl Engine {
    /// Validates `path` and opens a connection to it. The file is created
    /// lazily by `SQLite` if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidPath`] for an empty path,
    /// [`StoreError::RelativePath`] for a relative one and
    /// [`StoreError::IsADirectory`] when `path` names a directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(StoreError::InvalidPath("the database path was empty".to_string()));
        }
        if !path.is_absolute() {
            return Err(StoreError::RelativePath(path.to_path_buf()));
        }
        if path.is_dir() {
            return Err(StoreError::IsADirectory(path.to_path_buf()));
        }

        let conn = open_connection(path)?;
        debug!(path = %path.display(), "opened history database");

        Ok(Self {
            path: path.to_path_buf(),
            conn: RefCell::new(Some(conn)),
            disposed: Cell::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    /// Creates the schema if it is missing and validates an existing one.
    ///
    /// Tables already present are validated before anything is written, so
    /// a file holding a foreign schema is left untouched.
    ///
    /// # Errors
    /// Any failure while reading or creating the schema is reported as
    /// [`StoreError::DatabaseCorruption`].
    pub fn setup_tables(&self) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .map_err(corruption)?;
            validate_schema(conn, SchemaCheck::ExistingOnly)?;

            let tx = conn.transaction().map_err(corruption)?;
            tx.execute_batch(SCHEMA_V1).map_err(corruption)?;
            validate_schema(&tx, SchemaCheck::Complete)?;
            tx.commit().map_err(corruption)
        })?;
        debug!(path = %self.path.display(), "history tables ready");
        Ok(())
    }

    /// Creates a new, not yet entered, session bound to this engine.
    ///
    /// # Errors
    /// Returns [`StoreError::EngineDisposed`] after [`Engine::dispose`].
    pub fn new_session(&self) -> Result<Session<'_>, StoreError> {
        self.ensure_not_disposed()?;
        Ok(Session::new(self))
    }

    /// Runs `operation` inside a freshly entered session and exits the
    /// session afterwards, whether `operation` succeeded or not.
    ///
    /// # Errors
    /// Propagates session creation errors and the error of `operation`.
    pub fn with_session<T, E>(
        &self,
        operation: impl FnOnce(&Session<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut session = self.new_session()?;
        session.enter()?;
        let result = operation(&session);
        session.exit();
        result
    }

    /// Closes the connection. Terminal.
    ///
    /// # Errors
    /// Returns [`StoreError::EngineDisposed`] when called twice, or the
    /// `SQLite` error raised while closing.
    pub fn dispose(&self) -> Result<(), StoreError> {
        self.ensure_not_disposed()?;
        self.disposed.set(true);
        let conn = self
            .conn
            .try_borrow_mut()
            .map_err(|_| StoreError::ConnectionInUse)?
            .take();
        if let Some(conn) = conn {
            conn.close().map_err(|(_, err)| StoreError::from(err))?;
        }
        debug!(path = %self.path.display(), "disposed history database engine");
        Ok(())
    }

    /// Discards all content of the database file by truncating it to zero
    /// bytes, then reconnects. Used to recover from a broken file.
    ///
    /// # Errors
    /// Returns [`StoreError::EngineDisposed`] after disposal, or the I/O
    /// error raised while truncating.
    pub fn truncate_database_file(&self) -> Result<(), StoreError> {
        self.ensure_not_disposed()?;
        let mut slot = self
            .conn
            .try_borrow_mut()
            .map_err(|_| StoreError::ConnectionInUse)?;
        if let Some(conn) = slot.take() {
            conn.close().map_err(|(_, err)| StoreError::from(err))?;
        }

        OpenOptions::new()
            .write(true)
            .open(&self.path)?
            .set_len(0)?;
        info!(path = %self.path.display(), "truncated history database file");

        *slot = Some(open_connection(&self.path)?);
        Ok(())
    }

    pub(crate) fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_not_disposed()?;
        let mut slot = self
            .conn
            .try_borrow_mut()
            .map_err(|_| StoreError::ConnectionInUse)?;
        let conn = slot.as_mut().ok_or(StoreError::EngineDisposed)?;
        operation(conn)
    }

    pub(crate) fn ensure_not_disposed(&self) -> Result<(), StoreError> {
        if self.disposed.get() {
            return Err(StoreError::EngineDisposed);
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}
