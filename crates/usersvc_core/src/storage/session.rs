//! Storage session: one connection, at most one transaction.
//!
//! # Responsibility
//! - Lazily begin a single transaction and reuse it across nested calls.
//! - Run reads, mutations, bulk loads and batched updates inside it.
//! - Apply the auto-commit / auto-close policy at the end of each top-level
//!   operation.
//!
//! # Invariants
//! - `tx` is `Some` only while the backend has an open transaction.
//! - Under auto-commit every top-level operation ends with exactly one
//!   commit (success) or one rollback attempt (failure).
//! - If that rollback fails, the rollback error is returned and the original
//!   failure is only logged.
//! - A commit the backend rejects is followed by a rollback before `tx` is
//!   cleared; the commit error is returned.
//! - After auto-close or `release`, every call fails with
//!   `StorageError::ConnectionClosed`.
//! - Nested operations share the session transaction and therefore share
//!   fate: they commit or roll back together.

use super::error::{StorageError, StorageResult};
use super::request::{validate_identifier, validate_row_widths, CopyRequest, QueryRequest, UpdateRequest};
use super::update::build_update;
use crate::db::{connect, Backend, Dialect, FromRow, SessionSettings, Value};
use log::{debug, error, info, warn};
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

/// Identifier of the transaction a session currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct ActiveTransaction {
    id: TransactionId,
    started_at: Instant,
}

/// What a failed top-level operation does with the session transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnFailure {
    /// Roll back only under auto-commit.
    FollowAutoCommit,
    /// Always roll back the whole unit of work.
    Rollback,
}

/// Exclusive owner of one database connection and its transaction state.
///
/// Not meant to be shared between concurrent callers; open one session per
/// logical operation instead.
pub struct StorageSession {
    id: Uuid,
    settings: SessionSettings,
    backend: Option<Box<dyn Backend>>,
    tx: Option<ActiveTransaction>,
    next_tx: u64,
}

impl StorageSession {
    /// Opens a connection for `settings` and wraps it in a session.
    pub fn open(settings: SessionSettings) -> StorageResult<Self> {
        let backend = connect(&settings)?;
        Ok(Self::with_backend(settings, backend))
    }

    /// Wraps an already opened backend.
    pub fn with_backend(settings: SessionSettings, backend: Box<dyn Backend>) -> Self {
        let id = Uuid::new_v4();
        debug!(
            "event=session_open module=storage status=ok session={} app={} auto_commit={} auto_close={}",
            id,
            settings.app_name(),
            settings.auto_commit(),
            settings.auto_close()
        );
        Self {
            id,
            settings,
            backend: Some(backend),
            tx: None,
            next_tx: 1,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.backend.is_some()
    }

    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.tx.as_ref().map(|tx| tx.id)
    }

    pub fn dialect(&self) -> StorageResult<Dialect> {
        self.backend
            .as_ref()
            .map(|backend| backend.dialect())
            .ok_or(StorageError::ConnectionClosed)
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        if self.backend.is_none() {
            return Err(StorageError::ConnectionClosed);
        }
        if self.settings.cancel_token().is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }

    /// Begins the session transaction, or returns the one already active.
    pub fn begin(&mut self) -> StorageResult<TransactionId> {
        self.ensure_usable()?;
        if let Some(tx) = &self.tx {
            debug!(
                "event=tx_begin module=storage status=reused session={} tx={}",
                self.id, tx.id
            );
            return Ok(tx.id);
        }

        let backend = self.backend.as_mut().ok_or(StorageError::ConnectionClosed)?;
        backend
            .begin(self.settings.tx_options())
            .map_err(|err| StorageError::from_db(err, StorageError::Begin))?;

        let id = TransactionId(self.next_tx);
        self.next_tx += 1;
        self.tx = Some(ActiveTransaction {
            id,
            started_at: Instant::now(),
        });
        debug!(
            "event=tx_begin module=storage status=ok session={} tx={}",
            self.id, id
        );
        Ok(id)
    }

    /// Commits the active transaction.
    ///
    /// The transaction stays current until the backend confirms the commit.
    /// When the commit fails a rollback is issued before the transaction is
    /// forgotten, so the connection is never left inside a transaction the
    /// session no longer tracks. The commit error is returned.
    pub fn commit(&mut self) -> StorageResult<()> {
        let tx_id = self
            .tx
            .as_ref()
            .map(|tx| tx.id)
            .ok_or(StorageError::NoActiveTransaction)?;
        let backend = self.backend.as_mut().ok_or(StorageError::ConnectionClosed)?;
        match backend.commit() {
            Ok(()) => {
                if let Some(tx) = self.tx.take() {
                    debug!(
                        "event=tx_commit module=storage status=ok session={} tx={} duration_ms={}",
                        self.id,
                        tx.id,
                        tx.started_at.elapsed().as_millis()
                    );
                }
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=tx_commit module=storage status=error session={} tx={} error={}",
                    self.id, tx_id, err
                );
                if let Err(rollback_err) = backend.rollback() {
                    warn!(
                        "event=tx_commit module=storage status=rollback_failed session={} tx={} error={}",
                        self.id, tx_id, rollback_err
                    );
                }
                self.tx = None;
                Err(StorageError::from_db(err, StorageError::Commit))
            }
        }
    }

    /// Alias of [`StorageSession::commit`].
    pub fn end(&mut self) -> StorageResult<()> {
        self.commit()
    }

    /// Rolls back the active transaction.
    ///
    /// On failure the transaction is forgotten anyway; the server-side state
    /// of the connection is then unknown.
    pub fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.tx.take().ok_or(StorageError::NoActiveTransaction)?;
        let backend = self.backend.as_mut().ok_or(StorageError::ConnectionClosed)?;
        match backend.rollback() {
            Ok(()) => {
                info!(
                    "event=tx_rollback module=storage status=ok session={} tx={}",
                    self.id, tx.id
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=tx_rollback module=storage status=error session={} tx={} error={}",
                    self.id, tx.id, err
                );
                Err(StorageError::from_db(err, StorageError::Rollback))
            }
        }
    }

    /// Runs a read query and appends decoded rows to `dest`.
    ///
    /// Zero matching rows is not an error: `dest` is left as it was and a
    /// warning is logged. Returns the number of rows appended.
    pub fn query<T: FromRow>(
        &mut self,
        request: &QueryRequest,
        dest: &mut Vec<T>,
    ) -> StorageResult<usize> {
        debug!(
            "event=query module=storage status=start session={} args={} sql={}",
            self.id,
            request.args.len(),
            request.sql
        );
        let decoded = self.run("query", OnFailure::FollowAutoCommit, |backend| {
            let rows = backend
                .query(&request.sql, &request.args)
                .map_err(|err| StorageError::from_db(err, StorageError::Query))?;
            let mut decoded = Vec::with_capacity(rows.len());
            for row in &rows {
                decoded.push(T::from_row(row)?);
            }
            Ok(decoded)
        })?;

        let count = decoded.len();
        if count == 0 {
            warn!(
                "event=query module=storage status=empty session={} message=query returned no rows",
                self.id
            );
        }
        dest.extend(decoded);
        Ok(count)
    }

    /// Runs a mutation and returns the number of affected rows.
    ///
    /// A statement that affects no rows is reported as
    /// `StorageError::NoRowsAffected` and handled like any other failure.
    pub fn execute(&mut self, request: &QueryRequest) -> StorageResult<u64> {
        debug!(
            "event=execute module=storage status=start session={} args={} sql={}",
            self.id,
            request.args.len(),
            request.sql
        );
        self.run("execute", OnFailure::FollowAutoCommit, |backend| {
            let affected = backend
                .execute(&request.sql, &request.args)
                .map_err(|err| StorageError::from_db(err, StorageError::Query))?;
            if affected == 0 {
                return Err(StorageError::NoRowsAffected);
            }
            Ok(affected)
        })
    }

    /// Streams every row of `request.source` into `request.table`.
    ///
    /// The batch is all-or-nothing under auto-commit. An empty source is a
    /// successful no-op that still begins and commits.
    pub fn bulk_copy(&mut self, request: &CopyRequest<'_>) -> StorageResult<u64> {
        self.ensure_usable()?;
        validate_identifier("table", &request.table)?;
        validate_fields(&request.fields)?;
        let rows = request.source.to_rows()?;
        validate_row_widths(request.fields.len(), &rows)?;

        info!(
            "event=bulk_copy module=storage status=start session={} table={} rows={}",
            self.id,
            request.table,
            rows.len()
        );
        let written = self.run("bulk_copy", OnFailure::FollowAutoCommit, |backend| {
            if rows.is_empty() {
                return Ok(0);
            }
            backend
                .copy_in(&request.table, &request.fields, &rows)
                .map_err(|err| StorageError::from_db(err, StorageError::Query))
        })?;
        info!(
            "event=bulk_copy module=storage status=ok session={} table={} rows={}",
            self.id, request.table, written
        );
        Ok(written)
    }

    /// Builds one UPDATE statement; see [`build_update`].
    pub fn build_update<S: AsRef<str>>(
        &self,
        table: &str,
        fields: &[S],
        row: &[Value],
    ) -> StorageResult<(String, Vec<Value>)> {
        build_update(table, fields, row)
    }

    /// Applies one UPDATE per source row, sequentially, in one transaction.
    ///
    /// The first failing row aborts the batch and rolls the transaction back,
    /// so none of the batch's updates are kept. Returns total affected rows.
    pub fn update_from_rows(&mut self, request: &UpdateRequest<'_>) -> StorageResult<u64> {
        self.ensure_usable()?;
        validate_identifier("table", &request.table)?;
        if request.fields.is_empty() {
            return Err(StorageError::Validation(
                "update field list is empty".to_string(),
            ));
        }
        let rows = request.source.to_rows()?;
        validate_row_widths(request.fields.len(), &rows)?;
        let statements = rows
            .iter()
            .map(|row| build_update(&request.table, &request.fields, row))
            .collect::<StorageResult<Vec<_>>>()?;

        info!(
            "event=update_rows module=storage status=start session={} table={} rows={}",
            self.id,
            request.table,
            statements.len()
        );
        self.run("update_rows", OnFailure::Rollback, |backend| {
            let mut affected = 0u64;
            for (sql, args) in &statements {
                affected += backend
                    .execute(sql, args)
                    .map_err(|err| StorageError::from_db(err, StorageError::Query))?;
            }
            Ok(affected)
        })
    }

    /// Checks that the connection still answers.
    pub fn ping(&mut self) -> StorageResult<()> {
        self.ensure_usable()?;
        let backend = self.backend.as_mut().ok_or(StorageError::ConnectionClosed)?;
        backend
            .ping()
            .map_err(|err| StorageError::from_db(err, StorageError::Connection))
    }

    /// Closes the connection, rolling back any transaction still open.
    ///
    /// The connection is closed even when that rollback fails; the rollback
    /// error is then returned in place of the close outcome.
    pub fn release(&mut self) -> StorageResult<()> {
        if self.backend.is_none() {
            return Err(StorageError::ConnectionClosed);
        }
        let mut rollback_result = Ok(());
        if self.tx.is_some() {
            warn!(
                "event=session_release module=storage status=pending_tx session={}",
                self.id
            );
            rollback_result = self.rollback();
        }

        let backend = self.backend.take().ok_or(StorageError::ConnectionClosed)?;
        let close_result = backend
            .close()
            .map_err(|err| StorageError::from_db(err, StorageError::Close));
        if let Err(err) = &rollback_result {
            warn!(
                "event=session_release module=storage status=rollback_failed session={} error={}",
                self.id, err
            );
            if let Err(close_err) = &close_result {
                warn!(
                    "event=session_release module=storage status=close_failed session={} error={}",
                    self.id, close_err
                );
            }
            return rollback_result;
        }
        close_result?;
        info!(
            "event=session_release module=storage status=ok session={} app={}",
            self.id,
            self.settings.app_name()
        );
        Ok(())
    }

    /// Runs one top-level operation inside the session transaction and
    /// applies the commit / rollback / close policy to its outcome.
    fn run<T>(
        &mut self,
        operation: &str,
        on_failure: OnFailure,
        work: impl FnOnce(&mut dyn Backend) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let started_at = Instant::now();
        self.begin()?;
        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(StorageError::ConnectionClosed)?;

        match work(backend) {
            Ok(value) => {
                if self.settings.auto_commit() {
                    self.commit()?;
                    if self.settings.auto_close() {
                        self.release()?;
                    }
                }
                debug!(
                    "event={} module=storage status=ok session={} duration_ms={}",
                    operation,
                    self.id,
                    started_at.elapsed().as_millis()
                );
                Ok(value)
            }
            Err(err) => {
                error!(
                    "event={} module=storage status=error session={} duration_ms={} error={}",
                    operation,
                    self.id,
                    started_at.elapsed().as_millis(),
                    err
                );
                let roll_back = match on_failure {
                    OnFailure::FollowAutoCommit => self.settings.auto_commit(),
                    OnFailure::Rollback => true,
                };
                if roll_back && self.tx.is_some() {
                    if let Err(rollback_err) = self.rollback() {
                        error!(
                            "event={} module=storage status=rollback_failed session={} original_error={}",
                            operation, self.id, err
                        );
                        return Err(rollback_err);
                    }
                }
                Err(err)
            }
        }
    }
}

impl Drop for StorageSession {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            if self.tx.is_some() {
                warn!(
                    "event=session_drop module=storage status=pending_tx session={}",
                    self.id
                );
            }
            if let Err(err) = backend.close() {
                warn!(
                    "event=session_drop module=storage status=error session={} error={}",
                    self.id, err
                );
            }
        }
    }
}

fn validate_fields(fields: &[String]) -> StorageResult<()> {
    if fields.is_empty() {
        return Err(StorageError::Validation("field list is empty".to_string()));
    }
    for field in fields {
        validate_identifier("column", field)?;
    }
    Ok(())
}
