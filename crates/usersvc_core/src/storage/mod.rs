//! Storage session core.
//!
//! # Responsibility
//! - Own one connection per session and coordinate its single transaction.
//! - Execute parameterized reads and writes, bulk loads and batched updates.
//! - Classify every failure into one `StorageError` taxonomy.
//!
//! # See also
//! - `db` for the connection layer and value types.

mod error;
mod extract;
mod request;
mod session;
mod update;

pub use error::{ErrorKind, StorageError, StorageResult};
pub use extract::{extract_rows, transport_fields_to_row, RowSource, ToRow, BOOKKEEPING_FIELDS};
pub use request::{CopyRequest, QueryRequest, UpdateRequest};
pub use session::{StorageSession, TransactionId};
pub use update::{build_update, PREDICATE_MARKER};
