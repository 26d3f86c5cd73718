//! PostgreSQL backend on `tokio-postgres`.
//!
//! # Responsibility
//! - Drive one PostgreSQL connection from synchronous session code.
//! - Bind `Value` arguments by the server-declared parameter type.
//! - Stream bulk loads through `COPY ... FROM STDIN` in text format.
//!
//! # Invariants
//! - The backend owns a private current-thread runtime; every call blocks
//!   the caller inside `block_on` and nothing runs between calls.
//! - Called from a worker of a multi-thread tokio runtime, calls run under
//!   `block_in_place`. Called from a current-thread tokio runtime, where
//!   blocking would stall every task, calls fail with `DbError::Driver`.
//!   This includes `spawn_blocking` threads of a current-thread runtime.
//!   Neither case panics, and dropping the backend never blocks.
//! - A fired cancellation scope aborts the in-flight statement with a
//!   server-side cancel request and surfaces `DbError::Cancelled`.
//!
//! # Column decoding
//! - `bool`, integer, float, `bytea`, `timestamp` and `timestamptz` map to
//!   their `Value` variants.
//! - `uuid`, `date`, `time`, `json` and `jsonb` are decoded to `Value::Text`
//!   in their canonical text form.
//! - Other text-like types decode as text. Anything else (`numeric`, arrays,
//!   ranges, enums) fails with a query error; cast it to `text` in SQL.

use super::value::{Row, Value};
use super::{quote_ident_path, Backend, DbError, DbResult, Dialect, TxOptions};
use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use log::{debug, error, warn};
use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, CopyInSink, NoTls};
use tokio_util::sync::CancellationToken;

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Private driver runtime.
///
/// Shut down in the background when dropped, so a backend dropped inside an
/// async context does not panic.
struct DriverRuntime(Option<Runtime>);

impl DriverRuntime {
    fn new() -> DbResult<Self> {
        blocking_allowed()?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(DbError::Io)?;
        Ok(Self(Some(runtime)))
    }

    fn block_on<F: Future>(&self, future: F) -> DbResult<F::Output> {
        let runtime = self
            .0
            .as_ref()
            .ok_or_else(|| DbError::Driver("driver runtime is shut down".to_string()))?;
        match Handle::try_current() {
            Err(_) => Ok(runtime.block_on(future)),
            Ok(_) => {
                blocking_allowed()?;
                Ok(tokio::task::block_in_place(|| runtime.block_on(future)))
            }
        }
    }

    fn spawn<F>(&self, future: F) -> DbResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.0
            .as_ref()
            .map(|runtime| runtime.spawn(future))
            .ok_or_else(|| DbError::Driver("driver runtime is shut down".to_string()))
    }
}

impl Drop for DriverRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Rejects blocking calls made from a current-thread tokio runtime.
fn blocking_allowed() -> DbResult<()> {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() != RuntimeFlavor::MultiThread => Err(DbError::Driver(
            "blocking session used inside a current-thread async runtime".to_string(),
        )),
        _ => Ok(()),
    }
}

pub struct PostgresBackend {
    runtime: DriverRuntime,
    client: Client,
    connection: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl PostgresBackend {
    /// Connects with `config`; the connection driver task lives on the
    /// backend's own runtime.
    pub fn connect(config: &Config, cancel: CancellationToken) -> DbResult<Self> {
        let runtime = DriverRuntime::new()?;

        let (client, connection) = runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DbError::Cancelled),
                connected = config.connect(NoTls) => connected.map_err(DbError::Postgres),
            }
        })??;

        let connection = runtime.spawn(async move {
            if let Err(err) = connection.await {
                error!("event=pg_connection module=db status=error error={err}");
            }
        })?;

        Ok(Self {
            runtime,
            client,
            connection: Some(connection),
            cancel,
        })
    }

    fn run<T, F>(&self, operation: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let cancel = self.cancel.clone();
        let cancel_token = self.client.cancel_token();

        self.runtime.block_on(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if let Err(err) = cancel_token.cancel_query(NoTls).await {
                        warn!("event=pg_cancel module=db status=error error={err}");
                    }
                    Err(DbError::Cancelled)
                }
                result = operation => result.map_err(DbError::Postgres),
            }
        })?
    }
}

fn bind_params(args: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter().map(|arg| arg as &(dyn ToSql + Sync)).collect()
}

impl Backend for PostgresBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn begin(&mut self, options: &TxOptions) -> DbResult<()> {
        let statement = options.begin_statement();
        self.run(self.client.batch_execute(statement.as_str()))
    }

    fn commit(&mut self) -> DbResult<()> {
        self.run(self.client.batch_execute("COMMIT"))
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.run(self.client.batch_execute("ROLLBACK"))
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        let params = bind_params(args);
        let rows = self.run(self.client.query(sql, &params))?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect::<Vec<_>>()
            .into();

        rows.iter()
            .map(|row| decode_row(row, &columns).map_err(DbError::Postgres))
            .collect()
    }

    fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        let params = bind_params(args);
        self.run(self.client.execute(sql, &params))
    }

    fn copy_in(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> DbResult<u64> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            quote_ident_path(table),
            columns
                .iter()
                .map(|column| quote_ident_path(column))
                .collect::<Vec<_>>()
                .join(", ")
        );
        debug!("event=pg_copy module=db status=start table={table} rows={}", rows.len());

        let client = &self.client;
        self.run(async move {
            let sink: CopyInSink<Bytes> = client.copy_in(statement.as_str()).await?;
            futures::pin_mut!(sink);

            let mut buffer = BytesMut::with_capacity(COPY_CHUNK_BYTES);
            for row in rows {
                encode_copy_row(row, &mut buffer);
                if buffer.len() >= COPY_CHUNK_BYTES {
                    sink.send(buffer.split().freeze()).await?;
                }
            }
            if !buffer.is_empty() {
                sink.send(buffer.freeze()).await?;
            }
            sink.as_mut().finish().await
        })
    }

    fn ping(&mut self) -> DbResult<()> {
        self.run(self.client.simple_query("SELECT 1")).map(|_| ())
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        let Self {
            runtime,
            client,
            connection,
            ..
        } = *self;
        // Dropping the client sends Terminate; the driver task then finishes.
        drop(client);
        if let Some(handle) = connection {
            runtime
                .block_on(handle)?
                .map_err(|err| DbError::Driver(format!("connection task failed: {err}")))?;
        }
        Ok(())
    }
}

fn decode_row(row: &tokio_postgres::Row, columns: &Arc<[String]>) -> Result<Row, tokio_postgres::Error> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        values.push(decode_cell(row, index, column.type_())?);
    }
    Ok(Row::new(Arc::clone(columns), values))
}

fn decode_cell(
    row: &tokio_postgres::Row,
    index: usize,
    ty: &Type,
) -> Result<Value, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(index)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)?
            .map(|number| Value::Int(i64::from(number))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)?
            .map(|number| Value::Int(i64::from(number))),
        Type::INT8 => row.try_get::<_, Option<i64>>(index)?.map(Value::Int),
        Type::OID => row
            .try_get::<_, Option<u32>>(index)?
            .map(|number| Value::Int(i64::from(number))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)?
            .map(|number| Value::Float(f64::from(number))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index)?.map(Value::Float),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index)?.map(Value::Bytes),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(index)?
            .map(Value::Timestamp),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(index)?
            .map(|at| Value::Timestamp(at.naive_utc())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(index)?
            .map(|id| Value::Text(id.to_string())),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(index)?
            .map(|day| Value::Text(day.format("%Y-%m-%d").to_string())),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(index)?
            .map(|at| Value::Text(at.format("%H:%M:%S%.f").to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)?
            .map(|json| Value::Text(json.to_string())),
        _ => row.try_get::<_, Option<String>>(index)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(flag) => flag.to_sql_checked(ty, out),
            Value::Int(number) => match *ty {
                Type::INT2 => i16::try_from(*number)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*number)?.to_sql_checked(ty, out),
                Type::OID => u32::try_from(*number)?.to_sql_checked(ty, out),
                Type::FLOAT4 => (*number as f32).to_sql_checked(ty, out),
                Type::FLOAT8 => (*number as f64).to_sql_checked(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR => {
                    number.to_string().to_sql_checked(ty, out)
                }
                _ => number.to_sql_checked(ty, out),
            },
            Value::Float(number) => match *ty {
                Type::FLOAT4 => (*number as f32).to_sql_checked(ty, out),
                _ => number.to_sql_checked(ty, out),
            },
            Value::Text(text) => match *ty {
                Type::UUID => uuid::Uuid::parse_str(text)?.to_sql_checked(ty, out),
                Type::DATE => chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")?
                    .to_sql_checked(ty, out),
                Type::JSON | Type::JSONB => {
                    serde_json::from_str::<serde_json::Value>(text)?.to_sql_checked(ty, out)
                }
                _ => text.to_sql_checked(ty, out),
            },
            Value::Bytes(bytes) => bytes.to_sql_checked(ty, out),
            Value::Timestamp(at) => match *ty {
                Type::TIMESTAMPTZ => at.and_utc().to_sql_checked(ty, out),
                _ => at.to_sql_checked(ty, out),
            },
        }
    }

    // Every variant re-checks against the concrete type in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Appends one row in PostgreSQL COPY text format.
fn encode_copy_row(row: &[Value], out: &mut BytesMut) {
    for (index, value) in row.iter().enumerate() {
        if index > 0 {
            out.put_u8(b'\t');
        }
        match value {
            Value::Null => out.put_slice(b"\\N"),
            Value::Bool(flag) => out.put_u8(if *flag { b't' } else { b'f' }),
            Value::Int(number) => out.put_slice(number.to_string().as_bytes()),
            Value::Float(number) => out.put_slice(format_copy_float(*number).as_bytes()),
            Value::Text(text) => escape_copy_text(text, out),
            Value::Bytes(bytes) => {
                // bytea hex input `\x..`, with the backslash escaped for COPY.
                out.put_slice(b"\\\\x");
                out.put_slice(hex::encode(bytes).as_bytes());
            }
            Value::Timestamp(at) => {
                out.put_slice(at.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes());
            }
        }
    }
    out.put_u8(b'\n');
}

fn format_copy_float(number: f64) -> String {
    if number.is_nan() {
        "NaN".to_string()
    } else if number.is_infinite() {
        let spelled = if number > 0.0 { "Infinity" } else { "-Infinity" };
        spelled.to_string()
    } else {
        number.to_string()
    }
}

fn escape_copy_text(text: &str, out: &mut BytesMut) {
    for ch in text.chars() {
        match ch {
            '\\' => out.put_slice(b"\\\\"),
            '\n' => out.put_slice(b"\\n"),
            '\r' => out.put_slice(b"\\r"),
            '\t' => out.put_slice(b"\\t"),
            other => {
                let mut utf8 = [0u8; 4];
                out.put_slice(other.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
}
