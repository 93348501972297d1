use crate::engine::Engine;
use crate::error::{ErrorKind, Result};
use crate::lazy::{self, LazyLocator};
use crate::value::{Row, Value};
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use sqlx::Sqlite;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send>>;

type Statement<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind `args` to the `?` parameters of `sql`, in order.
pub(crate) fn statement(sql: &str, args: Vec<Value>) -> Statement<'_> {
    args.into_iter().fold(sqlx::query(sql), |query, arg| match arg {
        Value::Null => query.bind(None::<i64>),
        Value::Integer(value) => query.bind(value),
        Value::Real(value) => query.bind(value),
        Value::Text(value) => query.bind(value),
        Value::Blob(value) => query.bind(value),
    })
}

/// A statement against the index, built by [`Engine::query`].
///
/// Result rows are fetched from the store in one go, then lazy values are
/// decoded row by row as the stream is polled. Nothing is cached: reading
/// the same lazy value twice decodes it twice.
#[must_use]
pub struct Query {
    engine: Engine,
    sql: String,
    args: Vec<Value>,
}
impl Query {
    pub(crate) fn new(engine: Engine, sql: impl Into<String>) -> Self {
        Self {
            engine,
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Bind the next `?` parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    async fn raw(&self) -> Result<Vec<SqliteRow>> {
        let query = statement(&self.sql, self.args.clone());
        // Rows are collected before decoding starts: decoders query the store
        // themselves and an in-memory store only has one connection.
        query.fetch_all(self.engine.pool()).await.or_raise(|| ErrorKind::Database)
    }

    async fn decode_row(&self, columns: Arc<[String]>, raw: &SqliteRow) -> Result<Row> {
        let mut values = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            let value = Value::from_row(raw, index)?;
            values.push(self.materialize(value).await?);
        }
        Ok(Row::new(columns, values))
    }

    async fn materialize(&self, value: Value) -> Result<Value> {
        match value {
            Value::Blob(bytes) if LazyLocator::is_locator(&bytes) => match LazyLocator::parse(&bytes) {
                Ok(locator) => lazy::decode(self.engine.registry(), self.engine.decoders(), &locator).await,
                // Plain data that happens to share the prefix.
                Err(err) => {
                    debug!(error = ?err, "blob is not a lazy locator");
                    Ok(Value::Blob(bytes))
                },
            },
            value => Ok(value),
        }
    }

    pub fn fetch(self) -> RowStream {
        Box::pin(stream! {
            let rows = match self.raw().await {
                Ok(rows) => rows,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut columns: Option<Arc<[String]>> = None;
            for raw in &rows {
                let columns = Arc::clone(columns.get_or_insert_with(|| Row::columns_of(raw)));
                yield self.decode_row(columns, raw).await;
            }
        })
    }

    pub async fn fetch_all(self) -> Result<Vec<Row>> {
        self.fetch().try_collect().await
    }

    /// First column of the first row, if there is one.
    pub async fn fetch_scalar(self) -> Result<Option<Value>> {
        let mut rows = self.fetch();
        Ok(rows.try_next().await?.and_then(|row| row.into_values().into_iter().next()))
    }
}
