//! Wide views over name/value rows.
//!
//! Derived tables often store one row per (item, attribute). A [`Pivot`]
//! turns that into one row per item with one column per attribute name. The
//! set of columns depends on the data, so building the view takes two
//! passes: collect the distinct names, then (re)create the view.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{Executor, SqliteConnection};
use tracing::debug;

/// Description of a pivot view.
#[derive(Debug, Clone)]
pub struct Pivot<'a> {
    /// Table holding one row per attribute.
    pub source: &'a str,
    /// Name of the view to (re)create.
    pub view: &'a str,
    /// Columns identifying one output row.
    pub keys: &'a [&'a str],
    /// Column holding the attribute name; its distinct values become columns.
    pub name: &'a str,
    /// Column holding the attribute value.
    pub value: &'a str,
}

fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

impl Pivot<'_> {
    /// The `CREATE VIEW` statement for the given attribute names.
    pub fn sql(&self, names: &[String]) -> String {
        let keys: Vec<String> = self.keys.iter().map(|key| ident(key)).collect();
        let mut columns = keys.clone();
        for name in names {
            columns.push(format!(
                "MAX(CASE WHEN {} = {} THEN {} END) AS {}",
                ident(self.name),
                literal(name),
                ident(self.value),
                ident(name),
            ));
        }
        format!(
            "CREATE VIEW {} AS SELECT {} FROM {} GROUP BY {}",
            ident(self.view),
            columns.join(", "),
            ident(self.source),
            keys.join(", "),
        )
    }

    /// Rebuild the view from the names currently present in the source
    /// table. Returns those names, sorted.
    ///
    /// A pivot needs at least one key column to group by.
    pub fn create<'a>(&'a self, conn: &'a mut SqliteConnection) -> BoxFuture<'a, Result<Vec<String>>> {
        async move {
            if self.keys.is_empty() {
                exn::bail!(ErrorKind::InvalidData("pivot without key columns"));
            }
            let names: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT DISTINCT {name} FROM {source} WHERE {name} IS NOT NULL ORDER BY {name}",
                name = ident(self.name),
                source = ident(self.source),
            ))
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
            (&mut *conn).execute(sqlx::raw_sql(&format!("DROP VIEW IF EXISTS {}", ident(self.view))))
                .await
                .or_raise(|| ErrorKind::Database)?;
            (&mut *conn).execute(sqlx::raw_sql(&self.sql(&names)))
                .await
                .or_raise(|| ErrorKind::Database)?;
            debug!(view = self.view, columns = names.len(), "pivot view created");
            Ok(names)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    const PIVOT: Pivot<'static> = Pivot {
        source: "records",
        view: "frames",
        keys: &["file_id", "frame"],
        name: "name",
        value: "data",
    };

    #[test]
    fn test_sql_quotes_names() {
        let sql = PIVOT.sql(&["position".to_string(), "it's".to_string()]);
        assert_eq!(
            sql,
            "CREATE VIEW \"frames\" AS SELECT \"file_id\", \"frame\", \
             MAX(CASE WHEN \"name\" = 'position' THEN \"data\" END) AS \"position\", \
             MAX(CASE WHEN \"name\" = 'it''s' THEN \"data\" END) AS \"it's\" \
             FROM \"records\" GROUP BY \"file_id\", \"frame\""
        );
    }

    #[tokio::test]
    async fn test_create_pivots_rows() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql(
            "CREATE TABLE records (file_id INTEGER, frame INTEGER, name TEXT, data BLOB);
             INSERT INTO records VALUES (1, 0, 'position', 'p0'), (1, 0, 'velocity', 'v0'),
                                        (1, 1, 'position', 'p1'), (2, 0, 'box', 'b0');",
        )
        .execute(&mut conn)
        .await
        .unwrap();
        let names = PIVOT.create(&mut conn).await.unwrap();
        assert_eq!(names, vec!["box", "position", "velocity"]);

        let rows: Vec<(i64, i64, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT file_id, frame, box, position, velocity FROM frames ORDER BY file_id, frame",
        )
        .fetch_all(&mut conn)
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![
                (1, 0, None, Some("p0".to_string()), Some("v0".to_string())),
                (1, 1, None, Some("p1".to_string()), None),
                (2, 0, Some("b0".to_string()), None, None),
            ]
        );

        // Recreating picks up new names.
        sqlx::query("INSERT INTO records VALUES (2, 0, 'orientation', 'o0')")
            .execute(&mut conn)
            .await
            .unwrap();
        assert_eq!(PIVOT.create(&mut conn).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_create_requires_keys() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::raw_sql("CREATE TABLE records (name TEXT, data BLOB)")
            .execute(&mut conn)
            .await
            .unwrap();
        let keyless = Pivot { keys: &[], ..PIVOT };
        let err = keyless.create(&mut conn).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }
}
