use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, warn};

use crate::accumulator::Batch;
use crate::config::TimescaleSettings;
use crate::delivery::DeliveryClient;
use crate::error::{DeliveryError, SchemaError};
use crate::record::Record;
use crate::schema::{
    quote_ident, Column, ColumnType, DestinationSchema, SchemaManager, SchemaPolicy, SchemaStore,
    TypeFamily, KEY_COLUMN, TIMESTAMP_COLUMN,
};

/// Postgres caps a statement at this many bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// Sorts a sqlx error into retryable or not.
///
/// Connection loss, resource exhaustion, serialization failures and constraint
/// violations may clear up on their own. Authentication, permission, syntax
/// and data errors will fail again on every retry.
pub fn classify(error: sqlx::Error) -> DeliveryError {
    let transient = match &error {
        sqlx::Error::Database(db) => is_transient_sqlstate(db.code().as_deref()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        _ => false,
    };

    if transient {
        DeliveryError::transient(error)
    } else {
        DeliveryError::fatal(error)
    }
}

fn is_transient_sqlstate(code: Option<&str>) -> bool {
    match code.and_then(|code| code.get(..2)) {
        // invalid authorization, syntax or access rule violation, data exception,
        // invalid schema name, feature not supported
        Some("28" | "42" | "22" | "3F" | "0A") => false,
        Some(_) => true,
        None => false,
    }
}

/// Catalog access for one table, through the shared pool.
pub struct PgSchemaStore {
    pool: PgPool,
    schema: String,
    table: String,
    create_hypertable: bool,
}

impl PgSchemaStore {
    pub fn new(pool: PgPool, settings: &TimescaleSettings) -> Self {
        Self {
            pool,
            schema: settings.schema.clone(),
            table: settings.table.clone(),
            create_hypertable: settings.create_hypertable,
        }
    }

    fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

#[async_trait]
impl SchemaStore for PgSchemaStore {
    async fn load_columns(&self) -> Result<Vec<Column>, DeliveryError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
SELECT column_name::text, udt_schema::text, udt_name::text
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(name, udt_schema, udt_name)| {
                Column::new(name, ColumnType::from_catalog(&udt_schema, &udt_name))
            })
            .collect())
    }

    async fn create_table(&self) -> Result<(), DeliveryError> {
        let qualified = self.qualified();
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} {} NOT NULL, {} {})",
            qualified,
            quote_ident(TIMESTAMP_COLUMN),
            ColumnType::timestamptz().sql_name(),
            quote_ident(KEY_COLUMN),
            ColumnType::text().sql_name(),
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(classify)?;

        if self.create_hypertable {
            // Plain Postgres without the timescaledb extension is fine too
            match sqlx::query(
                "SELECT create_hypertable($1::regclass, $2::name, if_not_exists => TRUE)",
            )
            .bind(&qualified)
            .bind(TIMESTAMP_COLUMN)
            .execute(&self.pool)
            .await
            {
                Ok(_) => info!(table = %qualified, "converted destination table to a hypertable"),
                Err(e) => warn!(
                    table = %qualified,
                    error = %e,
                    "could not convert destination table to a hypertable"
                ),
            }
        }

        Ok(())
    }

    async fn add_columns(&self, columns: &[Column]) -> Result<(), DeliveryError> {
        if columns.is_empty() {
            return Ok(());
        }

        let additions: Vec<String> = columns
            .iter()
            .map(|column| {
                format!(
                    "ADD COLUMN IF NOT EXISTS {} {}",
                    quote_ident(&column.name),
                    column.column_type.sql_name()
                )
            })
            .collect();
        let ddl = format!("ALTER TABLE {} {}", self.qualified(), additions.join(", "));

        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    fn table_name(&self) -> String {
        self.qualified()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnSource {
    Timestamp,
    Key,
    Field,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WriteColumn {
    name: String,
    column_type: ColumnType,
    source: ColumnSource,
}

/// Lists the columns one insert for `batch` writes: the metadata columns the
/// table has, then every payload field in name order.
fn write_columns(
    batch: &Batch,
    schema: &DestinationSchema,
) -> Result<Vec<WriteColumn>, DeliveryError> {
    let mut columns = Vec::new();

    for (name, source) in [
        (TIMESTAMP_COLUMN, ColumnSource::Timestamp),
        (KEY_COLUMN, ColumnSource::Key),
    ] {
        if let Some(column_type) = schema.column(name) {
            columns.push(WriteColumn {
                name: name.to_owned(),
                column_type: column_type.clone(),
                source,
            });
        }
    }

    let fields: BTreeSet<&String> = batch
        .records()
        .iter()
        .flat_map(|record| record.payload().keys())
        .collect();
    for field in fields {
        let column_type = schema
            .column(field)
            .ok_or_else(|| SchemaError::UnknownFields(vec![field.clone()]))?;
        columns.push(WriteColumn {
            name: field.clone(),
            column_type: column_type.clone(),
            source: ColumnSource::Field,
        });
    }

    Ok(columns)
}

fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).max(1)
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Binds the value of one cell, with an explicit cast to the column type so
/// Postgres never has to guess, e.g. for text going into a timestamp column.
fn push_value(
    row: &mut Separated<'_, '_, Postgres, &'static str>,
    column: &WriteColumn,
    record: &Record,
) {
    match column.source {
        ColumnSource::Timestamp => {
            row.push_bind(record.timestamp());
        }
        ColumnSource::Key => {
            row.push_bind(record.key().map(str::to_owned));
        }
        ColumnSource::Field => {
            let value = record.payload().get(&column.name).filter(|v| !v.is_null());
            match column.column_type.family() {
                TypeFamily::Boolean => {
                    row.push_bind(value.and_then(Value::as_bool));
                }
                TypeFamily::Integer => {
                    row.push_bind(value.and_then(Value::as_i64));
                }
                TypeFamily::Float => {
                    row.push_bind(value.and_then(Value::as_f64));
                }
                TypeFamily::Json => {
                    row.push_bind(value.cloned().map(Json));
                }
                TypeFamily::Text | TypeFamily::Timestamp | TypeFamily::Other => {
                    row.push_bind(value.and_then(text_of));
                }
            }
        }
    }
    row.push_unseparated(format!("::{}", column.column_type.sql_name()));
}

/// Writes batches to one TimescaleDB (or plain Postgres) table.
///
/// Each batch goes in a single transaction, split into as many multi-row
/// inserts as the bind parameter limit requires. Either all its rows are
/// visible or none are.
pub struct TimescaleClient {
    pool: PgPool,
    table: String,
    schema: Arc<SchemaManager>,
}

impl TimescaleClient {
    pub async fn connect(
        settings: &TimescaleSettings,
        policy: SchemaPolicy,
    ) -> Result<(Self, Arc<SchemaManager>), DeliveryError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(settings.connect_options())
            .await
            .map_err(classify)?;
        info!(
            host = %settings.host,
            database = %settings.database,
            table = %settings.qualified_table(),
            "connected to timescaledb"
        );

        let store = Arc::new(PgSchemaStore::new(pool.clone(), settings));
        let schema = Arc::new(SchemaManager::new(store, policy));
        schema.initialize().await?;

        Ok((
            Self {
                pool,
                table: settings.qualified_table(),
                schema: schema.clone(),
            },
            schema,
        ))
    }
}

#[async_trait]
impl DeliveryClient for TimescaleClient {
    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }

        let schema = self.schema.snapshot().await;
        let columns = write_columns(batch, &schema)?;
        if columns.is_empty() {
            warn!(
                partition = batch.partition(),
                table = %self.table,
                "batch has no writable columns, skipping insert"
            );
            return Ok(());
        }

        let column_list = columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tx = self.pool.begin().await.map_err(classify)?;
        for chunk in batch.records().chunks(rows_per_statement(columns.len())) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", self.table, column_list));
            builder.push_values(chunk, |mut row, record| {
                for column in &columns {
                    push_value(&mut row, column, record);
                }
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "timescaledb"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::{json, Map};
    use tokio::time::Instant;

    use super::*;
    use crate::accumulator::{BatchAccumulator, BatchSettings};

    fn batch(payloads: Vec<Value>) -> Batch {
        let mut acc = BatchAccumulator::new(BatchSettings {
            max_size: 1000,
            timeout: Duration::from_secs(1),
        });
        let now = Instant::now();
        for (offset, payload) in payloads.into_iter().enumerate() {
            let Value::Object(fields) = payload else {
                panic!("test payloads are objects");
            };
            acc.add_at(Record::new(0, offset as i64, None, fields, Utc::now()), now);
        }
        acc.take(0).unwrap()
    }

    #[test]
    fn classifies_sqlstates() {
        // connection exception, serialization failure, too many connections,
        // admin shutdown, unique violation
        for code in ["08006", "40001", "53300", "57P01", "23505"] {
            assert!(is_transient_sqlstate(Some(code)), "{code}");
        }
        // bad password, undefined table, numeric out of range
        for code in ["28P01", "42P01", "22003"] {
            assert!(!is_transient_sqlstate(Some(code)), "{code}");
        }
        assert!(!is_transient_sqlstate(None));
    }

    #[test]
    fn classifies_driver_errors() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify(sqlx::Error::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionReset
        )))
        .is_transient());
        assert!(!classify(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn writes_metadata_then_sorted_fields() {
        let schema = DestinationSchema::new(vec![
            Column::new(TIMESTAMP_COLUMN, ColumnType::timestamptz()),
            Column::new(KEY_COLUMN, ColumnType::text()),
            Column::new("voltage", ColumnType::double_precision()),
            Column::new("panel_id", ColumnType::text()),
            Column::new("unused", ColumnType::bigint()),
        ]);
        let batch = batch(vec![
            json!({"voltage": 230.1}),
            json!({"panel_id": "p1", "voltage": 229}),
        ]);

        let columns = write_columns(&batch, &schema).unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(names, vec![TIMESTAMP_COLUMN, KEY_COLUMN, "panel_id", "voltage"]);
        assert_eq!(columns[0].source, ColumnSource::Timestamp);
        assert_eq!(columns[3].column_type, ColumnType::double_precision());
    }

    #[test]
    fn unknown_column_is_fatal() {
        let schema = DestinationSchema::new(vec![Column::new("a", ColumnType::bigint())]);
        let batch = batch(vec![json!({"a": 1, "b": 2})]);

        let err = write_columns(&batch, &schema).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn splits_statements_under_the_parameter_limit() {
        assert_eq!(rows_per_statement(1), 65_535);
        assert_eq!(rows_per_statement(10), 6_553);
        assert_eq!(rows_per_statement(100_000), 1);
        assert_eq!(rows_per_statement(0), 65_535);
    }

    #[test]
    fn renders_text_cells() {
        assert_eq!(text_of(&json!("abc")), Some("abc".to_owned()));
        assert_eq!(text_of(&json!(12)), Some("12".to_owned()));
        assert_eq!(text_of(&json!({"a": 1})), Some(r#"{"a":1}"#.to_owned()));
        assert_eq!(text_of(&Value::Null), None);
    }

    #[test]
    fn empty_payloads_write_only_metadata() {
        let schema = DestinationSchema::new(vec![Column::new(
            TIMESTAMP_COLUMN,
            ColumnType::timestamptz(),
        )]);
        let batch = batch(vec![Value::Object(Map::new())]);

        let columns = write_columns(&batch, &schema).unwrap();
        assert_eq!(columns.len(), 1);
    }
}
