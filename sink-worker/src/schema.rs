use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::accumulator::Batch;
use crate::error::{DeliveryError, SchemaError};
use crate::metrics_consts::SCHEMA_COLUMNS_ADDED;

/// Postgres truncates identifiers past this many bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Columns the sink writes besides the payload fields.
pub const TIMESTAMP_COLUMN: &str = "__timestamp";
pub const KEY_COLUMN: &str = "__key";

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// What a column can hold, coarse enough to decide which json values fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeFamily {
    Boolean,
    Integer,
    Float,
    Text,
    Json,
    Timestamp,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnType {
    family: TypeFamily,
    udt_schema: String,
    udt_name: String,
}

impl ColumnType {
    fn builtin(family: TypeFamily, udt_name: &str) -> Self {
        Self {
            family,
            udt_schema: "pg_catalog".to_owned(),
            udt_name: udt_name.to_owned(),
        }
    }

    pub fn boolean() -> Self {
        Self::builtin(TypeFamily::Boolean, "bool")
    }

    pub fn bigint() -> Self {
        Self::builtin(TypeFamily::Integer, "int8")
    }

    pub fn double_precision() -> Self {
        Self::builtin(TypeFamily::Float, "float8")
    }

    pub fn text() -> Self {
        Self::builtin(TypeFamily::Text, "text")
    }

    pub fn jsonb() -> Self {
        Self::builtin(TypeFamily::Json, "jsonb")
    }

    pub fn timestamptz() -> Self {
        Self::builtin(TypeFamily::Timestamp, "timestamptz")
    }

    /// Maps a catalog type, as found in `information_schema.columns`.
    pub fn from_catalog(udt_schema: &str, udt_name: &str) -> Self {
        let family = match udt_name {
            "bool" => TypeFamily::Boolean,
            "int2" | "int4" | "int8" => TypeFamily::Integer,
            "float4" | "float8" | "numeric" => TypeFamily::Float,
            "text" | "varchar" | "bpchar" | "name" | "citext" => TypeFamily::Text,
            "json" | "jsonb" => TypeFamily::Json,
            "timestamp" | "timestamptz" | "date" => TypeFamily::Timestamp,
            _ => TypeFamily::Other,
        };

        Self {
            family,
            udt_schema: udt_schema.to_owned(),
            udt_name: udt_name.to_owned(),
        }
    }

    pub fn family(&self) -> TypeFamily {
        self.family
    }

    /// The qualified type name, usable both in DDL and as a cast target.
    pub fn sql_name(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.udt_schema),
            quote_ident(&self.udt_name)
        )
    }

    /// Whether values of `kind` can be written to a column of this type.
    pub fn accepts(&self, kind: ValueKind) -> bool {
        match (self.family, kind) {
            (_, ValueKind::Null) => true,
            (TypeFamily::Boolean, ValueKind::Boolean) => true,
            (TypeFamily::Integer, ValueKind::Integer) => true,
            (TypeFamily::Float, ValueKind::Integer | ValueKind::Float) => true,
            (TypeFamily::Text | TypeFamily::Json | TypeFamily::Other, _) => true,
            (TypeFamily::Timestamp, ValueKind::String) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.udt_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// The shape of a json value, as far as column typing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Json,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::Number(n) if n.as_i64().is_some() => ValueKind::Integer,
            Value::Number(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Array(_) | Value::Object(_) => ValueKind::Json,
        }
    }

    /// Merges the kinds seen for one field across a batch. Integers and
    /// floats widen to float, nulls fit anything, other mixes do not merge.
    fn merge(self, other: ValueKind) -> Option<ValueKind> {
        match (self, other) {
            (a, b) if a == b => Some(a),
            (ValueKind::Null, b) => Some(b),
            (a, ValueKind::Null) => Some(a),
            (ValueKind::Integer, ValueKind::Float) | (ValueKind::Float, ValueKind::Integer) => {
                Some(ValueKind::Float)
            }
            _ => None,
        }
    }

    /// The type of a column created for values of this kind.
    pub fn column_type(self) -> ColumnType {
        match self {
            ValueKind::Boolean => ColumnType::boolean(),
            ValueKind::Integer => ColumnType::bigint(),
            ValueKind::Float => ColumnType::double_precision(),
            ValueKind::String | ValueKind::Null => ColumnType::text(),
            ValueKind::Json => ColumnType::jsonb(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Json => "json",
        }
    }
}

/// Infers one kind per payload field over the whole batch.
pub fn infer_fields(batch: &Batch) -> Result<BTreeMap<String, ValueKind>, SchemaError> {
    let mut fields: BTreeMap<String, ValueKind> = BTreeMap::new();

    for record in batch.records() {
        for (name, value) in record.payload() {
            let kind = ValueKind::of(value);
            match fields.get_mut(name) {
                None => {
                    fields.insert(name.clone(), kind);
                }
                Some(seen) => {
                    let current = *seen;
                    *seen = current.merge(kind).ok_or_else(|| SchemaError::MixedTypes {
                        field: name.clone(),
                        first: current.as_str(),
                        second: kind.as_str(),
                    })?;
                }
            }
        }
    }

    Ok(fields)
}

/// The destination's column set, as last read from the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationSchema {
    columns: HashMap<String, ColumnType>,
}

impl DestinationSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|c| (c.name, c.column_type))
                .collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnType> {
        self.columns.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.columns.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFieldPolicy {
    Fail,
    Ignore,
}

impl FromStr for UnknownFieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(UnknownFieldPolicy::Fail),
            "ignore" => Ok(UnknownFieldPolicy::Ignore),
            other => Err(format!("unknown field policy {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaPolicy {
    pub auto_update: bool,
    pub unknown_fields: UnknownFieldPolicy,
}

/// Catalog access for the destination table. Errors come back already
/// classified, so a dropped connection while altering the table is retried
/// like any other transient failure.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Returns the table's columns, or an empty list when the table does not exist.
    async fn load_columns(&self) -> Result<Vec<Column>, DeliveryError>;

    /// Creates the table with only the metadata columns.
    async fn create_table(&self) -> Result<(), DeliveryError>;

    /// Adds nullable columns, skipping any that appeared concurrently.
    async fn add_columns(&self, columns: &[Column]) -> Result<(), DeliveryError>;

    /// Human readable table name for logs and errors.
    fn table_name(&self) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChange {
    Unchanged,
    Added(Vec<String>),
    Dropped(Vec<String>),
}

/// Keeps the destination table able to hold every field of the batches about
/// to be written.
///
/// Shared by all partition workers. The lock is held for a whole
/// reconciliation so two partitions never race on the same ALTER TABLE.
pub struct SchemaManager {
    store: Arc<dyn SchemaStore>,
    policy: SchemaPolicy,
    known: Mutex<Arc<DestinationSchema>>,
}

impl SchemaManager {
    pub fn new(store: Arc<dyn SchemaStore>, policy: SchemaPolicy) -> Self {
        Self {
            store,
            policy,
            known: Mutex::new(Arc::new(DestinationSchema::default())),
        }
    }

    /// Loads the destination schema, creating the table first when allowed.
    pub async fn initialize(&self) -> Result<Arc<DestinationSchema>, SchemaError> {
        let mut known = self.known.lock().await;

        let mut columns = self.store.load_columns().await.map_err(SchemaError::Store)?;
        if columns.is_empty() {
            if !self.policy.auto_update {
                return Err(SchemaError::MissingTable(self.store.table_name()));
            }
            info!(table = %self.store.table_name(), "creating destination table");
            self.store.create_table().await.map_err(SchemaError::Store)?;
            columns = self.store.load_columns().await.map_err(SchemaError::Store)?;
        }

        let schema = Arc::new(DestinationSchema::new(columns));
        info!(
            table = %self.store.table_name(),
            columns = schema.len(),
            "loaded destination schema"
        );
        *known = schema.clone();
        Ok(schema)
    }

    /// The schema as of the last reconciliation.
    pub async fn snapshot(&self) -> Arc<DestinationSchema> {
        self.known.lock().await.clone()
    }

    /// Makes sure every field of `batch` has a compatible column. Depending on
    /// the policy, unknown fields get new columns, fail the batch, or are
    /// stripped from its records.
    pub async fn reconcile(&self, batch: &mut Batch) -> Result<SchemaChange, SchemaError> {
        let fields = infer_fields(batch)?;
        let mut known = self.known.lock().await;

        let unknown = check_fields(&known, &fields)?;
        if unknown.is_empty() {
            return Ok(SchemaChange::Unchanged);
        }

        if !self.policy.auto_update {
            let names: Vec<String> = unknown.into_iter().map(|c| c.name).collect();
            return match self.policy.unknown_fields {
                UnknownFieldPolicy::Fail => Err(SchemaError::UnknownFields(names)),
                UnknownFieldPolicy::Ignore => {
                    warn!(
                        partition = batch.partition(),
                        fields = ?names,
                        "dropping fields missing from the destination"
                    );
                    for record in batch.records_mut() {
                        record.remove_fields(&names);
                    }
                    Ok(SchemaChange::Dropped(names))
                }
            };
        }

        self.store
            .add_columns(&unknown)
            .await
            .map_err(SchemaError::Store)?;

        // Another sink may have added the same column first with a different
        // type, so the catalog has the final word
        let reloaded = Arc::new(DestinationSchema::new(
            self.store.load_columns().await.map_err(SchemaError::Store)?,
        ));
        *known = reloaded.clone();
        let still_unknown = check_fields(&reloaded, &fields)?;
        if !still_unknown.is_empty() {
            return Err(SchemaError::UnknownFields(
                still_unknown.into_iter().map(|c| c.name).collect(),
            ));
        }

        let names: Vec<String> = unknown.into_iter().map(|c| c.name).collect();
        metrics::counter!(SCHEMA_COLUMNS_ADDED).increment(names.len() as u64);
        info!(
            table = %self.store.table_name(),
            columns = ?names,
            "added columns to destination table"
        );
        Ok(SchemaChange::Added(names))
    }
}

/// Checks every field against the known columns, and returns the columns that
/// would have to be created for the fields that have none.
fn check_fields(
    schema: &DestinationSchema,
    fields: &BTreeMap<String, ValueKind>,
) -> Result<Vec<Column>, SchemaError> {
    let mut missing = Vec::new();

    for (name, kind) in fields {
        validate_column_name(name)?;
        match schema.column(name) {
            Some(existing) if existing.accepts(*kind) => {}
            Some(existing) => {
                return Err(SchemaError::TypeConflict {
                    column: name.clone(),
                    existing: existing.clone(),
                    inferred: kind.as_str(),
                })
            }
            None => missing.push(Column::new(name.clone(), kind.column_type())),
        }
    }

    Ok(missing)
}

fn validate_column_name(name: &str) -> Result<(), SchemaError> {
    if name == TIMESTAMP_COLUMN || name == KEY_COLUMN {
        return Err(SchemaError::ReservedColumn(name.to_owned()));
    }
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN || name.contains('\0') {
        return Err(SchemaError::InvalidColumnName(name.to_owned()));
    }
    Ok(())
}
