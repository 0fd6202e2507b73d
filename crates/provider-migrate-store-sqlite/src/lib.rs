#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use provider_migrate_core::{
    format_rfc3339, now_utc, ExtractionPolicy, FieldDescriptor, FieldMap, FieldType,
    IdentityProvider, MigrationError, NamePattern, OwnerIdentity, RecordKind, RecordStore,
    SchemaAccessor, SourceDataProvider, SourceRecord, StoredRecord, TransactionalStore,
    NATURAL_KEY_FIELD,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use serde_json::{Number, Value};
use tracing::{debug, info, warn};

const PROVIDER_MIGRATION_VERSION: i64 = 1;

/// Username preferred as the owner of migrated records.
pub const DEFAULT_OWNER_USERNAME: &str = "admin";

const SCHEMA_PROVIDERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username VARCHAR(150) NOT NULL UNIQUE,
  is_superuser BOOLEAN NOT NULL DEFAULT 0 CHECK (is_superuser IN (0, 1)),
  date_joined TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS authenticators (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name VARCHAR(100) NOT NULL UNIQUE,
  active BOOLEAN NOT NULL DEFAULT 1,
  client_id VARCHAR(200) NOT NULL DEFAULT '',
  client_secret VARCHAR(200) NOT NULL,
  tenant_id VARCHAR(200),
  scopes JSON NOT NULL DEFAULT '[]',
  date_created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
  date_updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS search_providers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name VARCHAR(200) NOT NULL UNIQUE,
  owner VARCHAR(150) REFERENCES users(username),
  active BOOLEAN NOT NULL DEFAULT 1,
  connector VARCHAR(200) NOT NULL,
  url VARCHAR(2048) NOT NULL DEFAULT '',
  query_template VARCHAR(2048) NOT NULL DEFAULT '{query_string}',
  query_mappings JSON NOT NULL DEFAULT '{}',
  result_mappings JSON NOT NULL DEFAULT '{}',
  results_per_query INTEGER NOT NULL DEFAULT 10,
  credentials JSON NOT NULL DEFAULT '{}',
  api_key VARCHAR(200),
  tags JSON NOT NULL DEFAULT '[]',
  description TEXT NOT NULL DEFAULT '',
  date_created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
  date_updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS ai_providers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name VARCHAR(200) NOT NULL UNIQUE,
  owner VARCHAR(150) REFERENCES users(username),
  active BOOLEAN NOT NULL DEFAULT 1,
  connector VARCHAR(200) NOT NULL,
  model VARCHAR(200) NOT NULL,
  api_key VARCHAR(200) NOT NULL DEFAULT '',
  endpoint VARCHAR(2048),
  temperature REAL NOT NULL DEFAULT 0.7,
  max_tokens INTEGER,
  defaults JSON NOT NULL DEFAULT '[]',
  tags JSON NOT NULL DEFAULT '[]',
  date_created TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
  date_updated TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TRIGGER IF NOT EXISTS trg_authenticators_touch
AFTER UPDATE ON authenticators
FOR EACH ROW WHEN NEW.date_updated = OLD.date_updated
BEGIN
  UPDATE authenticators SET date_updated = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_search_providers_touch
AFTER UPDATE ON search_providers
FOR EACH ROW WHEN NEW.date_updated = OLD.date_updated
BEGIN
  UPDATE search_providers SET date_updated = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_ai_providers_touch
AFTER UPDATE ON ai_providers
FOR EACH ROW WHEN NEW.date_updated = OLD.date_updated
BEGIN
  UPDATE ai_providers SET date_updated = CURRENT_TIMESTAMP WHERE id = NEW.id;
END;
";

/// How the load owner is chosen from the users table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OwnerSelection {
    /// `admin` if present, otherwise the first superuser.
    #[default]
    AdminOrSuperuser,
    /// Exactly this username; no fallback.
    Named(String),
}

pub struct SqliteProviderStore {
    conn: Connection,
    owner_selection: OwnerSelection,
}

impl SqliteProviderStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            owner_selection: OwnerSelection::default(),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_PROVIDERS_V1)
            .context("failed to apply provider schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROVIDER_MIGRATION_VERSION, now],
            )
            .context("failed to register provider schema migration")?;

        Ok(())
    }

    pub fn set_owner_selection(&mut self, selection: OwnerSelection) {
        self.owner_selection = selection;
    }

    /// Inserts a user, or updates the superuser bit of an existing one.
    pub fn add_user(&self, username: &str, is_superuser: bool) -> Result<()> {
        if username.trim().is_empty() {
            return Err(anyhow!("username MUST be non-empty"));
        }

        self.conn
            .execute(
                "INSERT INTO users(username, is_superuser) VALUES (?1, ?2)
                 ON CONFLICT(username) DO UPDATE SET is_superuser = excluded.is_superuser",
                params![username, i64::from(is_superuser)],
            )
            .with_context(|| format!("failed to upsert user {username}"))?;
        Ok(())
    }

    /// Every stored record of `kind`, in insertion order, without row ids.
    pub fn list_records(&self, kind: RecordKind) -> Result<Vec<FieldMap>> {
        let columns = destination_fields(&self.conn, kind)?;
        let rows = select_rows(&self.conn, kind.collection_key(), &columns, None)?;
        Ok(rows.into_iter().map(|(_, fields)| fields).collect())
    }

    fn scope(&self) -> ConnectionScope<'_> {
        ConnectionScope { conn: &self.conn }
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl SchemaAccessor for SqliteProviderStore {
    fn fields_of(&self, kind: RecordKind) -> Result<Vec<FieldDescriptor>, MigrationError> {
        destination_fields(&self.conn, kind).map_err(store_error)
    }
}

impl RecordStore for SqliteProviderStore {
    fn count(&self, kind: RecordKind) -> Result<usize, MigrationError> {
        self.scope().count(kind)
    }

    fn delete_all(&mut self, kind: RecordKind) -> Result<usize, MigrationError> {
        self.scope().delete_all(kind)
    }

    fn find_by_name(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, MigrationError> {
        self.scope().find_by_name(kind, name)
    }

    fn create(&mut self, kind: RecordKind, fields: &FieldMap) -> Result<(), MigrationError> {
        self.scope().create(kind, fields)
    }

    fn update(
        &mut self,
        kind: RecordKind,
        existing: &StoredRecord,
        fields: &FieldMap,
    ) -> Result<(), MigrationError> {
        self.scope().update(kind, existing, fields)
    }
}

impl TransactionalStore for SqliteProviderStore {
    fn atomically<T, F>(&mut self, work: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&mut dyn RecordStore) -> Result<T, MigrationError>,
    {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reconciliation transaction")
            .map_err(store_error)?;

        let outcome = {
            let mut scope = ConnectionScope { conn: &*tx };
            work(&mut scope)
        };

        match outcome {
            Ok(value) => {
                tx.commit()
                    .context("failed to commit reconciliation transaction")
                    .map_err(store_error)?;
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "rolling back reconciliation transaction");
                tx.rollback()
                    .context("failed to roll back reconciliation transaction")
                    .map_err(store_error)?;
                Err(err)
            }
        }
    }
}

impl IdentityProvider for SqliteProviderStore {
    fn resolve_owner_identity(&self) -> Result<OwnerIdentity, MigrationError> {
        let username = match &self.owner_selection {
            OwnerSelection::Named(username) => {
                find_username(&self.conn, username)
                    .map_err(store_error)?
                    .ok_or_else(|| {
                        MigrationError::NoOwnerIdentity(format!("user '{username}' not found"))
                    })?
            }
            OwnerSelection::AdminOrSuperuser => {
                match find_username(&self.conn, DEFAULT_OWNER_USERNAME).map_err(store_error)? {
                    Some(admin) => admin,
                    None => first_superuser(&self.conn)
                        .map_err(store_error)?
                        .ok_or_else(|| {
                            MigrationError::NoOwnerIdentity(format!(
                                "no '{DEFAULT_OWNER_USERNAME}' user and no superuser found; \
                                 create one before loading"
                            ))
                        })?,
                }
            }
        };

        OwnerIdentity::new(&username)
    }
}

/// Record access bound to either the plain connection or an open transaction.
struct ConnectionScope<'c> {
    conn: &'c Connection,
}

impl RecordStore for ConnectionScope<'_> {
    fn count(&self, kind: RecordKind) -> Result<usize, MigrationError> {
        count_rows(self.conn, kind.collection_key()).map_err(store_error)
    }

    fn delete_all(&mut self, kind: RecordKind) -> Result<usize, MigrationError> {
        let table = kind.collection_key();
        let deleted = self
            .conn
            .execute(&format!("DELETE FROM {}", quote_identifier(table)), [])
            .with_context(|| format!("failed to delete existing rows from {table}"))
            .map_err(store_error)?;
        debug!(%kind, deleted, "deleted rows");
        Ok(deleted)
    }

    fn find_by_name(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, MigrationError> {
        let columns = destination_fields(self.conn, kind).map_err(store_error)?;
        let mut rows = select_rows(self.conn, kind.collection_key(), &columns, Some(name))
            .map_err(store_error)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let (id, fields) = rows.swap_remove(0);
        Ok(Some(StoredRecord { id, fields }))
    }

    fn create(&mut self, kind: RecordKind, fields: &FieldMap) -> Result<(), MigrationError> {
        insert_row(self.conn, kind, fields).map_err(store_error)
    }

    fn update(
        &mut self,
        kind: RecordKind,
        existing: &StoredRecord,
        fields: &FieldMap,
    ) -> Result<(), MigrationError> {
        update_row(self.conn, kind, existing.id, fields).map_err(store_error)
    }
}

/// Reads records from a legacy database for the extraction stage.
pub struct SqliteSourceProvider {
    conn: Connection,
    policy: ExtractionPolicy,
}

impl SqliteSourceProvider {
    pub fn open(path: &Path, policy: ExtractionPolicy) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("source database not found: {}", path.display()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open source database at {}", path.display()))?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self::from_connection(conn, policy))
    }

    #[must_use]
    pub fn from_connection(conn: Connection, policy: ExtractionPolicy) -> Self {
        Self { conn, policy }
    }

    fn extractable_fields(&self, kind: RecordKind) -> Result<Vec<FieldDescriptor>> {
        let table = kind.collection_key();
        let relations = foreign_key_columns(&self.conn, table)?;

        let mut fields = Vec::new();
        for column in table_columns(&self.conn, table)? {
            if relations.contains(&column.name) {
                debug!(%kind, column = %column.name, "skipping relation column");
                continue;
            }
            if self.policy.is_redacted(kind, &column.name) {
                debug!(%kind, column = %column.name, "skipping sensitive column");
                continue;
            }
            let descriptor = column.descriptor();
            if descriptor.is_internal_id() {
                continue;
            }
            fields.push(descriptor);
        }
        Ok(fields)
    }
}

impl SourceDataProvider for SqliteSourceProvider {
    fn list_records(
        &self,
        kind: RecordKind,
        name_pattern: Option<&NamePattern>,
    ) -> Result<Vec<SourceRecord>, MigrationError> {
        let table = kind.collection_key();
        if !table_exists(&self.conn, table).map_err(store_error)? {
            warn!(%kind, table, "source table missing; nothing to extract");
            return Ok(Vec::new());
        }

        let fields = self.extractable_fields(kind).map_err(store_error)?;
        let rows = select_rows(&self.conn, table, &fields, None).map_err(store_error)?;
        let total = rows.len();

        let records: Vec<SourceRecord> = rows
            .into_iter()
            .map(|(_, fields)| SourceRecord::new(self.policy.redact(kind, fields)))
            .filter(|record| name_pattern.map_or(true, |pattern| pattern.matches(record)))
            .collect();

        if let Some(pattern) = name_pattern {
            info!(%kind, total, matched = records.len(), pattern = pattern.as_str(), "filtered by name pattern");
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnInfo {
    name: String,
    declared_type: String,
    not_null: bool,
    default: Option<String>,
    primary_key: bool,
}

impl ColumnInfo {
    fn descriptor(&self) -> FieldDescriptor {
        let (field_type, max_length) = parse_declared_type(&self.declared_type);
        let mut descriptor = FieldDescriptor::new(&self.name, field_type);
        descriptor.max_length = max_length;
        descriptor.nullable = !self.not_null && !self.primary_key;

        match parse_default(self.default.as_deref(), field_type) {
            ColumnDefault::Absent => {}
            ColumnDefault::StoreManaged => descriptor.auto_managed = true,
            ColumnDefault::Literal(value) => descriptor.schema_default = Some(value),
        }

        if self.primary_key && field_type == FieldType::Integer {
            descriptor.auto_managed = true;
        }
        descriptor
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ColumnDefault {
    Absent,
    StoreManaged,
    Literal(Value),
}

fn parse_declared_type(declared: &str) -> (FieldType, Option<usize>) {
    let upper = declared.trim().to_ascii_uppercase();
    let (base, length) = match upper.split_once('(') {
        Some((base, rest)) => (
            base.trim().to_string(),
            rest.trim_end_matches(')').trim().parse::<usize>().ok(),
        ),
        None => (upper.clone(), None),
    };

    let field_type = if base.contains("BOOL") {
        FieldType::Boolean
    } else if base.contains("JSON") {
        FieldType::Json
    } else if base.contains("TIMESTAMP") || base.contains("DATE") {
        FieldType::Timestamp
    } else if base.contains("INT") {
        FieldType::Integer
    } else if base.contains("CHAR") || base.contains("CLOB") || base.contains("TEXT") {
        FieldType::Text
    } else if base.contains("REAL")
        || base.contains("FLOA")
        || base.contains("DOUB")
        || base.contains("NUMERIC")
        || base.contains("DECIMAL")
    {
        FieldType::Real
    } else {
        FieldType::Any
    };

    let max_length = if field_type == FieldType::Text {
        length
    } else {
        None
    };
    (field_type, max_length)
}

fn parse_default(raw: Option<&str>, field_type: FieldType) -> ColumnDefault {
    let Some(raw) = raw else {
        return ColumnDefault::Absent;
    };

    let mut text = raw.trim();
    while let Some(inner) = text.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
        text = inner.trim();
    }

    let upper = text.to_ascii_uppercase();
    if matches!(
        upper.as_str(),
        "CURRENT_TIMESTAMP" | "CURRENT_DATE" | "CURRENT_TIME"
    ) || upper.contains("'NOW'")
    {
        return ColumnDefault::StoreManaged;
    }
    if upper == "NULL" {
        return ColumnDefault::Literal(Value::Null);
    }

    if let Some(inner) = text
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        let unescaped = inner.replace("''", "'");
        if field_type == FieldType::Json {
            if let Ok(decoded) = serde_json::from_str::<Value>(&unescaped) {
                return ColumnDefault::Literal(decoded);
            }
        }
        return ColumnDefault::Literal(Value::String(unescaped));
    }

    match upper.as_str() {
        "TRUE" => return ColumnDefault::Literal(Value::Bool(true)),
        "FALSE" => return ColumnDefault::Literal(Value::Bool(false)),
        _ => {}
    }

    if let Ok(integer) = text.parse::<i64>() {
        let value = match field_type {
            FieldType::Boolean => Value::Bool(integer != 0),
            FieldType::Real => real_value(integer as f64),
            _ => Value::from(integer),
        };
        return ColumnDefault::Literal(value);
    }
    if let Ok(real) = text.parse::<f64>() {
        return ColumnDefault::Literal(real_value(real));
    }

    ColumnDefault::Literal(Value::String(text.to_string()))
}

fn real_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn json_to_sql(value: &Value, field_type: FieldType) -> Result<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    if field_type == FieldType::Json {
        return Ok(SqlValue::Text(
            serde_json::to_string(value).context("failed to encode JSON column value")?,
        ));
    }

    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(
                number
                    .as_f64()
                    .ok_or_else(|| anyhow!("number {number} is not representable in sqlite"))?,
            ),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(
            serde_json::to_string(value).context("failed to encode structured value")?,
        ),
    })
}

fn sql_to_json(value: ValueRef<'_>, field_type: FieldType) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => match field_type {
            FieldType::Boolean => Value::Bool(integer != 0),
            FieldType::Real => real_value(integer as f64),
            _ => Value::from(integer),
        },
        ValueRef::Real(real) => real_value(real),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes)
                .context("text column is not valid UTF-8")?
                .to_string();
            if field_type == FieldType::Json {
                serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text))
            } else {
                Value::String(text)
            }
        }
        ValueRef::Blob(_) => return Err(anyhow!("BLOB columns cannot be migrated")),
    })
}

fn destination_fields(conn: &Connection, kind: RecordKind) -> Result<Vec<FieldDescriptor>> {
    let table = kind.collection_key();
    if !table_exists(conn, table)? {
        return Err(anyhow!(
            "destination table {table} for {kind} not found; run migrate first"
        ));
    }
    Ok(table_columns(conn, table)?
        .iter()
        .map(ColumnInfo::descriptor)
        .collect())
}

fn writable_columns<'f>(
    columns: &'f [FieldDescriptor],
    kind: RecordKind,
    fields: &FieldMap,
) -> Result<Vec<(&'f FieldDescriptor, SqlValue)>> {
    let mut assignments = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        let column = columns
            .iter()
            .find(|column| &column.name == name)
            .ok_or_else(|| anyhow!("{kind} has no column named {name}"))?;
        let encoded = json_to_sql(value, column.field_type)
            .with_context(|| format!("failed to encode {kind}.{name}"))?;
        assignments.push((column, encoded));
    }
    Ok(assignments)
}

fn insert_row(conn: &Connection, kind: RecordKind, fields: &FieldMap) -> Result<()> {
    let table = kind.collection_key();
    let columns = destination_fields(conn, kind)?;
    let assignments = writable_columns(&columns, kind, fields)?;

    let sql = if assignments.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote_identifier(table))
    } else {
        let names = assignments
            .iter()
            .map(|(column, _)| quote_identifier(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=assignments.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({names}) VALUES ({placeholders})",
            quote_identifier(table)
        )
    };

    conn.execute(
        &sql,
        params_from_iter(assignments.into_iter().map(|(_, value)| value)),
    )
    .with_context(|| format!("failed to insert {kind} {}", display_name(fields)))?;
    Ok(())
}

fn update_row(conn: &Connection, kind: RecordKind, id: i64, fields: &FieldMap) -> Result<()> {
    let table = kind.collection_key();
    let columns = destination_fields(conn, kind)?;
    let assignments = writable_columns(&columns, kind, fields)?;
    if assignments.is_empty() {
        return Ok(());
    }

    let set_clause = assignments
        .iter()
        .enumerate()
        .map(|(index, (column, _))| format!("{} = ?{}", quote_identifier(&column.name), index + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {set_clause} WHERE rowid = ?{}",
        quote_identifier(table),
        assignments.len() + 1
    );

    let mut values: Vec<SqlValue> = assignments.into_iter().map(|(_, value)| value).collect();
    values.push(SqlValue::Integer(id));

    let changed = conn
        .execute(&sql, params_from_iter(values))
        .with_context(|| format!("failed to update {kind} {}", display_name(fields)))?;
    if changed != 1 {
        return Err(anyhow!("{kind} row {id} disappeared during update"));
    }
    Ok(())
}

fn select_rows(
    conn: &Connection,
    table: &str,
    columns: &[FieldDescriptor],
    name: Option<&str>,
) -> Result<Vec<(i64, FieldMap)>> {
    let columns: Vec<&FieldDescriptor> = columns
        .iter()
        .filter(|column| !column.is_internal_id())
        .collect();

    let mut select_list = vec!["rowid".to_string()];
    select_list.extend(columns.iter().map(|column| quote_identifier(&column.name)));

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list.join(", "),
        quote_identifier(table)
    );
    let mut filter = Vec::new();
    if let Some(name) = name {
        sql.push_str(&format!(" WHERE {} = ?1", quote_identifier(NATURAL_KEY_FIELD)));
        filter.push(SqlValue::Text(name.to_string()));
    }
    sql.push_str(" ORDER BY rowid ASC");

    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("failed to prepare select on {table}"))?;
    let mut rows = stmt.query(params_from_iter(filter))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let mut fields = FieldMap::new();
        for (index, column) in columns.iter().enumerate() {
            let value = sql_to_json(row.get_ref(index + 1)?, column.field_type)
                .with_context(|| format!("failed to decode {table}.{}", column.name))?;
            fields.insert(column.name.clone(), value);
        }
        records.push((id, fields));
    }
    Ok(records)
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_identifier(table)),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count rows in {table}"))?;
    usize::try_from(count).with_context(|| format!("negative row count for {table}"))
}

fn find_username(conn: &Connection, username: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT username FROM users WHERE username = ?1",
        params![username],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("failed to query users")
}

fn first_superuser(conn: &Connection) -> Result<Option<String>> {
    conn.query_row(
        "SELECT username FROM users WHERE is_superuser = 1 ORDER BY id ASC LIMIT 1",
        [],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("failed to query superusers")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_identifier(table_name)))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            not_null: row.get::<_, i64>(3)? != 0,
            default: row.get(4)?,
            primary_key: row.get::<_, i64>(5)? > 0,
        })
    })?;
    collect_rows(rows)
}

fn foreign_key_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!(
            "PRAGMA foreign_key_list({})",
            quote_identifier(table_name)
        ))
        .with_context(|| format!("failed to inspect foreign keys for {table_name}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(3))?;
    collect_rows(rows)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn display_name(fields: &FieldMap) -> String {
    fields
        .get(NATURAL_KEY_FIELD)
        .and_then(Value::as_str)
        .map_or_else(|| "<unnamed>".to_string(), |name| format!("'{name}'"))
}

fn store_error(err: anyhow::Error) -> MigrationError {
    MigrationError::Store(format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;
    use provider_migrate_core::{
        extract_document, load_batches, translate_document, DeleteFlags, MigrationDocument,
        MigrationPolicy, TranslatedBatches,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            other => panic!("fixture must be a JSON object, got {other}"),
        }
    }

    fn fixture_store() -> SqliteProviderStore {
        let store = must(SqliteProviderStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn field<'a>(descriptors: &'a [FieldDescriptor], name: &str) -> &'a FieldDescriptor {
        must_some(descriptors.iter().find(|descriptor| descriptor.name == name))
    }

    const LEGACY_SCHEMA: &str = r#"
        CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT UNIQUE);
        CREATE TABLE authenticators (
          id INTEGER PRIMARY KEY,
          name VARCHAR(100) NOT NULL,
          client_id VARCHAR(200),
          client_secret VARCHAR(200),
          tenant_id VARCHAR(200),
          date_created TIMESTAMP,
          date_updated TIMESTAMP
        );
        CREATE TABLE search_providers (
          id INTEGER PRIMARY KEY,
          name VARCHAR(200) NOT NULL,
          owner_id INTEGER REFERENCES users(id),
          active BOOL,
          connector VARCHAR(200),
          url VARCHAR(2048),
          results_per_query INTEGER,
          query_mappings JSON,
          api_key VARCHAR(200),
          date_created TIMESTAMP,
          date_updated TIMESTAMP
        );
        INSERT INTO users (id, username) VALUES (1, 'legacy-admin');
        INSERT INTO authenticators (name, client_id, client_secret, tenant_id, date_created)
          VALUES ('Azure', 'abc', 's3cr3t', NULL, '2023-05-01 10:00:00');
        INSERT INTO search_providers
          (name, owner_id, active, connector, url, results_per_query, query_mappings, api_key)
          VALUES ('Web', 1, 1, 'RequestsGet', 'https://example.com', 5, '{"q":"x"}', 'k-1'),
                 ('Docs', 1, 0, 'Elastic', NULL, NULL, NULL, NULL);
    "#;

    fn legacy_source() -> SqliteSourceProvider {
        let conn = must(Connection::open_in_memory());
        must(conn.execute_batch(LEGACY_SCHEMA));
        SqliteSourceProvider::from_connection(conn, ExtractionPolicy::v1())
    }

    fn no_delete() -> DeleteFlags {
        DeleteFlags::default()
    }

    #[test]
    fn migrate_is_idempotent_and_creates_expected_schema() {
        let store = fixture_store();
        must(store.migrate());

        for table in ["users", "authenticators", "search_providers", "ai_providers"] {
            assert!(must(table_exists(store.connection(), table)), "{table} missing");
        }

        let registered: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
            params![PROVIDER_MIGRATION_VERSION],
            |row| row.get(0),
        ));
        assert_eq!(registered, 1);

        let triggers: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'trg_%_touch'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(triggers, 3);
    }

    #[test]
    fn schema_accessor_reports_defaults_nullability_and_auto_fields() {
        let store = fixture_store();
        let authenticator = must(store.fields_of(RecordKind::Authenticator));

        let id = field(&authenticator, "id");
        assert!(id.auto_managed);
        assert!(id.is_internal_id());

        let name = field(&authenticator, "name");
        assert_eq!(name.field_type, FieldType::Text);
        assert_eq!(name.max_length, Some(100));
        assert!(name.is_required());

        let secret = field(&authenticator, "client_secret");
        assert!(secret.is_required());

        assert_eq!(field(&authenticator, "client_id").schema_default, Some(json!("")));
        assert_eq!(field(&authenticator, "active").schema_default, Some(json!(true)));
        assert_eq!(field(&authenticator, "scopes").schema_default, Some(json!([])));
        assert!(field(&authenticator, "tenant_id").nullable);

        let created = field(&authenticator, "date_created");
        assert!(created.auto_managed);
        assert!(!created.has_schema_default());

        let ai = must(store.fields_of(RecordKind::AiProvider));
        assert_eq!(field(&ai, "temperature").schema_default, Some(json!(0.7)));
        assert_eq!(field(&ai, "defaults").field_type, FieldType::Json);
        assert!(field(&ai, "owner").nullable);
        assert!(field(&ai, "max_tokens").nullable);
    }

    #[test]
    fn fields_of_fails_before_migrate() {
        let store = must(SqliteProviderStore::open(Path::new(":memory:")));
        let err = store.fields_of(RecordKind::SearchProvider);
        assert!(matches!(err, Err(MigrationError::Store(message)) if message.contains("run migrate first")));
    }

    #[test]
    fn declared_types_and_defaults_parse_like_sqlite_affinity() {
        assert_eq!(parse_declared_type("VARCHAR(200)"), (FieldType::Text, Some(200)));
        assert_eq!(parse_declared_type("bool"), (FieldType::Boolean, None));
        assert_eq!(parse_declared_type("BIGINT"), (FieldType::Integer, None));
        assert_eq!(parse_declared_type("DATETIME"), (FieldType::Timestamp, None));
        assert_eq!(parse_declared_type("DECIMAL(10, 2)"), (FieldType::Real, None));
        assert_eq!(parse_declared_type(""), (FieldType::Any, None));

        assert_eq!(parse_default(None, FieldType::Text), ColumnDefault::Absent);
        assert_eq!(
            parse_default(Some("CURRENT_TIMESTAMP"), FieldType::Timestamp),
            ColumnDefault::StoreManaged
        );
        assert_eq!(
            parse_default(Some("(datetime('now'))"), FieldType::Timestamp),
            ColumnDefault::StoreManaged
        );
        assert_eq!(
            parse_default(Some("'it''s'"), FieldType::Text),
            ColumnDefault::Literal(json!("it's"))
        );
        assert_eq!(
            parse_default(Some("'{\"a\": 1}'"), FieldType::Json),
            ColumnDefault::Literal(json!({"a": 1}))
        );
        assert_eq!(
            parse_default(Some("0"), FieldType::Boolean),
            ColumnDefault::Literal(json!(false))
        );
        assert_eq!(
            parse_default(Some("NULL"), FieldType::Text),
            ColumnDefault::Literal(Value::Null)
        );
    }

    #[test]
    fn create_find_and_update_preserve_value_types() {
        let mut store = fixture_store();
        must(store.add_user("admin", true));

        must(store.create(
            RecordKind::AiProvider,
            &fields(json!({
                "name": "GPT",
                "owner": "admin",
                "connector": "OpenAI",
                "model": "gpt-4",
                "active": false,
                "temperature": 0.25,
                "max_tokens": null,
                "defaults": [""],
                "tags": {"tier": "gold"}
            })),
        ));

        let stored = must_some(must(store.find_by_name(RecordKind::AiProvider, "GPT")));
        assert_eq!(stored.fields.get("active"), Some(&json!(false)));
        assert_eq!(stored.fields.get("temperature"), Some(&json!(0.25)));
        assert_eq!(stored.fields.get("max_tokens"), Some(&Value::Null));
        assert_eq!(stored.fields.get("defaults"), Some(&json!([""])));
        assert_eq!(stored.fields.get("tags"), Some(&json!({"tier": "gold"})));
        assert_eq!(stored.fields.get("api_key"), Some(&json!("")));
        assert!(stored.fields.get("id").is_none());

        must(store.update(
            RecordKind::AiProvider,
            &stored,
            &fields(json!({"name": "GPT", "model": "gpt-4o"})),
        ));
        let updated = must_some(must(store.find_by_name(RecordKind::AiProvider, "GPT")));
        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.fields.get("model"), Some(&json!("gpt-4o")));
        assert_eq!(updated.fields.get("connector"), Some(&json!("OpenAI")));

        assert_eq!(must(store.count(RecordKind::AiProvider)), 1);
        assert!(must(store.find_by_name(RecordKind::AiProvider, "Missing")).is_none());
    }

    #[test]
    fn create_rejects_unknown_columns_and_dangling_owner() {
        let mut store = fixture_store();

        let unknown = store.create(
            RecordKind::SearchProvider,
            &fields(json!({"name": "Web", "connector": "A", "legacy_flag": 1})),
        );
        assert!(matches!(unknown, Err(MigrationError::Store(message)) if message.contains("legacy_flag")));

        let dangling = store.create(
            RecordKind::SearchProvider,
            &fields(json!({"name": "Web", "connector": "A", "owner": "ghost"})),
        );
        assert!(matches!(dangling, Err(MigrationError::Store(_))));
        assert_eq!(must(store.count(RecordKind::SearchProvider)), 0);
    }

    #[test]
    fn atomically_rolls_back_on_error() {
        let mut store = fixture_store();
        must(store.create(
            RecordKind::Authenticator,
            &fields(json!({"name": "Existing", "client_secret": "<client-secret>"})),
        ));

        let result: std::result::Result<(), MigrationError> = store.atomically(|tx| {
            tx.delete_all(RecordKind::Authenticator)?;
            tx.create(
                RecordKind::Authenticator,
                &fields(json!({"name": "New", "client_secret": "<client-secret>"})),
            )?;
            Err(MigrationError::Store("simulated failure".to_string()))
        });

        assert!(result.is_err());
        let names: Vec<_> = must(store.list_records(RecordKind::Authenticator))
            .into_iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["Existing"]);
    }

    #[test]
    fn owner_identity_prefers_admin_then_first_superuser() {
        let mut store = fixture_store();
        assert!(matches!(
            store.resolve_owner_identity(),
            Err(MigrationError::NoOwnerIdentity(_))
        ));

        must(store.add_user("regular", false));
        must(store.add_user("root", true));
        must(store.add_user("ops", true));
        assert_eq!(must(store.resolve_owner_identity()).as_str(), "root");

        must(store.add_user("admin", false));
        assert_eq!(must(store.resolve_owner_identity()).as_str(), "admin");

        store.set_owner_selection(OwnerSelection::Named("ops".to_string()));
        assert_eq!(must(store.resolve_owner_identity()).as_str(), "ops");

        store.set_owner_selection(OwnerSelection::Named("nobody".to_string()));
        assert!(matches!(
            store.resolve_owner_identity(),
            Err(MigrationError::NoOwnerIdentity(message)) if message.contains("nobody")
        ));
    }

    #[test]
    fn extraction_skips_relations_secrets_and_timestamps() {
        let source = legacy_source();
        let document = must(extract_document(&source, None));

        assert_eq!(
            document.authenticators,
            vec![fields(json!({"name": "Azure", "client_id": "abc", "tenant_id": null}))]
        );

        let web = &document.search_providers[0];
        assert!(web.get("owner_id").is_none());
        assert!(web.get("api_key").is_none());
        assert!(web.get("date_created").is_none());
        assert!(web.get("id").is_none());
        assert_eq!(web.get("active"), Some(&json!(true)));
        assert_eq!(web.get("query_mappings"), Some(&json!({"q": "x"})));

        assert!(document.ai_providers.is_empty());
    }

    #[test]
    fn extraction_applies_name_pattern() {
        let source = legacy_source();
        let pattern = must(NamePattern::parse("^Do"));
        let records = must(source.list_records(RecordKind::SearchProvider, Some(&pattern)));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), Some("Docs"));
    }

    #[test]
    fn legacy_to_destination_pipeline_is_repeatable() {
        let source = legacy_source();
        let extracted = must(extract_document(&source, None));

        let mut store = fixture_store();
        must(store.add_user("admin", true));
        let policy = MigrationPolicy::v1();

        let batches = must(translate_document(&extracted, &store, &policy, None));
        let load_document = batches.to_document();
        assert_eq!(
            load_document.authenticators[0].get("client_secret"),
            Some(&json!("<client-secret>"))
        );
        let docs = &load_document.search_providers[1];
        assert_eq!(docs.get("url"), Some(&json!("")));
        assert_eq!(docs.get("results_per_query"), Some(&json!(10)));
        assert_eq!(docs.get("owner"), Some(&Value::Null));

        let persisted = must(MigrationDocument::from_json_str(&must(
            load_document.to_json_pretty(),
        )));
        let reloaded = TranslatedBatches::from_document(&persisted);

        let first = must(load_batches(&mut store, &policy, &no_delete(), &reloaded, false));
        assert_eq!(must_some(first.for_kind(RecordKind::SearchProvider)).created, 2);

        let second = must(load_batches(&mut store, &policy, &no_delete(), &reloaded, false));
        let sp = must_some(second.for_kind(RecordKind::SearchProvider));
        assert_eq!((sp.created, sp.updated), (0, 2));
        assert_eq!(must(store.count(RecordKind::SearchProvider)), 2);

        let web = must_some(must(store.find_by_name(RecordKind::SearchProvider, "Web")));
        assert_eq!(web.fields.get("owner"), Some(&json!("admin")));
        assert_eq!(web.fields.get("api_key"), Some(&Value::Null));
        let azure = must_some(must(store.find_by_name(RecordKind::Authenticator, "Azure")));
        assert_eq!(azure.fields.get("client_secret"), Some(&json!("<client-secret>")));
    }

    fn stored_timestamps(store: &SqliteProviderStore, name: &str) -> (String, String) {
        must(store.connection().query_row(
            "SELECT date_created, date_updated FROM authenticators WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ))
    }

    #[test]
    fn legacy_timestamps_never_override_store_managed_columns() {
        let conn = must(Connection::open_in_memory());
        must(conn.execute_batch(LEGACY_SCHEMA));
        must(conn.execute(
            "UPDATE authenticators SET date_updated = '2023-05-02 10:00:00' WHERE name = 'Azure'",
            [],
        ));
        let keep_everything = ExtractionPolicy { kinds: Vec::new() };
        let source = SqliteSourceProvider::from_connection(conn, keep_everything);
        let extracted = must(extract_document(&source, None));
        assert_eq!(
            extracted.authenticators[0].get("date_created"),
            Some(&json!("2023-05-01 10:00:00"))
        );

        let mut store = fixture_store();
        must(store.add_user("admin", true));
        let policy = MigrationPolicy::v1();
        let batches = must(translate_document(&extracted, &store, &policy, None));
        assert_eq!(
            batches.records(RecordKind::Authenticator)[0].get("date_created"),
            None
        );

        must(load_batches(&mut store, &policy, &no_delete(), &batches, false));
        let (created, _) = stored_timestamps(&store, "Azure");
        assert_ne!(created, "2023-05-01 10:00:00");

        must(store.connection().execute(
            "UPDATE authenticators SET date_updated = '2000-01-01 00:00:00' WHERE name = 'Azure'",
            [],
        ));
        must(load_batches(&mut store, &policy, &no_delete(), &batches, false));
        let (created_after_rerun, updated_after_rerun) = stored_timestamps(&store, "Azure");
        assert_eq!(created_after_rerun, created);
        assert_ne!(updated_after_rerun, "2000-01-01 00:00:00");
        assert_ne!(updated_after_rerun, "2023-05-02 10:00:00");
    }

    #[test]
    fn failed_load_leaves_destination_untouched() {
        let mut store = fixture_store();
        must(store.add_user("admin", true));
        must(store.create(
            RecordKind::SearchProvider,
            &fields(json!({"name": "Existing", "connector": "A"})),
        ));

        let document = must(MigrationDocument::from_json_str(
            r#"{"search_providers": [{"name": "Fresh", "connector": "B"}, {"name": "Broken", "connector": null}]}"#,
        ));
        let flags = DeleteFlags {
            global: true,
            per_kind: BTreeMap::new(),
        };
        let result = load_batches(
            &mut store,
            &MigrationPolicy::v1(),
            &flags,
            &TranslatedBatches::from_document(&document),
            false,
        );

        assert!(matches!(result, Err(MigrationError::Store(_))));
        let names: Vec<_> = must(store.list_records(RecordKind::SearchProvider))
            .into_iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(names, vec!["Existing"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_repeated_upserts_never_grow_the_table(
            names in prop::collection::btree_set("[a-z]{1,8}", 1..6),
        ) {
            let mut store = fixture_store();
            must(store.add_user("admin", true));

            let mut document = MigrationDocument::default();
            for name in &names {
                document.push(
                    RecordKind::SearchProvider,
                    fields(json!({"name": name, "connector": "RequestsGet"})),
                );
            }
            let batches = TranslatedBatches::from_document(&document);
            let policy = MigrationPolicy::v1();

            must(load_batches(&mut store, &policy, &no_delete(), &batches, false));
            let report = must(load_batches(&mut store, &policy, &no_delete(), &batches, false));

            let sp = must_some(report.for_kind(RecordKind::SearchProvider));
            prop_assert_eq!(sp.created, 0);
            prop_assert_eq!(sp.updated, names.len());
            prop_assert_eq!(must(store.count(RecordKind::SearchProvider)), names.len());
        }
    }
}
