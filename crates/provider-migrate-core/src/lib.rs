use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Ordered field-name to value mapping used for every record shape.
pub type FieldMap = Map<String, Value>;

/// Natural key used to match source and destination records.
pub const NATURAL_KEY_FIELD: &str = "name";

/// Internal identifiers never cross the migration boundary.
pub const INTERNAL_ID_FIELDS: [&str; 2] = ["id", "pk"];

pub const POLICY_VERSION: u32 = 1;
pub const REPORT_CONTRACT_VERSION: &str = "reconciliation_report.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error(
        "{kind}.{field} is required, has no default, is not nullable, is not auto-managed, \
         and is missing from the source record and the explicit defaults"
    )]
    UnresolvableField { kind: RecordKind, field: String },
    #[error("validation error for {kind} '{name}': {field}: {reason}")]
    Validation {
        kind: RecordKind,
        name: String,
        field: String,
        reason: String,
    },
    #[error("{kind} record #{position} has no name")]
    MissingNaturalKey { kind: RecordKind, position: usize },
    #[error("no owner identity: {0}")]
    NoOwnerIdentity(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("document error: {0}")]
    Document(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl MigrationError {
    /// Wraps a collaborator failure as a fatal store error.
    pub fn store(err: impl Display) -> Self {
        Self::Store(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordKind {
    Authenticator,
    SearchProvider,
    #[serde(rename = "AIProvider")]
    AiProvider,
}

impl RecordKind {
    pub const ALL: [Self; 3] = [Self::Authenticator, Self::SearchProvider, Self::AiProvider];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticator => "Authenticator",
            Self::SearchProvider => "SearchProvider",
            Self::AiProvider => "AIProvider",
        }
    }

    /// Key of this kind's array in the interchange document, also used as
    /// the destination table name.
    #[must_use]
    pub fn collection_key(self) -> &'static str {
        match self {
            Self::Authenticator => "authenticators",
            Self::SearchProvider => "search_providers",
            Self::AiProvider => "ai_providers",
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    Json,
    Timestamp,
    Any,
}

impl FieldType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Timestamp => "timestamp",
            Self::Any => "any",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub max_length: Option<usize>,
    pub nullable: bool,
    /// Present iff the destination schema declares a default.
    pub schema_default: Option<Value>,
    /// Value is computed by the destination store itself.
    pub auto_managed: bool,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            max_length: None,
            nullable: false,
            schema_default: None,
            auto_managed: false,
        }
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.schema_default = Some(value);
        self
    }

    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub fn auto_managed(mut self) -> Self {
        self.auto_managed = true;
        self
    }

    #[must_use]
    pub fn has_schema_default(&self) -> bool {
        self.schema_default.is_some()
    }

    /// Non-nullable, no schema default, and not computed by the store.
    #[must_use]
    pub fn is_required(&self) -> bool {
        !self.nullable && self.schema_default.is_none() && !self.auto_managed
    }

    #[must_use]
    pub fn is_internal_id(&self) -> bool {
        INTERNAL_ID_FIELDS.contains(&self.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerIdentity(String);

impl OwnerIdentity {
    /// # Errors
    /// Returns [`MigrationError::NoOwnerIdentity`] for a blank identity.
    pub fn new(value: &str) -> Result<Self, MigrationError> {
        if value.trim().is_empty() {
            return Err(MigrationError::NoOwnerIdentity(
                "owner identity MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Regex filter applied to record names during extraction and translation.
#[derive(Debug, Clone)]
pub struct NamePattern(Regex);

impl NamePattern {
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when the pattern is not a
    /// valid regular expression.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        let regex = Regex::new(raw).map_err(|err| {
            MigrationError::Configuration(format!("invalid name pattern {raw:?}: {err}"))
        })?;
        Ok(Self(regex))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Records without a string name never match a pattern.
    #[must_use]
    pub fn matches(&self, record: &SourceRecord) -> bool {
        record.name().is_some_and(|name| self.0.is_match(name))
    }
}

fn strip_internal_ids(fields: &mut FieldMap) {
    fields.retain(|name, _| !INTERNAL_ID_FIELDS.contains(&name.as_str()));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SourceRecord(FieldMap);

impl SourceRecord {
    /// Builds a source record, dropping internal identifiers.
    #[must_use]
    pub fn new(mut fields: FieldMap) -> Self {
        strip_internal_ids(&mut fields);
        Self(fields)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.get(NATURAL_KEY_FIELD).and_then(Value::as_str)
    }

    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    #[must_use]
    pub fn into_fields(self) -> FieldMap {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TranslatedRecord(FieldMap);

impl TranslatedRecord {
    /// Wraps fields read back from a load document. Internal identifiers
    /// are dropped.
    #[must_use]
    pub fn from_fields(mut fields: FieldMap) -> Self {
        strip_internal_ids(&mut fields);
        Self(fields)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Natural key, if present and non-blank.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0
            .get(NATURAL_KEY_FIELD)
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    #[must_use]
    pub fn into_fields(self) -> FieldMap {
        self.0
    }
}

/// Persisted interchange format between extract, translate and load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    #[serde(default)]
    pub authenticators: Vec<FieldMap>,
    #[serde(default)]
    pub search_providers: Vec<FieldMap>,
    #[serde(default)]
    pub ai_providers: Vec<FieldMap>,
}

impl MigrationDocument {
    /// # Errors
    /// Returns [`MigrationError::Document`] when the payload is not a
    /// valid interchange document.
    pub fn from_json_str(raw: &str) -> Result<Self, MigrationError> {
        serde_json::from_str(raw)
            .map_err(|err| MigrationError::Document(format!("invalid migration document: {err}")))
    }

    /// # Errors
    /// Returns [`MigrationError::Document`] when serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, MigrationError> {
        serde_json::to_string_pretty(self).map_err(|err| {
            MigrationError::Document(format!("failed to serialize migration document: {err}"))
        })
    }

    #[must_use]
    pub fn records(&self, kind: RecordKind) -> &[FieldMap] {
        match kind {
            RecordKind::Authenticator => &self.authenticators,
            RecordKind::SearchProvider => &self.search_providers,
            RecordKind::AiProvider => &self.ai_providers,
        }
    }

    fn records_mut(&mut self, kind: RecordKind) -> &mut Vec<FieldMap> {
        match kind {
            RecordKind::Authenticator => &mut self.authenticators,
            RecordKind::SearchProvider => &mut self.search_providers,
            RecordKind::AiProvider => &mut self.ai_providers,
        }
    }

    pub fn push(&mut self, kind: RecordKind, fields: FieldMap) {
        self.records_mut(kind).push(fields);
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<RecordKind, usize> {
        RecordKind::ALL
            .into_iter()
            .map(|kind| (kind, self.records(kind).len()))
            .collect()
    }
}

impl SourceDataProvider for MigrationDocument {
    fn list_records(
        &self,
        kind: RecordKind,
        name_pattern: Option<&NamePattern>,
    ) -> Result<Vec<SourceRecord>, MigrationError> {
        Ok(self
            .records(kind)
            .iter()
            .cloned()
            .map(SourceRecord::new)
            .filter(|record| name_pattern.map_or(true, |pattern| pattern.matches(record)))
            .collect())
    }
}

/// Validated translation output, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslatedBatches {
    batches: BTreeMap<RecordKind, Vec<TranslatedRecord>>,
}

impl TranslatedBatches {
    #[must_use]
    pub fn from_document(document: &MigrationDocument) -> Self {
        let mut batches = Self::default();
        for kind in RecordKind::ALL {
            for fields in document.records(kind) {
                batches.push(kind, TranslatedRecord::from_fields(fields.clone()));
            }
        }
        batches
    }

    pub fn push(&mut self, kind: RecordKind, record: TranslatedRecord) {
        self.batches.entry(kind).or_default().push(record);
    }

    #[must_use]
    pub fn records(&self, kind: RecordKind) -> &[TranslatedRecord] {
        self.batches.get(&kind).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn counts(&self) -> BTreeMap<RecordKind, usize> {
        RecordKind::ALL
            .into_iter()
            .map(|kind| (kind, self.records(kind).len()))
            .collect()
    }

    #[must_use]
    pub fn to_document(&self) -> MigrationDocument {
        let mut document = MigrationDocument::default();
        for kind in RecordKind::ALL {
            for record in self.records(kind) {
                document.push(kind, record.fields().clone());
            }
        }
        document
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: i64,
    pub fields: FieldMap,
}

pub trait SchemaAccessor {
    #[allow(clippy::missing_errors_doc)]
    fn fields_of(&self, kind: RecordKind) -> Result<Vec<FieldDescriptor>, MigrationError>;
}

pub trait SourceDataProvider {
    /// Lists records of `kind`, with the provider's own sensitive fields
    /// already removed.
    #[allow(clippy::missing_errors_doc)]
    fn list_records(
        &self,
        kind: RecordKind,
        name_pattern: Option<&NamePattern>,
    ) -> Result<Vec<SourceRecord>, MigrationError>;
}

pub trait RecordStore {
    #[allow(clippy::missing_errors_doc)]
    fn count(&self, kind: RecordKind) -> Result<usize, MigrationError>;

    #[allow(clippy::missing_errors_doc)]
    fn delete_all(&mut self, kind: RecordKind) -> Result<usize, MigrationError>;

    #[allow(clippy::missing_errors_doc)]
    fn find_by_name(
        &self,
        kind: RecordKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, MigrationError>;

    #[allow(clippy::missing_errors_doc)]
    fn create(&mut self, kind: RecordKind, fields: &FieldMap) -> Result<(), MigrationError>;

    #[allow(clippy::missing_errors_doc)]
    fn update(
        &mut self,
        kind: RecordKind,
        existing: &StoredRecord,
        fields: &FieldMap,
    ) -> Result<(), MigrationError>;
}

pub trait TransactionalStore {
    /// Runs `work` as one atomic unit. An `Err` from `work` or from the
    /// commit leaves the store exactly as it was before the call.
    #[allow(clippy::missing_errors_doc)]
    fn atomically<T, F>(&mut self, work: F) -> Result<T, MigrationError>
    where
        F: FnOnce(&mut dyn RecordStore) -> Result<T, MigrationError>;
}

pub trait IdentityProvider {
    #[allow(clippy::missing_errors_doc)]
    fn resolve_owner_identity(&self) -> Result<OwnerIdentity, MigrationError>;
}

/// Everything the load stage needs from a destination.
pub trait DestinationStore:
    SchemaAccessor + RecordStore + TransactionalStore + IdentityProvider
{
}

impl<T> DestinationStore for T where
    T: SchemaAccessor + RecordStore + TransactionalStore + IdentityProvider
{
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KindPolicy {
    pub kind: RecordKind,
    #[serde(default)]
    pub sensitive_fields: BTreeSet<String>,
    #[serde(default)]
    pub explicit_defaults: FieldMap,
    /// Fields assigned at load time; skipped by the validator.
    #[serde(default)]
    pub validation_exclusions: BTreeSet<String>,
    #[serde(default)]
    pub owner_field: Option<String>,
}

impl KindPolicy {
    #[must_use]
    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields.contains(field)
    }

    #[must_use]
    pub fn explicit_default(&self, field: &str) -> Option<&Value> {
        self.explicit_defaults.get(field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationPolicy {
    pub policy_version: u32,
    pub kinds: Vec<KindPolicy>,
}

impl MigrationPolicy {
    #[must_use]
    pub fn v1() -> Self {
        let exclusions = string_set(&["owner"]);

        let mut authenticator_defaults = FieldMap::new();
        authenticator_defaults.insert(
            "client_secret".to_string(),
            Value::String("<client-secret>".to_string()),
        );

        let mut ai_defaults = FieldMap::new();
        ai_defaults.insert(
            "defaults".to_string(),
            Value::Array(vec![Value::String(String::new())]),
        );

        Self {
            policy_version: POLICY_VERSION,
            kinds: vec![
                KindPolicy {
                    kind: RecordKind::Authenticator,
                    sensitive_fields: string_set(&[
                        "client_secret",
                        "password",
                        "secret_key",
                        "api_key",
                        "token",
                    ]),
                    explicit_defaults: authenticator_defaults,
                    validation_exclusions: exclusions.clone(),
                    owner_field: None,
                },
                KindPolicy {
                    kind: RecordKind::SearchProvider,
                    sensitive_fields: string_set(&["api_key", "password", "token", "secret_key"]),
                    explicit_defaults: FieldMap::new(),
                    validation_exclusions: exclusions.clone(),
                    owner_field: Some("owner".to_string()),
                },
                KindPolicy {
                    kind: RecordKind::AiProvider,
                    sensitive_fields: string_set(&["api_key", "secret_key", "password", "token"]),
                    explicit_defaults: ai_defaults,
                    validation_exclusions: exclusions,
                    owner_field: Some("owner".to_string()),
                },
            ],
        }
    }

    /// Validates policy shape and per-kind invariants.
    ///
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when a kind is missing or
    /// duplicated, or a kind's tables contradict each other.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.policy_version == 0 {
            return Err(MigrationError::Configuration(
                "policy_version MUST be >= 1".to_string(),
            ));
        }

        for kind in RecordKind::ALL {
            let occurrences = self.kinds.iter().filter(|item| item.kind == kind).count();
            if occurrences != 1 {
                return Err(MigrationError::Configuration(format!(
                    "policy MUST configure {kind} exactly once (found {occurrences})"
                )));
            }
        }

        for policy in &self.kinds {
            if policy.is_sensitive(NATURAL_KEY_FIELD) {
                return Err(MigrationError::Configuration(format!(
                    "{}: natural key '{NATURAL_KEY_FIELD}' cannot be sensitive",
                    policy.kind
                )));
            }

            if let Some(owner_field) = &policy.owner_field {
                if policy.is_sensitive(owner_field) {
                    return Err(MigrationError::Configuration(format!(
                        "{}: owner field '{owner_field}' cannot be sensitive",
                        policy.kind
                    )));
                }
            }

            for internal in INTERNAL_ID_FIELDS {
                if policy.explicit_defaults.contains_key(internal) {
                    return Err(MigrationError::Configuration(format!(
                        "{}: internal identifier '{internal}' cannot carry an explicit default",
                        policy.kind
                    )));
                }
            }
        }

        Ok(())
    }

    /// Decodes and validates a policy from JSON.
    ///
    /// # Errors
    /// Returns [`MigrationError::Configuration`] when decoding fails or the
    /// decoded policy is invalid.
    pub fn from_json(value: &Value) -> Result<Self, MigrationError> {
        let policy: Self = serde_json::from_value(value.clone()).map_err(|err| {
            MigrationError::Configuration(format!("invalid policy JSON payload: {err}"))
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// # Errors
    /// Returns [`MigrationError::Configuration`] when `kind` is not
    /// configured.
    pub fn for_kind(&self, kind: RecordKind) -> Result<&KindPolicy, MigrationError> {
        self.kinds
            .iter()
            .find(|item| item.kind == kind)
            .ok_or_else(|| MigrationError::Configuration(format!("no policy configured for {kind}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionKindPolicy {
    pub kind: RecordKind,
    #[serde(default)]
    pub redacted_fields: BTreeSet<String>,
}

/// Redaction applied by the extraction stage before anything is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionPolicy {
    pub kinds: Vec<ExtractionKindPolicy>,
}

impl ExtractionPolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            kinds: vec![
                ExtractionKindPolicy {
                    kind: RecordKind::Authenticator,
                    redacted_fields: string_set(&[
                        "client_secret",
                        "password",
                        "secret_key",
                        "date_created",
                        "date_updated",
                    ]),
                },
                ExtractionKindPolicy {
                    kind: RecordKind::SearchProvider,
                    redacted_fields: string_set(&[
                        "api_key",
                        "password",
                        "token",
                        "date_created",
                        "date_updated",
                    ]),
                },
                ExtractionKindPolicy {
                    kind: RecordKind::AiProvider,
                    redacted_fields: string_set(&[
                        "api_key",
                        "password",
                        "token",
                        "date_created",
                        "date_updated",
                    ]),
                },
            ],
        }
    }

    /// # Errors
    /// Returns [`MigrationError::Configuration`] when decoding fails.
    pub fn from_json(value: &Value) -> Result<Self, MigrationError> {
        serde_json::from_value(value.clone()).map_err(|err| {
            MigrationError::Configuration(format!("invalid extraction policy JSON payload: {err}"))
        })
    }

    #[must_use]
    pub fn is_redacted(&self, kind: RecordKind, field: &str) -> bool {
        self.kinds
            .iter()
            .filter(|item| item.kind == kind)
            .any(|item| item.redacted_fields.contains(field))
    }

    /// Drops every redacted field of `kind` from `fields`.
    #[must_use]
    pub fn redact(&self, kind: RecordKind, mut fields: FieldMap) -> FieldMap {
        fields.retain(|name, _| !self.is_redacted(kind, name));
        fields
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    SensitivePlaceholder,
    SensitiveOmitted,
    AutoManaged,
    SourceValue,
    ExplicitDefault,
    SchemaDefault,
    Nullable,
    BlankPassthrough,
}

impl ResolutionTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SensitivePlaceholder => "sensitive_placeholder",
            Self::SensitiveOmitted => "sensitive_omitted",
            Self::SourceValue => "source_value",
            Self::ExplicitDefault => "explicit_default",
            Self::AutoManaged => "auto_managed",
            Self::SchemaDefault => "schema_default",
            Self::Nullable => "nullable",
            Self::BlankPassthrough => "blank_passthrough",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Value { value: Value, tier: ResolutionTier },
    /// Field is left out of the output so the destination's own rules apply.
    Omit { tier: ResolutionTier },
}

impl Resolution {
    #[must_use]
    pub fn tier(&self) -> ResolutionTier {
        match self {
            Self::Value { tier, .. } | Self::Omit { tier } => *tier,
        }
    }
}

/// Null, empty string, empty list, empty mapping, or whitespace-only string.
#[must_use]
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(entries) => entries.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

struct ResolveContext<'a> {
    policy: &'a KindPolicy,
    field: &'a FieldDescriptor,
    source: &'a SourceRecord,
}

type ResolutionCheck = fn(&ResolveContext<'_>) -> Option<Resolution>;

const RESOLUTION_CHAIN: [(&str, ResolutionCheck); 7] = [
    ("sensitive", check_sensitive),
    ("auto_managed", check_auto_managed),
    ("source_value", check_source_value),
    ("explicit_default", check_explicit_default),
    ("schema_default", check_schema_default),
    ("nullable", check_nullable),
    ("blank_passthrough", check_blank_passthrough),
];

fn check_sensitive(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    if !ctx.policy.is_sensitive(&ctx.field.name) {
        return None;
    }

    Some(match ctx.policy.explicit_default(&ctx.field.name) {
        Some(placeholder) => Resolution::Value {
            value: placeholder.clone(),
            tier: ResolutionTier::SensitivePlaceholder,
        },
        None => Resolution::Omit {
            tier: ResolutionTier::SensitiveOmitted,
        },
    })
}

fn check_source_value(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    let value = ctx.source.get(&ctx.field.name)?;
    if is_blank(value) {
        return None;
    }
    Some(Resolution::Value {
        value: value.clone(),
        tier: ResolutionTier::SourceValue,
    })
}

fn check_explicit_default(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    ctx.policy
        .explicit_default(&ctx.field.name)
        .map(|value| Resolution::Value {
            value: value.clone(),
            tier: ResolutionTier::ExplicitDefault,
        })
}

fn check_auto_managed(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    ctx.field.auto_managed.then_some(Resolution::Omit {
        tier: ResolutionTier::AutoManaged,
    })
}

fn check_schema_default(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    ctx.field
        .schema_default
        .as_ref()
        .map(|value| Resolution::Value {
            value: value.clone(),
            tier: ResolutionTier::SchemaDefault,
        })
}

fn check_nullable(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    ctx.field.nullable.then_some(Resolution::Value {
        value: Value::Null,
        tier: ResolutionTier::Nullable,
    })
}

fn check_blank_passthrough(ctx: &ResolveContext<'_>) -> Option<Resolution> {
    match ctx.source.get(&ctx.field.name) {
        Some(Value::Null) | None => None,
        Some(value) => Some(Resolution::Value {
            value: value.clone(),
            tier: ResolutionTier::BlankPassthrough,
        }),
    }
}

/// Decides each target field's value under the precedence chain.
pub struct FieldResolver<'a> {
    policy: &'a MigrationPolicy,
}

impl<'a> FieldResolver<'a> {
    #[must_use]
    pub fn new(policy: &'a MigrationPolicy) -> Self {
        Self { policy }
    }

    /// Resolves one field. Checks run in order and the first match wins.
    ///
    /// # Errors
    /// Returns [`MigrationError::UnresolvableField`] when no check applies,
    /// and [`MigrationError::Configuration`] when `kind` has no policy.
    pub fn resolve(
        &self,
        kind: RecordKind,
        field: &FieldDescriptor,
        source: &SourceRecord,
    ) -> Result<Resolution, MigrationError> {
        let ctx = ResolveContext {
            policy: self.policy.for_kind(kind)?,
            field,
            source,
        };

        for (check, apply) in RESOLUTION_CHAIN {
            let Some(resolution) = apply(&ctx) else {
                continue;
            };
            log_resolution(kind, field, check, &resolution, source);
            return Ok(resolution);
        }

        Err(MigrationError::UnresolvableField {
            kind,
            field: field.name.clone(),
        })
    }
}

fn log_resolution(
    kind: RecordKind,
    field: &FieldDescriptor,
    check: &str,
    resolution: &Resolution,
    source: &SourceRecord,
) {
    let field_name = field.name.as_str();
    match resolution {
        Resolution::Value {
            value,
            tier: ResolutionTier::SensitivePlaceholder,
        } => info!(%kind, field = field_name, placeholder = %value, "sensitive field, using explicit placeholder default"),
        Resolution::Omit {
            tier: ResolutionTier::SensitiveOmitted,
        } => info!(%kind, field = field_name, "sensitive field, skipping (no explicit default)"),
        Resolution::Value {
            value,
            tier: ResolutionTier::ExplicitDefault,
        } => {
            if source.get(field_name).is_some() {
                info!(%kind, field = field_name, default = %value, "source value is blank; using explicit default");
            } else {
                info!(%kind, field = field_name, default = %value, "using explicit default");
            }
        }
        Resolution::Omit {
            tier: ResolutionTier::AutoManaged,
        } => debug!(%kind, field = field_name, "auto-managed field, skipping"),
        Resolution::Value {
            tier: ResolutionTier::BlankPassthrough,
            ..
        } => warn!(%kind, field = field_name, "keeping blank source value; no default or null rule applies"),
        _ => debug!(%kind, field = field_name, check, tier = resolution.tier().as_str(), "resolved field"),
    }
}

/// Applies the resolver across every field of a kind.
pub struct RecordTranslator<'a, S: SchemaAccessor + ?Sized> {
    schema: &'a S,
    resolver: FieldResolver<'a>,
}

impl<'a, S: SchemaAccessor + ?Sized> RecordTranslator<'a, S> {
    #[must_use]
    pub fn new(schema: &'a S, policy: &'a MigrationPolicy) -> Self {
        Self {
            schema,
            resolver: FieldResolver::new(policy),
        }
    }

    /// Translates a single source record against the kind's current schema.
    ///
    /// # Errors
    /// Returns [`MigrationError::UnresolvableField`] bubbled from the
    /// resolver, or the schema accessor's error.
    pub fn translate(
        &self,
        kind: RecordKind,
        source: &SourceRecord,
    ) -> Result<TranslatedRecord, MigrationError> {
        let fields = self.schema.fields_of(kind)?;
        self.translate_with(kind, &fields, source)
    }

    fn translate_with(
        &self,
        kind: RecordKind,
        fields: &[FieldDescriptor],
        source: &SourceRecord,
    ) -> Result<TranslatedRecord, MigrationError> {
        let mut output = FieldMap::new();

        for field in fields.iter().filter(|field| !field.is_internal_id()) {
            match self.resolver.resolve(kind, field, source)? {
                Resolution::Value { value, .. } => {
                    output.insert(field.name.clone(), value);
                }
                Resolution::Omit { .. } => {}
            }
        }

        Ok(TranslatedRecord(output))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

impl FieldViolation {
    fn new(field: &str, reason: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Schema checks on translated records. Uniqueness and cross-row
/// constraints are left to the store.
pub struct Validator<'a, S: SchemaAccessor + ?Sized> {
    schema: &'a S,
    policy: &'a MigrationPolicy,
}

impl<'a, S: SchemaAccessor + ?Sized> Validator<'a, S> {
    #[must_use]
    pub fn new(schema: &'a S, policy: &'a MigrationPolicy) -> Self {
        Self { schema, policy }
    }

    /// Returns the first violated field, in schema order.
    ///
    /// # Errors
    /// The outer `Err` carries schema accessor and policy failures; the
    /// inner one carries the violation.
    pub fn validate(
        &self,
        kind: RecordKind,
        record: &TranslatedRecord,
    ) -> Result<Result<(), FieldViolation>, MigrationError> {
        let fields = self.schema.fields_of(kind)?;
        let policy = self.policy.for_kind(kind)?;
        Ok(validate_against(policy, &fields, record))
    }
}

fn validate_against(
    policy: &KindPolicy,
    fields: &[FieldDescriptor],
    record: &TranslatedRecord,
) -> Result<(), FieldViolation> {
    for field in fields {
        if field.is_internal_id()
            || field.auto_managed
            || policy.validation_exclusions.contains(&field.name)
        {
            continue;
        }

        match record.get(&field.name) {
            None => {
                if field.is_required() {
                    return Err(FieldViolation::new(
                        &field.name,
                        "field is required but has no value",
                    ));
                }
            }
            Some(Value::Null) => {
                if !field.nullable {
                    return Err(FieldViolation::new(&field.name, "field may not be null"));
                }
            }
            Some(value) => check_value(field, value)?,
        }
    }

    for name in record.fields().keys() {
        if policy.validation_exclusions.contains(name) {
            continue;
        }
        if !fields.iter().any(|field| &field.name == name) {
            return Err(FieldViolation::new(
                name,
                format!("unknown field for {}", policy.kind),
            ));
        }
    }

    Ok(())
}

fn check_value(field: &FieldDescriptor, value: &Value) -> Result<(), FieldViolation> {
    let conforms = match field.field_type {
        FieldType::Text => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Real => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Timestamp => value.as_str().is_some_and(is_timestamp),
        FieldType::Json | FieldType::Any => true,
    };

    if !conforms {
        return Err(FieldViolation::new(
            &field.name,
            format!(
                "expected {} value, got {}",
                field.field_type.as_str(),
                json_type_name(value)
            ),
        ));
    }

    if let (Some(max_length), Some(text)) = (field.max_length, value.as_str()) {
        let length = text.chars().count();
        if length > max_length {
            return Err(FieldViolation::new(
                &field.name,
                format!("ensure this value has at most {max_length} characters (it has {length})"),
            ));
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_timestamp(value: &str) -> bool {
    if OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339).is_ok() {
        return true;
    }

    const DATETIME_FORMATS: [&str; 2] = [
        "[year]-[month]-[day] [hour]:[minute]:[second]",
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]",
    ];
    let parses_as_datetime = DATETIME_FORMATS.iter().any(|description| {
        time::format_description::parse(description)
            .is_ok_and(|format| time::PrimitiveDateTime::parse(value, &format).is_ok())
    });
    if parses_as_datetime {
        return true;
    }

    time::format_description::parse("[year]-[month]-[day]")
        .is_ok_and(|format| time::Date::parse(value, &format).is_ok())
}

/// Translates and validates every record of every kind from `source`.
///
/// # Errors
/// Aborts on the first [`MigrationError::UnresolvableField`] or
/// [`MigrationError::Validation`]; no partial output is returned.
pub fn translate_document<P, S>(
    source: &P,
    schema: &S,
    policy: &MigrationPolicy,
    name_pattern: Option<&NamePattern>,
) -> Result<TranslatedBatches, MigrationError>
where
    P: SourceDataProvider + ?Sized,
    S: SchemaAccessor + ?Sized,
{
    policy.validate()?;
    let translator = RecordTranslator::new(schema, policy);
    let mut batches = TranslatedBatches::default();

    for kind in RecordKind::ALL {
        let records = source.list_records(kind, name_pattern)?;
        let fields = schema.fields_of(kind)?;
        let kind_policy = policy.for_kind(kind)?;
        info!(%kind, records = records.len(), "translating batch");

        for (position, record) in records.iter().enumerate() {
            let label = record
                .name()
                .map_or_else(|| format!("<unnamed-{}>", position + 1), str::to_string);
            info!(%kind, position = position + 1, name = %label, "translating record");

            let translated = translator.translate_with(kind, &fields, record)?;
            if let Err(violation) = validate_against(kind_policy, &fields, &translated) {
                warn!(%kind, name = %label, field = %violation.field, reason = %violation.reason, "validation failed");
                return Err(MigrationError::Validation {
                    kind,
                    name: label,
                    field: violation.field,
                    reason: violation.reason,
                });
            }
            batches.push(kind, translated);
        }
    }

    Ok(batches)
}

/// Dumps every kind from `source` into an interchange document.
///
/// # Errors
/// Returns the provider's error.
pub fn extract_document<P: SourceDataProvider + ?Sized>(
    source: &P,
    name_pattern: Option<&NamePattern>,
) -> Result<MigrationDocument, MigrationError> {
    let mut document = MigrationDocument::default();
    for kind in RecordKind::ALL {
        let records = source.list_records(kind, name_pattern)?;
        info!(%kind, records = records.len(), "extracted records");
        for record in records {
            document.push(kind, record.into_fields());
        }
    }
    Ok(document)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteFlags {
    /// Operator asked for deletion at all.
    pub global: bool,
    pub per_kind: BTreeMap<RecordKind, bool>,
}

impl DeleteFlags {
    #[must_use]
    pub fn any_per_kind(&self) -> bool {
        self.per_kind.values().any(|flag| *flag)
    }

    #[must_use]
    pub fn kind_flag(&self, kind: RecordKind) -> bool {
        self.per_kind.get(&kind).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DeleteDecision {
    DeleteDisabled,
    NotSelected,
    NoIncomingRecords,
    SelectedByKindFlag,
    SelectedByGlobalDelete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindPlan {
    pub kind: RecordKind,
    pub incoming: usize,
    pub should_delete_existing: bool,
    pub decision: DeleteDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub kinds: Vec<KindPlan>,
}

impl ReconciliationPlan {
    #[must_use]
    pub fn should_delete(&self, kind: RecordKind) -> bool {
        self.kinds
            .iter()
            .any(|item| item.kind == kind && item.should_delete_existing)
    }
}

/// Decides per kind whether existing records are deleted before upserts.
///
/// A kind is deleted only when global delete is on, its own flag is set or
/// no per-kind flag is set for any kind, and the batch has at least one
/// record of that kind.
#[must_use]
pub fn plan_reconciliation(
    flags: &DeleteFlags,
    counts: &BTreeMap<RecordKind, usize>,
) -> ReconciliationPlan {
    let any_specific = flags.any_per_kind();

    let kinds = RecordKind::ALL
        .into_iter()
        .map(|kind| {
            let incoming = counts.get(&kind).copied().unwrap_or(0);
            let decision = if !flags.global {
                DeleteDecision::DeleteDisabled
            } else if any_specific && !flags.kind_flag(kind) {
                DeleteDecision::NotSelected
            } else if incoming == 0 {
                DeleteDecision::NoIncomingRecords
            } else if any_specific {
                DeleteDecision::SelectedByKindFlag
            } else {
                DeleteDecision::SelectedByGlobalDelete
            };

            KindPlan {
                kind,
                incoming,
                should_delete_existing: matches!(
                    decision,
                    DeleteDecision::SelectedByKindFlag | DeleteDecision::SelectedByGlobalDelete
                ),
                decision,
            }
        })
        .collect();

    ReconciliationPlan { kinds }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindReport {
    pub kind: RecordKind,
    pub deleted: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl KindReport {
    #[must_use]
    pub fn empty(kind: RecordKind) -> Self {
        Self {
            kind,
            deleted: 0,
            created: 0,
            updated: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub contract_version: String,
    pub run_id: Ulid,
    pub generated_at: String,
    pub dry_run: bool,
    pub owner: OwnerIdentity,
    pub plan: ReconciliationPlan,
    pub kinds: Vec<KindReport>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn for_kind(&self, kind: RecordKind) -> Option<&KindReport> {
        self.kinds.iter().find(|item| item.kind == kind)
    }
}

/// Applies a plan and translated batches to a destination store.
pub struct Reconciler {
    owner_fields: BTreeMap<RecordKind, String>,
}

impl Reconciler {
    /// A kind carries ownership when its policy names an owner field and
    /// the destination schema has that field.
    ///
    /// # Errors
    /// Returns policy or schema accessor failures.
    pub fn new<S: SchemaAccessor + ?Sized>(
        policy: &MigrationPolicy,
        schema: &S,
    ) -> Result<Self, MigrationError> {
        let mut owner_fields = BTreeMap::new();
        for kind in RecordKind::ALL {
            let Some(owner_field) = &policy.for_kind(kind)?.owner_field else {
                continue;
            };
            let fields = schema.fields_of(kind)?;
            if fields.iter().any(|field| &field.name == owner_field) {
                owner_fields.insert(kind, owner_field.clone());
            } else {
                debug!(%kind, field = %owner_field, "destination has no owner field");
            }
        }
        Ok(Self { owner_fields })
    }

    #[must_use]
    pub fn carries_ownership(&self, kind: RecordKind) -> bool {
        self.owner_fields.contains_key(&kind)
    }

    /// Deletes planned kinds, then upserts every record by name, all in one
    /// atomic unit.
    ///
    /// # Errors
    /// Any store failure aborts the run and rolls back every mutation.
    pub fn apply<S: TransactionalStore + ?Sized>(
        &self,
        store: &mut S,
        plan: &ReconciliationPlan,
        batches: &TranslatedBatches,
        owner: &OwnerIdentity,
    ) -> Result<ReconciliationReport, MigrationError> {
        let kinds = store.atomically(|tx| {
            let mut reports = Vec::new();
            for kind in RecordKind::ALL {
                reports.push(self.apply_kind(tx, plan, kind, batches.records(kind), owner)?);
            }
            Ok(reports)
        })?;

        info!("load process completed successfully");
        build_report(false, owner, plan, kinds)
    }

    /// Computes the counts [`Reconciler::apply`] would report without
    /// mutating the store.
    ///
    /// # Errors
    /// Returns store read failures.
    pub fn preview<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        plan: &ReconciliationPlan,
        batches: &TranslatedBatches,
        owner: &OwnerIdentity,
    ) -> Result<ReconciliationReport, MigrationError> {
        let mut kinds = Vec::new();
        for kind in RecordKind::ALL {
            let delete = plan.should_delete(kind);
            let mut report = KindReport::empty(kind);
            if delete {
                report.deleted = store.count(kind)?;
            }
            let mut seen = BTreeSet::new();

            for record in batches.records(kind) {
                let Some(name) = record.name() else {
                    report.skipped += 1;
                    continue;
                };
                let exists = seen.contains(name)
                    || (!delete && store.find_by_name(kind, name)?.is_some());
                if exists {
                    report.updated += 1;
                } else {
                    report.created += 1;
                }
                seen.insert(name.to_string());
            }
            kinds.push(report);
        }

        build_report(true, owner, plan, kinds)
    }

    fn apply_kind(
        &self,
        store: &mut dyn RecordStore,
        plan: &ReconciliationPlan,
        kind: RecordKind,
        records: &[TranslatedRecord],
        owner: &OwnerIdentity,
    ) -> Result<KindReport, MigrationError> {
        let mut report = KindReport::empty(kind);

        if plan.should_delete(kind) {
            let existing = store.count(kind)?;
            info!(%kind, existing, incoming = records.len(), "deleting existing records");
            report.deleted = store.delete_all(kind)?;
        } else {
            debug!(%kind, "not deleting existing records");
        }

        let owner_field = self.owner_fields.get(&kind);

        for (index, record) in records.iter().enumerate() {
            let Some(name) = record.name() else {
                let skip = MigrationError::MissingNaturalKey {
                    kind,
                    position: index + 1,
                };
                warn!(%kind, %skip, "skipping record with missing name");
                report.skipped += 1;
                continue;
            };

            let mut fields = record.fields().clone();
            if let Some(owner_field) = owner_field {
                fields.insert(owner_field.clone(), Value::String(owner.to_string()));
            }

            match store.find_by_name(kind, name)? {
                Some(existing) => {
                    store.update(kind, &existing, &fields)?;
                    report.updated += 1;
                }
                None => {
                    store.create(kind, &fields)?;
                    report.created += 1;
                }
            }
        }

        info!(
            %kind,
            created = report.created,
            updated = report.updated,
            skipped = report.skipped,
            owner_assigned = owner_field.is_some(),
            "processed records"
        );
        Ok(report)
    }
}

fn build_report(
    dry_run: bool,
    owner: &OwnerIdentity,
    plan: &ReconciliationPlan,
    kinds: Vec<KindReport>,
) -> Result<ReconciliationReport, MigrationError> {
    Ok(ReconciliationReport {
        contract_version: REPORT_CONTRACT_VERSION.to_string(),
        run_id: Ulid::new(),
        generated_at: format_rfc3339(now_utc())?,
        dry_run,
        owner: owner.clone(),
        plan: plan.clone(),
        kinds,
    })
}

/// Resolves the owner, plans deletions, and reconciles `batches` into
/// `store`. With `dry_run` the store is only read.
///
/// # Errors
/// Returns [`MigrationError::NoOwnerIdentity`] before any mutation when no
/// owner resolves, and any store failure (after rollback).
pub fn load_batches<S: DestinationStore>(
    store: &mut S,
    policy: &MigrationPolicy,
    flags: &DeleteFlags,
    batches: &TranslatedBatches,
    dry_run: bool,
) -> Result<ReconciliationReport, MigrationError> {
    policy.validate()?;
    let owner = store.resolve_owner_identity()?;
    info!(%owner, "using owner identity for ownership");

    let plan = plan_reconciliation(flags, &batches.counts());
    for item in &plan.kinds {
        debug!(kind = %item.kind, incoming = item.incoming, decision = ?item.decision, "delete decision");
    }

    let reconciler = Reconciler::new(policy, &*store)?;
    if dry_run {
        reconciler.preview(&*store, &plan, batches, &owner)
    } else {
        reconciler.apply(store, &plan, batches, &owner)
    }
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`MigrationError::Document`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MigrationError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| MigrationError::Document(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

fn string_set(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
