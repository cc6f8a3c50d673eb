//! Field schema model and the merge/replace update planner.
//!
//! A [`Schema`] mirrors the field list of one remote collection. Updates are
//! expressed as an ordered batch of [`SchemaOperation`]s so the cluster can
//! apply them in one request, and the same batch is replayed locally to
//! compute the schema the cache should hold afterwards.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value as JsonValue};

use crate::error::{ConnectorError, Result};

/// Reserved optimistic-concurrency field maintained by the cluster.
pub const VERSION_FIELD: &str = "_version_";
/// Unique-key field name used when a table does not configure one.
pub const DEFAULT_UNIQUE_KEY: &str = "id";

/// Scalar field types a table may declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Long,
    Float,
    Double,
    Boolean,
    String,
    Timestamp,
    /// Remote type outside the supported set; preserved when read back but
    /// never produced from table configuration.
    Custom(String),
}

impl FieldType {
    /// Field type name understood by the cluster.
    pub fn remote_name(&self) -> &str {
        match self {
            Self::Int => "pint",
            Self::Long => "plong",
            Self::Float => "pfloat",
            Self::Double => "pdouble",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Timestamp => "pdate",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Maps a cluster type name back to a field type.
    pub fn from_remote_name(name: &str) -> Self {
        match name {
            "pint" | "int" => Self::Int,
            "plong" | "long" => Self::Long,
            "pfloat" | "float" => Self::Float,
            "pdouble" | "double" => Self::Double,
            "boolean" => Self::Boolean,
            "string" => Self::String,
            "pdate" | "date" => Self::Timestamp,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl FromStr for FieldType {
    type Err = ConnectorError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Ok(Self::Int),
            "long" => Ok(Self::Long),
            "float" => Ok(Self::Float),
            "double" => Ok(Self::Double),
            "bool" | "boolean" => Ok(Self::Boolean),
            "string" | "text" => Ok(Self::String),
            "timestamp" | "date" => Ok(Self::Timestamp),
            other => Err(ConnectorError::Configuration(format!(
                "unsupported field type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.remote_name())
    }
}

/// One field of a collection schema. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub indexed: bool,
    pub stored: bool,
    pub multi_valued: bool,
}

impl FieldDescriptor {
    /// Indexed, stored, single-valued field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            indexed: true,
            stored: true,
            multi_valued: false,
        }
    }

    pub fn with_indexed(mut self, indexed: bool) -> Self {
        self.indexed = indexed;
        self
    }

    pub fn with_stored(mut self, stored: bool) -> Self {
        self.stored = stored;
        self
    }

    pub fn with_multi_valued(mut self, multi_valued: bool) -> Self {
        self.multi_valued = multi_valued;
        self
    }

    /// Field definition payload used by add/replace schema commands.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "name": self.name,
            "type": self.field_type.remote_name(),
            "indexed": self.indexed,
            "stored": self.stored,
            "multiValued": self.multi_valued,
        })
    }

    /// Parses a field entry of a schema-fields response.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let field_type = FieldType::from_remote_name(value.get("type")?.as_str()?);
        let flag = |key: &str, default: bool| {
            value
                .get(key)
                .and_then(JsonValue::as_bool)
                .unwrap_or(default)
        };
        Some(Self {
            name,
            field_type,
            indexed: flag("indexed", true),
            stored: flag("stored", true),
            multi_valued: flag("multiValued", false),
        })
    }
}

/// Unique key plus ordered field descriptors of one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    unique_key: String,
    fields: Vec<FieldDescriptor>,
}

impl Schema {
    pub fn new(unique_key: impl Into<String>) -> Self {
        Self {
            unique_key: unique_key.into(),
            fields: Vec::new(),
        }
    }

    /// Builds a schema, keeping the last descriptor for a repeated name.
    pub fn with_fields(
        unique_key: impl Into<String>,
        fields: impl IntoIterator<Item = FieldDescriptor>,
    ) -> Self {
        let mut schema = Self::new(unique_key);
        for field in fields {
            schema.upsert_field(field);
        }
        schema
    }

    pub fn unique_key(&self) -> &str {
        &self.unique_key
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|field| field.name.as_str()).collect()
    }

    /// Whether `name` is the unique key or the version field.
    pub fn is_protected(&self, name: &str) -> bool {
        name == self.unique_key || name == VERSION_FIELD
    }

    /// Replaces a same-named field in place or appends a new one.
    pub fn upsert_field(&mut self, field: FieldDescriptor) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
    }

    fn remove_field(&mut self, name: &str) {
        self.fields.retain(|field| field.name != name);
    }

    /// Parses a field list of the form `name:type[:flag...],...`.
    ///
    /// Flags: `indexed`, `unindexed`, `stored`, `unstored`, `multivalued`.
    pub fn parse_field_list(unique_key: &str, raw: &str) -> Result<Self> {
        let mut schema = Self::new(unique_key);
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':').map(str::trim);
            let name = parts.next().unwrap_or_default();
            if !is_valid_field_name(name) {
                return Err(ConnectorError::Configuration(format!(
                    "invalid field name in schema entry '{entry}'"
                )));
            }
            let field_type = parts
                .next()
                .ok_or_else(|| {
                    ConnectorError::Configuration(format!(
                        "schema entry '{entry}' is missing a type"
                    ))
                })?
                .parse::<FieldType>()?;
            let mut field = FieldDescriptor::new(name, field_type);
            for flag in parts {
                field = match flag.to_ascii_lowercase().as_str() {
                    "indexed" => field.with_indexed(true),
                    "unindexed" => field.with_indexed(false),
                    "stored" => field.with_stored(true),
                    "unstored" => field.with_stored(false),
                    "multivalued" => field.with_multi_valued(true),
                    other => {
                        return Err(ConnectorError::Configuration(format!(
                            "unknown flag '{other}' in schema entry '{entry}'"
                        )))
                    }
                };
            }
            if schema.contains(name) {
                return Err(ConnectorError::Configuration(format!(
                    "field '{name}' declared twice"
                )));
            }
            schema.upsert_field(field);
        }
        Ok(schema)
    }

    /// Replays an operation batch on a copy of this schema.
    pub fn applied(&self, operations: &[SchemaOperation]) -> Self {
        let mut next = self.clone();
        for operation in operations {
            match operation {
                SchemaOperation::AddField(field) | SchemaOperation::ReplaceField(field) => {
                    next.upsert_field(field.clone())
                }
                SchemaOperation::DeleteField(name) => {
                    if !next.is_protected(name) {
                        next.remove_field(name);
                    }
                }
            }
        }
        next
    }
}

fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// One command of a schema update batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOperation {
    AddField(FieldDescriptor),
    ReplaceField(FieldDescriptor),
    DeleteField(String),
}

impl SchemaOperation {
    /// Command name of the schema API.
    pub fn command(&self) -> &'static str {
        match self {
            Self::AddField(_) => "add-field",
            Self::ReplaceField(_) => "replace-field",
            Self::DeleteField(_) => "delete-field",
        }
    }

    /// Command payload of the schema API.
    pub fn payload(&self) -> JsonValue {
        match self {
            Self::AddField(field) | Self::ReplaceField(field) => field.to_json(),
            Self::DeleteField(name) => json!({ "name": name }),
        }
    }

    pub fn field_name(&self) -> &str {
        match self {
            Self::AddField(field) | Self::ReplaceField(field) => &field.name,
            Self::DeleteField(name) => name,
        }
    }
}

/// Encodes a batch as one JSON object with repeated command keys.
///
/// The schema API executes commands in document order, which a map-based
/// encoder cannot express, so the object is assembled by hand.
pub fn encode_operation_batch(operations: &[SchemaOperation]) -> String {
    let body = operations
        .iter()
        .map(|op| format!("{}:{}", JsonValue::from(op.command()), op.payload()))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

/// Computes the operation batch that moves `current` towards `desired`.
///
/// Merge mode adds unknown fields and replaces known ones, never deleting.
/// Replace mode deletes every unprotected field, then adds the desired ones;
/// protected fields named by `desired` are replaced in place.
pub fn plan_update(current: &Schema, desired: &Schema, merge: bool) -> Vec<SchemaOperation> {
    let mut operations = Vec::new();
    if merge {
        for field in desired.fields() {
            if current.contains(&field.name) {
                operations.push(SchemaOperation::ReplaceField(field.clone()));
            } else {
                operations.push(SchemaOperation::AddField(field.clone()));
            }
        }
        return operations;
    }

    for field in current.fields() {
        if !current.is_protected(&field.name) {
            operations.push(SchemaOperation::DeleteField(field.name.clone()));
        }
    }
    for field in desired.fields() {
        if current.is_protected(&field.name) && current.contains(&field.name) {
            operations.push(SchemaOperation::ReplaceField(field.clone()));
        } else {
            operations.push(SchemaOperation::AddField(field.clone()));
        }
    }
    operations
}

#[cfg(test)]
mod tests {
    use super::{
        encode_operation_batch, plan_update, FieldDescriptor, FieldType, Schema,
        SchemaOperation, VERSION_FIELD,
    };

    fn remote_schema() -> Schema {
        Schema::with_fields(
            "id",
            [
                FieldDescriptor::new("id", FieldType::String),
                FieldDescriptor::new(VERSION_FIELD, FieldType::Long),
                FieldDescriptor::new("price", FieldType::Double),
                FieldDescriptor::new("symbol", FieldType::String),
            ],
        )
    }

    #[test]
    fn parse_field_list_reads_types_and_flags() {
        let schema =
            Schema::parse_field_list("id", "id:string, volume:long:unstored, tags:string:multivalued")
                .unwrap();
        assert_eq!(schema.field_names(), vec!["id", "volume", "tags"]);
        assert!(!schema.field("volume").unwrap().stored);
        assert!(schema.field("tags").unwrap().multi_valued);
        assert_eq!(schema.field("volume").unwrap().field_type, FieldType::Long);
    }

    #[test]
    fn parse_field_list_rejects_unknown_types_and_duplicates() {
        assert!(Schema::parse_field_list("id", "a:blob").is_err());
        assert!(Schema::parse_field_list("id", "a:int,a:long").is_err());
        assert!(Schema::parse_field_list("id", "a").is_err());
        assert!(Schema::parse_field_list("id", "a:int:sorted").is_err());
    }

    #[test]
    fn merge_plan_adds_and_replaces_without_deleting() {
        let desired = Schema::with_fields(
            "id",
            [
                FieldDescriptor::new("price", FieldType::Float),
                FieldDescriptor::new("volume", FieldType::Long),
                FieldDescriptor::new("symbol", FieldType::String),
            ],
        );
        let plan = plan_update(&remote_schema(), &desired, true);
        assert_eq!(
            plan,
            vec![
                SchemaOperation::ReplaceField(FieldDescriptor::new("price", FieldType::Float)),
                SchemaOperation::AddField(FieldDescriptor::new("volume", FieldType::Long)),
                SchemaOperation::ReplaceField(FieldDescriptor::new("symbol", FieldType::String)),
            ]
        );
        let merged = remote_schema().applied(&plan);
        assert_eq!(merged.field_names(), vec!["id", VERSION_FIELD, "price", "symbol", "volume"]);
    }

    #[test]
    fn replace_plan_keeps_only_protected_fields_and_desired_fields() {
        let desired = Schema::with_fields(
            "id",
            [
                FieldDescriptor::new("volume", FieldType::Long),
                FieldDescriptor::new("price", FieldType::Double),
            ],
        );
        let plan = plan_update(&remote_schema(), &desired, false);
        assert_eq!(plan[0], SchemaOperation::DeleteField("price".to_string()));
        assert_eq!(plan[1], SchemaOperation::DeleteField("symbol".to_string()));
        let replaced = remote_schema().applied(&plan);
        let mut names = replaced.field_names();
        names.sort();
        assert_eq!(names, vec!["_version_", "id", "price", "volume"]);
    }

    #[test]
    fn replace_plan_never_deletes_unique_key_even_when_redeclared() {
        let desired = Schema::with_fields("id", [FieldDescriptor::new("id", FieldType::Long)]);
        let plan = plan_update(&remote_schema(), &desired, false);
        assert!(plan
            .iter()
            .all(|op| !matches!(op, SchemaOperation::DeleteField(name) if name == "id")));
        assert!(plan.contains(&SchemaOperation::ReplaceField(FieldDescriptor::new(
            "id",
            FieldType::Long
        ))));
    }

    #[test]
    fn deleting_protected_field_is_ignored_locally() {
        let after = remote_schema().applied(&[SchemaOperation::DeleteField(
            VERSION_FIELD.to_string(),
        )]);
        assert!(after.contains(VERSION_FIELD));
    }

    #[test]
    fn batch_encoding_keeps_command_order() {
        let body = encode_operation_batch(&[
            SchemaOperation::DeleteField("a".to_string()),
            SchemaOperation::AddField(FieldDescriptor::new("a", FieldType::Int)),
        ]);
        let delete_at = body.find("\"delete-field\"").unwrap();
        let add_at = body.find("\"add-field\"").unwrap();
        assert!(delete_at < add_at);
        assert!(body.starts_with('{') && body.ends_with('}'));
    }

    #[test]
    fn remote_type_names_round_trip_and_preserve_custom_types() {
        assert_eq!(FieldType::from_remote_name("pdate"), FieldType::Timestamp);
        assert_eq!(
            FieldType::from_remote_name("text_general").remote_name(),
            "text_general"
        );
    }
}
