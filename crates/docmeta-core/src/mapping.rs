use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub output_path: String,
    pub internal_field: String,
    pub required: bool,
}

/// Ordered `output path -> internal field` projection. Paths are dotted
/// and build nested objects in the output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMap {
    pub fields: Vec<FieldMapping>,
}

impl SchemaMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, output_path: impl Into<String>, internal_field: impl Into<String>) -> Self {
        self.fields.push(FieldMapping {
            output_path: output_path.into(),
            internal_field: internal_field.into(),
            required: false,
        });
        self
    }

    #[must_use]
    pub fn required_field(
        mut self,
        output_path: impl Into<String>,
        internal_field: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldMapping {
            output_path: output_path.into(),
            internal_field: internal_field.into(),
            required: true,
        });
        self
    }

    /// Identity mapping for each name.
    pub fn identity<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        names.into_iter().fold(Self::new(), |map, name| map.field(name, name))
    }

    pub fn internal_fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.internal_field.as_str())
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.internal_field.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SchemaMapper {
    map: SchemaMap,
}

impl SchemaMapper {
    /// Rejects empty path segments, duplicate paths and paths that would be
    /// both a value and a parent object.
    pub fn new(map: SchemaMap) -> Result<Self> {
        let mut seen: HashSet<&str> = HashSet::new();

        for mapping in &map.fields {
            let path = mapping.output_path.as_str();
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(Error::InvalidSchemaMap(format!("invalid output path '{path}'")));
            }
            if mapping.internal_field.is_empty() {
                return Err(Error::InvalidSchemaMap(format!(
                    "output path '{path}' has no internal field"
                )));
            }
            if !seen.insert(path) {
                return Err(Error::InvalidSchemaMap(format!("duplicate output path '{path}'")));
            }
        }

        for a in &seen {
            for b in &seen {
                if b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'.' {
                    return Err(Error::InvalidSchemaMap(format!(
                        "output path '{a}' is both a value and the parent of '{b}'"
                    )));
                }
            }
        }

        Ok(Self { map })
    }

    pub const fn schema_map(&self) -> &SchemaMap {
        &self.map
    }

    /// Every mapped internal field must be one the pipeline can produce.
    pub fn validate_sources(&self, producible: &BTreeSet<String>) -> Result<()> {
        let unknown: Vec<&str> = self
            .map
            .internal_fields()
            .filter(|f| !producible.contains(*f))
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidSchemaMap(format!(
                "no pass, filename parser or built-in produces: {}",
                unknown.join(", ")
            )))
        }
    }

    /// Mapped fields absent (or null) in `internal`.
    pub fn missing_fields(&self, internal: &Map<String, Value>) -> Vec<String> {
        self.map
            .fields
            .iter()
            .filter(|f| is_absent(internal, &f.internal_field))
            .map(|f| f.internal_field.clone())
            .collect()
    }

    /// Projects `internal` onto the output paths. Unmapped fields are dropped,
    /// absent ones omitted; absent required fields fail the whole mapping.
    pub fn map(&self, internal: &Map<String, Value>) -> Result<Map<String, Value>> {
        let missing: Vec<String> = self
            .map
            .fields
            .iter()
            .filter(|f| f.required && is_absent(internal, &f.internal_field))
            .map(|f| f.internal_field.clone())
            .collect();

        if !missing.is_empty() {
            return Err(Error::SchemaMappingIncomplete { missing });
        }

        let mut output = Map::new();
        for mapping in &self.map.fields {
            if let Some(value) = internal.get(&mapping.internal_field).filter(|v| !v.is_null()) {
                insert_path(&mut output, &mapping.output_path, value.clone());
            }
        }
        Ok(output)
    }
}

fn is_absent(internal: &Map<String, Value>, field: &str) -> bool {
    internal.get(field).map_or(true, Value::is_null)
}

fn insert_path(output: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = output;
    for segment in segments {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(leaf.to_string(), value);
}
