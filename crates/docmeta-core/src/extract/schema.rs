use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    StringList,
    Integer,
    Number,
    Boolean,
    Object,
}

impl FieldType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::StringList => "list of strings",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
        }
    }

    /// Integers are accepted where a number is expected.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub description: String,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            description: String::new(),
        }
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A named, declared set of fields that model output must conform to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl ExtractionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Checks `object` against the declared fields. Returns the projected
    /// field map (undeclared keys dropped, nulls treated as absent) or the
    /// list of violations.
    pub fn validate(&self, object: &Map<String, Value>) -> Result<Map<String, Value>, Vec<String>> {
        let mut fields = Map::new();
        let mut violations = Vec::new();

        for spec in &self.fields {
            match object.get(&spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(format!("missing required field '{}'", spec.name));
                    }
                }
                Some(value) if spec.field_type.accepts(value) => {
                    fields.insert(spec.name.clone(), value.clone());
                }
                Some(value) => violations.push(format!(
                    "field '{}' expected {}, got {}",
                    spec.name,
                    spec.field_type.as_str(),
                    json_kind(value)
                )),
            }
        }

        if violations.is_empty() {
            Ok(fields)
        } else {
            Err(violations)
        }
    }

    /// Human-readable field listing appended to system prompts.
    pub fn describe(&self) -> String {
        let mut out = format!("Respond with a single JSON object for schema '{}' with these fields:\n", self.name);
        for spec in &self.fields {
            out.push_str(&format!(
                "- \"{}\" ({}, {})",
                spec.name,
                spec.field_type.as_str(),
                if spec.required { "required" } else { "optional" }
            ));
            if !spec.description.is_empty() {
                out.push_str(": ");
                out.push_str(&spec.description);
            }
            out.push('\n');
        }
        out.push_str("Use null for optional fields you cannot find. Do not add other fields.");
        out
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated instance of an [`ExtractionSchema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub schema: String,
    pub fields: Map<String, Value>,
}

impl ParsedRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
