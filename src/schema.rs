//! Target schemas and conformance checking.
//!
//! A schema is accepted in two spellings. The compact form maps field names
//! straight to type names:
//!
//! ```json
//! {"merchant": "string", "total": "number", "items": ["string"]}
//! ```
//!
//! The JSON-Schema subset uses `properties`, with `items` for arrays and
//! nested `properties` for objects. Both produce the same [`TargetSchema`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::PipelineError;
use crate::normalize::type_name;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid schema: {0}")]
    Invalid(String),

    #[error("Failed to read schema '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array(Box<FieldType>),
    Object(Vec<SchemaField>),
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Integer => write!(f, "integer"),
            Self::Boolean => write!(f, "boolean"),
            Self::Array(item) => write!(f, "array<{}>", item),
            Self::Object(_) => write!(f, "object"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
    pub description: Option<String>,
}

/// The fields a converted result must carry, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSchema {
    name: Option<String>,
    fields: Vec<SchemaField>,
}

impl TargetSchema {
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SchemaError::Invalid(format!("not valid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let object = value
            .as_object()
            .ok_or_else(|| SchemaError::Invalid("schema must be a JSON object".to_string()))?;

        let (fields, name) = match object.get("properties") {
            Some(Value::Object(properties)) => (
                parse_properties(properties, "")?,
                object
                    .get("title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            Some(_) => {
                return Err(SchemaError::Invalid(
                    "`properties` must be an object".to_string(),
                ))
            }
            None => (parse_compact(object, "")?, None),
        };

        if fields.is_empty() {
            return Err(SchemaError::Invalid("schema declares no fields".to_string()));
        }

        Ok(Self { name, fields })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Compact rendering used inside prompts: field name to type
    pub fn describe(&self) -> Value {
        Value::Object(describe_fields(&self.fields))
    }

    /// Check a model response against the schema.
    ///
    /// Undeclared keys are dropped, absent keys become `null`, and values are
    /// coerced when no information is lost. Anything else is a mismatch.
    pub fn conform(&self, value: &Value) -> Result<Map<String, Value>, PipelineError> {
        let object = value.as_object().ok_or_else(|| {
            PipelineError::SchemaMismatch(format!(
                "expected a JSON object, got {}",
                type_name(value)
            ))
        })?;

        conform_fields(&self.fields, object, "").map_err(PipelineError::SchemaMismatch)
    }
}

fn parse_type_name(name: &str, path: &str) -> Result<FieldType, SchemaError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "string" | "str" | "text" | "date" => Ok(FieldType::String),
        "number" | "float" | "double" | "decimal" => Ok(FieldType::Number),
        "integer" | "int" => Ok(FieldType::Integer),
        "boolean" | "bool" => Ok(FieldType::Boolean),
        other => Err(SchemaError::Invalid(format!(
            "field '{}' has unknown type '{}'",
            path, other
        ))),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn parse_compact(object: &Map<String, Value>, parent: &str) -> Result<Vec<SchemaField>, SchemaError> {
    object
        .iter()
        .map(|(name, definition)| {
            let path = join(parent, name);
            let (field_type, description) = parse_compact_type(definition, &path)?;
            Ok(SchemaField {
                name: name.clone(),
                field_type,
                description,
            })
        })
        .collect()
}

fn parse_compact_type(definition: &Value, path: &str) -> Result<(FieldType, Option<String>), SchemaError> {
    match definition {
        Value::String(name) => Ok((parse_type_name(name, path)?, None)),
        Value::Array(items) => match items.as_slice() {
            [item] => {
                let (item_type, _) = parse_compact_type(item, path)?;
                Ok((FieldType::Array(Box::new(item_type)), None))
            }
            _ => Err(SchemaError::Invalid(format!(
                "array field '{}' must declare exactly one item type",
                path
            ))),
        },
        // An object carrying a string `type` is a JSON-Schema style field definition
        Value::Object(inner) if inner.get("type").is_some_and(Value::is_string) => {
            parse_property(inner, path)
        }
        Value::Object(inner) => {
            let fields = parse_compact(inner, path)?;
            if fields.is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "object field '{}' declares no fields",
                    path
                )));
            }
            Ok((FieldType::Object(fields), None))
        }
        other => Err(SchemaError::Invalid(format!(
            "field '{}' has invalid type definition of kind {}",
            path,
            type_name(other)
        ))),
    }
}

fn parse_properties(
    properties: &Map<String, Value>,
    parent: &str,
) -> Result<Vec<SchemaField>, SchemaError> {
    properties
        .iter()
        .map(|(name, definition)| {
            let path = join(parent, name);
            let definition = definition.as_object().ok_or_else(|| {
                SchemaError::Invalid(format!("property '{}' must be an object", path))
            })?;
            let (field_type, description) = parse_property(definition, &path)?;
            Ok(SchemaField {
                name: name.clone(),
                field_type,
                description,
            })
        })
        .collect()
}

fn parse_property(
    definition: &Map<String, Value>,
    path: &str,
) -> Result<(FieldType, Option<String>), SchemaError> {
    let description = definition
        .get("description")
        .and_then(Value::as_str)
        .map(str::to_string);

    // ["string", "null"] style unions: the first non-null member wins
    let type_name = match definition.get("type") {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Array(names)) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|name| *name != "null")
            .map(str::to_string)
            .ok_or_else(|| SchemaError::Invalid(format!("property '{}' has no usable type", path)))?,
        Some(_) => {
            return Err(SchemaError::Invalid(format!(
                "property '{}' has a malformed type",
                path
            )))
        }
        None if definition.contains_key("properties") => "object".to_string(),
        None => return Err(SchemaError::Invalid(format!("property '{}' has no type", path))),
    };

    let field_type = match type_name.as_str() {
        "array" => {
            let items = definition.get("items").and_then(Value::as_object).ok_or_else(|| {
                SchemaError::Invalid(format!("array property '{}' needs an `items` object", path))
            })?;
            let (item_type, _) = parse_property(items, path)?;
            FieldType::Array(Box::new(item_type))
        }
        "object" => {
            let properties = definition
                .get("properties")
                .and_then(Value::as_object)
                .ok_or_else(|| {
                    SchemaError::Invalid(format!(
                        "object property '{}' needs a `properties` object",
                        path
                    ))
                })?;
            let fields = parse_properties(properties, path)?;
            if fields.is_empty() {
                return Err(SchemaError::Invalid(format!(
                    "object property '{}' declares no fields",
                    path
                )));
            }
            FieldType::Object(fields)
        }
        other => parse_type_name(other, path)?,
    };

    Ok((field_type, description))
}

fn describe_type(field_type: &FieldType) -> Value {
    match field_type {
        FieldType::Array(item) => Value::Array(vec![describe_type(item)]),
        FieldType::Object(fields) => Value::Object(describe_fields(fields)),
        scalar => Value::String(scalar.to_string()),
    }
}

fn describe_fields(fields: &[SchemaField]) -> Map<String, Value> {
    fields
        .iter()
        .map(|f| (f.name.clone(), describe_type(&f.field_type)))
        .collect()
}

fn conform_fields(
    fields: &[SchemaField],
    object: &Map<String, Value>,
    parent: &str,
) -> Result<Map<String, Value>, String> {
    let dropped: Vec<&str> = object
        .keys()
        .filter(|key| !fields.iter().any(|f| &f.name == *key))
        .map(String::as_str)
        .collect();
    if !dropped.is_empty() {
        tracing::debug!("Dropping undeclared keys at '{}': {:?}", parent, dropped);
    }

    let mut out = Map::with_capacity(fields.len());
    for field in fields {
        let path = join(parent, &field.name);
        let value = match object.get(&field.name) {
            None | Some(Value::Null) => Value::Null,
            Some(value) => coerce(&field.field_type, value, &path)?,
        };
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

fn coerce(field_type: &FieldType, value: &Value, path: &str) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    let mismatch = || {
        format!(
            "field '{}' expects {}, got {}",
            path,
            field_type,
            type_name(value)
        )
    };

    match field_type {
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch()),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
            Value::String(s) => parse_numeric(s).ok_or_else(|| {
                format!("field '{}' expects number, got non-numeric string {:?}", path, s)
            }),
            _ => Err(mismatch()),
        },
        FieldType::Integer => {
            let number = match value {
                Value::Number(_) => value.clone(),
                Value::String(s) if s.trim().is_empty() => return Ok(Value::Null),
                Value::String(s) => parse_numeric(s).ok_or_else(mismatch)?,
                _ => return Err(mismatch()),
            };
            as_integer(&number).ok_or_else(|| {
                format!("field '{}' expects integer, got fractional {}", path, number)
            })
        }
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        FieldType::Array(item_type) => match value {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, item)| coerce(item_type, item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            // A lone value is a one-element list
            single => Ok(Value::Array(vec![coerce(
                item_type,
                single,
                &format!("{}[0]", path),
            )?])),
        },
        FieldType::Object(fields) => match value {
            Value::Object(inner) => conform_fields(fields, inner, path).map(Value::Object),
            _ => Err(mismatch()),
        },
    }
}

/// A plain amount: optional sign and currency, digits with optional `,`
/// thousands grouping, optional decimal part
static RE_AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?xi)^
        (?P<sign>[-+])?\s*
        (?:(?:US|[CA]|R)?[$€£¥₹₩₽]\s*|(?:USD|EUR|GBP|JPY|CNY|INR|CAD|AUD|CHF|SEK|NOK|DKK|NZD|MXN|BRL|KRW|RUB)\s+)?
        (?P<sign2>-)?
        (?P<whole>\d{1,3}(?:,\d{3})+|\d+)
        (?P<fraction>\.\d+)?
        (?:\s*(?:[$€£¥₹₩₽]|USD|EUR|GBP|JPY|CNY|INR|CAD|AUD|CHF|SEK|NOK|DKK|NZD|MXN|BRL|KRW|RUB))?
        $",
    )
    .unwrap()
});

/// Parse amounts such as `"$1,234.50"`, `"42"` or `"-3.5 EUR"`.
///
/// Anything else, including quantities like `"4 x 2.50"` or
/// comma-decimal amounts like `"1.234,50"`, is not a number.
fn parse_numeric(raw: &str) -> Option<Value> {
    let caps = RE_AMOUNT.captures(raw.trim())?;
    let leading = caps.name("sign").map(|m| m.as_str());
    let after_currency = caps.name("sign2").is_some();
    if leading.is_some() && after_currency {
        return None;
    }
    let negative = leading == Some("-") || after_currency;
    let whole = caps.name("whole")?.as_str().replace(',', "");
    let sign = if negative { "-" } else { "" };

    match caps.name("fraction") {
        None => whole
            .parse::<i64>()
            .ok()
            .map(|i| Value::Number((if negative { -i } else { i }).into()))
            .or_else(|| {
                format!("{}{}", sign, whole)
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
            }),
        Some(fraction) => format!("{}{}{}", sign, whole, fraction.as_str())
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
    }
}

fn as_integer(number: &Value) -> Option<Value> {
    if number.is_i64() || number.is_u64() {
        return Some(number.clone());
    }
    let f = number.as_f64()?;
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(Value::Number((f as i64).into()))
    } else {
        None
    }
}

/// Named schemas loaded once at startup
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, TargetSchema>,
    default: Option<String>,
}

impl SchemaCatalog {
    /// Load every `*.json` file in `dir`, keyed by file stem
    pub fn load_dir(dir: &Path) -> Result<Self, SchemaError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SchemaError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut schemas = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|source| SchemaError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?
                .path();

            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let text = std::fs::read_to_string(&path).map_err(|source| SchemaError::Io {
                path: path.clone(),
                source,
            })?;
            let schema = TargetSchema::parse(&text)
                .map_err(|e| SchemaError::Invalid(format!("{}: {}", path.display(), e)))?
                .with_name(name.clone());

            tracing::info!(
                "Loaded schema '{}' with {} fields",
                name,
                schema.fields().len()
            );
            schemas.insert(name, schema);
        }

        Ok(Self {
            schemas,
            default: None,
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: TargetSchema) {
        let name = name.into();
        self.schemas.insert(name.clone(), schema.with_name(name));
    }

    pub fn with_default(mut self, name: &str) -> Result<Self, SchemaError> {
        if !self.schemas.contains_key(name) {
            return Err(SchemaError::UnknownSchema(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&TargetSchema, SchemaError> {
        self.schemas
            .get(name)
            .ok_or_else(|| SchemaError::UnknownSchema(name.to_string()))
    }

    pub fn default_schema(&self) -> Option<&TargetSchema> {
        self.default.as_deref().and_then(|name| self.schemas.get(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }
}
