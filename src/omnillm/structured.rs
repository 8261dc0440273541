//! Structured output: schema descriptions and typed population.
//!
//! A [`StructSchema`] describes the shape a provider response must conform
//! to.  It is built through the fluent builder or inferred from a JSON
//! template, converted to a JSON-schema description for the provider, and
//! used to populate the parsed response with type coercion.
//!
//! [`populate`] is exposed standalone; it performs no AI call and is used
//! directly for testing and cache rehydration.
//!
//! # Example
//!
//! ```rust
//! use omnillm::omnillm::structured::{populate, FieldType, StructSchema};
//! use serde_json::json;
//!
//! let person = StructSchema::new("Person")
//!     .field("firstName", FieldType::String)
//!     .field("lastName", FieldType::String)
//!     .field("age", FieldType::Integer);
//!
//! let value = populate(&person, &json!({"FIRSTNAME": "Alice", "lastName": "Smith", "age": "32"}))
//!     .unwrap();
//! assert_eq!(value["firstName"], json!("Alice"));
//! assert_eq!(value["age"], json!(32));
//! ```

use crate::omnillm::error::AiError;
use serde_json::{json, Map, Value};

/// Type of a schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    /// A string value.
    String,
    /// A floating-point number.
    Number,
    /// An integer.
    Integer,
    /// A boolean.
    Boolean,
    /// A nested object described by its own schema.
    Object(StructSchema),
    /// An array of the given element type.
    Array(Box<FieldType>),
}

impl FieldType {
    /// JSON-schema description of this type.
    fn to_json_schema(&self) -> Value {
        match self {
            FieldType::String => json!({"type": "string"}),
            FieldType::Number => json!({"type": "number"}),
            FieldType::Integer => json!({"type": "integer"}),
            FieldType::Boolean => json!({"type": "boolean"}),
            FieldType::Object(schema) => schema.to_json_schema(),
            FieldType::Array(items) => json!({
                "type": "array",
                "items": items.to_json_schema(),
            }),
        }
    }

    /// Neutral default when a field is absent and carries no explicit
    /// default: empty string, zero, false, empty object/array.
    fn neutral_default(&self) -> Value {
        match self {
            FieldType::String => Value::String(String::new()),
            FieldType::Number => json!(0.0),
            FieldType::Integer => json!(0),
            FieldType::Boolean => Value::Bool(false),
            FieldType::Object(schema) => {
                // Recursing fills nested defaults.
                populate(schema, &Value::Object(Map::new())).unwrap_or(Value::Object(Map::new()))
            }
            FieldType::Array(_) => Value::Array(Vec::new()),
        }
    }
}

/// One field of a [`StructSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Field name as it appears in the populated output.
    pub name: String,
    /// Field type, driving coercion during population.
    pub field_type: FieldType,
    /// Description surfaced in the JSON-schema sent to the provider.
    pub description: Option<String>,
    /// Value used when the response omits the field.
    pub default: Option<Value>,
}

/// Schema describing a structured-output target.
///
/// Immutable once built; the builder methods consume and return `self`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructSchema {
    /// Schema name, used as the JSON-schema title.
    pub name: String,
    /// Ordered field list.
    pub fields: Vec<FieldSchema>,
    /// When true the populated value is an array of conforming objects.
    pub many: bool,
}

impl StructSchema {
    /// Start a schema with the given name and no fields.
    pub fn new(name: impl Into<String>) -> Self {
        StructSchema {
            name: name.into(),
            fields: Vec::new(),
            many: false,
        }
    }

    /// Append a field.
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            description: None,
            default: None,
        });
        self
    }

    /// Append a field with a description for the provider.
    pub fn field_described(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            description: Some(description.into()),
            default: None,
        });
        self
    }

    /// Append a field with an explicit default used when the response omits it.
    pub fn field_with_default(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        default: Value,
    ) -> Self {
        self.fields.push(FieldSchema {
            name: name.into(),
            field_type,
            description: None,
            default: Some(default),
        });
        self
    }

    /// Mark the schema as an array target: the provider is asked for an
    /// array of conforming objects and population yields a JSON array.
    pub fn array_of(mut self) -> Self {
        self.many = true;
        self
    }

    /// Infer a schema from a JSON template.
    ///
    /// The template's values act as typed exemplars: a string field becomes
    /// `FieldType::String`, an integer `Integer`, a float `Number`, a bool
    /// `Boolean`; nested objects recurse; arrays take their element type
    /// from the first element (string when empty).  Template values double
    /// as field defaults.
    pub fn from_template(name: impl Into<String>, template: &Value) -> Result<Self, AiError> {
        let object = template.as_object().ok_or_else(|| {
            AiError::InvalidArgument("structured-output template must be a JSON object".into())
        })?;
        let mut schema = StructSchema::new(name);
        for (key, value) in object {
            let field_type = infer_field_type(key, value)?;
            schema.fields.push(FieldSchema {
                name: key.clone(),
                field_type,
                description: None,
                default: Some(value.clone()),
            });
        }
        Ok(schema)
    }

    /// JSON-schema description sent to providers.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut prop = field.field_type.to_json_schema();
            if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(field.name.clone(), prop);
            required.push(Value::String(field.name.clone()));
        }
        let object_schema = json!({
            "type": "object",
            "title": self.name,
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        });
        if self.many {
            json!({"type": "array", "items": object_schema})
        } else {
            object_schema
        }
    }
}

fn infer_field_type(key: &str, value: &Value) -> Result<FieldType, AiError> {
    match value {
        Value::String(_) => Ok(FieldType::String),
        Value::Bool(_) => Ok(FieldType::Boolean),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Ok(FieldType::Integer)
            } else {
                Ok(FieldType::Number)
            }
        }
        Value::Object(_) => Ok(FieldType::Object(StructSchema::from_template(key, value)?)),
        Value::Array(items) => {
            let element = match items.first() {
                Some(first) => infer_field_type(key, first)?,
                None => FieldType::String,
            };
            Ok(FieldType::Array(Box::new(element)))
        }
        Value::Null => Ok(FieldType::String),
    }
}

/// Populate `data` into the shape described by `schema`.
///
/// Field matching is case-insensitive.  Numeric strings coerce to numbers,
/// `"true"`/`"false"` to booleans, numbers to their string form for string
/// fields.  Nested object fields recurse; array fields populate each
/// element.  Extra fields in `data` are ignored; missing fields take the
/// field's declared default (or a neutral default).  A value that cannot be
/// coerced is [`AiError::SchemaViolation`].
pub fn populate(schema: &StructSchema, data: &Value) -> Result<Value, AiError> {
    if schema.many {
        let items = data.as_array().ok_or_else(|| {
            AiError::SchemaViolation(format!(
                "expected a JSON array for schema '{}', got {}",
                schema.name,
                type_name(data)
            ))
        })?;
        let mut element_schema = schema.clone();
        element_schema.many = false;
        let populated = items
            .iter()
            .map(|item| populate(&element_schema, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Array(populated));
    }

    let object = data.as_object().ok_or_else(|| {
        AiError::SchemaViolation(format!(
            "expected a JSON object for schema '{}', got {}",
            schema.name,
            type_name(data)
        ))
    })?;

    let mut output = Map::new();
    for field in &schema.fields {
        let found = object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(&field.name))
            .map(|(_, value)| value);
        let value = match found {
            Some(value) if !value.is_null() => coerce(&field.field_type, value, &field.name)?,
            _ => match &field.default {
                Some(default) => default.clone(),
                None => field.field_type.neutral_default(),
            },
        };
        output.insert(field.name.clone(), value);
    }
    Ok(Value::Object(output))
}

fn coerce(field_type: &FieldType, value: &Value, field: &str) -> Result<Value, AiError> {
    match field_type {
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(violation(field, "string", other)),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| violation(field, "number", value)),
            other => Err(violation(field, "number", other)),
        },
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => {
                // Accept floats with no fractional part.
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(json!(f as i64))
                } else {
                    Err(violation(field, "integer", value))
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|i| json!(i))
                .map_err(|_| violation(field, "integer", value)),
            other => Err(violation(field, "integer", other)),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(violation(field, "boolean", value)),
            },
            other => Err(violation(field, "boolean", other)),
        },
        FieldType::Object(nested) => populate(nested, value),
        FieldType::Array(element) => {
            let items = value
                .as_array()
                .ok_or_else(|| violation(field, "array", value))?;
            let populated = items
                .iter()
                .map(|item| coerce(element, item, field))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(populated))
        }
    }
}

fn violation(field: &str, expected: &str, got: &Value) -> AiError {
    AiError::SchemaViolation(format!(
        "field '{}' expected {}, got {}",
        field,
        expected,
        type_name(got)
    ))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> StructSchema {
        StructSchema::new("Person")
            .field("firstName", FieldType::String)
            .field("lastName", FieldType::String)
            .field("age", FieldType::Integer)
    }

    #[test]
    fn populate_coerces_numeric_strings_and_case() {
        let value = populate(
            &person(),
            &json!({"FirstName": "Alice", "lastname": "Smith", "AGE": "32"}),
        )
        .unwrap();
        assert_eq!(value["firstName"], json!("Alice"));
        assert_eq!(value["lastName"], json!("Smith"));
        assert_eq!(value["age"], json!(32));
    }

    #[test]
    fn populate_ignores_extra_and_defaults_missing() {
        let schema = person().field_with_default("country", FieldType::String, json!("US"));
        let value = populate(&schema, &json!({"firstName": "Bob", "hobby": "chess"})).unwrap();
        assert_eq!(value["firstName"], json!("Bob"));
        assert_eq!(value["lastName"], json!(""));
        assert_eq!(value["country"], json!("US"));
        assert!(value.get("hobby").is_none());
    }

    #[test]
    fn populate_boolean_coercion() {
        let schema = StructSchema::new("Flag").field("active", FieldType::Boolean);
        let value = populate(&schema, &json!({"active": "TRUE"})).unwrap();
        assert_eq!(value["active"], json!(true));
    }

    #[test]
    fn populate_nested_objects_and_arrays() {
        let address = StructSchema::new("Address")
            .field("city", FieldType::String)
            .field("zip", FieldType::String);
        let schema = StructSchema::new("Person")
            .field("name", FieldType::String)
            .field("address", FieldType::Object(address))
            .field("scores", FieldType::Array(Box::new(FieldType::Integer)));
        let value = populate(
            &schema,
            &json!({
                "name": "Carol",
                "Address": {"City": "Lisbon", "zip": 1000},
                "scores": ["1", 2, 3.0]
            }),
        )
        .unwrap();
        assert_eq!(value["address"]["city"], json!("Lisbon"));
        assert_eq!(value["address"]["zip"], json!("1000"));
        assert_eq!(value["scores"], json!([1, 2, 3]));
    }

    #[test]
    fn populate_array_schema() {
        let schema = person().array_of();
        let value = populate(
            &schema,
            &json!([{"firstName": "A", "lastName": "B", "age": 1}]),
        )
        .unwrap();
        assert_eq!(value.as_array().unwrap().len(), 1);
        assert_eq!(value[0]["firstName"], json!("A"));
    }

    #[test]
    fn populate_round_trip_identity() {
        // populate(S, serialize(O)) == O modulo default-filled fields.
        let original = json!({"firstName": "Dana", "lastName": "Fox", "age": 40});
        let value = populate(&person(), &original).unwrap();
        assert_eq!(value, original);
    }

    #[test]
    fn populate_rejects_uncoercible_values() {
        let result = populate(&person(), &json!({"firstName": {}, "lastName": "x", "age": 1}));
        assert!(matches!(result, Err(AiError::SchemaViolation(_))));
    }

    #[test]
    fn template_inference_carries_types_and_defaults() {
        let schema = StructSchema::from_template(
            "Config",
            &json!({"host": "localhost", "port": 8080, "debug": false, "ratio": 0.5}),
        )
        .unwrap();
        let by_name = |n: &str| {
            schema
                .fields
                .iter()
                .find(|f| f.name == n)
                .unwrap()
                .field_type
                .clone()
        };
        assert_eq!(by_name("host"), FieldType::String);
        assert_eq!(by_name("port"), FieldType::Integer);
        assert_eq!(by_name("debug"), FieldType::Boolean);
        assert_eq!(by_name("ratio"), FieldType::Number);

        let value = populate(&schema, &json!({"port": 9090})).unwrap();
        assert_eq!(value["host"], json!("localhost"));
        assert_eq!(value["port"], json!(9090));
    }

    #[test]
    fn json_schema_lists_required_in_declaration_order() {
        let schema = person().to_json_schema();
        assert_eq!(
            schema["required"],
            json!(["firstName", "lastName", "age"])
        );
        assert_eq!(schema["properties"]["age"]["type"], json!("integer"));
    }
}
