//! Metadata bag and structural specification checking
//!
//! `Meta` is the context value threaded through the whole pipeline: an
//! opaque JSON object read by tasks, validated against a task's
//! `Specification`, and carried as the header of every wire envelope.
//! Validation is structural only: presence and type of each declared field,
//! never business rules. The validator never mutates the meta.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque bag of named values, backed by a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(Map<String, Value>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value; returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `self` on top of `defaults`: every key present here wins,
    /// missing keys fall back to the default value.
    pub fn with_defaults(&self, defaults: &Meta) -> Meta {
        let mut merged = defaults.0.clone();
        for (k, v) in &self.0 {
            merged.insert(k.clone(), v.clone());
        }
        Meta(merged)
    }
}

impl From<Map<String, Value>> for Meta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Runtime type of a JSON value.
///
/// `Int` and `Float` are distinct; a field declared `Float` also accepts
/// integer numbers (most producers emit one JSON number type).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    Float,
    String,
    Array,
    Object,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    ValueType::Int
                } else {
                    ValueType::Float
                }
            }
            Value::String(_) => ValueType::String,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Object => "object",
        };
        f.write_str(name)
    }
}

/// What a single specification field expects.
#[derive(Debug, Clone)]
pub enum Expect {
    /// Any one of the listed types
    Types(Vec<ValueType>),
    /// An object validated against a nested specification
    Nested(Specification),
}

/// One declared field: name plus expectation.
#[derive(Debug, Clone)]
pub struct SpecField {
    pub key: String,
    pub expect: Expect,
}

/// Ordered structural schema for a `Meta`.
#[derive(Debug, Clone, Default)]
pub struct Specification {
    fields: Vec<SpecField>,
}

impl Specification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field with a single accepted type.
    pub fn field(mut self, key: impl Into<String>, ty: ValueType) -> Self {
        self.fields.push(SpecField {
            key: key.into(),
            expect: Expect::Types(vec![ty]),
        });
        self
    }

    /// Declare a field accepting any of the given types.
    pub fn field_any(mut self, key: impl Into<String>, types: impl Into<Vec<ValueType>>) -> Self {
        self.fields.push(SpecField {
            key: key.into(),
            expect: Expect::Types(types.into()),
        });
        self
    }

    /// Declare a field holding an object with its own specification.
    pub fn nested(mut self, key: impl Into<String>, spec: Specification) -> Self {
        self.fields.push(SpecField {
            key: key.into(),
            expect: Expect::Nested(spec),
        });
        self
    }

    /// Derive a specification from a typed record: one field per entry,
    /// expecting the type the example currently holds. Keys starting with
    /// an underscore are skipped.
    pub fn of_example(example: &Meta) -> Self {
        let fields = example
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| SpecField {
                key: k.clone(),
                expect: Expect::Types(vec![ValueType::of(v)]),
            })
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[SpecField] {
        &self.fields
    }
}

/// A single field-level mismatch found during verification.
#[derive(Debug, Clone)]
pub struct MetaFieldError {
    pub required_key: String,
    pub required_types: Vec<ValueType>,
    /// `None` when the field is missing entirely
    pub presented_type: Option<ValueType>,
    pub presented_value: Option<Value>,
}

impl fmt::Display for MetaFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expected: Vec<String> = self.required_types.iter().map(|t| t.to_string()).collect();
        match self.presented_type {
            Some(ty) => write!(
                f,
                "field '{}': expected {}, got {}",
                self.required_key,
                expected.join("|"),
                ty
            ),
            None => write!(
                f,
                "field '{}': expected {}, missing",
                self.required_key,
                expected.join("|")
            ),
        }
    }
}

/// One entry in a verification's error list.
#[derive(Debug, Clone)]
pub enum FieldIssue {
    Field(MetaFieldError),
    /// A nested specification failed; its own verification is folded in.
    Nested {
        key: String,
        verification: Verification,
    },
}

/// Result of structurally checking a `Meta` against a `Specification`.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    errors: Vec<FieldIssue>,
}

impl Verification {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[FieldIssue] {
        &self.errors
    }

    /// Flat human-readable summary of every issue, nested ones prefixed
    /// with their field path.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        self.collect_descriptions("", &mut parts);
        parts.join("; ")
    }

    fn collect_descriptions(&self, prefix: &str, out: &mut Vec<String>) {
        for issue in &self.errors {
            match issue {
                FieldIssue::Field(e) => {
                    if prefix.is_empty() {
                        out.push(e.to_string());
                    } else {
                        out.push(format!("{}{}", prefix, e));
                    }
                }
                FieldIssue::Nested { key, verification } => {
                    let nested_prefix = format!("{}{}.", prefix, key);
                    verification.collect_descriptions(&nested_prefix, out);
                }
            }
        }
    }

    /// Structured JSON rendering, used in remote failure responses.
    pub fn to_value(&self) -> Value {
        let issues: Vec<Value> = self
            .errors
            .iter()
            .map(|issue| match issue {
                FieldIssue::Field(e) => {
                    let expected: Vec<Value> = e
                        .required_types
                        .iter()
                        .map(|t| Value::String(t.to_string()))
                        .collect();
                    let mut obj = Map::new();
                    obj.insert("field".into(), Value::String(e.required_key.clone()));
                    obj.insert("expected".into(), Value::Array(expected));
                    obj.insert(
                        "actual".into(),
                        match e.presented_type {
                            Some(ty) => Value::String(ty.to_string()),
                            None => Value::String("missing".into()),
                        },
                    );
                    if let Some(v) = &e.presented_value {
                        obj.insert("value".into(), v.clone());
                    }
                    Value::Object(obj)
                }
                FieldIssue::Nested { key, verification } => {
                    let mut obj = Map::new();
                    obj.insert("field".into(), Value::String(key.clone()));
                    obj.insert("nested".into(), verification.to_value());
                    Value::Object(obj)
                }
            })
            .collect();
        Value::Array(issues)
    }
}

fn accepts(required: &[ValueType], presented: ValueType) -> bool {
    required.contains(&presented)
        || (presented == ValueType::Int && required.contains(&ValueType::Float))
}

/// Check `meta` against `specification`. Pure function: the meta is never
/// mutated and no state is kept between calls. `None` specification always
/// succeeds.
///
/// Nested specification *failures* fold into the parent's error list; a
/// nested success contributes nothing.
pub fn verify(meta: &Meta, specification: Option<&Specification>) -> Verification {
    let mut errors = Vec::new();
    let Some(spec) = specification else {
        return Verification { errors };
    };

    for field in spec.fields() {
        let value = meta.get(&field.key);
        match &field.expect {
            Expect::Types(required) => match value {
                Some(v) => {
                    let presented = ValueType::of(v);
                    if !accepts(required, presented) {
                        errors.push(FieldIssue::Field(MetaFieldError {
                            required_key: field.key.clone(),
                            required_types: required.clone(),
                            presented_type: Some(presented),
                            presented_value: Some(v.clone()),
                        }));
                    }
                }
                None => {
                    errors.push(FieldIssue::Field(MetaFieldError {
                        required_key: field.key.clone(),
                        required_types: required.clone(),
                        presented_type: None,
                        presented_value: None,
                    }));
                }
            },
            Expect::Nested(nested_spec) => match value {
                Some(Value::Object(map)) => {
                    let nested_meta = Meta::from(map.clone());
                    let verification = verify(&nested_meta, Some(nested_spec));
                    if !verification.succeeded() {
                        errors.push(FieldIssue::Nested {
                            key: field.key.clone(),
                            verification,
                        });
                    }
                }
                other => {
                    errors.push(FieldIssue::Field(MetaFieldError {
                        required_key: field.key.clone(),
                        required_types: vec![ValueType::Object],
                        presented_type: other.map(ValueType::of),
                        presented_value: other.cloned(),
                    }));
                }
            },
        }
    }

    Verification { errors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Meta {
        Meta::from_value(value).unwrap()
    }

    #[test]
    fn empty_specification_always_succeeds() {
        let m = meta(json!({"anything": 1}));
        assert!(verify(&m, None).succeeded());
        assert!(verify(&m, Some(&Specification::new())).succeeded());
    }

    #[test]
    fn exact_types_succeed() {
        let m = meta(json!({"count": 3, "label": "x", "ratio": 0.5}));
        let spec = Specification::new()
            .field("count", ValueType::Int)
            .field("label", ValueType::String)
            .field("ratio", ValueType::Float);
        assert!(verify(&m, Some(&spec)).succeeded());
    }

    #[test]
    fn one_error_per_offending_field() {
        let m = meta(json!({"count": "x"}));
        let spec = Specification::new()
            .field("count", ValueType::Int)
            .field("label", ValueType::String);
        let v = verify(&m, Some(&spec));
        assert!(!v.succeeded());
        assert_eq!(v.errors().len(), 2);

        match &v.errors()[0] {
            FieldIssue::Field(e) => {
                assert_eq!(e.required_key, "count");
                assert_eq!(e.presented_type, Some(ValueType::String));
                assert_eq!(e.presented_value, Some(json!("x")));
            }
            other => panic!("unexpected issue: {:?}", other),
        }
        match &v.errors()[1] {
            FieldIssue::Field(e) => {
                assert_eq!(e.required_key, "label");
                assert_eq!(e.presented_type, None);
            }
            other => panic!("unexpected issue: {:?}", other),
        }
    }

    #[test]
    fn float_field_accepts_int() {
        let m = meta(json!({"ratio": 2}));
        let spec = Specification::new().field("ratio", ValueType::Float);
        assert!(verify(&m, Some(&spec)).succeeded());
    }

    #[test]
    fn type_alternatives() {
        let spec =
            Specification::new().field_any("id", vec![ValueType::Int, ValueType::String]);
        assert!(verify(&meta(json!({"id": 7})), Some(&spec)).succeeded());
        assert!(verify(&meta(json!({"id": "seven"})), Some(&spec)).succeeded());
        assert!(!verify(&meta(json!({"id": true})), Some(&spec)).succeeded());
    }

    #[test]
    fn nested_failures_fold_into_parent() {
        let spec = Specification::new()
            .nested("limits", Specification::new().field("max", ValueType::Int));

        let good = meta(json!({"limits": {"max": 10}}));
        assert!(verify(&good, Some(&spec)).succeeded());

        let bad = meta(json!({"limits": {"max": "ten"}}));
        let v = verify(&bad, Some(&spec));
        assert_eq!(v.errors().len(), 1);
        match &v.errors()[0] {
            FieldIssue::Nested { key, verification } => {
                assert_eq!(key, "limits");
                assert_eq!(verification.errors().len(), 1);
            }
            other => panic!("unexpected issue: {:?}", other),
        }
        assert!(v.describe().contains("limits.field 'max'"));
    }

    #[test]
    fn nested_field_must_be_object() {
        let spec = Specification::new()
            .nested("limits", Specification::new().field("max", ValueType::Int));
        let v = verify(&meta(json!({"limits": 4})), Some(&spec));
        match &v.errors()[0] {
            FieldIssue::Field(e) => {
                assert_eq!(e.required_types, vec![ValueType::Object]);
                assert_eq!(e.presented_type, Some(ValueType::Int));
            }
            other => panic!("unexpected issue: {:?}", other),
        }
    }

    #[test]
    fn derived_specification_matches_example() {
        let example = meta(json!({"count": 1, "label": "a", "_private": true}));
        let spec = Specification::of_example(&example);
        assert_eq!(spec.fields().len(), 2);
        assert!(verify(&meta(json!({"count": 9, "label": "b"})), Some(&spec)).succeeded());
        assert!(!verify(&meta(json!({"count": "9", "label": "b"})), Some(&spec)).succeeded());
    }

    #[test]
    fn with_defaults_overlay() {
        let settings = meta(json!({"retries": 3, "count": 1}));
        let m = meta(json!({"count": 5}));
        let merged = m.with_defaults(&settings);
        assert_eq!(merged.get("count"), Some(&json!(5)));
        assert_eq!(merged.get("retries"), Some(&json!(3)));
    }
}
