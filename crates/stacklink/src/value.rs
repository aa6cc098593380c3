//! setting value representation
//!
//! Settings of resources, facets and integrations are one of
//! - boolean
//! - number (integer or decimal)
//! - string
//! - reference to another resource ([Id])
//! - parameter (name of a template parameter)
//! - list of values
//! - object (order-preserving map, string keys)
//!
//! There is no `null`: an absent or `null` setting is simply not stored.
use crate::id::{Classifier, Id};
use crate::util::as_intrinsic;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value as Json;

/// All possible setting value types
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    String(String),
    /// A resolved reference expression, kept together with its template form
    Reference(Id, Json),
    Parameter(String),
    List(Vec<Value>),
    Object(indexmap::IndexMap<String, Value>),
}

/// Resolved settings of one entity, in schema order
pub type Settings = indexmap::IndexMap<String, Value>;

impl Value {
    /// Convert a template fragment, classifying intrinsic reference expressions
    ///
    /// Returns `None` for `null`.
    pub fn from_template(value: &Json, classifier: &Classifier<'_>) -> Option<Value> {
        if as_intrinsic(value).is_some() {
            let id = classifier.classify(value);
            return Some(match id {
                Id::Parameter { parameter_id } => Value::Parameter(parameter_id),
                Id::Unresolved => Value::from_json(value)?,
                id => Value::Reference(id, value.clone()),
            });
        }

        Some(match value {
            Json::Array(array) => Value::List(
                array
                    .iter()
                    .filter_map(|element| Value::from_template(element, classifier))
                    .collect(),
            ),
            Json::Object(object) => Value::Object(
                object
                    .iter()
                    .filter_map(|(key, value)| {
                        Value::from_template(value, classifier).map(|value| (key.clone(), value))
                    })
                    .collect(),
            ),
            scalar => Value::from_json(scalar)?,
        })
    }

    /// Plain conversion without classification
    pub fn from_json(value: &Json) -> Option<Value> {
        Some(match value {
            Json::Null => return None,
            Json::Bool(b) => Value::Boolean(*b),
            Json::Number(n) => match n.as_i64() {
                Some(int) => Value::Integer(int),
                None => Value::Decimal(n.as_f64()?),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(array) => Value::List(array.iter().filter_map(Value::from_json).collect()),
            Json::Object(object) => Value::Object(
                object
                    .iter()
                    .filter_map(|(key, value)| {
                        Value::from_json(value).map(|value| (key.clone(), value))
                    })
                    .collect(),
            ),
        })
    }

    /// The template form of this value
    pub fn to_json(&self) -> Json {
        match self {
            Value::Boolean(b) => Json::Bool(*b),
            Value::Integer(int) => Json::from(*int),
            Value::Decimal(decimal) => Json::from(*decimal),
            Value::String(s) => Json::String(s.clone()),
            Value::Reference(_, expression) => expression.clone(),
            Value::Parameter(name) => crate::util::reference(name),
            Value::List(list) => Json::Array(list.iter().map(Value::to_json).collect()),
            Value::Object(object) => Json::Object(
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<&Id> {
        match self {
            Value::Reference(id, _) => Some(id),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Concatenate lists, used when singleton resources are coalesced
    pub fn concat(self, other: Value) -> Value {
        match (self, other) {
            (Value::List(mut lhs), Value::List(rhs)) => {
                for value in rhs {
                    if !lhs.contains(&value) {
                        lhs.push(value);
                    }
                }
                Value::List(lhs)
            }
            (_, other) => other,
        }
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Boolean(value) => serializer.serialize_bool(*value),
            Value::Integer(value) => serializer.serialize_i64(*value),
            Value::Decimal(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Reference(id, _) => id.serialize(serializer),
            Value::Parameter(name) => {
                let mut ser = serializer.serialize_map(Some(1))?;
                ser.serialize_entry("Parameter", name)?;
                ser.end()
            }
            Value::List(value) => {
                let mut ser = serializer.serialize_seq(Some(value.len()))?;
                for element in value {
                    ser.serialize_element(element)?;
                }
                ser.end()
            }
            Value::Object(value) => {
                let mut ser = serializer.serialize_map(Some(value.len()))?;
                for (element_key, element_value) in value {
                    ser.serialize_entry(element_key, element_value)?;
                }
                ser.end()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn references_are_classified() {
        let template =
            template!("Parameters: {Stage: {Type: String}}\nResources: {Tbl: {Type: T}}");
        let classifier = Classifier::new(&template);

        assert_eq!(
            Value::from_template(&json!({"Ref": "Stage"}), &classifier),
            Some(Value::Parameter("Stage".into()))
        );
        assert_eq!(
            Value::from_template(&json!([{"Ref": "Tbl"}, null, 3]), &classifier),
            Some(Value::List(vec![
                Value::Reference(Id::logical("Tbl"), json!({"Ref": "Tbl"})),
                Value::Integer(3)
            ]))
        );
    }

    #[test]
    fn template_form_round_trips() {
        let template = template!("Resources: {Tbl: {Type: T}}");
        let classifier = Classifier::new(&template);
        let fragment = json!({"Name": "x", "Arn": {"Fn::GetAtt": ["Tbl", "Arn"]}, "Size": 1.5});
        assert_eq!(
            Value::from_template(&fragment, &classifier)
                .unwrap()
                .to_json(),
            fragment
        );
    }

    #[test]
    fn concat_deduplicates() {
        let lhs = Value::from(vec!["a", "b"]);
        let rhs = Value::from(vec!["b", "c"]);
        assert_eq!(lhs.concat(rhs), Value::from(vec!["a", "b", "c"]));
    }
}
