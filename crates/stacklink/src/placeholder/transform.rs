//! closed registry of placeholder transforms
use super::PlaceholderError;
use crate::template::normalize_logical_name;
use crate::util;
use serde_json::Value as Json;

/// A named, pure value transform (`%{value|Truncate(64)}`)
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// coerce `"true"`/`"false"`/numbers/booleans to a boolean
    Bool,
    Not,
    /// stringify scalars, json-encode containers
    String,
    Json,
    Number,
    Integer,
    /// format a number with a fixed count of decimals
    Fixed(usize),
    /// keep at most n characters
    Truncate(usize),
    Upper,
    Lower,
    Capitalize,
    Alphanumeric,
    /// Serverless logical-id normalisation
    LogicalName,
    /// name → `{Ref: name}`
    Ref,
    /// name → `{Fn::GetAtt: [name, attr]}`
    GetAtt(String),
    /// string → `{Fn::Sub: string}`
    Sub,
    /// `Ref`/`Fn::GetAtt`/`Name.Attr` → `Name`
    LogicalId,
    /// substitute a literal when the input is missing or null
    Default(Json),
}

impl Transform {
    pub fn parse(name: &str, arguments: &[&str]) -> Result<Self, PlaceholderError> {
        let transform = match (name, arguments) {
            ("Bool", []) => Transform::Bool,
            ("Not", []) => Transform::Not,
            ("String", []) => Transform::String,
            ("Json", []) => Transform::Json,
            ("Number", []) => Transform::Number,
            ("Integer", []) => Transform::Integer,
            ("Fixed", [decimals]) => Transform::Fixed(parse_count(name, decimals)?),
            ("Truncate", [length]) => Transform::Truncate(parse_count(name, length)?),
            ("Upper", []) => Transform::Upper,
            ("Lower", []) => Transform::Lower,
            ("Capitalize", []) => Transform::Capitalize,
            ("Alphanumeric", []) => Transform::Alphanumeric,
            ("LogicalName", []) => Transform::LogicalName,
            ("Ref", []) => Transform::Ref,
            ("GetAtt", [attribute]) => Transform::GetAtt(unquote(attribute).to_string()),
            ("Sub", []) => Transform::Sub,
            ("LogicalId", []) => Transform::LogicalId,
            ("Default", [literal]) => Transform::Default(parse_literal(literal)),
            (
                "Bool" | "Not" | "String" | "Json" | "Number" | "Integer" | "Fixed" | "Truncate"
                | "Upper" | "Lower" | "Capitalize" | "Alphanumeric" | "LogicalName" | "Ref"
                | "GetAtt" | "Sub" | "LogicalId" | "Default",
                _,
            ) => {
                return Err(PlaceholderError::TransformArity {
                    transform: name.to_string(),
                    given: arguments.len(),
                })
            }
            _ => return Err(PlaceholderError::UnknownTransform(name.to_string())),
        };

        Ok(transform)
    }

    /// Parse a `Name|Name(args)|...` chain
    pub fn parse_chain(chain: &str) -> Result<Vec<Self>, PlaceholderError> {
        chain
            .split('|')
            .map(str::trim)
            .filter(|call| !call.is_empty())
            .map(|call| {
                let Some((name, rest)) = call.split_once('(') else {
                    return Self::parse(call, &[]);
                };

                let Some(arguments) = rest.strip_suffix(')') else {
                    return Err(PlaceholderError::Syntax(format!(
                        "unterminated transform arguments in {call:?}"
                    )));
                };

                let arguments: Vec<&str> = if arguments.trim().is_empty() {
                    vec![]
                } else {
                    arguments.split(',').map(str::trim).collect()
                };
                Self::parse(name.trim(), &arguments)
            })
            .collect()
    }

    /// Apply to a value; `None` means the identifier was not found in the context
    pub fn apply(&self, value: Option<Json>) -> Result<Option<Json>, PlaceholderError> {
        if let Transform::Default(default) = self {
            return Ok(match value {
                None | Some(Json::Null) => Some(default.clone()),
                value => value,
            });
        }

        let Some(value) = value else {
            return Ok(None);
        };

        let transformed = match self {
            Transform::Bool => Json::Bool(truthy(&value)),
            Transform::Not => Json::Bool(!truthy(&value)),
            Transform::String => Json::String(stringify(&value)),
            Transform::Json => Json::String(value.to_string()),
            Transform::Number => Json::from(self.number(&value)?),
            Transform::Integer => Json::from(self.number(&value)?.trunc() as i64),
            Transform::Fixed(decimals) => {
                Json::String(format!("{:.*}", *decimals, self.number(&value)?))
            }
            Transform::Truncate(length) => {
                Json::String(stringify(&value).chars().take(*length).collect())
            }
            Transform::Upper => Json::String(stringify(&value).to_uppercase()),
            Transform::Lower => Json::String(stringify(&value).to_lowercase()),
            Transform::Capitalize => {
                let text = stringify(&value);
                let mut chars = text.chars();
                Json::String(match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => text,
                })
            }
            Transform::Alphanumeric => Json::String(
                stringify(&value)
                    .chars()
                    .filter(char::is_ascii_alphanumeric)
                    .collect(),
            ),
            Transform::LogicalName => {
                Json::String(normalize_logical_name(&stringify(&value)))
            }
            Transform::Ref => util::reference(&self.name(&value)?),
            Transform::GetAtt(attribute) => util::get_att(&self.name(&value)?, attribute),
            Transform::Sub => util::intrinsic("Fn::Sub", Json::String(self.name(&value)?)),
            Transform::LogicalId => match util::logical_id_of(&value) {
                Some(logical_id) => Json::String(logical_id.to_string()),
                None => return Err(self.invalid(&value, "not a reference")),
            },
            Transform::Default(_) => unreachable!("handled above"),
        };

        Ok(Some(transformed))
    }

    fn number(&self, value: &Json) -> Result<f64, PlaceholderError> {
        match value {
            Json::Number(n) => n.as_f64(),
            Json::String(s) => s.trim().parse().ok(),
            Json::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
        .ok_or_else(|| self.invalid(value, "not numeric"))
    }

    fn name(&self, value: &Json) -> Result<String, PlaceholderError> {
        match value {
            Json::String(s) => Ok(s.clone()),
            // already a reference; keep the target name
            value => util::logical_id_of(value)
                .map(str::to_string)
                .ok_or_else(|| self.invalid(value, "expected a name")),
        }
    }

    fn invalid(&self, value: &Json, reason: &str) -> PlaceholderError {
        PlaceholderError::TransformInput {
            transform: format!("{self:?}"),
            input: util::json_type(value),
            reason: reason.to_string(),
        }
    }
}

pub(crate) fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Json::String(s) => !matches!(s.trim().to_lowercase().as_str(), "" | "false" | "0" | "no"),
        Json::Array(array) => !array.is_empty(),
        Json::Object(_) => true,
    }
}

/// Textual form used when a value is spliced into a longer string
pub(crate) fn stringify(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        Json::Bool(_) | Json::Number(_) => value.to_string(),
        Json::Array(_) | Json::Object(_) => value.to_string(),
    }
}

fn parse_count(transform: &str, argument: &str) -> Result<usize, PlaceholderError> {
    argument.parse().map_err(|_| {
        PlaceholderError::Syntax(format!(
            "{transform} expects a non-negative integer, got {argument:?}"
        ))
    })
}

fn unquote(argument: &str) -> &str {
    argument
        .strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .or_else(|| argument.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
        .unwrap_or(argument)
}

fn parse_literal(argument: &str) -> Json {
    let unquoted = unquote(argument);
    if unquoted.len() != argument.len() {
        return Json::String(unquoted.to_string());
    }
    serde_json::from_str(argument).unwrap_or_else(|_| Json::String(argument.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn apply(chain: &str, value: Json) -> Json {
        Transform::parse_chain(chain)
            .unwrap()
            .iter()
            .try_fold(Some(value), |value, transform| transform.apply(value))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn coercions() {
        assert_eq!(apply("Bool", json!("true")), json!(true));
        assert_eq!(apply("Bool", json!("False")), json!(false));
        assert_eq!(apply("Number", json!("42")), json!(42.0));
        assert_eq!(apply("Integer", json!("42.7")), json!(42));
        assert_eq!(apply("Fixed(2)", json!(1)), json!("1.00"));
    }

    #[test]
    fn strings() {
        assert_eq!(apply("Truncate(3)", json!("abcdef")), json!("abc"));
        assert_eq!(apply("Upper|Truncate(2)", json!("abc")), json!("AB"));
        assert_eq!(apply("Capitalize", json!("hello")), json!("Hello"));
        assert_eq!(apply("Alphanumeric", json!("my-table_1")), json!("mytable1"));
        assert_eq!(apply("LogicalName", json!("my-fn")), json!("MyDashfn"));
    }

    #[test]
    fn references() {
        assert_eq!(apply("Ref", json!("Stage")), json!({"Ref": "Stage"}));
        assert_eq!(
            apply("GetAtt(Arn)", json!("Tbl")),
            json!({"Fn::GetAtt": ["Tbl", "Arn"]})
        );
        assert_eq!(
            apply("LogicalId", json!({"Fn::GetAtt": ["Role", "Arn"]})),
            json!("Role")
        );
    }

    #[test]
    fn default_fills_missing() {
        let chain = Transform::parse_chain("Default('fallback')|Upper").unwrap();
        let value = chain
            .iter()
            .try_fold(None, |value, transform| transform.apply(value))
            .unwrap();
        assert_eq!(value, Some(json!("FALLBACK")));
    }

    #[test]
    fn unknown_transform() {
        assert!(matches!(
            Transform::parse_chain("Shout"),
            Err(PlaceholderError::UnknownTransform(name)) if name == "Shout"
        ));
        assert!(matches!(
            Transform::parse_chain("Truncate"),
            Err(PlaceholderError::TransformArity { .. })
        ));
    }
}
