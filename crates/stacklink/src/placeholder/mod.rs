//! `%{identifier|Transform}` substitution in path strings and template fragments
//!
//! A string is parsed once into a [Pattern] (literals and [Token]s). Each token names a
//! [ContextKey] and a chain of [Transform]s. Evaluating a pattern that consists of exactly
//! one token yields the token's json value unchanged, so `"%{targetId|Ref}"` becomes an
//! object rather than a string. Anything else is stringified and concatenated.
mod transform;

pub use transform::Transform;
pub(crate) use transform::{stringify, truthy};

use crate::visit::{VisitKeysMut, VisitStringsMut};
use serde_json::Value as Json;
use std::fmt;

/// Name of a value in a [Context]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    Name(String),
    Setting(String),
    Facet(String),
    FacetSetting(String),
    SourceSetting(String),
    TargetSetting(String),
}

impl ContextKey {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        match text.split_once(':') {
            Some(("SETTING", name)) => ContextKey::Setting(name.to_string()),
            Some(("FACET", name)) => ContextKey::Facet(name.to_string()),
            Some(("FACETSETTING", name)) => ContextKey::FacetSetting(name.to_string()),
            Some(("SOURCESETTING", name)) => ContextKey::SourceSetting(name.to_string()),
            Some(("TARGETSETTING", name)) => ContextKey::TargetSetting(name.to_string()),
            _ => ContextKey::Name(text.to_string()),
        }
    }
}

impl From<&str> for ContextKey {
    fn from(value: &str) -> Self {
        ContextKey::Name(value.to_string())
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Name(name) => f.write_str(name),
            ContextKey::Setting(name) => write!(f, "SETTING:{name}"),
            ContextKey::Facet(name) => write!(f, "FACET:{name}"),
            ContextKey::FacetSetting(name) => write!(f, "FACETSETTING:{name}"),
            ContextKey::SourceSetting(name) => write!(f, "SOURCESETTING:{name}"),
            ContextKey::TargetSetting(name) => write!(f, "TARGETSETTING:{name}"),
        }
    }
}

/// Values visible to placeholders and path predicates
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: indexmap::IndexMap<ContextKey, Json>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<ContextKey>, value: impl Into<Json>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<ContextKey>, value: impl Into<Json>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<Json> {
        self.values.shift_remove(key)
    }

    pub fn get(&self, key: &ContextKey) -> Option<&Json> {
        self.values.get(key)
    }

    pub fn get_name(&self, name: &str) -> Option<&Json> {
        self.values.get(&ContextKey::parse(name))
    }

    /// Store every entry of `settings` under keys built by `namespace`
    pub fn insert_all<'a>(
        &mut self,
        namespace: fn(String) -> ContextKey,
        settings: impl IntoIterator<Item = (&'a String, Json)>,
    ) {
        for (name, value) in settings {
            self.values.insert(namespace(name.clone()), value);
        }
    }
}

/// How to treat identifiers missing from the [Context]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// missing identifiers raise [PlaceholderError::UndefinedContextKey]
    Strict,
    /// missing identifiers leave the token text in place
    AllowUndefined,
}

/// `%{identifier[index]|Transform|...}`
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub key: ContextKey,
    pub index: Option<usize>,
    pub transforms: Vec<Transform>,
    source: String,
}

impl Token {
    fn parse(source: &str) -> Result<Self, PlaceholderError> {
        let (identifier, chain) = source.split_once('|').unwrap_or((source, ""));
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(PlaceholderError::Syntax(format!(
                "empty identifier in %{{{source}}}"
            )));
        }

        let (name, index) = match identifier.strip_suffix(']').and_then(|i| i.split_once('[')) {
            Some((name, index)) => {
                let index = index.trim().parse().map_err(|_| {
                    PlaceholderError::Syntax(format!("invalid index in %{{{source}}}"))
                })?;
                (name, Some(index))
            }
            None => (identifier, None),
        };

        Ok(Self {
            key: ContextKey::parse(name),
            index,
            transforms: Transform::parse_chain(chain)?,
            source: source.to_string(),
        })
    }

    fn evaluate(&self, context: &Context) -> Result<Option<Json>, PlaceholderError> {
        let value = context.get(&self.key).and_then(|value| match self.index {
            None => Some(value.clone()),
            Some(index) => value.get(index).cloned(),
        });

        self.transforms
            .iter()
            .try_fold(value, |value, transform| transform.apply(value))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{{{}}}", self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Token(Token),
}

/// A parsed string with placeholders
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self, PlaceholderError> {
        let mut segments = vec![];
        let mut rest = text;

        while let Some(start) = rest.find("%{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }

            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(PlaceholderError::Syntax(format!(
                    "unterminated placeholder in {text:?}"
                )));
            };

            segments.push(Segment::Token(Token::parse(&after[..end])?));
            rest = &after[end + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn has_tokens(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Token(_)))
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Token(token) => Some(token),
            Segment::Literal(_) => None,
        })
    }

    pub fn evaluate(
        &self,
        context: &Context,
        strictness: Strictness,
    ) -> Result<Json, PlaceholderError> {
        if let [Segment::Token(token)] = self.segments.as_slice() {
            return match token.evaluate(context)? {
                Some(value) => Ok(value),
                None => undefined(token, strictness).map(Json::String),
            };
        }

        let mut text = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => text.push_str(literal),
                Segment::Token(token) => match token.evaluate(context)? {
                    Some(value) => text.push_str(&stringify(&value)),
                    None => text.push_str(&undefined(token, strictness)?),
                },
            }
        }

        Ok(Json::String(text))
    }
}

fn undefined(token: &Token, strictness: Strictness) -> Result<String, PlaceholderError> {
    match strictness {
        Strictness::Strict => Err(PlaceholderError::UndefinedContextKey(token.key.to_string())),
        Strictness::AllowUndefined => Ok(token.to_string()),
    }
}

/// Expand a string; the result is not necessarily a string
pub fn expand_str(
    text: &str,
    context: &Context,
    strictness: Strictness,
) -> Result<Json, PlaceholderError> {
    if !text.contains("%{") {
        return Ok(Json::String(text.to_string()));
    }

    Pattern::parse(text)?.evaluate(context, strictness)
}

/// Expand a string that must stay a string (paths, keys)
pub fn expand_to_string(
    text: &str,
    context: &Context,
    strictness: Strictness,
) -> Result<String, PlaceholderError> {
    Ok(stringify(&expand_str(text, context, strictness)?))
}

/// Expand every string value and object key of a template fragment
pub fn expand_json(
    fragment: &Json,
    context: &Context,
    strictness: Strictness,
) -> Result<Json, PlaceholderError> {
    let mut expanded = fragment.clone();
    let mut error = None;

    expanded.visit_strings_mut(&mut |node: &mut Json| {
        if error.is_some() {
            return;
        }
        let Json::String(text) = node else {
            return;
        };
        match expand_str(text, context, strictness) {
            Ok(value) => *node = value,
            Err(e) => error = Some(e),
        }
    });

    expanded.visit_keys_mut(&mut |key: &mut String| {
        if error.is_some() || !key.contains("%{") {
            return;
        }
        match expand_to_string(key, context, strictness) {
            Ok(value) => *key = value,
            Err(e) => error = Some(e),
        }
    });

    match error {
        Some(e) => Err(e),
        None => Ok(expanded),
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PlaceholderError {
    #[error("undefined context key {0}")]
    UndefinedContextKey(String),
    #[error("placeholder syntax: {0}")]
    Syntax(String),
    #[error("unknown transform {0}")]
    UnknownTransform(String),
    #[error("transform {transform} does not take {given} argument(s)")]
    TransformArity { transform: String, given: usize },
    #[error("transform {transform} can not handle {input}: {reason}")]
    TransformInput {
        transform: String,
        input: &'static str,
        reason: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn context() -> Context {
        Context::new()
            .with("resourceId", "Fn")
            .with("values", json!(["a", "b"]))
            .with(ContextKey::Setting("MemorySize".into()), 1024)
    }

    #[test]
    fn single_token_keeps_type() {
        assert_eq!(
            expand_str("%{SETTING:MemorySize}", &context(), Strictness::Strict).unwrap(),
            json!(1024)
        );
        assert_eq!(
            expand_str("%{resourceId|Ref}", &context(), Strictness::Strict).unwrap(),
            json!({"Ref": "Fn"})
        );
    }

    #[test]
    fn concatenation_stringifies() {
        assert_eq!(
            expand_str(
                "%{resourceId}Role-%{values[1]}-%{SETTING:MemorySize}",
                &context(),
                Strictness::Strict
            )
            .unwrap(),
            json!("FnRole-b-1024")
        );
    }

    #[test]
    fn undefined_keys() {
        assert_eq!(
            expand_str("%{targetId}", &context(), Strictness::Strict),
            Err(PlaceholderError::UndefinedContextKey("targetId".into()))
        );
        assert_eq!(
            expand_str("x-%{targetId|Upper}", &context(), Strictness::AllowUndefined).unwrap(),
            json!("x-%{targetId|Upper}")
        );
    }

    #[test]
    fn fragments_expand_keys_and_values() {
        let fragment = json!({
            "%{resourceId}Role": {
                "Type": "AWS::IAM::Role",
                "Memory": "%{SETTING:MemorySize}",
                "Tags": ["%{values[0]}"]
            }
        });

        assert_eq!(
            expand_json(&fragment, &context(), Strictness::Strict).unwrap(),
            json!({
                "FnRole": {
                    "Type": "AWS::IAM::Role",
                    "Memory": 1024,
                    "Tags": ["a"]
                }
            })
        );
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(
            Pattern::parse("%{resourceId"),
            Err(PlaceholderError::Syntax(_))
        ));
        assert!(matches!(
            Pattern::parse("%{|Upper}"),
            Err(PlaceholderError::Syntax(_))
        ));
    }
}
