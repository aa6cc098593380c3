//! path/query language over template documents
//!
//! ```text
//! $.Resources[?(@.Type == 'AWS::Lambda::Function')].Properties
//! @.Properties.Policies[*]
//! $..Ref
//! $.Resources[?(@key == %resourceId)]
//! @.environment[?(@key =~ '_TABLE$')]
//! ```
//!
//! Paths are RFC 9535 JSONPath, evaluated with `serde_json_path`, plus a few additions:
//!
//! - a path may start at `@`, the current node of the [Scope] (the located fragment of a
//!   resource, or the previous match of a pipeline)
//! - filters may test the candidate's property name or index as `@key`
//! - `%name` reads a value of the placeholder [Context]
//! - `a =~ 'regex'` is shorthand for `search(a, 'regex')`
//!
//! A bare operand in a filter is an existence test, as in JSONPath: `[?(@.Condition)]`
//! keeps candidates that have a `Condition`, whatever its value.
//!
//! Path strings are expanded with [crate::placeholder] before they are parsed, so
//! `$.Resources['%{resourceId}Role']` is a plain lookup once the context is known.
//!
//! A list of path strings forms a pipeline: each match of one step becomes `@` of the
//! next, and its value is threaded into the context as `value` (its key as `key`).
mod eval;
mod parser;

use crate::placeholder::{self, Context, PlaceholderError, Strictness};
use crate::template::{Location, PathKey};
use serde_json::Value as Json;

/// A parsed path expression
#[derive(Debug, Clone)]
pub struct Path {
    root: Root,
    segments: Vec<Segment>,
    source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Document,
    Current,
}

#[derive(Debug, Clone)]
enum Segment {
    Name(String),
    Names(Vec<String>),
    Index(i64),
    Wildcard,
    Filter(Vec<Token>),
    Descendant(Box<Segment>),
}

impl Segment {
    /// Filters on `@key` are applied per candidate, outside of `serde_json_path`
    fn uses_key(&self) -> bool {
        match self {
            Segment::Filter(tokens) => tokens.iter().any(Token::uses_key),
            Segment::Descendant(inner) => inner.uses_key(),
            _ => false,
        }
    }
}

/// One token of a filter expression
#[derive(Debug, Clone)]
enum Token {
    Punct(&'static str),
    Literal(Json),
    Key,
    Context(String),
    Path(Box<Path>),
    Function(String),
    /// `subject =~ pattern`
    Search(Box<Token>, Box<Token>),
}

impl Token {
    fn uses_key(&self) -> bool {
        match self {
            Token::Key => true,
            Token::Search(subject, pattern) => subject.uses_key() || pattern.uses_key(),
            _ => false,
        }
    }
}

impl Path {
    /// Parse a path and check that it translates to valid JSONPath
    pub fn parse(source: &str) -> Result<Self, PathError> {
        let path = parser::Parser::new(source).parse_path()?;
        eval::validate(&path)?;
        Ok(path)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a scope, returning every match in document order
    pub fn evaluate<'a>(&self, scope: &Scope<'a, '_>) -> Result<Vec<Node<'a>>, PathError> {
        eval::evaluate(self, scope)
    }

    /// The syntactic location of a path made only of names and non-negative indices
    ///
    /// Used to create containers that do not exist yet.
    pub fn definite_location(&self, current: &Location) -> Option<Location> {
        let mut location = match self.root {
            Root::Document => Location::root(),
            Root::Current => current.clone(),
        };

        for segment in &self.segments {
            location = match segment {
                Segment::Name(name) => location.child(name.as_str()),
                Segment::Index(index) => location.child(usize::try_from(*index).ok()?),
                _ => return None,
            };
        }

        Some(location)
    }
}

/// A matched node
#[derive(Debug, Clone, PartialEq)]
pub struct Node<'a> {
    pub location: Location,
    pub value: &'a Json,
}

impl<'a> Node<'a> {
    pub fn key(&self) -> Option<&PathKey> {
        self.location.keys().last()
    }
}

/// What a path is evaluated against
#[derive(Debug, Clone)]
pub struct Scope<'a, 'c> {
    pub document: &'a Json,
    /// target of `@`; the document root when unset
    pub current: Option<Node<'a>>,
    pub context: &'c Context,
}

impl<'a, 'c> Scope<'a, 'c> {
    pub fn new(document: &'a Json, context: &'c Context) -> Self {
        Self {
            document,
            current: None,
            context,
        }
    }

    pub fn at(mut self, current: Node<'a>) -> Self {
        self.current = Some(current);
        self
    }

    fn current(&self) -> Node<'a> {
        self.current.clone().unwrap_or(Node {
            location: Location::root(),
            value: self.document,
        })
    }
}

/// Evaluate a pipeline of path strings
///
/// A path that resolves to nothing yields no nodes; it is up to the caller to decide
/// whether absence is fatal.
pub fn select<'a, S: AsRef<str>>(
    pipeline: &[S],
    scope: &Scope<'a, '_>,
) -> Result<Vec<Node<'a>>, PathError> {
    let mut inputs = vec![scope.current()];

    for (position, step) in pipeline.iter().enumerate() {
        let mut outputs = vec![];
        for input in &inputs {
            let context = step_context(scope.context, position, input);
            let path = parse_expanded(step.as_ref(), &context)?;
            let step_scope = Scope {
                document: scope.document,
                current: Some(input.clone()),
                context: &context,
            };
            outputs.extend(path.evaluate(&step_scope)?);
        }
        inputs = outputs;
    }

    Ok(inputs)
}

/// Like [select], but requires exactly one match
pub fn select_one<'a, S: AsRef<str>>(
    pipeline: &[S],
    scope: &Scope<'a, '_>,
) -> Result<Node<'a>, PathError> {
    let mut nodes = select(pipeline, scope)?;
    if nodes.len() != 1 {
        return Err(PathError::Cardinality {
            path: describe(pipeline),
            found: nodes.len(),
        });
    }
    Ok(nodes.remove(0))
}

/// Locations a write should touch
///
/// When the last step matches nothing but is definite, its syntactic location (relative
/// to each input of that step) is returned so the caller can create it.
pub fn select_for_write<S: AsRef<str>>(
    pipeline: &[S],
    scope: &Scope<'_, '_>,
) -> Result<Vec<Location>, PathError> {
    let Some((last, leading)) = pipeline.split_last() else {
        return Ok(vec![scope.current().location]);
    };

    let inputs = select(leading, scope)?;
    let mut locations = vec![];
    for input in &inputs {
        let context = step_context(scope.context, leading.len(), input);
        let path = parse_expanded(last.as_ref(), &context)?;
        let step_scope = Scope {
            document: scope.document,
            current: Some(input.clone()),
            context: &context,
        };

        let matches = path.evaluate(&step_scope)?;
        if matches.is_empty() {
            locations.extend(path.definite_location(&input.location));
        } else {
            locations.extend(matches.into_iter().map(|node| node.location));
        }
    }

    Ok(locations)
}

fn step_context(context: &Context, position: usize, input: &Node<'_>) -> Context {
    let mut context = context.clone();
    if position > 0 {
        context.insert("value", input.value.clone());
        match input.key() {
            Some(PathKey::Key(key)) => context.insert("key", key.as_str()),
            Some(PathKey::Index(index)) => context.insert("key", *index),
            None => {}
        }
    }
    context
}

fn parse_expanded(source: &str, context: &Context) -> Result<Path, PathError> {
    let expanded = placeholder::expand_to_string(source, context, Strictness::Strict)?;
    Path::parse(&expanded)
}

fn describe<S: AsRef<str>>(pipeline: &[S]) -> String {
    pipeline
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(thiserror::Error, Debug)]
pub enum PathError {
    #[error("invalid path {path:?}: {message}")]
    Syntax { path: String, message: String },
    #[error("context value {name:?} of path {path:?} is not a scalar")]
    ContextValue { path: String, name: String },
    #[error("unable to expand path")]
    Placeholder(#[from] PlaceholderError),
    #[error("path {path:?} must match exactly one node, found {found}")]
    Cardinality { path: String, found: usize },
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn document() -> Json {
        json!({
            "Resources": {
                "Fn": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {"Role": {"Fn::GetAtt": ["FnRole", "Arn"]}}
                },
                "FnRole": {
                    "Type": "AWS::IAM::Role",
                    "Properties": {"Policies": [{"PolicyName": "one"}]}
                }
            }
        })
    }

    #[test]
    fn pipeline_follows_references() {
        let document = document();
        let context = Context::new().with("resourceId", "Fn");
        let scope = Scope::new(&document, &context);

        let nodes = select(
            &[
                "$.Resources['%{resourceId}'].Properties.Role",
                "$.Resources['%{value|LogicalId}'].Properties.Policies[*].PolicyName",
            ],
            &scope,
        )
        .unwrap();

        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].value, &json!("one"));
        assert_eq!(
            nodes[0].location.to_string(),
            "$['Resources']['FnRole']['Properties']['Policies'][0]['PolicyName']"
        );
    }

    #[test]
    fn missing_paths_are_empty() {
        let document = document();
        let context = Context::new();
        let scope = Scope::new(&document, &context);
        assert!(select(&["$.Resources.Nope.Properties"], &scope)
            .unwrap()
            .is_empty());
        assert!(matches!(
            select_one(&["$.Resources.*"], &scope),
            Err(PathError::Cardinality { found: 2, .. })
        ));
    }

    #[test]
    fn write_locations_fall_back_to_definite_paths() {
        let document = document();
        let context = Context::new();
        let scope = Scope::new(&document, &context);

        let locations = select_for_write(
            &["$.Resources.Fn", "@.Properties.Environment.Variables"],
            &scope,
        )
        .unwrap();
        assert_eq!(
            locations,
            vec![["Resources", "Fn", "Properties", "Environment", "Variables"]
                .into_iter()
                .collect::<Location>()]
        );

        // nothing to anchor on: nothing to write
        let locations =
            select_for_write(&["$.Resources.Nope", "@.Properties"], &scope).unwrap();
        assert!(locations.is_empty());
    }
}
