//! evaluation through `serde_json_path`
//!
//! Consecutive segments are rendered as one standard JSONPath query rooted at the
//! normalized path of each input node, so `$` inside filters keeps meaning the document
//! root. `@key` filters are the exception: they are rendered once per candidate with the
//! candidate's key in place of `@key`.
use super::{Node, Path, PathError, Root, Scope, Segment, Token};
use crate::placeholder::{Context, ContextKey};
use crate::template::{self, Location, PathKey};
use serde_json::Value as Json;
use serde_json_path::{JsonPath, PathElement};
use std::fmt::Write;

pub(super) fn evaluate<'a>(
    path: &Path,
    scope: &Scope<'a, '_>,
) -> Result<Vec<Node<'a>>, PathError> {
    let start = match path.root {
        Root::Document => Node {
            location: Location::root(),
            value: scope.document,
        },
        Root::Current => scope.current(),
    };

    let mut nodes = vec![start];
    let mut pending: Vec<&Segment> = vec![];
    for segment in &path.segments {
        match segment {
            Segment::Filter(tokens) if segment.uses_key() => {
                nodes = query(path, nodes, &pending, scope)?;
                pending.clear();
                nodes = filter_by_key(path, nodes, tokens, scope)?;
            }
            segment => pending.push(segment),
        }
    }
    query(path, nodes, &pending, scope)
}

/// Render with placeholder values and compile, to report syntax errors at parse time
pub(super) fn validate(path: &Path) -> Result<(), PathError> {
    let context = Context::new();
    let key = PathKey::Key(String::new());
    let mut standard = String::from("$");
    for segment in &path.segments {
        let key = segment.uses_key().then_some(&key);
        render_segment(&mut standard, segment, &Render::new(path, &context, key))?;
    }
    compile(path, &standard).map(|_| ())
}

impl Path {
    /// The standard JSONPath this path stands for, with `@` replaced by `current`
    #[cfg(test)]
    pub(super) fn to_standard(
        &self,
        current: &Location,
        context: &Context,
    ) -> Result<String, PathError> {
        let mut standard = match self.root {
            Root::Document => String::from("$"),
            Root::Current => current.to_string(),
        };
        let render = Render::new(self, context, None);
        for segment in &self.segments {
            render_segment(&mut standard, segment, &render)?;
        }
        Ok(standard)
    }
}

fn query<'a>(
    path: &Path,
    nodes: Vec<Node<'a>>,
    segments: &[&Segment],
    scope: &Scope<'a, '_>,
) -> Result<Vec<Node<'a>>, PathError> {
    if segments.is_empty() {
        return Ok(nodes);
    }

    let render = Render::new(path, scope.context, None);
    let mut suffix = String::new();
    for segment in segments {
        render_segment(&mut suffix, segment, &render)?;
    }

    let mut found = vec![];
    for node in nodes {
        let standard = format!("{}{suffix}", node.location);
        found.extend(run(path, &standard, scope.document)?);
    }
    Ok(found)
}

fn filter_by_key<'a>(
    path: &Path,
    nodes: Vec<Node<'a>>,
    tokens: &[Token],
    scope: &Scope<'a, '_>,
) -> Result<Vec<Node<'a>>, PathError> {
    let mut kept = vec![];
    for node in nodes {
        for child in children(&node) {
            let Some(key) = child.key() else {
                continue;
            };
            let mut standard = format!("{}[?", node.location);
            render_tokens(&mut standard, tokens, &Render::new(path, scope.context, Some(key)))?;
            standard.push(']');

            let matched = run(path, &standard, scope.document)?
                .iter()
                .any(|hit| hit.location == child.location);
            if matched {
                kept.push(child);
            }
        }
    }
    Ok(kept)
}

fn compile(path: &Path, standard: &str) -> Result<JsonPath, PathError> {
    JsonPath::parse(standard).map_err(|e| PathError::Syntax {
        path: path.source.clone(),
        message: e.to_string(),
    })
}

fn run<'a>(path: &Path, standard: &str, document: &'a Json) -> Result<Vec<Node<'a>>, PathError> {
    let compiled = compile(path, standard)?;
    tracing::trace!(path = %path.source, standard, "query");

    let mut nodes = vec![];
    for located in compiled.query_located(document) {
        let location: Location = located
            .location()
            .iter()
            .map(|element| match element {
                PathElement::Name(name) => PathKey::from(*name),
                PathElement::Index(index) => PathKey::from(*index),
            })
            .collect();
        if let Some(value) = template::get(document, &location) {
            nodes.push(Node { location, value });
        }
    }
    Ok(nodes)
}

fn children<'a>(node: &Node<'a>) -> Vec<Node<'a>> {
    match node.value {
        Json::Object(object) => object
            .iter()
            .map(|(key, value)| Node {
                location: node.location.child(key.as_str()),
                value,
            })
            .collect(),
        Json::Array(array) => array
            .iter()
            .enumerate()
            .map(|(index, value)| Node {
                location: node.location.child(index),
                value,
            })
            .collect(),
        _ => vec![],
    }
}

struct Render<'r> {
    path: &'r Path,
    context: &'r Context,
    /// stands in for `@key`
    key: Option<&'r PathKey>,
}

impl<'r> Render<'r> {
    fn new(path: &'r Path, context: &'r Context, key: Option<&'r PathKey>) -> Self {
        Self { path, context, key }
    }

    fn error(&self, message: &str) -> PathError {
        PathError::Syntax {
            path: self.path.source.clone(),
            message: message.to_string(),
        }
    }
}

fn render_segment(
    out: &mut String,
    segment: &Segment,
    render: &Render<'_>,
) -> Result<(), PathError> {
    match segment {
        Segment::Name(name) => {
            let _ = write!(out, "{}", PathKey::from(name.as_str()));
        }
        Segment::Names(names) => {
            out.push('[');
            for (position, name) in names.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                let bracketed = PathKey::from(name.as_str()).to_string();
                out.push_str(&bracketed[1..bracketed.len() - 1]);
            }
            out.push(']');
        }
        Segment::Index(index) => {
            let _ = write!(out, "[{index}]");
        }
        Segment::Wildcard => out.push_str("[*]"),
        Segment::Filter(tokens) => {
            out.push_str("[?");
            render_tokens(out, tokens, render)?;
            out.push(']');
        }
        Segment::Descendant(inner) => {
            out.push_str("..");
            render_segment(out, inner, render)?;
        }
    }
    Ok(())
}

fn render_tokens(out: &mut String, tokens: &[Token], render: &Render<'_>) -> Result<(), PathError> {
    let mut glued = true;
    for token in tokens {
        if !glued {
            out.push(' ');
        }
        render_token(out, token, render)?;
        // a function name must touch its `(`
        glued = matches!(token, Token::Function(_));
    }
    Ok(())
}

fn render_token(out: &mut String, token: &Token, render: &Render<'_>) -> Result<(), PathError> {
    match token {
        Token::Punct(punct) => out.push_str(punct),
        Token::Literal(value) => out.push_str(&value.to_string()),
        Token::Function(name) => out.push_str(name),
        Token::Key => match render.key {
            Some(PathKey::Key(key)) => out.push_str(&Json::String(key.clone()).to_string()),
            Some(PathKey::Index(index)) => {
                let _ = write!(out, "{index}");
            }
            None => {
                return Err(render.error("`@key` is only supported in filters of the path itself"))
            }
        },
        Token::Context(name) => match context_value(render.context, name) {
            None => {
                tracing::trace!(
                    path = %render.path.source,
                    name,
                    "context value missing, using null"
                );
                out.push_str("null");
            }
            Some(Json::Array(_) | Json::Object(_)) => {
                return Err(PathError::ContextValue {
                    path: render.path.source.clone(),
                    name: name.clone(),
                })
            }
            Some(value) => out.push_str(&value.to_string()),
        },
        Token::Path(nested) => {
            out.push(match nested.root {
                Root::Document => '$',
                Root::Current => '@',
            });
            let inner = Render::new(render.path, render.context, None);
            for segment in &nested.segments {
                render_segment(out, segment, &inner)?;
            }
        }
        Token::Search(subject, pattern) => {
            out.push_str("search(");
            render_token(out, subject, render)?;
            out.push_str(", ");
            render_token(out, pattern, render)?;
            out.push(')');
        }
    }
    Ok(())
}

fn context_value(context: &Context, name: &str) -> Option<Json> {
    match name.strip_suffix(']').and_then(|n| n.split_once('[')) {
        Some((name, index)) => {
            let index: usize = index.parse().ok()?;
            context.get(&ContextKey::parse(name))?.get(index).cloned()
        }
        None => context.get(&ContextKey::parse(name)).cloned(),
    }
}

#[cfg(test)]
mod test {
    use crate::path::{select, Scope};
    use crate::placeholder::Context;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn keys(paths: &[&str], document: &serde_json::Value, context: &Context) -> Vec<String> {
        select(paths, &Scope::new(document, context))
            .unwrap()
            .into_iter()
            .map(|node| node.location.to_string())
            .collect()
    }

    #[test]
    fn filter_on_type_and_key() {
        let document = json!({
            "Resources": {
                "A": {"Type": "AWS::SQS::Queue"},
                "B": {"Type": "AWS::Lambda::Function"},
                "C": {"Type": "AWS::SQS::Queue", "Condition": "IsProd"}
            }
        });
        let context = Context::new().with("wanted", "C");

        assert_eq!(
            keys(&["$.Resources[?(@.Type == 'AWS::SQS::Queue')]"], &document, &context),
            vec!["$['Resources']['A']", "$['Resources']['C']"]
        );
        assert_eq!(
            keys(
                &["$.Resources[?(@.Type =~ '^AWS::SQS' && !@.Condition)]"],
                &document,
                &context
            ),
            vec!["$['Resources']['A']"]
        );
        assert_eq!(
            keys(&["$.Resources[?(@key == %wanted)]"], &document, &context),
            vec!["$['Resources']['C']"]
        );
        assert_eq!(
            keys(&["$.Resources[?(@key =~ '^[AB]$')].Type"], &document, &context),
            vec!["$['Resources']['A']['Type']", "$['Resources']['B']['Type']"]
        );
    }

    #[test]
    fn relative_paths_start_at_the_current_node() {
        let document = json!({
            "Resources": {
                "Fn": {"Properties": {"Environment": {"Variables": {
                    "ORDERS_TABLE": {"Ref": "Orders"},
                    "STAGE": "dev",
                    "it's": "quoted"
                }}}}
            }
        });
        let context = Context::new();
        let scope = Scope::new(&document, &context);

        let variables = select(&["$.Resources.Fn", "@.Properties.Environment.Variables"], &scope)
            .unwrap();
        assert_eq!(variables.len(), 1);

        let tables = select(
            &["$.Resources.Fn", "@.Properties.Environment.Variables[?(@key =~ '_TABLE$')]"],
            &scope,
        )
        .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].value, &json!({"Ref": "Orders"}));

        // keys that need escaping survive the round trip through a normalized path
        let quoted = select(
            &["$.Resources.Fn.Properties.Environment.Variables", "@[?(@key == \"it's\")]"],
            &scope,
        )
        .unwrap();
        assert_eq!(quoted[0].value, &json!("quoted"));
    }

    #[test]
    fn recursive_descent_is_in_document_order() {
        let document = json!({
            "a": {"Ref": "X"},
            "b": [{"c": {"Ref": "Y"}}, {"Ref": "Z"}]
        });
        let context = Context::new();

        let found: Vec<_> = select(&["$..Ref"], &Scope::new(&document, &context))
            .unwrap()
            .into_iter()
            .map(|node| node.value.clone())
            .collect();
        assert_eq!(found, vec![json!("X"), json!("Y"), json!("Z")]);
    }

    #[test]
    fn negative_index_and_union() {
        let document = json!({"list": [1, 2, 3], "obj": {"a": 1, "b": 2, "c": 3}});
        let context = Context::new();
        assert_eq!(
            keys(&["$.list[-1]"], &document, &context),
            vec!["$['list'][2]"]
        );
        assert_eq!(
            keys(&["$.obj['c','a']"], &document, &context),
            vec!["$['obj']['c']", "$['obj']['a']"]
        );
    }
}
