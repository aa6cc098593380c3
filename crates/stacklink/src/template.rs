//! raw infrastructure document ([Template]) and addressing of its entries
//!
//! [Template] tracks
//! - the dialect ([Format]) detected from the top-level `service` marker
//! - the nested document itself, as an order-preserving [serde_json::Value]
//!
//! and defines an [EntryId] for each top-level entry. Entries live in [Section]s whose
//! location depends on the dialect: `Resources` sits at the root of a plain template but
//! under `resources` in a Serverless one.
use serde_json::Value as Json;
use std::fmt;

/// Template dialect
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum Format {
    /// plain CloudFormation or SAM
    #[default]
    Plain,
    /// Serverless Framework convention
    Serverless,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Plain => f.write_str("Plain"),
            Format::Serverless => f.write_str("Serverless"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub enum Section {
    Resources,
    Conditions,
    Parameters,
    /// `functions` of a Serverless template
    Functions,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::Resources,
        Section::Conditions,
        Section::Parameters,
        Section::Functions,
    ];
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Resources => f.write_str("Resources"),
            Section::Conditions => f.write_str("Conditions"),
            Section::Parameters => f.write_str("Parameters"),
            Section::Functions => f.write_str("Functions"),
        }
    }
}

/// Identifies one top-level template entry
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct EntryId {
    pub section: Section,
    pub name: String,
}

impl EntryId {
    pub fn new(section: Section, name: impl Into<String>) -> Self {
        Self {
            section,
            name: name.into(),
        }
    }

    pub fn resource(name: impl Into<String>) -> Self {
        Self::new(Section::Resources, name)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.section, self.name)
    }
}

/// One step of a [Location]
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum PathKey {
    Index(usize),
    Key(String),
}

/// Renders as a normalized JSONPath selector, so a [Location] displays as a path that
/// selects exactly its node
impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Index(index) => write!(f, "[{index}]"),
            PathKey::Key(key) => {
                f.write_str("['")?;
                for c in key.chars() {
                    match c {
                        '\'' => f.write_str("\\'")?,
                        '\\' => f.write_str("\\\\")?,
                        c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("']")
            }
        }
    }
}

impl From<&str> for PathKey {
    fn from(value: &str) -> Self {
        PathKey::Key(value.to_string())
    }
}

impl From<usize> for PathKey {
    fn from(value: usize) -> Self {
        PathKey::Index(value)
    }
}

/// Absolute address of a node inside a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Location(pub Vec<PathKey>);

impl Location {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, key: impl Into<PathKey>) -> Self {
        let mut keys = self.0.clone();
        keys.push(key.into());
        Self(keys)
    }

    pub fn parent(&self) -> Option<(Location, &PathKey)> {
        let (last, rest) = self.0.split_last()?;
        Some((Location(rest.to_vec()), last))
    }

    pub fn starts_with(&self, prefix: &Location) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("$")?;
        for key in &self.0 {
            key.fmt(f)?;
        }
        Ok(())
    }
}

impl<K: Into<PathKey>> FromIterator<K> for Location {
    fn from_iter<T: IntoIterator<Item = K>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Read access to a [Location] of a document
pub fn get<'a>(document: &'a Json, location: &Location) -> Option<&'a Json> {
    location
        .keys()
        .iter()
        .try_fold(document, |node, key| match key {
            PathKey::Key(key) => node.as_object()?.get(key),
            PathKey::Index(index) => node.as_array()?.get(*index),
        })
}

pub fn get_mut<'a>(document: &'a mut Json, location: &Location) -> Option<&'a mut Json> {
    location
        .keys()
        .iter()
        .try_fold(document, |node, key| match key {
            PathKey::Key(key) => node.as_object_mut()?.get_mut(key),
            PathKey::Index(index) => node.as_array_mut()?.get_mut(*index),
        })
}

/// Walk to `location`, creating missing objects (and `null` array slots) on the way
///
/// Returns `None` when an existing scalar blocks the way.
pub fn ensure<'a>(document: &'a mut Json, location: &Location) -> Option<&'a mut Json> {
    let mut node = document;
    for key in location.keys() {
        if node.is_null() {
            *node = match key {
                PathKey::Key(_) => Json::Object(Default::default()),
                PathKey::Index(_) => Json::Array(Default::default()),
            };
        }

        node = match key {
            PathKey::Key(key) => node
                .as_object_mut()?
                .entry(key.clone())
                .or_insert(Json::Null),
            PathKey::Index(index) => {
                let array = node.as_array_mut()?;
                if *index >= array.len() {
                    array.resize(*index + 1, Json::Null);
                }
                &mut array[*index]
            }
        };
    }

    Some(node)
}

/// Remove the node at `location`, returning it
pub fn remove(document: &mut Json, location: &Location) -> Option<Json> {
    let (parent, key) = location.parent()?;
    let parent = get_mut(document, &parent)?;
    match key {
        PathKey::Key(key) => parent.as_object_mut()?.shift_remove(key),
        PathKey::Index(index) => {
            let array = parent.as_array_mut()?;
            (*index < array.len()).then(|| array.remove(*index))
        }
    }
}

/// Remove `location` and its ancestors while they are empty containers
///
/// Stops at `floor` keys deep and never removes a `Properties` object.
pub fn prune_empty(document: &mut Json, location: &Location, floor: usize) {
    let mut location = location.clone();
    while location.keys().len() > floor {
        let empty = match get(document, &location) {
            Some(Json::Object(object)) => object.is_empty(),
            Some(Json::Array(array)) => array.is_empty(),
            _ => false,
        };
        if !empty || location.keys().last() == Some(&PathKey::from("Properties")) {
            return;
        }

        remove(document, &location);
        location = match location.parent() {
            Some((parent, _)) => parent,
            None => return,
        };
    }
}

/// Parameters that every template implicitly declares
pub const PSEUDO_PARAMETERS: &[&str] = &[
    "AWS::AccountId",
    "AWS::NotificationARNs",
    "AWS::NoValue",
    "AWS::Partition",
    "AWS::Region",
    "AWS::StackId",
    "AWS::StackName",
    "AWS::URLSuffix",
];

/// A raw template and its dialect
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    format: Format,
    document: Json,
}

impl Template {
    /// Wrap a document, detecting its [Format]
    pub fn new(document: Json) -> Result<Self, LoadError> {
        let Some(root) = document.as_object() else {
            return Err(LoadError::NotAnObject);
        };

        let format = if root.contains_key("service") {
            Format::Serverless
        } else {
            Format::Plain
        };

        Ok(Self { format, document })
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn document(&self) -> &Json {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Json {
        &mut self.document
    }

    /// Location of a [Section] in this dialect
    pub fn section_location(&self, section: Section) -> Location {
        match (self.format, section) {
            (Format::Plain, Section::Functions) => ["Functions"].into_iter().collect(),
            (Format::Plain, section) => [section.to_string().as_str()].into_iter().collect(),
            (Format::Serverless, Section::Functions) => ["functions"].into_iter().collect(),
            (Format::Serverless, section) => ["resources", section.to_string().as_str()]
                .into_iter()
                .collect(),
        }
    }

    pub fn entry_location(&self, entry: &EntryId) -> Location {
        self.section_location(entry.section)
            .child(entry.name.as_str())
    }

    /// The entry that contains `location`, if any
    pub fn entry_at(&self, location: &Location) -> Option<EntryId> {
        Section::ALL.into_iter().find_map(|section| {
            let section_location = self.section_location(section);
            if !location.starts_with(&section_location) {
                return None;
            }

            match location.keys().get(section_location.keys().len())? {
                PathKey::Key(name) => Some(EntryId::new(section, name.clone())),
                PathKey::Index(_) => None,
            }
        })
    }

    pub fn section(&self, section: Section) -> Option<&serde_json::Map<String, Json>> {
        get(&self.document, &self.section_location(section))?.as_object()
    }

    /// All entries in document order, section by section
    pub fn entries(&self) -> Vec<EntryId> {
        Section::ALL
            .into_iter()
            .flat_map(|section| {
                self.section(section)
                    .into_iter()
                    .flat_map(move |entries| {
                        entries.keys().map(move |name| EntryId::new(section, name.clone()))
                    })
            })
            .collect()
    }

    pub fn entry(&self, entry: &EntryId) -> Option<&Json> {
        self.section(entry.section)?.get(&entry.name)
    }

    pub fn contains(&self, entry: &EntryId) -> bool {
        self.entry(entry).is_some()
    }

    pub fn insert_entry(&mut self, entry: &EntryId, value: Json) -> Option<Json> {
        let location = self.entry_location(entry);
        let slot = ensure(&mut self.document, &location)?;
        let previous = std::mem::replace(slot, value);
        (!previous.is_null()).then_some(previous)
    }

    pub fn remove_entry(&mut self, entry: &EntryId) -> Option<Json> {
        let location = self.entry_location(entry);
        let removed = remove(&mut self.document, &location);
        tracing::trace!(%entry, removed = removed.is_some(), "remove entry");
        removed
    }

    /// The CloudFormation `Type` of an entry (`Condition`/`Parameter` for those sections)
    pub fn entry_type(&self, entry: &EntryId) -> String {
        match entry.section {
            Section::Conditions => "Condition".to_string(),
            Section::Parameters => "Parameter".to_string(),
            Section::Functions => "AWS::Lambda::Function".to_string(),
            Section::Resources => self
                .entry(entry)
                .and_then(|value| value.get("Type"))
                .and_then(Json::as_str)
                .unwrap_or("Unknown")
                .to_string(),
        }
    }

    /// Resolve a logical id as written inside a `Ref`/`Fn::GetAtt` to its entry
    ///
    /// Serverless functions answer to their generated logical id (`hello` is
    /// `HelloLambdaFunction`).
    pub fn resolve_logical(&self, logical_id: &str) -> Option<EntryId> {
        let resource = EntryId::resource(logical_id);
        if self.contains(&resource) {
            return Some(resource);
        }

        let functions = self.section(Section::Functions)?;
        functions
            .keys()
            .find(|name| function_logical_id(name) == logical_id)
            .map(|name| EntryId::new(Section::Functions, name.clone()))
    }

    /// Whether `name` is a declared or pseudo parameter
    pub fn is_parameter(&self, name: &str) -> bool {
        PSEUDO_PARAMETERS.contains(&name)
            || self
                .section(Section::Parameters)
                .is_some_and(|parameters| parameters.contains_key(name))
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.document)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.document)
    }
}

/// Serverless logical id normalisation (`my-func` → `MyDashfunc`)
pub fn normalize_logical_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut chars = name.chars();
    if let Some(first) = chars.next() {
        normalized.extend(first.to_uppercase());
    }
    for c in chars {
        match c {
            '-' => normalized.push_str("Dash"),
            '_' => normalized.push_str("Underscore"),
            c => normalized.push(c),
        }
    }
    normalized
}

pub fn function_logical_id(name: &str) -> String {
    format!("{}LambdaFunction", normalize_logical_name(name))
}

impl Template {
    pub fn from_json_str(text: &str) -> Result<Self, LoadError> {
        let document: Json = serde_json::from_str(text)?;
        Self::new(document)
    }

    /// Parse YAML, expanding CloudFormation short-form tags (`!Ref`, `!GetAtt`, ...)
    pub fn from_yaml_str(text: &str) -> Result<Self, LoadError> {
        let document: serde_yaml::Value = serde_yaml::from_str(text)?;
        Self::new(yaml_to_json(document)?)
    }

    /// JSON when the text looks like JSON, YAML otherwise
    pub fn from_str_guess(text: &str) -> Result<Self, LoadError> {
        if text.trim_start().starts_with('{') {
            Self::from_json_str(text)
        } else {
            Self::from_yaml_str(text)
        }
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<Json, LoadError> {
    use serde_yaml::Value as Yaml;

    Ok(match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(b),
        Yaml::Number(n) => {
            if let Some(int) = n.as_i64() {
                Json::from(int)
            } else if let Some(uint) = n.as_u64() {
                Json::from(uint)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(Json::Number)
                    .ok_or(LoadError::InvalidNumber)?
            }
        }
        Yaml::String(s) => Json::String(s),
        Yaml::Sequence(sequence) => Json::Array(
            sequence
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut object = serde_json::Map::new();
            for (key, value) in mapping {
                let key = match key {
                    Yaml::String(s) => s,
                    Yaml::Number(n) => n.to_string(),
                    Yaml::Bool(b) => b.to_string(),
                    _ => return Err(LoadError::NonScalarKey),
                };
                object.insert(key, yaml_to_json(value)?);
            }
            Json::Object(object)
        }
        Yaml::Tagged(tagged) => {
            let tag = tagged.tag.to_string();
            let tag = tag.trim_start_matches('!');
            let value = yaml_to_json(tagged.value)?;
            expand_short_form(tag, value)?
        }
    })
}

fn expand_short_form(tag: &str, value: Json) -> Result<Json, LoadError> {
    let key = match tag {
        "Ref" => "Ref",
        "Condition" => "Condition",
        "GetAtt" => {
            let value = match value {
                Json::String(s) => match s.split_once('.') {
                    Some((logical_id, attribute)) => {
                        serde_json::json!([logical_id, attribute])
                    }
                    None => return Err(LoadError::MalformedGetAtt(s)),
                },
                other => other,
            };
            return Ok(crate::util::intrinsic("Fn::GetAtt", value));
        }
        "Sub" | "If" | "Join" | "Select" | "Split" | "Equals" | "Not" | "And" | "Or"
        | "ImportValue" | "Cidr" | "GetAZs" | "Base64" | "FindInMap" | "Transform" => {
            return Ok(crate::util::intrinsic(&format!("Fn::{tag}"), value))
        }
        other => return Err(LoadError::UnknownTag(other.to_string())),
    };

    Ok(crate::util::intrinsic(key, value))
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("template root must be a mapping")]
    NotAnObject,
    #[error("Unable to parse yaml template")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Unable to parse json template")]
    Json(#[from] serde_json::Error),
    #[error("mapping keys must be scalars")]
    NonScalarKey,
    #[error("number can not be represented")]
    InvalidNumber,
    #[error("unknown tag !{0}")]
    UnknownTag(String),
    #[error("!GetAtt expects `Resource.Attribute`, got {0:?}")]
    MalformedGetAtt(String),
}

/// Utility macro to create a [Template] from YAML text
///
/// ```
/// # use stacklink::template;
/// let template = template!("Resources: {}");
/// assert_eq!(template.format(), stacklink::template::Format::Plain);
/// ```
///
/// # Panic
/// Panics on invalid input
#[macro_export]
macro_rules! template {
    { $text:expr } => {
        $crate::template::Template::from_yaml_str($text).expect("template must parse")
    };
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_format() {
        assert_eq!(template!("Resources: {}").format(), Format::Plain);
        assert_eq!(
            template!("service: demo\nfunctions: {}").format(),
            Format::Serverless
        );
    }

    #[test]
    fn short_form_tags() {
        let template = template! {r#"
        Resources:
          Fn:
            Type: AWS::Lambda::Function
            Properties:
              Role: !GetAtt FnRole.Arn
              Name: !Sub "${AWS::StackName}-fn"
              Table: !Ref Tbl
        "#};

        let properties = &template.entry(&EntryId::resource("Fn")).unwrap()["Properties"];
        assert_eq!(
            properties["Role"],
            serde_json::json!({"Fn::GetAtt": ["FnRole", "Arn"]})
        );
        assert_eq!(
            properties["Name"],
            serde_json::json!({"Fn::Sub": "${AWS::StackName}-fn"})
        );
        assert_eq!(properties["Table"], serde_json::json!({"Ref": "Tbl"}));
    }

    #[test]
    fn entries_in_both_dialects() {
        let plain = template!("Resources:\n  A: {Type: X}\nConditions:\n  C: {}\n");
        assert_eq!(
            plain.entries(),
            vec![
                EntryId::resource("A"),
                EntryId::new(Section::Conditions, "C")
            ]
        );

        let serverless = template! {r#"
        service: demo
        functions:
          hello-world: {handler: index.handler}
        resources:
          Resources:
            Tbl: {Type: AWS::DynamoDB::Table}
        "#};
        assert_eq!(
            serverless.entries(),
            vec![
                EntryId::resource("Tbl"),
                EntryId::new(Section::Functions, "hello-world")
            ]
        );
        assert_eq!(
            serverless.resolve_logical("HelloDashworldLambdaFunction"),
            Some(EntryId::new(Section::Functions, "hello-world"))
        );
        assert_eq!(
            serverless.entry_at(
                &["resources", "Resources", "Tbl", "Properties"]
                    .into_iter()
                    .collect()
            ),
            Some(EntryId::resource("Tbl"))
        );
    }

    #[test]
    fn ensure_and_remove() {
        let mut document = serde_json::json!({});
        let location: Location = ["a", "b"].into_iter().collect();
        *ensure(&mut document, &location).unwrap() = serde_json::json!(1);
        assert_eq!(document, serde_json::json!({"a": {"b": 1}}));
        assert_eq!(remove(&mut document, &location), Some(serde_json::json!(1)));
        assert_eq!(document, serde_json::json!({"a": {}}));
    }

    #[test]
    fn prune_stops_at_properties() {
        let mut document = serde_json::json!({
            "Fn": {"Properties": {"Environment": {"Variables": {}}, "Runtime": "x"}}
        });
        let location: Location = ["Fn", "Properties", "Environment", "Variables"]
            .into_iter()
            .collect();
        prune_empty(&mut document, &location, 1);
        assert_eq!(
            document,
            serde_json::json!({"Fn": {"Properties": {"Runtime": "x"}}})
        );

        let mut document = serde_json::json!({"Fn": {"Properties": {"Policies": []}}});
        prune_empty(
            &mut document,
            &["Fn", "Properties", "Policies"].into_iter().collect(),
            1,
        );
        assert_eq!(document, serde_json::json!({"Fn": {"Properties": {}}}));
    }
}
