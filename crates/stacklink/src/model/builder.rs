//! build [Resource]s and [Facet]s from located template fragments
use super::{Facet, Resource};
use crate::error::Result;
use crate::id::Classifier;
use crate::path::{self, Node, Scope};
use crate::placeholder::{self, truthy, Context, ContextKey, Strictness};
use crate::schema::{PathSpec, ResourceTypeSchema, SettingSchema};
use crate::template::{EntryId, PathKey, Template};
use crate::util::{as_intrinsic, sub_prefix};
use crate::value::{Settings, Value};
use indexmap::IndexMap;
use serde_json::Value as Json;

/// One locator hit
#[derive(Debug, Clone)]
pub(crate) struct Located<'a> {
    pub node: Node<'a>,
    /// the entry containing the hit
    pub entry: Option<EntryId>,
    /// the hit is the entry itself, not a fragment inside it
    pub is_entry: bool,
}

/// Settings resolved at one node, plus the hits of facet-bearing settings
pub(crate) struct Resolved<'a> {
    pub settings: Settings,
    pub facets: Vec<(String, Vec<Node<'a>>)>,
}

pub(crate) struct Builder<'a, 'c> {
    template: &'a Template,
    classifier: &'c Classifier<'a>,
    region: &'c str,
}

impl<'a, 'c> Builder<'a, 'c> {
    pub fn new(template: &'a Template, classifier: &'c Classifier<'a>, region: &'c str) -> Self {
        Self {
            template,
            classifier,
            region,
        }
    }

    /// Values every placeholder may use
    pub fn base_context(&self) -> Context {
        Context::new()
            .with("region", self.region)
            .with("format", self.template.format().to_string())
    }

    /// Placeholder values describing `resource`
    pub fn resource_context(&self, resource: &Resource) -> Context {
        let logical_id = resource
            .primary_entry()
            .map_or(resource.id.as_str(), |entry| entry.name.as_str());
        let mut context = self
            .base_context()
            .with("resourceId", resource.id.as_str())
            .with("logicalId", logical_id);
        if let Some(name) = &resource.physical_name {
            context.insert("physicalId", name.as_str());
        }
        context.insert_all(
            ContextKey::Setting,
            resource.settings.iter().map(|(k, v)| (k, v.to_json())),
        );
        context
    }

    /// The node of the entry a resource was located at
    pub fn resource_fragment(&self, resource: &Resource) -> Option<Node<'a>> {
        self.fragment(resource.primary_entry()?)
    }

    pub fn scope<'s>(&self, context: &'s Context) -> Scope<'a, 's> {
        Scope::new(self.template.document(), context)
    }

    /// Run a path spec for the active format; `None` when it does not apply
    pub fn select(
        &self,
        spec: &PathSpec,
        at: Option<&Node<'a>>,
        context: &Context,
    ) -> Result<Vec<Node<'a>>> {
        let Some(steps) = spec.steps(self.template.format()) else {
            return Ok(vec![]);
        };
        let mut scope = self.scope(context);
        if let Some(at) = at {
            scope = scope.at(at.clone());
        }
        Ok(path::select(&steps, &scope)?)
    }

    pub fn locate(&self, schema: &ResourceTypeSchema) -> Result<Vec<Located<'a>>> {
        let Some(locator) = &schema.locator else {
            return Ok(vec![]);
        };

        let context = self.base_context();
        Ok(self
            .select(locator, None, &context)?
            .into_iter()
            .map(|node| self.located(node))
            .collect())
    }

    /// The node of a whole entry
    pub fn fragment(&self, entry: &EntryId) -> Option<Node<'a>> {
        Some(Node {
            location: self.template.entry_location(entry),
            value: self.template.entry(entry)?,
        })
    }

    pub fn located(&self, node: Node<'a>) -> Located<'a> {
        let entry = self.template.entry_at(&node.location);
        let is_entry = entry
            .as_ref()
            .is_some_and(|entry| self.template.entry_location(entry) == node.location);
        Located {
            node,
            entry,
            is_entry,
        }
    }

    /// Build one resource from a locator hit
    pub fn build(
        &self,
        resource_type: &str,
        schema: &ResourceTypeSchema,
        located: &Located<'a>,
    ) -> Result<Resource> {
        let mut context = self.base_context();
        let logical_id = located
            .entry
            .as_ref()
            .map(|entry| entry.name.clone())
            .unwrap_or_default();
        context.insert("logicalId", logical_id.as_str());
        context.insert("value", located.node.value.clone());
        match located.node.key() {
            Some(PathKey::Key(key)) => context.insert("key", key.as_str()),
            Some(PathKey::Index(index)) => context.insert("key", *index),
            None => {}
        }

        let id = placeholder::expand_to_string(schema.id_pattern(), &context, Strictness::Strict)?;
        context.remove(&ContextKey::from("value"));
        context.insert("resourceId", id.as_str());

        let mut resource = Resource::new(resource_type, id);
        if located.is_entry {
            if let Some(entry) = &located.entry {
                resource.template_partial.insert(entry.clone());
            }
        }

        if let Some(physical_name) = &schema.physical_name {
            resource.physical_name = self
                .select(physical_name, Some(&located.node), &context)?
                .first()
                .and_then(|node| physical_name_of(node.value));
            if let Some(name) = &resource.physical_name {
                context.insert("physicalId", name.as_str());
            }
        }

        for entry in self.satellites(&schema.satellites, &located.node, &context)? {
            resource.template_partial.insert(entry);
        }

        let resolved = self.resolve_settings(
            &schema.settings,
            &located.node,
            &mut context,
            ContextKey::Setting,
        )?;
        resource.settings = resolved.settings;

        for (facet_type, hits) in resolved.facets {
            let facet_schema = schema.facet_settings.get(&facet_type);
            let facets = resource.facets.entry(facet_type.clone()).or_default();
            for hit in hits {
                let index = facets.len();
                let mut facet_context = context.clone();
                facet_context.insert("index", index);

                let mut facet = Facet::new(facet_type.as_str(), "");
                let located = self.located(hit.clone());
                if located.is_entry {
                    if let Some(entry) = located.entry {
                        facet.template_partial.insert(entry);
                    }
                }

                if let Some(facet_schema) = facet_schema {
                    let resolved = self.resolve_settings(
                        &facet_schema.settings,
                        &hit,
                        &mut facet_context,
                        ContextKey::FacetSetting,
                    )?;
                    facet.settings = resolved.settings;
                    for entry in self.satellites(&facet_schema.satellites, &hit, &facet_context)? {
                        facet.template_partial.insert(entry);
                    }
                }

                facet.id = match facet_schema.and_then(|schema| schema.id.as_deref()) {
                    Some(pattern) => {
                        placeholder::expand_to_string(pattern, &facet_context, Strictness::Strict)?
                    }
                    None => format!("{facet_type}{index}"),
                };
                tracing::trace!(resource = %resource.id, facet = %facet.id, "facet");
                facets.push(facet);
            }
        }

        tracing::debug!(
            resource_type,
            id = %resource.id,
            entries = resource.template_partial.len(),
            "built resource"
        );
        Ok(resource)
    }

    /// Entries claimed through auxiliary locators
    pub fn satellites(
        &self,
        satellites: &[PathSpec],
        at: &Node<'a>,
        context: &Context,
    ) -> Result<Vec<EntryId>> {
        let mut entries = vec![];
        for satellite in satellites {
            for node in self.select(satellite, Some(at), context)? {
                if let Some(entry) = self.template.entry_at(&node.location) {
                    if !entries.contains(&entry) {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }

    /// Resolve settings in schema order
    ///
    /// Each resolved value is also stored in `context` under `namespace(name)` so later
    /// settings (paths, defaults, `DependsOn`) can use it.
    pub fn resolve_settings(
        &self,
        schemas: &IndexMap<String, SettingSchema>,
        at: &Node<'a>,
        context: &mut Context,
        namespace: fn(String) -> ContextKey,
    ) -> Result<Resolved<'a>> {
        let mut resolved = Resolved {
            settings: Settings::new(),
            facets: vec![],
        };

        for (name, schema) in schemas {
            if let Some(facet_type) = &schema.facet_type {
                let hits = match &schema.path {
                    Some(path) => self.select(path, Some(at), context)?,
                    None => vec![],
                };
                resolved.facets.push((facet_type.clone(), hits));
                continue;
            }

            let found = match &schema.path {
                Some(path) => {
                    let nodes = self.select(path, Some(at), context)?;
                    match nodes.as_slice() {
                        [] => None,
                        [node] => Some(node.value.clone()),
                        nodes => Some(Json::Array(
                            nodes.iter().map(|node| node.value.clone()).collect(),
                        )),
                    }
                }
                None => None,
            };

            let value = if depends_on_met(schema, context, namespace) {
                let transformed = schema
                    .transforms
                    .iter()
                    .try_fold(found, |value, transform| transform.apply(value))?
                    .filter(|value| !value.is_null());
                match transformed {
                    Some(value) => Some(value),
                    None => default_value(schema, context, Strictness::Strict)?,
                }
            } else {
                tracing::trace!(setting = %name, "dependency not met, using default");
                default_value(schema, context, Strictness::AllowUndefined)?
            };

            let Some(value) = value else {
                continue;
            };

            context.insert(namespace(name.clone()), value.clone());
            if let Some(value) = Value::from_template(&value, self.classifier) {
                resolved.settings.insert(name.clone(), value);
            }
        }

        Ok(resolved)
    }
}

/// Add `sourceId` and `SOURCESETTING:*` of an integration source
pub(crate) fn insert_source(context: &mut Context, source: &Resource) {
    context.insert("sourceId", source.id.as_str());
    context.insert_all(
        ContextKey::SourceSetting,
        source.settings.iter().map(|(k, v)| (k, v.to_json())),
    );
}

/// Add `targetId`, `targetPhysicalId` and `TARGETSETTING:*` of a target resource
pub(crate) fn insert_target(context: &mut Context, target: &Resource) {
    context.insert("targetId", target.id.as_str());
    if let Some(name) = &target.physical_name {
        context.insert("targetPhysicalId", name.as_str());
    }
    context.insert_all(
        ContextKey::TargetSetting,
        target.settings.iter().map(|(k, v)| (k, v.to_json())),
    );
}

/// Whether every `DependsOn` entry has its expected value
pub(crate) fn depends_on_met(
    schema: &SettingSchema,
    context: &Context,
    namespace: fn(String) -> ContextKey,
) -> bool {
    schema.depends_on.iter().all(|(other, expected)| {
        match context.get(&namespace(other.clone())) {
            Some(actual) => same_setting(actual, expected),
            None => expected.is_null() || !truthy(expected),
        }
    })
}

fn same_setting(actual: &Json, expected: &Json) -> bool {
    match (actual, expected) {
        (Json::Number(a), Json::Number(b)) => a.as_f64() == b.as_f64(),
        (Json::Bool(a), expected) | (expected, Json::Bool(a)) if !expected.is_boolean() => {
            *a == truthy(expected)
        }
        (actual, expected) => actual == expected,
    }
}

pub(crate) fn default_value(
    schema: &SettingSchema,
    context: &Context,
    strictness: Strictness,
) -> Result<Option<Json>> {
    Ok(match &schema.default {
        Some(default) => Some(placeholder::expand_json(default, context, strictness)?),
        None => None,
    })
}

fn physical_name_of(value: &Json) -> Option<String> {
    let name = match value {
        Json::String(name) => name.as_str(),
        value => match as_intrinsic(value)? {
            ("Fn::Sub", Json::String(template)) => sub_prefix(template),
            _ => return None,
        },
    };
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::SchemaRegistry;
    use crate::template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
ResourceTypes:
  Function:
    Locator: "$.Resources[?(@.Type == 'AWS::Serverless::Function')]"
    PhysicalName: "@.Properties.FunctionName"
    Satellites:
      - ["@.Properties.Role", "$.Resources['%{value|LogicalId}']"]
    Settings:
      Runtime:
        Path: "@.Properties.Runtime"
        Default: nodejs20.x
      Tracing:
        Path: "@.Properties.Tracing"
        Transformations: "Bool"
        Default: false
      TracingMode:
        Path: "@.Properties.TracingMode"
        Default: PassThrough
        DependsOn:
          Tracing: true
      Routes:
        Path: "@.Properties.Events[?(@.Type == 'Api')]"
        FacetType: Route
    FacetSettings:
      Route:
        Id: "%{FACETSETTING:Method|Upper} %{FACETSETTING:Path}"
        Settings:
          Path:
            Path: "@.Properties.Path"
          Method:
            Path: "@.Properties.Method"
"#;

    #[test]
    fn builds_settings_facets_and_satellites() {
        let registry = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let template = template! {r#"
        Resources:
          Fn:
            Type: AWS::Serverless::Function
            Properties:
              FunctionName: !Sub "orders-${AWS::Region}"
              Role: !GetAtt FnRole.Arn
              TracingMode: Active
              Events:
                List: {Type: Api, Properties: {Path: /items, Method: get}}
                Queue: {Type: SQS, Properties: {Queue: !GetAtt Jobs.Arn}}
          FnRole:
            Type: AWS::IAM::Role
        "#};
        let classifier = Classifier::new(&template);
        let builder = Builder::new(&template, &classifier, registry.region());
        let schema = registry.get("Function").unwrap();

        let located = builder.locate(schema).unwrap();
        assert_eq!(located.len(), 1);
        assert!(located[0].is_entry);

        let resource = builder.build("Function", schema, &located[0]).unwrap();
        assert_eq!(resource.id, "Fn");
        assert_eq!(resource.physical_name.as_deref(), Some("orders-"));
        assert_eq!(
            resource.template_partial.iter().cloned().collect::<Vec<_>>(),
            vec![EntryId::resource("Fn"), EntryId::resource("FnRole")]
        );
        assert_eq!(resource.settings["Runtime"], Value::from("nodejs20.x"));
        assert_eq!(resource.settings["Tracing"], Value::from(false));
        // tracing is off, so the mode falls back to its default
        assert_eq!(resource.settings["TracingMode"], Value::from("PassThrough"));

        let route = resource.facet("Route", "GET /items").unwrap();
        assert_eq!(route.settings["Path"], Value::from("/items"));
        assert!(route.template_partial.is_empty());
    }

    #[test]
    fn dependency_check_compares_loosely() {
        let schema: SettingSchema =
            serde_yaml::from_str("DependsOn: {Enabled: true, Size: 2}").unwrap();
        let context = Context::new()
            .with(ContextKey::Setting("Enabled".into()), "true")
            .with(ContextKey::Setting("Size".into()), json!(2.0));
        assert!(depends_on_met(&schema, &context, ContextKey::Setting));

        let context = Context::new().with(ContextKey::Setting("Size".into()), 2);
        assert!(!depends_on_met(&schema, &context, ContextKey::Setting));
    }
}
