//! declarative resource-type schemas ([SchemaRegistry])
//!
//! Schemas are data: which template fragments make up a resource type, how its settings
//! are read, which template edits a mutation triggers, which integrations and permissions
//! it supports. They are loaded once (YAML or JSON) and passed by reference to every
//! engine entry point. Nothing in the engine is specific to one resource type.
//!
//! ```yaml
//! ResourceTypes:
//!   Table:
//!     Locator: "$.Resources[?(@.Type == 'AWS::DynamoDB::Table')]"
//!     PhysicalName: "@.Properties.TableName"
//!     Settings:
//!       BillingMode:
//!         Path: "@.Properties.BillingMode"
//!         Default: PAY_PER_REQUEST
//!     PermissionTypes:
//!       Read:
//!         Actions: [dynamodb:GetItem, dynamodb:Query]
//!         Resources: ["%{targetId|GetAtt(Arn)}"]
//! GroupingRules:
//!   - Owner: "^Function$"
//!     Target: "^AWS::IAM::Role$"
//!     StopChaining: true
//! ```
use crate::placeholder::{PlaceholderError, Transform};
use crate::template::Format;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value as Json;

/// Resource type of standalone template entries without a dedicated schema
pub const CUSTOM_TYPE: &str = "Custom";

/// A path string, a pipeline of path strings, or one of those per [Format]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    Single(String),
    Pipeline(Vec<String>),
    PerFormat(IndexMap<Format, PathSpec>),
}

impl PathSpec {
    /// The pipeline to run for `format`, if this spec applies to it
    pub fn steps(&self, format: Format) -> Option<Vec<String>> {
        match self {
            PathSpec::Single(path) => Some(vec![path.clone()]),
            PathSpec::Pipeline(steps) => Some(steps.clone()),
            PathSpec::PerFormat(by_format) => by_format.get(&format)?.steps(format),
        }
    }
}

impl From<&str> for PathSpec {
    fn from(value: &str) -> Self {
        PathSpec::Single(value.to_string())
    }
}

/// A value shared by both dialects or one per [Format]
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FormatSpecific<T> {
    PerFormat(IndexMap<Format, T>),
    Shared(T),
}

impl<T> FormatSpecific<T> {
    pub fn get(&self, format: Format) -> Option<&T> {
        match self {
            FormatSpecific::PerFormat(by_format) => by_format.get(&format),
            FormatSpecific::Shared(value) => Some(value),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ResourceTypeSchema {
    /// absolute query; each match is one resource
    pub locator: Option<PathSpec>,
    /// id pattern; hits sharing one id are coalesced (defaults to `%{logicalId}`)
    pub id: Option<String>,
    /// extra entries claimed together with the located fragment
    #[serde(default)]
    pub satellites: Vec<PathSpec>,
    pub physical_name: Option<PathSpec>,
    #[serde(default)]
    pub settings: IndexMap<String, SettingSchema>,
    #[serde(default)]
    pub facet_settings: IndexMap<String, FacetTypeSchema>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default)]
    pub integration_types: IndexMap<String, IntegrationTypeSchema>,
    #[serde(default)]
    pub permission_types: IndexMap<String, PermissionTypeSchema>,
    #[serde(default)]
    pub grouping_rules: Vec<GroupingRule>,
    pub virtual_network_placements: Option<PlacementSchema>,
    /// where IAM grants of this (compute) type live
    pub permissions: Option<FormatSpecific<PermissionLocation>>,
    /// where environment-style references of this (compute) type live
    pub references: Option<PathSpec>,
    /// references a compute resource gets when wired to this type: name pattern → value
    #[serde(default)]
    pub default_references: IndexMap<String, Json>,
    /// instances of this type may be inferred from a permission shape alone
    pub virtual_reference: Option<VirtualReferenceSchema>,
}

impl ResourceTypeSchema {
    pub fn id_pattern(&self) -> &str {
        self.id.as_deref().unwrap_or("%{logicalId}")
    }

    pub fn supports_permissions(&self) -> bool {
        self.permissions.is_some()
    }

    /// Settings of this type or of one of its facet types
    pub fn setting(&self, facet_type: Option<&str>, name: &str) -> Option<&SettingSchema> {
        match facet_type {
            None => self.settings.get(name),
            Some(facet_type) => self.facet_settings.get(facet_type)?.settings.get(name),
        }
    }

    /// Reactions of this type matching `trigger`, in schema order
    pub fn reactions_for<'s>(
        &'s self,
        trigger: &'s Trigger<'_>,
    ) -> impl Iterator<Item = &'s Reaction> {
        self.reactions
            .iter()
            .filter(move |reaction| reaction.matches(trigger))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SettingSchema {
    pub path: Option<PathSpec>,
    /// `Transform|Transform(arg)` chain applied to the resolved value
    pub transformations: Option<String>,
    pub default: Option<Json>,
    /// forced back to `Default` unless every named setting has the given value
    #[serde(default)]
    pub depends_on: IndexMap<String, Json>,
    /// each match becomes one facet of this type
    pub facet_type: Option<String>,
    /// edits to this setting rewrite free-form structure; re-parse afterwards
    #[serde(default)]
    pub reparse_required: bool,
    #[serde(skip)]
    pub(crate) transforms: Vec<Transform>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FacetTypeSchema {
    /// facet id pattern (defaults to `<FacetType><index>`)
    pub id: Option<String>,
    #[serde(default)]
    pub settings: IndexMap<String, SettingSchema>,
    #[serde(default)]
    pub satellites: Vec<PathSpec>,
}

/// What happened, as seen by reaction conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
pub enum Action {
    AddResource,
    DeleteResource,
    UpdateResourceSetting,
    AddFacet,
    DeleteFacet,
    UpdateFacetSetting,
    AddIntegration,
    DeleteIntegration,
    UpdateIntegrationSetting,
    PutVirtualNetworkPlacement,
    DeleteVirtualNetworkPlacement,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Reaction {
    pub action: Action,
    #[serde(default)]
    pub conditions: ReactionConditions,
    pub operations: Vec<Operation>,
}

impl Reaction {
    pub fn matches(&self, trigger: &Trigger<'_>) -> bool {
        let conditions = &self.conditions;
        self.action == trigger.action
            && conditions.format.map_or(true, |f| f == trigger.format)
            && matches_name(&conditions.setting, trigger.setting)
            && matches_name(&conditions.facet_type, trigger.facet_type)
            && matches_name(&conditions.integration_type, trigger.integration_type)
            && matches_name(&conditions.target_type, trigger.target_type)
            && matches_value(&conditions.old_value, trigger.old_value)
            && matches_value(&conditions.new_value, trigger.new_value)
    }
}

fn matches_name(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual == Some(expected.as_str()),
    }
}

fn matches_value(expected: &Option<Json>, actual: Option<&Json>) -> bool {
    match expected {
        None => true,
        Some(expected) => actual.unwrap_or(&Json::Null) == expected,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ReactionConditions {
    pub setting: Option<String>,
    pub facet_type: Option<String>,
    pub integration_type: Option<String>,
    pub target_type: Option<String>,
    pub old_value: Option<Json>,
    pub new_value: Option<Json>,
    pub format: Option<Format>,
}

/// The facts a reaction is matched against
#[derive(Debug, Clone, derive_new::new)]
pub struct Trigger<'a> {
    pub action: Action,
    pub format: Format,
    #[new(default)]
    pub setting: Option<&'a str>,
    #[new(default)]
    pub facet_type: Option<&'a str>,
    #[new(default)]
    pub integration_type: Option<&'a str>,
    #[new(default)]
    pub target_type: Option<&'a str>,
    #[new(default)]
    pub old_value: Option<&'a Json>,
    #[new(default)]
    pub new_value: Option<&'a Json>,
}

/// One template edit
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Op", rename_all = "PascalCase", deny_unknown_fields)]
pub enum Operation {
    /// write a fragment at the resolved path(s)
    #[serde(rename_all = "PascalCase")]
    Upsert {
        path: PathSpec,
        value: Json,
        #[serde(default = "default_true")]
        create_path: bool,
    },
    /// remove the resolved path(s); absent paths are ignored
    #[serde(rename_all = "PascalCase")]
    Delete { path: PathSpec },
    /// push onto the array at the resolved path(s), creating it if needed
    #[serde(rename_all = "PascalCase")]
    Append {
        path: PathSpec,
        value: Json,
        #[serde(default)]
        unique: bool,
    },
    /// move child `from` to `to` inside the resolved object(s)
    #[serde(rename_all = "PascalCase")]
    RenameKey {
        path: PathSpec,
        from: String,
        to: String,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct IntegrationTypeSchema {
    pub target_type: String,
    /// query for existing integrations; each match is one integration
    ///
    /// Evaluated with `@` set to the source resource's fragment, unless `Source` is given,
    /// in which case the locator is global and `Source` (relative to the match) names the
    /// source.
    pub locator: Option<PathSpec>,
    /// reference to the target, relative to the match (the match itself when unset)
    pub target: Option<PathSpec>,
    pub source: Option<PathSpec>,
    pub facet_type: Option<String>,
    #[serde(default)]
    pub settings: IndexMap<String, SettingSchema>,
    /// permission types of the target granted when the integration is added
    #[serde(default)]
    pub permissions: Vec<String>,
    /// whether adding the integration also writes the target's default references
    #[serde(default)]
    pub references: bool,
    /// location, among the integration's own entries, that mutations patch
    pub virtual_target: Option<PathSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PermissionTypeSchema {
    #[serde(default)]
    pub actions: Vec<String>,
    /// resource patterns (`%{targetId|GetAtt(Arn)}`)
    #[serde(default)]
    pub resources: Vec<Json>,
    pub templated_policy: Option<TemplatedPolicySchema>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TemplatedPolicySchema {
    pub name: String,
    #[serde(default)]
    pub parameters: Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
pub enum PermissionStyle {
    /// SAM `Policies`: managed policy names, templated policies, policy documents
    Policies,
    /// an IAM role entry: inline `Policies` and `ManagedPolicyArns`
    Role,
    /// a plain list of IAM statements
    Statements,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PermissionLocation {
    pub style: PermissionStyle,
    pub path: PathSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct VirtualReferenceSchema {
    /// id of the synthetic singleton
    pub id: String,
    /// actions of the default grant; a statement using any of these without a
    /// classifiable target implies a reference to the singleton
    pub actions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<Json>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PlacementSchema {
    pub subnets: PathSpec,
    pub security_groups: PathSpec,
    pub virtual_network: Option<PathSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct GroupingRule {
    /// regex over the owner's type; defaults to the declaring resource type
    pub owner: Option<String>,
    /// regex over the CloudFormation type of the entry being merged
    pub target: String,
    /// entries merged through this rule do not pass ownership on, and the rule applies
    /// at most once per owner
    #[serde(default)]
    pub stop_chaining: bool,
}

/// A grouping rule with compiled patterns
#[derive(Debug, Clone)]
pub struct CompiledGroupingRule {
    pub index: usize,
    pub owner: regex::Regex,
    pub target: regex::Regex,
    pub stop_chaining: bool,
}

impl CompiledGroupingRule {
    pub fn permits(&self, owner_type: &str, target_type: &str) -> bool {
        self.owner.is_match(owner_type) && self.target.is_match(target_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct SchemaDocument {
    resource_types: IndexMap<String, ResourceTypeSchema>,
    #[serde(default)]
    grouping_rules: Vec<GroupingRule>,
    region: Option<String>,
}

/// All resource-type schemas of one process
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    resource_types: IndexMap<String, ResourceTypeSchema>,
    grouping_rules: Vec<CompiledGroupingRule>,
    region: String,
}

impl SchemaRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaError> {
        Self::from_document(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        Self::from_document(serde_json::from_str(text)?)
    }

    fn from_document(document: SchemaDocument) -> Result<Self, SchemaError> {
        let SchemaDocument {
            mut resource_types,
            grouping_rules,
            region,
        } = document;

        let mut compiled = vec![];
        for rule in &grouping_rules {
            compiled.push(compile_rule(compiled.len(), rule, None)?);
        }

        for (type_name, schema) in resource_types.iter_mut() {
            for rule in &schema.grouping_rules {
                compiled.push(compile_rule(compiled.len(), rule, Some(type_name))?);
            }

            let facet_settings = schema
                .facet_settings
                .values_mut()
                .flat_map(|facet| facet.settings.iter_mut());
            let integration_settings = schema
                .integration_types
                .values_mut()
                .flat_map(|integration| integration.settings.iter_mut());
            for (name, setting) in schema
                .settings
                .iter_mut()
                .chain(facet_settings)
                .chain(integration_settings)
            {
                if let Some(chain) = &setting.transformations {
                    setting.transforms =
                        Transform::parse_chain(chain).map_err(|source| SchemaError::Setting {
                            resource_type: type_name.clone(),
                            setting: name.clone(),
                            source,
                        })?;
                }
            }

            if let Some(facet_type) = schema
                .settings
                .values()
                .filter_map(|setting| setting.facet_type.as_ref())
                .find(|facet_type| !schema.facet_settings.contains_key(*facet_type))
            {
                return Err(SchemaError::UndeclaredFacetType {
                    resource_type: type_name.clone(),
                    facet_type: facet_type.clone(),
                });
            }
        }

        tracing::debug!(
            resource_types = resource_types.len(),
            grouping_rules = compiled.len(),
            "schema registry loaded"
        );

        Ok(Self {
            resource_types,
            grouping_rules: compiled,
            region: region.unwrap_or_else(|| "us-east-1".to_string()),
        })
    }

    pub fn get(&self, resource_type: &str) -> Option<&ResourceTypeSchema> {
        self.resource_types.get(resource_type)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = (&String, &ResourceTypeSchema)> {
        self.resource_types.iter()
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The first grouping rule allowing `owner_type` to absorb an entry of `target_type`
    pub fn grouping_rule(
        &self,
        owner_type: &str,
        target_type: &str,
    ) -> Option<&CompiledGroupingRule> {
        self.grouping_rules
            .iter()
            .find(|rule| rule.permits(owner_type, target_type))
    }

    /// Every grouping rule, registry-wide ones first
    pub fn rules(&self) -> &[CompiledGroupingRule] {
        &self.grouping_rules
    }

    /// The schema declaring integration type `name` for `source_type`
    pub fn integration_type(
        &self,
        source_type: &str,
        name: &str,
    ) -> Option<&IntegrationTypeSchema> {
        self.get(source_type)?.integration_types.get(name)
    }

    /// Resource types whose instances can be inferred from permissions alone
    pub fn virtual_reference_types(
        &self,
    ) -> impl Iterator<Item = (&String, &VirtualReferenceSchema)> {
        self.resource_types
            .iter()
            .filter_map(|(name, schema)| Some((name, schema.virtual_reference.as_ref()?)))
    }
}

fn compile_rule(
    index: usize,
    rule: &GroupingRule,
    declaring_type: Option<&str>,
) -> Result<CompiledGroupingRule, SchemaError> {
    let owner = match (&rule.owner, declaring_type) {
        (Some(owner), _) => owner.clone(),
        (None, Some(declaring_type)) => format!("^{}$", regex::escape(declaring_type)),
        (None, None) => return Err(SchemaError::RuleWithoutOwner(rule.target.clone())),
    };

    let compile = |pattern: &str| {
        regex::Regex::new(pattern).map_err(|source| SchemaError::Regex {
            pattern: pattern.to_string(),
            source,
        })
    };

    Ok(CompiledGroupingRule {
        index,
        owner: compile(&owner)?,
        target: compile(&rule.target)?,
        stop_chaining: rule.stop_chaining,
    })
}

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("Unable to parse yaml schema")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Unable to parse json schema")]
    Json(#[from] serde_json::Error),
    #[error("invalid grouping rule pattern {pattern:?}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("registry-wide grouping rule for {0:?} must name an owner")]
    RuleWithoutOwner(String),
    #[error("invalid transformations of {resource_type}.{setting}")]
    Setting {
        resource_type: String,
        setting: String,
        #[source]
        source: PlaceholderError,
    },
    #[error("{resource_type} uses undeclared facet type {facet_type}")]
    UndeclaredFacetType {
        resource_type: String,
        facet_type: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = r#"
ResourceTypes:
  Function:
    Locator:
      Plain: "$.Resources[?(@.Type == 'AWS::Serverless::Function')]"
      Serverless: "$.functions.*"
    Settings:
      MemorySize:
        Path: "@.Properties.MemorySize"
        Transformations: "Integer"
        Default: 128
    GroupingRules:
      - Target: "^AWS::IAM::Role$"
        StopChaining: true
    Reactions:
      - Action: UpdateResourceSetting
        Conditions:
          Setting: MemorySize
        Operations:
          - Op: Upsert
            Path: "$.Resources['%{resourceId}'].Properties.MemorySize"
            Value: "%{value}"
GroupingRules:
  - Owner: ".*"
    Target: "^Condition$"
"#;

    #[test]
    fn loads_and_compiles() {
        let registry = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let function = registry.get("Function").unwrap();

        assert_eq!(
            function.locator.as_ref().unwrap().steps(Format::Serverless),
            Some(vec!["$.functions.*".to_string()])
        );
        assert_eq!(
            function.settings["MemorySize"].transforms,
            vec![Transform::Integer]
        );
        assert_eq!(registry.region(), "us-east-1");

        let rule = registry.grouping_rule("Function", "AWS::IAM::Role").unwrap();
        assert!(rule.stop_chaining);
        assert!(registry.grouping_rule("Table", "AWS::IAM::Role").is_none());
        assert!(registry.grouping_rule("Table", "Condition").is_some());
    }

    #[test]
    fn reactions_match_conditions() {
        let registry = SchemaRegistry::from_yaml_str(SCHEMA).unwrap();
        let function = registry.get("Function").unwrap();

        let mut trigger = Trigger::new(Action::UpdateResourceSetting, Format::Plain);
        trigger.setting = Some("MemorySize");
        assert_eq!(function.reactions_for(&trigger).count(), 1);

        trigger.setting = Some("Timeout");
        assert_eq!(function.reactions_for(&trigger).count(), 0);
    }

    #[test]
    fn rejects_bad_transformations() {
        let schema = SCHEMA.replace("\"Integer\"", "\"Shout\"");
        assert!(matches!(
            SchemaRegistry::from_yaml_str(&schema),
            Err(SchemaError::Setting { .. })
        ));
    }
}
