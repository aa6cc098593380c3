//! classification of reference expressions ([Id])
//!
//! Every reference graph edge, ownership decision, permission target and reference target
//! goes through [Classifier::classify]. Classification is a pure function of the
//! expression, the template and the known resources.
use crate::template::{EntryId, Section, Template};
use crate::util::{self, as_intrinsic, get_att_target, sub_prefix, sub_tokens};
use serde_json::Value as Json;

/// Suffixes of condition names guarding a "use an existing resource" parameter
///
/// `Fn::If: [TableUseExisting, <existing>, <new>]` classifies as its `<new>` branch.
pub const USE_EXISTING_SUFFIXES: &[&str] = &["UseExisting", "UseExistingResource"];

/// The resolved meaning of one reference expression
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "Kind")]
pub enum Id {
    /// points at a template entry (or the resource owning it)
    Logical {
        #[serde(rename = "ResourceId")]
        resource_id: String,
    },
    Parameter {
        #[serde(rename = "ParameterId")]
        parameter_id: String,
    },
    /// a literal name/ARN matching a known resource's physical name
    Physical {
        #[serde(rename = "ResourceId")]
        resource_id: String,
    },
    /// a reference to an id with no backing template entry
    Virtual {
        #[serde(rename = "ResourceId")]
        resource_id: String,
        #[serde(rename = "IsVirtualReferenceResource")]
        is_virtual_reference_resource: bool,
    },
    Unresolved,
}

impl Id {
    pub fn logical(resource_id: impl Into<String>) -> Self {
        Id::Logical {
            resource_id: resource_id.into(),
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Id::Logical { resource_id }
            | Id::Physical { resource_id }
            | Id::Virtual { resource_id, .. } => Some(resource_id),
            Id::Parameter { .. } | Id::Unresolved => None,
        }
    }

    pub fn parameter_id(&self) -> Option<&str> {
        match self {
            Id::Parameter { parameter_id } => Some(parameter_id),
            _ => None,
        }
    }

    /// Whether the target lives in this template
    pub fn is_local(&self) -> bool {
        matches!(self, Id::Logical { .. } | Id::Parameter { .. })
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Id::Unresolved)
    }

    pub fn is_virtual_reference_resource(&self) -> bool {
        matches!(
            self,
            Id::Virtual {
                is_virtual_reference_resource: true,
                ..
            }
        )
    }
}

/// A resource as seen by the classifier
#[derive(Debug, Clone, derive_new::new)]
pub struct KnownResource {
    pub id: String,
    pub physical_name: Option<String>,
    pub is_virtual_reference_resource: bool,
}

/// Maps a template entry to the id of the resource owning it
pub trait OwnerLookup {
    fn owning_resource(&self, entry: &EntryId) -> Option<&str>;
}

/// Classifies reference expressions against a template and the known resources
pub struct Classifier<'a> {
    template: &'a Template,
    resources: Vec<KnownResource>,
    owners: Option<&'a dyn OwnerLookup>,
}

impl<'a> Classifier<'a> {
    pub fn new(template: &'a Template) -> Self {
        Self {
            template,
            resources: vec![],
            owners: None,
        }
    }

    pub fn with_resources(mut self, resources: impl IntoIterator<Item = KnownResource>) -> Self {
        self.resources = resources.into_iter().collect();
        self
    }

    /// Re-point attribute references to the resource owning the referenced entry
    ///
    /// `Fn::GetAtt FnRole.Arn` then means `Fn` when `Fn` owns `FnRole`. A plain `Ref`
    /// keeps naming the entry itself.
    pub fn resolving_owner(mut self, owners: &'a dyn OwnerLookup) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn template(&self) -> &'a Template {
        self.template
    }

    pub fn classify(&self, expression: &Json) -> Id {
        let Some((function, argument)) = as_intrinsic(expression) else {
            return match expression {
                Json::String(s) => self.physical(s),
                _ => Id::Unresolved,
            };
        };

        match function {
            "Ref" => match argument {
                Json::String(name) => self.by_name(name, Lookup::Ref),
                _ => Id::Unresolved,
            },
            "Fn::GetAtt" => match get_att_target(argument) {
                Some((name, _)) => self.by_name(name, Lookup::Attribute),
                None => Id::Unresolved,
            },
            "Fn::Sub" => self.classify_sub(argument),
            "Fn::Join" => self.classify_join(argument),
            "Fn::If" => self.classify_if(argument),
            "Fn::Select" => match argument.as_array().map(Vec::as_slice) {
                Some([index, Json::Array(list)]) => index
                    .as_u64()
                    .or_else(|| index.as_str().and_then(|s| s.parse().ok()))
                    .and_then(|index| list.get(index as usize))
                    .map_or(Id::Unresolved, |element| self.classify(element)),
                Some([_, list]) => self.classify(list),
                _ => Id::Unresolved,
            },
            "Fn::Split" => match argument.as_array().map(Vec::as_slice) {
                Some([_, source]) => self.classify(source),
                _ => Id::Unresolved,
            },
            "Fn::Cidr" => match argument.as_array().and_then(|list| list.first()) {
                Some(block) => self.classify(block),
                None => Id::Unresolved,
            },
            _ => Id::Unresolved,
        }
    }

    /// `Ref`/`Fn::GetAtt` target resolution
    fn by_name(&self, name: &str, lookup: Lookup) -> Id {
        if let Some(entry) = self.template.resolve_logical(name) {
            let owner = match lookup {
                Lookup::Ref => None,
                Lookup::Attribute => self
                    .owners
                    .and_then(|owners| owners.owning_resource(&entry)),
            };
            return Id::logical(owner.unwrap_or(entry.name.as_str()));
        }

        if lookup == Lookup::Ref && self.template.is_parameter(name) {
            return Id::Parameter {
                parameter_id: name.to_string(),
            };
        }

        // resources without a template entry of their own (serverless functions by name,
        // synthetic singletons) are still logical when we know them
        if let Some(resource) = self.resources.iter().find(|r| r.id == name) {
            if !resource.is_virtual_reference_resource {
                return Id::logical(name);
            }
        }

        Id::Virtual {
            resource_id: name.to_string(),
            is_virtual_reference_resource: self
                .resources
                .iter()
                .any(|r| r.id == name && r.is_virtual_reference_resource),
        }
    }

    /// Substring match against known physical names
    fn physical(&self, text: &str) -> Id {
        self.resources
            .iter()
            .filter_map(|resource| {
                let name = resource.physical_name.as_deref()?;
                (!name.is_empty() && text.contains(name)).then_some((resource, name.len()))
            })
            // the longest name wins so `orders` does not shadow `orders-archive`
            .max_by_key(|(_, length)| *length)
            .map_or(Id::Unresolved, |(resource, _)| Id::Physical {
                resource_id: resource.id.clone(),
            })
    }

    fn classify_sub(&self, argument: &Json) -> Id {
        let (template, variables) = match argument {
            Json::String(template) => (template.as_str(), None),
            Json::Array(parts) => match parts.as_slice() {
                [Json::String(template)] => (template.as_str(), None),
                [Json::String(template), Json::Object(variables)] => {
                    (template.as_str(), Some(variables))
                }
                _ => return Id::Unresolved,
            },
            _ => return Id::Unresolved,
        };

        for (name, attribute) in sub_tokens(template) {
            if let Some(value) = variables.and_then(|variables| variables.get(name)) {
                let id = self.classify(value);
                if matches!(id, Id::Logical { .. }) {
                    return id;
                }
                continue;
            }

            if name.starts_with("AWS::") {
                continue;
            }

            if self.template.resolve_logical(name).is_some() {
                let lookup = match attribute {
                    Some(_) => Lookup::Attribute,
                    None => Lookup::Ref,
                };
                return self.by_name(name, lookup);
            }
        }

        self.physical(sub_prefix(template))
    }

    fn classify_join(&self, argument: &Json) -> Id {
        let Some([Json::String(delimiter), Json::Array(parts)]) =
            argument.as_array().map(Vec::as_slice)
        else {
            return Id::Unresolved;
        };

        for part in parts {
            let id = self.classify(part);
            if matches!(id, Id::Logical { .. }) {
                return id;
            }
        }

        let constant: Vec<&str> = parts.iter().map_while(Json::as_str).collect();
        self.physical(&constant.join(delimiter))
    }

    fn classify_if(&self, argument: &Json) -> Id {
        let Some([Json::String(condition), _existing, new]) =
            argument.as_array().map(Vec::as_slice)
        else {
            return Id::Unresolved;
        };

        if USE_EXISTING_SUFFIXES
            .iter()
            .any(|suffix| condition.ends_with(suffix))
        {
            return self.classify(new);
        }

        Id::Unresolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Ref,
    Attribute,
}

/// Fields too weak to imply structural ownership
const WEAK_FIELDS: &[&str] = &["DependsOn", "Environment", "environment"];

/// A reference found while scanning a fragment
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub entry: EntryId,
    /// mentioned through a field that does not imply ownership
    pub weak: bool,
}

/// Every template entry mentioned by `value`
///
/// Collects `Ref`/`Fn::GetAtt`/`Fn::Sub` targets, condition names (`Condition` keys,
/// `Fn::If`), and physical-name matches of plain strings when resources are known.
pub fn mentions(classifier: &Classifier<'_>, value: &Json) -> Vec<Mention> {
    let mut found = vec![];
    scan(classifier, value, false, &mut found);

    let mut unique: Vec<Mention> = Vec::with_capacity(found.len());
    for mention in found {
        match unique.iter_mut().find(|m| m.entry == mention.entry) {
            // a strong mention wins over a weak one
            Some(existing) => existing.weak &= mention.weak,
            None => unique.push(mention),
        }
    }
    unique
}

fn scan(classifier: &Classifier<'_>, value: &Json, weak: bool, found: &mut Vec<Mention>) {
    let template = classifier.template();

    if let Some((function, argument)) = as_intrinsic(value) {
        match function {
            "Ref" | "Fn::GetAtt" => {
                if let Some(entry) = util::logical_id_of(value)
                    .and_then(|name| logical_or_parameter(template, name))
                {
                    found.push(Mention { entry, weak });
                }
                return;
            }
            "Condition" => {
                if let Json::String(name) = argument {
                    push_condition(template, name, weak, found);
                }
                return;
            }
            "Fn::Sub" => {
                let text = match argument {
                    Json::String(text) => Some(text.as_str()),
                    Json::Array(parts) => parts.first().and_then(Json::as_str),
                    _ => None,
                };
                let variables = argument
                    .as_array()
                    .and_then(|parts| parts.get(1))
                    .and_then(Json::as_object);
                for (name, _) in text.map(sub_tokens).unwrap_or_default() {
                    if variables.is_some_and(|variables| variables.contains_key(name)) {
                        continue;
                    }
                    if let Some(entry) = logical_or_parameter(template, name) {
                        found.push(Mention { entry, weak });
                    }
                }
                if let Some(variables) = variables {
                    for value in variables.values() {
                        scan(classifier, value, weak, found);
                    }
                }
                return;
            }
            "Fn::If" => {
                if let Some(Json::String(name)) =
                    argument.as_array().and_then(|parts| parts.first())
                {
                    push_condition(template, name, weak, found);
                }
                if let Some(parts) = argument.as_array() {
                    for part in parts.iter().skip(1) {
                        scan(classifier, part, weak, found);
                    }
                }
                return;
            }
            _ => {}
        }
    }

    match value {
        Json::Object(object) => {
            for (key, value) in object {
                if key == "Condition" {
                    if let Json::String(name) = value {
                        push_condition(template, name, weak, found);
                        continue;
                    }
                }
                let weak = weak || WEAK_FIELDS.contains(&key.as_str());
                scan(classifier, value, weak, found);
            }
        }
        Json::Array(array) => {
            for element in array {
                scan(classifier, element, weak, found);
            }
        }
        Json::String(text) => {
            if let Id::Physical { resource_id } = classifier.physical(text) {
                if let Some(entry) = template.resolve_logical(&resource_id) {
                    found.push(Mention { entry, weak });
                }
            }
        }
        Json::Null | Json::Bool(_) | Json::Number(_) => {}
    }
}

fn logical_or_parameter(template: &Template, name: &str) -> Option<EntryId> {
    template.resolve_logical(name).or_else(|| {
        let parameter = EntryId::new(Section::Parameters, name);
        template.contains(&parameter).then_some(parameter)
    })
}

fn push_condition(template: &Template, name: &str, weak: bool, found: &mut Vec<Mention>) {
    let entry = EntryId::new(Section::Conditions, name);
    if template.contains(&entry) {
        found.push(Mention { entry, weak });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stack() -> Template {
        template! {r#"
        Parameters:
          Stage: {Type: String}
        Conditions:
          TableUseExisting: !Equals [!Ref Stage, prod]
        Resources:
          Tbl:
            Type: AWS::DynamoDB::Table
          Fn:
            Type: AWS::Lambda::Function
            Condition: TableUseExisting
            Properties:
              Environment:
                Variables:
                  TABLE: !Ref Tbl
              Role: !GetAtt FnRole.Arn
          FnRole:
            Type: AWS::IAM::Role
        "#}
    }

    #[test]
    fn direct_references() {
        let template = stack();
        let classifier = Classifier::new(&template);
        assert_eq!(classifier.classify(&json!({"Ref": "Tbl"})), Id::logical("Tbl"));
        assert_eq!(
            classifier.classify(&json!({"Ref": "Stage"})),
            Id::Parameter {
                parameter_id: "Stage".into()
            }
        );
        assert_eq!(
            classifier.classify(&json!({"Ref": "AWS::Region"})),
            Id::Parameter {
                parameter_id: "AWS::Region".into()
            }
        );
        assert_eq!(
            classifier.classify(&json!({"Ref": "Missing"})),
            Id::Virtual {
                resource_id: "Missing".into(),
                is_virtual_reference_resource: false
            }
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let template = stack();
        let classifier = Classifier::new(&template);
        let expression = json!({"Fn::GetAtt": ["Tbl", "Arn"]});
        let first = classifier.classify(&expression);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&expression), first);
        }
    }

    struct Owners;

    impl OwnerLookup for Owners {
        fn owning_resource(&self, entry: &EntryId) -> Option<&str> {
            (entry.name == "FnRole").then_some("Fn")
        }
    }

    #[test]
    fn attribute_reference_resolves_owner() {
        let template = stack();
        let expression = json!({"Fn::GetAtt": ["FnRole", "Arn"]});
        assert_eq!(
            Classifier::new(&template).classify(&expression),
            Id::logical("FnRole")
        );
        assert_eq!(
            Classifier::new(&template)
                .resolving_owner(&Owners)
                .classify(&expression),
            Id::logical("Fn")
        );
    }

    #[test]
    fn plain_refs_keep_naming_the_entry() {
        let template = stack();
        let classifier = Classifier::new(&template).resolving_owner(&Owners);
        assert_eq!(
            classifier.classify(&json!({"Ref": "FnRole"})),
            Id::logical("FnRole")
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::Sub": "${FnRole}"})),
            Id::logical("FnRole")
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::Sub": "${FnRole.Arn}/*"})),
            Id::logical("Fn")
        );
    }

    #[test]
    fn physical_names_and_interpolation() {
        let template = stack();
        let classifier = Classifier::new(&template).with_resources([KnownResource::new(
            "Orders".into(),
            Some("orders-table".into()),
            false,
        )]);

        assert_eq!(
            classifier.classify(&json!(
                "arn:aws:dynamodb:us-east-1:123456789012:table/orders-table"
            )),
            Id::Physical {
                resource_id: "Orders".into()
            }
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::Sub": "arn:${AWS::Partition}:x:::${Tbl.Arn}"})),
            Id::logical("Tbl")
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::Sub": "orders-table-${AWS::Region}"})),
            Id::Physical {
                resource_id: "Orders".into()
            }
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::Join": ["", ["orders", "-table"]]})),
            Id::Physical {
                resource_id: "Orders".into()
            }
        );
        assert_eq!(classifier.classify(&json!("unrelated")), Id::Unresolved);
    }

    #[test]
    fn use_existing_conditionals_take_the_new_branch() {
        let template = stack();
        let classifier = Classifier::new(&template);
        assert_eq!(
            classifier.classify(&json!({
                "Fn::If": ["TableUseExisting", {"Ref": "Stage"}, {"Ref": "Tbl"}]
            })),
            Id::logical("Tbl")
        );
        assert_eq!(
            classifier.classify(&json!({"Fn::If": ["IsProd", {"Ref": "Tbl"}, {"Ref": "Tbl"}]})),
            Id::Unresolved
        );
    }

    #[test]
    fn mentions_mark_weak_fields() {
        let template = stack();
        let classifier = Classifier::new(&template);
        let function = template.entry(&EntryId::resource("Fn")).unwrap();
        assert_eq!(
            mentions(&classifier, function),
            vec![
                Mention {
                    entry: EntryId::new(Section::Conditions, "TableUseExisting"),
                    weak: false
                },
                Mention {
                    entry: EntryId::resource("Tbl"),
                    weak: true
                },
                Mention {
                    entry: EntryId::resource("FnRole"),
                    weak: false
                },
            ]
        );
    }
}
