//! normalized resource graph ([StackGraph])
//!
//! Every entity that manages template entries ([Resource], [Facet], [Integration]) keeps
//! its owned-entry set in `template_partial`. The ownership map ([StackGraph::owners]) is
//! derived from those sets, so the two can not drift apart.
mod builder;

pub(crate) use builder::{default_value, depends_on_met, insert_source, insert_target, Builder};

use crate::id::{Id, KnownResource, OwnerLookup};
use crate::schema::CUSTOM_TYPE;
use crate::template::EntryId;
use crate::value::{Settings, Value};
use indexmap::{IndexMap, IndexSet};
use serde::{Serialize, Serializer};
use serde_json::Value as Json;

/// Template entries owned by one entity
pub type TemplatePartial = IndexSet<EntryId>;

fn serialize_partial<S: Serializer>(
    partial: &TemplatePartial,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(partial.iter().map(ToString::to_string))
}

/// One node of the graph
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    pub id: String,
    pub settings: Settings,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub facets: IndexMap<String, Vec<Facet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_name: Option<String>,
    #[serde(serialize_with = "serialize_partial")]
    pub template_partial: TemplatePartial,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_virtual_reference_resource: bool,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            settings: Default::default(),
            facets: Default::default(),
            physical_name: None,
            template_partial: Default::default(),
            is_virtual_reference_resource: false,
        }
    }

    /// A standalone resource wrapping one template entry without a dedicated schema
    pub fn custom(entry: EntryId, cfn_type: &str) -> Self {
        let mut resource = Self::new(CUSTOM_TYPE, entry.name.clone());
        resource
            .settings
            .insert("Type".to_string(), Value::from(cfn_type));
        resource.template_partial.insert(entry);
        resource
    }

    pub fn is_custom(&self) -> bool {
        self.resource_type == CUSTOM_TYPE
    }

    /// The type grouping rules see: the schema type, or the CloudFormation type of a
    /// custom resource
    pub fn grouping_type(&self) -> &str {
        match self.is_custom() {
            true => self
                .settings
                .get("Type")
                .and_then(Value::as_str)
                .unwrap_or(CUSTOM_TYPE),
            false => &self.resource_type,
        }
    }

    /// The entry the resource was located at, if it has one
    pub fn primary_entry(&self) -> Option<&EntryId> {
        self.template_partial.first()
    }

    pub fn facet(&self, facet_type: &str, facet_id: &str) -> Option<&Facet> {
        self.facets.get(facet_type)?.iter().find(|f| f.id == facet_id)
    }

    pub fn facet_mut(&mut self, facet_type: &str, facet_id: &str) -> Option<&mut Facet> {
        self.facets
            .get_mut(facet_type)?
            .iter_mut()
            .find(|f| f.id == facet_id)
    }

    pub fn facets(&self) -> impl Iterator<Item = &Facet> {
        self.facets.values().flatten()
    }

    /// Fold a second locator hit with the same id into this resource
    ///
    /// List settings and facets are concatenated; other settings keep their first value.
    pub fn coalesce(&mut self, other: Resource) {
        for (name, value) in other.settings {
            match self.settings.get_mut(&name) {
                Some(existing) if matches!(existing, Value::List(_)) => {
                    let current = std::mem::replace(existing, Value::List(vec![]));
                    *existing = current.concat(value);
                }
                Some(_) => {}
                None => {
                    self.settings.insert(name, value);
                }
            }
        }

        for (facet_type, facets) in other.facets {
            let known = self.facets.entry(facet_type).or_default();
            for facet in facets {
                if !known.iter().any(|f| f.id == facet.id) {
                    known.push(facet);
                }
            }
        }

        self.template_partial.extend(other.template_partial);
        if self.physical_name.is_none() {
            self.physical_name = other.physical_name;
        }
    }

    pub(crate) fn known(&self) -> KnownResource {
        // virtual reference resources show up in ARNs under their id
        let physical_name = match (&self.physical_name, self.is_virtual_reference_resource) {
            (Some(name), _) => Some(name.clone()),
            (None, true) => Some(self.id.clone()),
            (None, false) => None,
        };
        KnownResource::new(
            self.id.clone(),
            physical_name,
            self.is_virtual_reference_resource,
        )
    }
}

/// A repeatable sub-element of a [Resource]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Facet {
    #[serde(rename = "Type")]
    pub facet_type: String,
    pub id: String,
    pub settings: Settings,
    #[serde(serialize_with = "serialize_partial")]
    pub template_partial: TemplatePartial,
}

impl Facet {
    pub fn new(facet_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            facet_type: facet_type.into(),
            id: id.into(),
            settings: Default::default(),
            template_partial: Default::default(),
        }
    }
}

/// A directed wiring between two resources
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Integration {
    #[serde(rename = "Type")]
    pub integration_type: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet_id: Option<String>,
    pub settings: Settings,
    #[serde(serialize_with = "serialize_partial")]
    pub template_partial: TemplatePartial,
    /// where mutations of this integration patch the template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_target: Option<crate::template::Location>,
}

impl Integration {
    pub fn new(
        integration_type: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            integration_type: integration_type.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            facet_type: None,
            facet_id: None,
            settings: Default::default(),
            template_partial: Default::default(),
            virtual_target: None,
        }
    }

    pub fn owner(&self) -> Owner {
        Owner::Integration {
            integration_type: self.integration_type.clone(),
            source_id: self.source_id.clone(),
            target_id: self.target_id.clone(),
        }
    }

    pub fn is(&self, integration_type: &str, source_id: &str, target_id: &str) -> bool {
        self.integration_type == integration_type
            && self.source_id == source_id
            && self.target_id == target_id
    }

    pub fn touches(&self, resource_id: &str) -> bool {
        self.source_id == resource_id || self.target_id == resource_id
    }
}

/// What kind of IAM grant a [Permission] is
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Kind")]
pub enum PermissionKind {
    /// managed policy name or ARN
    Managed {
        #[serde(rename = "Name")]
        name: Json,
    },
    /// SAM policy template (`DynamoDBReadPolicy: {TableName: ...}`)
    Templated {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Parameters")]
        parameters: Json,
    },
    Statement {
        #[serde(rename = "Effect")]
        effect: String,
        #[serde(rename = "Actions")]
        actions: Vec<String>,
        #[serde(rename = "Resources")]
        resources: Vec<Json>,
    },
}

impl PermissionKind {
    pub fn actions(&self) -> &[String] {
        match self {
            PermissionKind::Statement { actions, .. } => actions,
            _ => &[],
        }
    }
}

/// One IAM grant attached to a compute resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Permission {
    pub resource_id: String,
    #[serde(flatten)]
    pub kind: PermissionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<Id>,
}

impl Permission {
    pub fn target_resource(&self) -> Option<&str> {
        self.target.as_ref()?.resource_id()
    }
}

/// An environment-style link from a compute resource to a target
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reference {
    pub resource_id: String,
    /// environment variable name; the target id for virtual reference resources
    pub variable: String,
    pub target: Id,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_virtual_reference_resource: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualNetworkPlacement {
    pub resource_id: String,
    pub virtual_network_id: Id,
    pub subnet_ids: Vec<Id>,
    pub security_group_ids: Vec<Id>,
}

impl VirtualNetworkPlacement {
    pub fn mentions(&self, resource_id: &str) -> bool {
        std::iter::once(&self.virtual_network_id)
            .chain(&self.subnet_ids)
            .chain(&self.security_group_ids)
            .any(|id| id.resource_id() == Some(resource_id))
    }
}

/// A declared template parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Parameter {
    pub id: String,
    #[serde(rename = "Type", skip_serializing_if = "Option::is_none")]
    pub parameter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The entity a template entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "Kind", rename_all_fields = "PascalCase")]
pub enum Owner {
    Resource {
        resource_id: String,
    },
    Facet {
        resource_id: String,
        facet_type: String,
        facet_id: String,
    },
    Integration {
        integration_type: String,
        source_id: String,
        target_id: String,
    },
}

impl Owner {
    pub fn resource(resource_id: impl Into<String>) -> Self {
        Owner::Resource {
            resource_id: resource_id.into(),
        }
    }

    pub fn facet(resource_id: &str, facet: &Facet) -> Self {
        Owner::Facet {
            resource_id: resource_id.to_string(),
            facet_type: facet.facet_type.clone(),
            facet_id: facet.id.clone(),
        }
    }

    /// The resource an `Fn::GetAtt` to an owned entry is re-pointed at
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Owner::Resource { resource_id } | Owner::Facet { resource_id, .. } => Some(resource_id),
            Owner::Integration { .. } => None,
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::Resource { resource_id } => write!(f, "{resource_id}"),
            Owner::Facet {
                resource_id,
                facet_type,
                facet_id,
            } => write!(f, "{resource_id}/{facet_type}/{facet_id}"),
            Owner::Integration {
                integration_type,
                source_id,
                target_id,
            } => write!(f, "{integration_type}({source_id} -> {target_id})"),
        }
    }
}

/// Ownership map: template entry → owner
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Owners(pub IndexMap<EntryId, Owner>);

impl Owners {
    pub fn get(&self, entry: &EntryId) -> Option<&Owner> {
        self.0.get(entry)
    }
}

impl OwnerLookup for Owners {
    fn owning_resource(&self, entry: &EntryId) -> Option<&str> {
        self.0.get(entry)?.resource_id()
    }
}

impl Serialize for Owners {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(entry, owner)| (entry.to_string(), owner)))
    }
}

/// Result of parsing a template
///
/// Two graphs are equal when they hold the same resources, in any order, and equal lists
/// of everything else.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackGraph {
    pub resources: Vec<Resource>,
    pub integrations: Vec<Integration>,
    pub references: Vec<Reference>,
    pub permissions: Vec<Permission>,
    pub virtual_network_placements: Vec<VirtualNetworkPlacement>,
    pub parameters: Vec<Parameter>,
}

impl PartialEq for StackGraph {
    fn eq(&self, other: &Self) -> bool {
        fn by_id(graph: &StackGraph) -> Vec<&Resource> {
            let mut resources: Vec<&Resource> = graph.resources.iter().collect();
            resources.sort_by(|a, b| a.id.cmp(&b.id));
            resources
        }

        by_id(self) == by_id(other)
            && self.integrations == other.integrations
            && self.references == other.references
            && self.permissions == other.permissions
            && self.virtual_network_placements == other.virtual_network_placements
            && self.parameters == other.parameters
    }
}

impl StackGraph {
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn resource_mut(&mut self, id: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.id == id)
    }

    pub fn integration(
        &self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
    ) -> Option<&Integration> {
        self.integrations
            .iter()
            .find(|i| i.is(integration_type, source_id, target_id))
    }

    pub fn integration_mut(
        &mut self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
    ) -> Option<&mut Integration> {
        self.integrations
            .iter_mut()
            .find(|i| i.is(integration_type, source_id, target_id))
    }

    pub fn permissions_of<'s>(
        &'s self,
        resource_id: &'s str,
    ) -> impl Iterator<Item = &'s Permission> {
        self.permissions
            .iter()
            .filter(move |p| p.resource_id == resource_id)
    }

    pub fn references_of<'s>(
        &'s self,
        resource_id: &'s str,
    ) -> impl Iterator<Item = &'s Reference> {
        self.references
            .iter()
            .filter(move |r| r.resource_id == resource_id)
    }

    pub fn placement(&self, resource_id: &str) -> Option<&VirtualNetworkPlacement> {
        self.virtual_network_placements
            .iter()
            .find(|p| p.resource_id == resource_id)
    }

    /// Ownership map built from every entity's owned-entry set
    pub fn owners(&self) -> Owners {
        let mut owners = IndexMap::new();
        for resource in &self.resources {
            for entry in &resource.template_partial {
                owners.insert(entry.clone(), Owner::resource(&resource.id));
            }
            for facet in resource.facets() {
                for entry in &facet.template_partial {
                    owners.insert(entry.clone(), Owner::facet(&resource.id, facet));
                }
            }
        }
        for integration in &self.integrations {
            for entry in &integration.template_partial {
                owners.insert(entry.clone(), integration.owner());
            }
        }
        Owners(owners)
    }

    /// Known resources for [crate::id::Classifier::with_resources]
    pub fn known_resources(&self) -> Vec<KnownResource> {
        self.resources.iter().map(Resource::known).collect()
    }

    /// The owned-entry set of `owner`
    pub fn partial_mut(&mut self, owner: &Owner) -> Option<&mut TemplatePartial> {
        match owner {
            Owner::Resource { resource_id } => {
                Some(&mut self.resource_mut(resource_id)?.template_partial)
            }
            Owner::Facet {
                resource_id,
                facet_type,
                facet_id,
            } => Some(
                &mut self
                    .resource_mut(resource_id)?
                    .facet_mut(facet_type, facet_id)?
                    .template_partial,
            ),
            Owner::Integration {
                integration_type,
                source_id,
                target_id,
            } => Some(
                &mut self
                    .integration_mut(integration_type, source_id, target_id)?
                    .template_partial,
            ),
        }
    }

    /// Drop `entry` from whichever set owns it
    pub fn release(&mut self, entry: &EntryId) {
        for resource in &mut self.resources {
            resource.template_partial.shift_remove(entry);
            for facet in resource.facets.values_mut().flatten() {
                facet.template_partial.shift_remove(entry);
            }
        }
        for integration in &mut self.integrations {
            integration.template_partial.shift_remove(entry);
        }
    }

    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn coalesce_concatenates_lists_and_facets() {
        let mut api = Resource::new("Api", "ServerlessRestApi");
        api.settings
            .insert("Stages".into(), Value::from(vec!["dev"]));
        api.settings.insert("Name".into(), Value::from("first"));
        api.facets
            .insert("Route".into(), vec![Facet::new("Route", "GET /a")]);

        let mut second = Resource::new("Api", "ServerlessRestApi");
        second
            .settings
            .insert("Stages".into(), Value::from(vec!["dev", "prod"]));
        second.settings.insert("Name".into(), Value::from("second"));
        second
            .facets
            .insert("Route".into(), vec![Facet::new("Route", "GET /b")]);

        api.coalesce(second);
        assert_eq!(api.settings["Stages"], Value::from(vec!["dev", "prod"]));
        assert_eq!(api.settings["Name"], Value::from("first"));
        assert_eq!(
            api.facets()
                .map(|facet| facet.id.as_str())
                .collect::<Vec<_>>(),
            vec!["GET /a", "GET /b"]
        );
    }

    #[test]
    fn owners_follow_partials() {
        let mut graph = StackGraph::default();
        let mut function = Resource::new("Function", "Fn");
        function.template_partial.insert(EntryId::resource("Fn"));
        function.template_partial.insert(EntryId::resource("FnRole"));
        graph.resources.push(function);

        let mut integration = Integration::new("Queue", "Fn", "Jobs");
        integration
            .template_partial
            .insert(EntryId::resource("FnJobsMapping"));
        graph.integrations.push(integration);

        let owners = graph.owners();
        assert_eq!(
            owners.owning_resource(&EntryId::resource("FnRole")),
            Some("Fn")
        );
        assert_eq!(
            owners.get(&EntryId::resource("FnJobsMapping")),
            Some(&Owner::Integration {
                integration_type: "Queue".into(),
                source_id: "Fn".into(),
                target_id: "Jobs".into()
            })
        );
        assert_eq!(owners.owning_resource(&EntryId::resource("FnJobsMapping")), None);

        graph.release(&EntryId::resource("FnRole"));
        assert!(graph.owners().get(&EntryId::resource("FnRole")).is_none());
    }
}
