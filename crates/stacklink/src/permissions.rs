//! IAM permissions of compute resources
//!
//! Where grants live depends on the resource type and the dialect
//! ([crate::schema::PermissionStyle]):
//! - `Policies`: the SAM `Policies` property (managed policy names, policy templates,
//!   policy documents)
//! - `Role`: inline policies and managed policy ARNs of an IAM role entry
//! - `Statements`: a plain statement list, such as the Serverless provider-level
//!   `provider.iam.role.statements` shared by every function
//!
//! The template is the source of truth: after every write the permissions of the touched
//! resource are derived again.
use crate::error::{Error, Result};
use crate::id::{Classifier, Id};
use crate::model::{
    insert_target, Builder, Permission, PermissionKind, Reference, Resource, StackGraph,
};
use crate::placeholder::{self, Strictness};
use crate::schema::{PermissionLocation, PermissionStyle, SchemaRegistry};
use crate::template::{self, Location, Template};
use serde_json::{json, Value as Json};

/// What to grant
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "Kind", rename_all_fields = "PascalCase")]
pub enum PermissionRequest {
    /// a permission type declared by the target's resource type
    Typed {
        target_id: String,
        permission_type: String,
    },
    Managed {
        name: Json,
    },
    Statement {
        actions: Vec<String>,
        resources: Vec<Json>,
        #[serde(default)]
        target_id: Option<String>,
    },
}

/// Which permission to remove
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionSelector {
    /// position among the resource's permissions
    Index(usize),
    Matching(PermissionKind),
}

/// A permission and where it sits in the template
#[derive(Debug, Clone)]
struct Found {
    permission: Permission,
    location: Location,
    /// policy object removed together with its last statement
    policy: Option<Location>,
    /// property removed once empty
    container: Location,
}

fn permission_location<'s>(
    registry: &'s SchemaRegistry,
    template: &Template,
    resource: &Resource,
) -> Option<&'s PermissionLocation> {
    registry
        .get(&resource.resource_type)?
        .permissions
        .as_ref()?
        .get(template.format())
}

/// Derive permissions (and virtual reference resources) of every compute resource
pub(crate) fn derive_all(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
) -> Result<()> {
    let ids: Vec<String> = graph
        .resources
        .iter()
        .filter(|resource| permission_location(registry, template, resource).is_some())
        .map(|resource| resource.id.clone())
        .collect();
    for id in ids {
        refresh(registry, template, graph, &id)?;
    }
    Ok(())
}

/// Derive the permissions of one resource again
pub(crate) fn refresh(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
    resource_id: &str,
) -> Result<()> {
    let found = scan(registry, template, graph, resource_id)?;

    graph.permissions.retain(|p| p.resource_id != resource_id);
    graph
        .references
        .retain(|r| !(r.resource_id == resource_id && r.is_virtual_reference_resource));

    for Found { mut permission, .. } in found {
        if permission.target.is_none() {
            permission.target = promote_virtual(registry, graph, &permission.kind);
        }

        if let Some(target) = &permission.target {
            let virtual_target = target
                .resource_id()
                .and_then(|id| graph.resource(id))
                .is_some_and(|target| target.is_virtual_reference_resource);
            let known = graph
                .references
                .iter()
                .any(|r| r.resource_id == resource_id && &r.target == target);
            if virtual_target && !known {
                graph.references.push(Reference {
                    resource_id: resource_id.to_string(),
                    variable: target.resource_id().unwrap_or_default().to_string(),
                    target: target.clone(),
                    is_virtual_reference_resource: true,
                });
            }
        }

        graph.permissions.push(permission);
    }
    Ok(())
}

/// Map an un-targeted statement onto a virtual reference resource, creating it on first
/// sight
fn promote_virtual(
    registry: &SchemaRegistry,
    graph: &mut StackGraph,
    kind: &PermissionKind,
) -> Option<Id> {
    let actions = kind.actions();
    let (resource_type, schema) = registry
        .virtual_reference_types()
        .find(|(_, schema)| actions.iter().any(|action| schema.actions.contains(action)))?;

    if graph.resource(&schema.id).is_none() {
        tracing::debug!(id = %schema.id, %resource_type, "virtual reference resource");
        let mut resource = Resource::new(resource_type.as_str(), schema.id.as_str());
        resource.is_virtual_reference_resource = true;
        graph.resources.push(resource);
    }

    Some(Id::Virtual {
        resource_id: schema.id.clone(),
        is_virtual_reference_resource: true,
    })
}

/// Every permission of a resource, in template order
fn scan(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &StackGraph,
    resource_id: &str,
) -> Result<Vec<Found>> {
    let resource = graph
        .resource(resource_id)
        .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))?;
    let Some(location) = permission_location(registry, template, resource) else {
        return Ok(vec![]);
    };

    let owners = graph.owners();
    let classifier = Classifier::new(template)
        .with_resources(graph.known_resources())
        .resolving_owner(&owners);
    let builder = Builder::new(template, &classifier, registry.region());
    let context = builder.resource_context(resource);
    let fragment = builder.resource_fragment(resource);

    let mut scanner = Scanner {
        classifier: &classifier,
        resource_id,
        found: vec![],
    };
    for container in builder.select(&location.path, fragment.as_ref(), &context)? {
        let at = container.location.clone();
        match location.style {
            PermissionStyle::Policies => scanner.policies(container.value, &at),
            PermissionStyle::Role => {
                let policies = at.child("Policies");
                if let Some(Json::Array(items)) = container.value.get("Policies") {
                    for (index, policy) in items.iter().enumerate() {
                        let policy_at = policies.child(index);
                        if let Some(document) = policy.get("PolicyDocument") {
                            scanner.statements(
                                document.get("Statement"),
                                &policy_at.child("PolicyDocument").child("Statement"),
                                Some(&policy_at),
                                &policies,
                            );
                        }
                    }
                }
                let managed = at.child("ManagedPolicyArns");
                if let Some(Json::Array(items)) = container.value.get("ManagedPolicyArns") {
                    for (index, name) in items.iter().enumerate() {
                        scanner.managed(name, managed.child(index), &managed);
                    }
                }
            }
            PermissionStyle::Statements => {
                scanner.statements(Some(container.value), &at, None, &at)
            }
        }
    }
    Ok(scanner.found)
}

struct Scanner<'c, 'a> {
    classifier: &'c Classifier<'a>,
    resource_id: &'c str,
    found: Vec<Found>,
}

impl Scanner<'_, '_> {
    fn push(
        &mut self,
        kind: PermissionKind,
        target: Option<Id>,
        location: Location,
        policy: Option<&Location>,
        container: &Location,
    ) {
        self.found.push(Found {
            permission: Permission {
                resource_id: self.resource_id.to_string(),
                kind,
                target,
            },
            location,
            policy: policy.cloned(),
            container: container.clone(),
        });
    }

    /// SAM `Policies`: a name, a document, or a list of names, templates and documents
    fn policies(&mut self, value: &Json, at: &Location) {
        match value {
            Json::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let item_at = at.child(index);
                    match item {
                        Json::Object(object) if object.contains_key("Statement") => self.statements(
                            object.get("Statement"),
                            &item_at.child("Statement"),
                            Some(&item_at),
                            at,
                        ),
                        Json::Object(object)
                            if object.len() == 1 && crate::util::as_intrinsic(item).is_none() =>
                        {
                            let (name, parameters) = object
                                .iter()
                                .next()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .unwrap_or_default();
                            let target = self.target_in(&parameters);
                            self.push(
                                PermissionKind::Templated { name, parameters },
                                target,
                                item_at,
                                None,
                                at,
                            );
                        }
                        name => self.managed(name, item_at, at),
                    }
                }
            }
            Json::Object(object) if object.contains_key("Statement") => {
                self.statements(object.get("Statement"), &at.child("Statement"), Some(at), at)
            }
            name => self.managed(name, at.clone(), at),
        }
    }

    fn managed(&mut self, name: &Json, location: Location, container: &Location) {
        self.push(
            PermissionKind::Managed { name: name.clone() },
            None,
            location,
            None,
            container,
        );
    }

    fn statements(
        &mut self,
        value: Option<&Json>,
        at: &Location,
        policy: Option<&Location>,
        container: &Location,
    ) {
        match value {
            Some(Json::Array(statements)) => {
                for (index, statement) in statements.iter().enumerate() {
                    self.statement(statement, at.child(index), policy, container);
                }
            }
            Some(statement @ Json::Object(_)) => {
                self.statement(statement, at.clone(), policy, container)
            }
            _ => {}
        }
    }

    fn statement(
        &mut self,
        statement: &Json,
        location: Location,
        policy: Option<&Location>,
        container: &Location,
    ) {
        let effect = statement
            .get("Effect")
            .and_then(Json::as_str)
            .unwrap_or("Allow")
            .to_string();
        let actions = match statement.get("Action") {
            Some(Json::String(action)) => vec![action.clone()],
            Some(Json::Array(actions)) => actions
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect(),
            _ => vec![],
        };
        let resources = match statement.get("Resource") {
            Some(Json::Array(resources)) => resources.clone(),
            Some(resource) => vec![resource.clone()],
            None => vec![],
        };
        let target = resources.iter().find_map(|resource| self.target(resource));

        self.push(
            PermissionKind::Statement {
                effect,
                actions,
                resources,
            },
            target,
            location,
            policy,
            container,
        );
    }

    fn target(&self, value: &Json) -> Option<Id> {
        let id = self.classifier.classify(value);
        id.resource_id().is_some().then_some(id)
    }

    /// First resource mentioned by policy template parameters
    fn target_in(&self, parameters: &Json) -> Option<Id> {
        match parameters {
            Json::Object(object) if crate::util::as_intrinsic(parameters).is_none() => {
                object.values().find_map(|value| self.target_in(value))
            }
            value => self.target(value),
        }
    }
}

/// What gets written, with its normalized form
struct Grant {
    kind: PermissionKind,
    target: Option<String>,
}

fn statement_json(effect: &str, actions: &[String], resources: &[Json]) -> Json {
    json!({"Effect": effect, "Action": actions, "Resource": resources})
}

/// Attach a permission to a compute resource
#[tracing::instrument(level = "trace", skip_all, fields(resource = resource_id))]
pub(crate) fn add_permission(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    resource_id: &str,
    request: &PermissionRequest,
) -> Result<()> {
    let resource = graph
        .resource(resource_id)
        .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))?;
    let location = permission_location(registry, template, resource).ok_or_else(|| {
        Error::UnsupportedPermissions {
            resource_type: resource.resource_type.clone(),
        }
    })?;

    let grant = grant(registry, template, graph, resource, location.style, request)?;

    if scan(registry, template, graph, resource_id)?
        .iter()
        .any(|found| found.permission.kind == grant.kind)
    {
        tracing::debug!(resource = resource_id, "permission already present");
        return Ok(());
    }

    let locations = {
        let owners = graph.owners();
        let classifier = Classifier::new(template).resolving_owner(&owners);
        let builder = Builder::new(template, &classifier, registry.region());
        let context = builder.resource_context(resource);
        let fragment = builder.resource_fragment(resource);
        let Some(steps) = location.path.steps(template.format()) else {
            return Err(no_location(resource_id, template));
        };
        let mut scope = builder.scope(&context);
        if let Some(fragment) = fragment {
            scope = scope.at(fragment);
        }
        crate::path::select_for_write(&steps, &scope)?
    };
    let Some(container) = locations.into_iter().next() else {
        return Err(no_location(resource_id, template));
    };

    let format = template.format();
    let unsupported = match (location.style, &grant.kind) {
        (PermissionStyle::Policies, _) | (_, PermissionKind::Statement { .. }) => None,
        (PermissionStyle::Role, PermissionKind::Managed { .. }) => None,
        (_, PermissionKind::Templated { .. }) => Some("policy templates"),
        (_, PermissionKind::Managed { .. }) => Some("managed policies"),
    };
    if let Some(what) = unsupported {
        return Err(Error::NoLocation {
            resource_id: resource_id.to_string(),
            what,
            format,
        });
    }

    let slot = template::ensure(template.document_mut(), &container)
        .ok_or_else(|| Error::NoLocation {
            resource_id: resource_id.to_string(),
            what: "permissions",
            format,
        })?;

    match (location.style, &grant.kind) {
        (PermissionStyle::Policies, kind) => {
            let item = match kind {
                PermissionKind::Managed { name } => name.clone(),
                PermissionKind::Templated { name, parameters } => {
                    json!({ name.as_str(): parameters })
                }
                PermissionKind::Statement {
                    effect,
                    actions,
                    resources,
                } => json!({"Statement": [statement_json(effect, actions, resources)]}),
            };
            push(as_list(slot), item);
        }
        (PermissionStyle::Role, PermissionKind::Managed { name }) => {
            let properties = as_object(slot);
            let arns = properties
                .entry("ManagedPolicyArns")
                .or_insert_with(|| Json::Array(vec![]));
            push(as_list(arns), name.clone());
        }
        (
            PermissionStyle::Role,
            PermissionKind::Statement {
                effect,
                actions,
                resources,
            },
        ) => {
            let base = match &grant.target {
                Some(target) => format!("{resource_id}{target}Access"),
                None => format!("{resource_id}Policy"),
            };
            let properties = as_object(slot);
            let policies = as_list(
                properties
                    .entry("Policies")
                    .or_insert_with(|| Json::Array(vec![])),
            );
            let name = unique_policy_name(policies, &base);
            policies.push(json!({
                "PolicyName": name,
                "PolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [statement_json(effect, actions, resources)]
                }
            }));
        }
        (
            PermissionStyle::Statements,
            PermissionKind::Statement {
                effect,
                actions,
                resources,
            },
        ) => push(as_list(slot), statement_json(effect, actions, resources)),
        _ => {}
    }

    tracing::debug!(resource = resource_id, kind = ?grant.kind, "permission added");
    refresh(registry, template, graph, resource_id)
}

fn no_location(resource_id: &str, template: &Template) -> Error {
    Error::NoLocation {
        resource_id: resource_id.to_string(),
        what: "permissions",
        format: template.format(),
    }
}

fn grant(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &StackGraph,
    resource: &Resource,
    style: PermissionStyle,
    request: &PermissionRequest,
) -> Result<Grant> {
    Ok(match request {
        PermissionRequest::Managed { name } => Grant {
            kind: PermissionKind::Managed { name: name.clone() },
            target: None,
        },
        PermissionRequest::Statement {
            actions,
            resources,
            target_id,
        } => Grant {
            kind: PermissionKind::Statement {
                effect: "Allow".to_string(),
                actions: actions.clone(),
                resources: resources.clone(),
            },
            target: target_id.clone(),
        },
        PermissionRequest::Typed {
            target_id,
            permission_type,
        } => {
            let target = graph
                .resource(target_id)
                .ok_or_else(|| Error::UnknownResource(target_id.clone()))?;
            let schema = registry
                .get(&target.resource_type)
                .ok_or_else(|| Error::UnknownResourceType(target.resource_type.clone()))?;
            let declared = schema.permission_types.get(permission_type).ok_or_else(|| {
                Error::UnknownPermissionType {
                    resource_type: target.resource_type.clone(),
                    permission_type: permission_type.clone(),
                }
            })?;

            let classifier = Classifier::new(template);
            let builder = Builder::new(template, &classifier, registry.region());
            let mut context = builder.resource_context(resource);
            insert_target(&mut context, target);

            let kind = match (&declared.templated_policy, style) {
                (Some(policy), PermissionStyle::Policies) => PermissionKind::Templated {
                    name: policy.name.clone(),
                    parameters: placeholder::expand_json(
                        &policy.parameters,
                        &context,
                        Strictness::Strict,
                    )?,
                },
                _ if declared.actions.is_empty() => {
                    return Err(Error::NoLocation {
                        resource_id: resource.id.clone(),
                        what: "policy templates",
                        format: template.format(),
                    })
                }
                _ => PermissionKind::Statement {
                    effect: "Allow".to_string(),
                    actions: declared.actions.clone(),
                    resources: declared
                        .resources
                        .iter()
                        .map(|resource| {
                            placeholder::expand_json(resource, &context, Strictness::Strict)
                        })
                        .collect::<Result<_, _>>()?,
                },
            };
            Grant {
                kind,
                target: Some(target_id.clone()),
            }
        }
    })
}

fn as_list(slot: &mut Json) -> &mut Vec<Json> {
    if !slot.is_array() {
        *slot = match slot.take() {
            Json::Null => Json::Array(vec![]),
            single => Json::Array(vec![single]),
        };
    }
    match slot {
        Json::Array(list) => list,
        _ => unreachable!("converted above"),
    }
}

fn as_object(slot: &mut Json) -> &mut serde_json::Map<String, Json> {
    if !slot.is_object() {
        *slot = Json::Object(Default::default());
    }
    match slot {
        Json::Object(object) => object,
        _ => unreachable!("converted above"),
    }
}

fn push(list: &mut Vec<Json>, item: Json) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// `base`, or `base` with the smallest numeric suffix not used by another policy
fn unique_policy_name(policies: &[Json], base: &str) -> String {
    let taken: Vec<&str> = policies
        .iter()
        .filter_map(|policy| policy.get("PolicyName")?.as_str())
        .collect();
    if !taken.contains(&base) {
        return base.to_string();
    }
    (1..)
        .map(|suffix| format!("{base}{suffix}"))
        .find(|name| !taken.contains(&name.as_str()))
        .unwrap_or_else(|| base.to_string())
}

/// Remove a permission; a missing permission is not an error
#[tracing::instrument(level = "trace", skip_all, fields(resource = resource_id))]
pub(crate) fn delete_permission(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    resource_id: &str,
    selector: &PermissionSelector,
) -> Result<bool> {
    delete_where(registry, template, graph, resource_id, |index, permission| match selector {
        PermissionSelector::Index(wanted) => index == *wanted,
        PermissionSelector::Matching(kind) => &permission.kind == kind,
    })
}

/// Remove the first permission of `resource_id` matching `predicate`
fn delete_where(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    resource_id: &str,
    mut predicate: impl FnMut(usize, &Permission) -> bool,
) -> Result<bool> {
    let found = {
        // virtual targets are assigned on refresh; match against the graph's view
        let known: Vec<&Permission> = graph.permissions_of(resource_id).collect();
        scan(registry, template, graph, resource_id)?
            .into_iter()
            .enumerate()
            .find(|(index, found)| {
                let permission = match known.get(*index) {
                    Some(known) if known.kind == found.permission.kind => known,
                    _ => &found.permission,
                };
                predicate(*index, permission)
            })
            .map(|(_, found)| found)
    };

    let Some(found) = found else {
        tracing::warn!(resource = resource_id, "no such permission, nothing to delete");
        return Ok(false);
    };

    let floor = graph
        .resource(resource_id)
        .and_then(Resource::primary_entry)
        .filter(|entry| found.container.starts_with(&template.entry_location(entry)))
        .map_or(0, |entry| template.entry_location(entry).keys().len());

    let document = template.document_mut();
    template::remove(document, &found.location);
    if let Some(policy) = &found.policy {
        let keeps_statements = template::get(document, policy).is_some_and(|policy| {
            let document = policy.get("PolicyDocument").unwrap_or(policy);
            match document.get("Statement") {
                Some(Json::Array(statements)) => !statements.is_empty(),
                Some(Json::Object(_)) => true,
                _ => false,
            }
        });
        if !keeps_statements {
            template::remove(document, policy);
        }
    }
    template::prune_empty(document, &found.container, floor);

    tracing::debug!(resource = resource_id, kind = ?found.permission.kind, "permission removed");
    refresh(registry, template, graph, resource_id)?;
    Ok(true)
}

/// Remove every permission of `resource_id` granted on `target_id`
pub(crate) fn delete_targeting(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    resource_id: &str,
    target_id: &str,
) -> Result<()> {
    while graph
        .permissions_of(resource_id)
        .any(|p| p.target_resource() == Some(target_id))
    {
        let deleted = delete_where(registry, template, graph, resource_id, |_, p| {
            p.target_resource() == Some(target_id)
        })?;
        if !deleted {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn policy_names_get_the_smallest_free_suffix() {
        let policies = vec![
            json!({"PolicyName": "FnTblAccess"}),
            json!({"PolicyName": "FnTblAccess1"}),
            json!({"PolicyName": "FnTblAccess3"}),
        ];
        assert_eq!(unique_policy_name(&policies, "FnTblAccess"), "FnTblAccess2");
        assert_eq!(unique_policy_name(&policies, "FnQueueAccess"), "FnQueueAccess");
    }

    #[test]
    fn single_values_become_lists() {
        let mut slot = json!("AWSLambdaBasicExecutionRole");
        push(as_list(&mut slot), json!("AmazonS3ReadOnlyAccess"));
        push(as_list(&mut slot), json!("AmazonS3ReadOnlyAccess"));
        assert_eq!(
            slot,
            json!(["AWSLambdaBasicExecutionRole", "AmazonS3ReadOnlyAccess"])
        );
    }
}
