//! Environment references from compute resources to other resources
use crate::error::{Error, Result};
use crate::id::Classifier;
use crate::model::{insert_target, Builder, PermissionKind, Reference, StackGraph};
use crate::permissions::{self, PermissionRequest};
use crate::placeholder::{self, Context, Strictness};
use crate::schema::SchemaRegistry;
use crate::template::{self, Template};
use serde_json::Value as Json;

/// Derive the references of every resource declaring a reference path
pub(crate) fn derive_all(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
) -> Result<()> {
    let ids: Vec<String> = graph
        .resources
        .iter()
        .filter(|resource| {
            registry
                .get(&resource.resource_type)
                .is_some_and(|schema| schema.references.is_some())
        })
        .map(|resource| resource.id.clone())
        .collect();
    for id in ids {
        refresh(registry, template, graph, &id)?;
    }
    Ok(())
}

/// Derive the (non virtual) references of one resource again
pub(crate) fn refresh(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
    resource_id: &str,
) -> Result<()> {
    let found = {
        let resource = graph
            .resource(resource_id)
            .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))?;
        let Some(spec) = registry
            .get(&resource.resource_type)
            .and_then(|schema| schema.references.as_ref())
        else {
            return Ok(());
        };

        let owners = graph.owners();
        let classifier = Classifier::new(template)
            .with_resources(graph.known_resources())
            .resolving_owner(&owners);
        let builder = Builder::new(template, &classifier, registry.region());
        let context = builder.resource_context(resource);
        let fragment = builder.resource_fragment(resource);

        let mut found = vec![];
        for node in builder.select(spec, fragment.as_ref(), &context)? {
            let Json::Object(variables) = node.value else {
                continue;
            };
            for (variable, value) in variables {
                let target = classifier.classify(value);
                // the resource's own name (e.g. a table name in its own environment)
                if !target.is_resolved() || target.resource_id() == Some(resource_id) {
                    continue;
                }
                found.push(Reference {
                    resource_id: resource_id.to_string(),
                    variable: variable.clone(),
                    target,
                    is_virtual_reference_resource: false,
                });
            }
        }
        found
    };

    graph
        .references
        .retain(|r| r.resource_id != resource_id || r.is_virtual_reference_resource);
    graph.references.extend(found);
    Ok(())
}

/// Set one environment variable of `source_id`
#[tracing::instrument(level = "trace", skip_all, fields(source = source_id, variable = variable))]
pub(crate) fn add_reference(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    source_id: &str,
    variable: &str,
    value: Json,
) -> Result<()> {
    let location = {
        let resource = graph
            .resource(source_id)
            .ok_or_else(|| Error::UnknownResource(source_id.to_string()))?;
        let unsupported = || Error::UnsupportedReferences {
            resource_type: resource.resource_type.clone(),
        };
        let spec = registry
            .get(&resource.resource_type)
            .and_then(|schema| schema.references.as_ref())
            .ok_or_else(unsupported)?;
        let steps = spec.steps(template.format()).ok_or_else(unsupported)?;

        let owners = graph.owners();
        let classifier = Classifier::new(template).resolving_owner(&owners);
        let builder = Builder::new(template, &classifier, registry.region());
        let context = builder.resource_context(resource);
        let mut scope = builder.scope(&context);
        if let Some(fragment) = builder.resource_fragment(resource) {
            scope = scope.at(fragment);
        }
        crate::path::select_for_write(&steps, &scope)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoLocation {
                resource_id: source_id.to_string(),
                what: "references",
                format: template.format(),
            })?
    };

    let format = template.format();
    let slot = template::ensure(template.document_mut(), &location)
        .ok_or_else(|| Error::NoLocation {
            resource_id: source_id.to_string(),
            what: "references",
            format,
        })?;
    if !slot.is_object() {
        *slot = Json::Object(Default::default());
    }
    if let Json::Object(variables) = slot {
        variables.insert(variable.to_string(), value);
    }

    tracing::debug!(source = source_id, variable, "reference added");
    refresh(registry, template, graph, source_id)
}

/// Wire `source_id` to `target_id` the way the target type asks for
///
/// Ordinary targets get their declared default environment variables. Virtual reference
/// resources are granted their default permission instead.
pub(crate) fn add_default_references(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    source_id: &str,
    target_id: &str,
) -> Result<()> {
    let target = graph
        .resource(target_id)
        .ok_or_else(|| Error::UnknownResource(target_id.to_string()))?;
    let schema = registry
        .get(&target.resource_type)
        .ok_or_else(|| Error::UnknownResourceType(target.resource_type.clone()))?;

    if let Some(virtual_reference) = schema
        .virtual_reference
        .as_ref()
        .filter(|_| target.is_virtual_reference_resource)
    {
        let mut context = base_context(registry, template);
        insert_target(&mut context, target);
        let resources = virtual_reference
            .resources
            .iter()
            .map(|resource| placeholder::expand_json(resource, &context, Strictness::Strict))
            .collect::<Result<_, _>>()?;
        let request = PermissionRequest::Statement {
            actions: virtual_reference.actions.clone(),
            resources,
            target_id: Some(target_id.to_string()),
        };
        return permissions::add_permission(registry, template, graph, source_id, &request);
    }

    let mut context = base_context(registry, template);
    insert_target(&mut context, target);
    let mut variables = vec![];
    for (name, value) in &schema.default_references {
        let name = placeholder::expand_to_string(name, &context, Strictness::Strict)?;
        let value = placeholder::expand_json(value, &context, Strictness::Strict)?;
        variables.push((name, value));
    }

    for (name, value) in variables {
        add_reference(registry, template, graph, source_id, &name, value)?;
    }
    Ok(())
}

/// Remove the reference of `source_id` named `variable`
///
/// For a virtual reference resource the grants implying the reference are removed: every
/// one targeting the singleton, or else the first statement whose actions overlap the
/// singleton's actions and which targets nothing in this template.
#[tracing::instrument(level = "trace", skip_all, fields(source = source_id, variable = variable))]
pub(crate) fn delete_reference(
    registry: &SchemaRegistry,
    template: &mut Template,
    graph: &mut StackGraph,
    source_id: &str,
    variable: &str,
) -> Result<bool> {
    let Some(reference) = graph
        .references_of(source_id)
        .find(|r| r.variable == variable)
        .cloned()
    else {
        tracing::warn!(source = source_id, variable, "no such reference, nothing to delete");
        return Ok(false);
    };

    if reference.is_virtual_reference_resource {
        let target_id = reference.target.resource_id().unwrap_or_default().to_string();
        let actions = graph
            .resource(&target_id)
            .and_then(|target| registry.get(&target.resource_type))
            .and_then(|schema| schema.virtual_reference.as_ref())
            .map(|vr| vr.actions.clone())
            .unwrap_or_default();

        let exact = |graph: &StackGraph| {
            graph
                .permissions_of(source_id)
                .position(|p| p.target_resource() == Some(target_id.as_str()))
        };
        let Some(mut index) = exact(graph).or_else(|| {
            graph.permissions_of(source_id).position(|p| {
                let untargeted = p.target.as_ref().map_or(true, |target| !target.is_local());
                let overlaps = matches!(&p.kind, PermissionKind::Statement { .. })
                    && p.kind.actions().iter().any(|action| actions.contains(action));
                untargeted && overlaps
            })
        }) else {
            tracing::warn!(
                source = source_id,
                target = %target_id,
                "no grant implies this reference"
            );
            return Ok(false);
        };

        // every grant promoted onto the singleton implies the same reference
        let mut deleted = false;
        loop {
            let selector = permissions::PermissionSelector::Index(index);
            if !permissions::delete_permission(registry, template, graph, source_id, &selector)? {
                return Ok(deleted);
            }
            deleted = true;
            match exact(graph) {
                Some(next) => index = next,
                None => return Ok(true),
            }
        }
    }

    let location = {
        let resource = graph
            .resource(source_id)
            .ok_or_else(|| Error::UnknownResource(source_id.to_string()))?;
        let Some(spec) = registry
            .get(&resource.resource_type)
            .and_then(|schema| schema.references.as_ref())
        else {
            return Ok(false);
        };
        let owners = graph.owners();
        let classifier = Classifier::new(template).resolving_owner(&owners);
        let builder = Builder::new(template, &classifier, registry.region());
        let context = builder.resource_context(resource);
        let fragment = builder.resource_fragment(resource);
        builder
            .select(spec, fragment.as_ref(), &context)?
            .into_iter()
            .find(|node| node.value.get(variable).is_some())
            .map(|node| node.location)
    };
    let Some(location) = location else {
        return Ok(false);
    };

    let floor = graph
        .resource(source_id)
        .and_then(|resource| resource.primary_entry())
        .map_or(0, |entry| template.entry_location(entry).keys().len());
    let document = template.document_mut();
    template::remove(document, &location.child(variable));
    template::prune_empty(document, &location, floor);

    tracing::debug!(source = source_id, variable, "reference removed");
    refresh(registry, template, graph, source_id)?;
    Ok(true)
}

fn base_context(registry: &SchemaRegistry, template: &Template) -> Context {
    Context::new()
        .with("region", registry.region())
        .with("format", template.format().to_string())
}
