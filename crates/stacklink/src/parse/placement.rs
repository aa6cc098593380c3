//! virtual network placement of resources
use crate::error::{Error, Result};
use crate::id::{Classifier, Id};
use crate::model::{Builder, StackGraph, VirtualNetworkPlacement};
use crate::path::Node;
use crate::schema::SchemaRegistry;
use crate::template::Template;
use serde_json::Value as Json;

pub(crate) fn derive(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
) -> Result<()> {
    let owners = graph.owners();
    let classifier = Classifier::new(template)
        .with_resources(graph.known_resources())
        .resolving_owner(&owners);
    let builder = Builder::new(template, &classifier, registry.region());

    let mut placements = vec![];
    for resource in &graph.resources {
        let Some(schema) = registry
            .get(&resource.resource_type)
            .and_then(|schema| schema.virtual_network_placements.as_ref())
        else {
            continue;
        };
        let Some(fragment) = resource
            .primary_entry()
            .and_then(|entry| builder.fragment(entry))
        else {
            continue;
        };

        let context = builder
            .base_context()
            .with("resourceId", resource.id.as_str());
        let subnet_ids = ids(
            builder.select(&schema.subnets, Some(&fragment), &context)?,
            &classifier,
        );
        let security_group_ids = ids(
            builder.select(&schema.security_groups, Some(&fragment), &context)?,
            &classifier,
        );
        if subnet_ids.is_empty() && security_group_ids.is_empty() {
            continue;
        }

        let explicit = match &schema.virtual_network {
            Some(spec) => builder
                .select(spec, Some(&fragment), &context)?
                .first()
                .map(|node| classifier.classify(node.value)),
            None => None,
        };

        let network = match explicit {
            Some(network) => Found::Network(network),
            None => infer_network(
                template,
                graph,
                &classifier,
                &resource.id,
                &subnet_ids,
                &security_group_ids,
            )?,
        };

        let virtual_network_id = match network {
            Found::Network(id @ Id::Logical { .. })
                if id
                    .resource_id()
                    .is_some_and(|network| graph.resource(network).is_some()) =>
            {
                id
            }
            Found::Network(id) => {
                tracing::debug!(
                    resource = %resource.id,
                    ?id,
                    "unrecognized virtual network, not placed"
                );
                continue;
            }
            Found::DefaultNetwork => {
                tracing::debug!(resource = %resource.id, "default virtual network, not placed");
                continue;
            }
        };

        placements.push(VirtualNetworkPlacement {
            resource_id: resource.id.clone(),
            virtual_network_id,
            subnet_ids,
            security_group_ids,
        });
    }

    graph.virtual_network_placements = placements;
    Ok(())
}

enum Found {
    Network(Id),
    DefaultNetwork,
}

/// Walk from a local subnet (or security group) to its network
fn infer_network(
    template: &Template,
    graph: &StackGraph,
    classifier: &Classifier<'_>,
    resource_id: &str,
    subnet_ids: &[Id],
    security_group_ids: &[Id],
) -> Result<Found> {
    let vpc_of = |id: &Id| -> Option<Option<&Json>> {
        let Id::Logical { resource_id } = id else {
            return None;
        };
        let entry = graph.resource(resource_id)?.primary_entry()?;
        let properties = template.entry(entry)?.get("Properties");
        Some(properties.and_then(|properties| properties.get("VpcId")))
    };

    for subnet in subnet_ids {
        match vpc_of(subnet) {
            Some(Some(vpc)) => return Ok(Found::Network(classifier.classify(vpc))),
            Some(None) => {
                return Err(Error::Placement {
                    resource_id: resource_id.to_string(),
                    reason: format!(
                        "subnet {} has no VpcId",
                        subnet.resource_id().unwrap_or_default()
                    ),
                })
            }
            None => {}
        }
    }

    for group in security_group_ids {
        match vpc_of(group) {
            Some(Some(vpc)) => return Ok(Found::Network(classifier.classify(vpc))),
            // a security group without VpcId lives in the default network
            Some(None) => return Ok(Found::DefaultNetwork),
            None => {}
        }
    }

    Ok(Found::Network(Id::Unresolved))
}

/// Resolved ids of every value (or list element) of the matched nodes
fn ids(nodes: Vec<Node<'_>>, classifier: &Classifier<'_>) -> Vec<Id> {
    let mut found = vec![];
    for node in nodes {
        let values = match node.value {
            Json::Array(values) => values.iter().collect(),
            value => vec![value],
        };
        for value in values {
            let id = classifier.classify(value);
            if id.is_resolved() && !found.contains(&id) {
                found.push(id);
            }
        }
    }
    found
}
