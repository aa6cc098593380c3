//! Template → [StackGraph]
//!
//! The pipeline, in order:
//! 1. locate resources (and their facets and satellites) and claim their entries
//! 2. locate integrations between located resources and claim their entries
//! 3. record which entry mentions which
//! 4. merge the remaining entries into owners until nothing is left, turning entries
//!    without a legal owner (or caught in a cycle) into custom resources
//! 5. fold custom resources into owners that grouping rules allow
//! 6. collect parameters
//! 7. find the patch location of integrations with a virtual target
//! 8. derive references and permissions
//! 9. derive references of custom resources
//! 10. derive virtual network placements
//!
//! Deployment bookkeeping entries ([is_noise_entry]) never reach the graph.
mod placement;
mod session;

pub use session::is_noise_entry;

use crate::error::{Error, Result};
use crate::id::{mentions, Classifier, Id};
use crate::model::{Builder, Owner, Parameter, Reference, StackGraph};
use crate::schema::SchemaRegistry;
use crate::template::{Section, Template, PSEUDO_PARAMETERS};
use crate::{permissions, references};
use session::ParseSession;

/// Build the normalized graph of `template`
#[tracing::instrument(level = "trace", skip_all, fields(format = %template.format()))]
pub fn parse(registry: &SchemaRegistry, template: &Template) -> Result<StackGraph> {
    let mut session = ParseSession::new(registry, template);
    session.locate_resources()?;
    session.locate_integrations()?;
    session.build_relationships();
    session.resolve_ownership();
    session.reabsorb();

    let mut graph = session.finish();
    graph.parameters = parameters(template);
    virtual_targets(registry, template, &mut graph)?;
    references::derive_all(registry, template, &mut graph)?;
    permissions::derive_all(registry, template, &mut graph)?;
    custom_references(registry, template, &mut graph);
    placement::derive(registry, template, &mut graph)?;

    tracing::debug!(
        resources = graph.resources.len(),
        integrations = graph.integrations.len(),
        references = graph.references.len(),
        permissions = graph.permissions.len(),
        "parsed"
    );
    Ok(graph)
}

fn parameters(template: &Template) -> Vec<Parameter> {
    let Some(section) = template.section(Section::Parameters) else {
        return vec![];
    };
    section
        .iter()
        .filter(|(name, _)| !PSEUDO_PARAMETERS.contains(&name.as_str()))
        .map(|(name, declaration)| Parameter {
            id: name.clone(),
            parameter_type: declaration
                .get("Type")
                .and_then(|t| t.as_str())
                .map(str::to_string),
            default: declaration.get("Default").cloned(),
            description: declaration
                .get("Description")
                .and_then(|d| d.as_str())
                .map(str::to_string),
        })
        .collect()
}

/// Point integrations with a virtual target at the location mutations patch
fn virtual_targets(
    registry: &SchemaRegistry,
    template: &Template,
    graph: &mut StackGraph,
) -> Result<()> {
    let classifier = Classifier::new(template);
    let builder = Builder::new(template, &classifier, registry.region());

    for integration in &mut graph.integrations {
        let Some(spec) = graph
            .resources
            .iter()
            .find(|r| r.id == integration.source_id)
            .and_then(|source| {
                registry.integration_type(&source.resource_type, &integration.integration_type)
            })
            .and_then(|schema| schema.virtual_target.as_ref())
        else {
            continue;
        };

        let context = builder
            .base_context()
            .with("sourceId", integration.source_id.as_str())
            .with("targetId", integration.target_id.as_str());
        let mut found = None;
        for entry in &integration.template_partial {
            let Some(fragment) = builder.fragment(entry) else {
                continue;
            };
            let selected = builder.select(spec, Some(&fragment), &context)?;
            if let Some(node) = selected.into_iter().next() {
                found = Some(node.location);
                break;
            }
        }

        match found {
            Some(location) => integration.virtual_target = Some(location),
            None => {
                return Err(Error::VirtualTargetNotFound {
                    integration_type: integration.integration_type.clone(),
                    source_id: integration.source_id.clone(),
                    path: format!("{spec:?}"),
                })
            }
        }
    }
    Ok(())
}

/// References from custom resources to the resources owning what they mention
///
/// Mentions through weak fields only count where a grouping rule lets the target absorb
/// the custom resource's type, the same legality check ownership merging uses.
fn custom_references(registry: &SchemaRegistry, template: &Template, graph: &mut StackGraph) {
    let owners = graph.owners();
    let classifier = Classifier::new(template).with_resources(graph.known_resources());

    let mut found = vec![];
    for custom in graph.resources.iter().filter(|r| r.is_custom()) {
        let own = Owner::resource(&custom.id);
        for entry in &custom.template_partial {
            let Some(value) = template.entry(entry) else {
                continue;
            };
            for mention in mentions(&classifier, value) {
                let Some(target_id) = owners
                    .get(&mention.entry)
                    .filter(|o| **o != own)
                    .and_then(Owner::resource_id)
                else {
                    continue;
                };
                let Some(target) = graph.resource(target_id) else {
                    continue;
                };
                if mention.weak
                    && registry
                        .grouping_rule(target.grouping_type(), custom.grouping_type())
                        .is_none()
                {
                    tracing::trace!(
                        custom = %custom.id,
                        target = target_id,
                        "weak mention, no reference"
                    );
                    continue;
                }

                let reference = Reference {
                    resource_id: custom.id.clone(),
                    variable: mention.entry.name.clone(),
                    target: Id::logical(target_id),
                    is_virtual_reference_resource: false,
                };
                if !found.contains(&reference) {
                    found.push(reference);
                }
            }
        }
    }
    graph.references.extend(found);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::template;
    use pretty_assertions::assert_eq;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_yaml_str(
            r#"
ResourceTypes:
  Table:
    Locator: "$.Resources[?(@.Type == 'AWS::DynamoDB::Table')]"
    Settings:
      Name:
        Path: "@.Properties.TableName"
GroupingRules:
  - Owner: ".*"
    Target: "^(Condition|Parameter)$"
"#,
        )
        .unwrap()
    }

    #[test]
    fn unknown_entries_become_custom_resources() {
        let template = template! {r#"
Parameters:
  Stage: {Type: String, Default: dev}
Resources:
  Tbl:
    Type: AWS::DynamoDB::Table
    Properties:
      TableName: !Sub "orders-${Stage}"
  Bucket:
    Type: AWS::S3::Bucket
  CDKMetadata:
    Type: AWS::CDK::Metadata
"#};
        let graph = parse(&registry(), &template).unwrap();

        let ids: Vec<(&str, &str)> = graph
            .resources
            .iter()
            .map(|r| (r.id.as_str(), r.resource_type.as_str()))
            .collect();
        assert_eq!(ids, vec![("Tbl", "Table"), ("Bucket", "Custom")]);
        assert_eq!(graph.parameters.len(), 1);
        assert_eq!(graph.parameters[0].default, Some(serde_json::json!("dev")));

        // the parameter follows its only user
        let owners = graph.owners();
        assert_eq!(
            owners.get(&template::EntryId::new(Section::Parameters, "Stage")),
            Some(&Owner::resource("Tbl"))
        );
    }
}
