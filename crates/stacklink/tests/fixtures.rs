//! Fixture tests
//!
//! Parses each template in /tests/fixtures/ individually and checks the invariants every
//! graph must hold: each template entry (except deployment bookkeeping) is owned exactly
//! once, and parsing is deterministic.
use pretty_assertions::assert_eq;
use stacklink::template::EntryId;
use stacklink::{Engine, SchemaRegistry, StackGraph, Template};
use std::collections::HashSet;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("STACKLINK_LOG"))
        .with_writer(std::io::stderr)
        .try_init();
}

fn registry() -> SchemaRegistry {
    SchemaRegistry::from_yaml_str(include_str!("schema.yaml")).expect("test schema must load")
}

/// Owned entries of every resource, facet and integration, duplicates included
fn owned_entries(graph: &StackGraph) -> Vec<EntryId> {
    let resources = graph.resources.iter().flat_map(|resource| {
        resource
            .template_partial
            .iter()
            .chain(resource.facets().flat_map(|facet| &facet.template_partial))
    });
    let integrations = graph
        .integrations
        .iter()
        .flat_map(|integration| &integration.template_partial);
    resources.chain(integrations).cloned().collect()
}

#[test]
fn fixtures() {
    init_logging();
    let registry = registry();
    let engine = Engine::new(&registry);

    insta::glob!("fixtures/*", |path| {
        let text = std::fs::read_to_string(path).unwrap();
        let template = Template::from_str_guess(&text).expect("fixture must load");
        let graph = engine.parse(&template).expect("fixture must parse");

        let owned = owned_entries(&graph);
        let unique: HashSet<&EntryId> = owned.iter().collect();
        assert_eq!(owned.len(), unique.len(), "{}: entry owned twice", path.display());

        let expected: HashSet<EntryId> = template
            .entries()
            .into_iter()
            .filter(|entry| !stacklink::parse::is_noise_entry(&template, entry))
            .collect();
        let owned: HashSet<EntryId> = owned.into_iter().collect();
        assert_eq!(owned, expected, "{}: ownership is not total", path.display());

        assert_eq!(graph, engine.parse(&template).unwrap());
        graph.to_yaml_string().expect("graph must serialize");
        insta::assert_yaml_snapshot!(graph);
    });
}

#[test]
fn ownership_map() {
    init_logging();
    let registry = registry();
    let template = stacklink::template!(
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      Role: !GetAtt FnRole.Arn
  FnRole:
    Type: AWS::IAM::Role
  FnLogs:
    Type: AWS::Logs::LogGroup
    Properties:
      LogGroupName: !Sub "/aws/lambda/${Fn}"
  Topic:
    Type: AWS::SNS::Topic
"#
    );
    let graph = Engine::new(&registry).parse(&template).unwrap();

    insta::assert_yaml_snapshot!(graph.owners(), @r###"
    ---
    Resources.Fn:
      Kind: Resource
      ResourceId: Fn
    Resources.FnRole:
      Kind: Resource
      ResourceId: Fn
    Resources.FnLogs:
      Kind: Resource
      ResourceId: Fn
    Resources.Topic:
      Kind: Resource
      ResourceId: Topic
    "###);
}
