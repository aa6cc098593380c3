//! End-to-end scenarios
//!
//! Every test loads `schema.yaml`, parses a template, applies changes through [Engine] and
//! compares the resulting template and graph. Where a change should be indistinguishable
//! from a fresh parse, the graph is compared against one.
use pretty_assertions::assert_eq;
use serde_json::json;
use stacklink::id::Id;
use stacklink::model::{Owner, PermissionKind};
use stacklink::permissions::{PermissionRequest, PermissionSelector};
use stacklink::template::{EntryId, Section};
use stacklink::{Engine, Error, Intent, SchemaRegistry, StackGraph, Template};

fn registry() -> SchemaRegistry {
    SchemaRegistry::from_yaml_str(include_str!("schema.yaml")).expect("test schema must load")
}

fn intent(text: &str) -> Intent {
    serde_yaml::from_str(text).expect("intent must parse")
}

fn parsed(registry: &SchemaRegistry, text: &str) -> (Template, StackGraph) {
    let template = stacklink::template!(text);
    let graph = Engine::new(registry)
        .parse(&template)
        .expect("template must parse into a graph");
    (template, graph)
}

fn owner_of(graph: &StackGraph, entry: EntryId) -> Option<Owner> {
    graph.owners().get(&entry).cloned()
}

const FUNCTION_AND_TABLE: &str = r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
  Tbl:
    Type: AWS::DynamoDB::Table
    Properties:
      BillingMode: PAY_PER_REQUEST
"#;

#[test]
fn adding_an_integration_grants_permissions_and_references() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(&registry, FUNCTION_AND_TABLE);

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: AddIntegration, IntegrationType: ReadTable, \
                 SourceId: Fn, TargetId: Tbl}",
            ),
        )
        .unwrap();

    let properties = &template.document()["Resources"]["Fn"]["Properties"];
    assert_eq!(
        properties["Environment"],
        json!({"Variables": {"TBL_TABLE": {"Ref": "Tbl"}}})
    );
    assert_eq!(
        properties["Policies"],
        json!([{"Statement": [{
            "Effect": "Allow",
            "Action": ["dynamodb:GetItem", "dynamodb:Query", "dynamodb:Scan"],
            "Resource": [{"Fn::GetAtt": ["Tbl", "Arn"]}]
        }]}])
    );

    assert!(graph.integration("ReadTable", "Fn", "Tbl").is_some());
    let permissions: Vec<_> = graph.permissions_of("Fn").collect();
    assert_eq!(permissions.len(), 1);
    assert_eq!(permissions[0].target_resource(), Some("Tbl"));
    let references: Vec<_> = graph.references_of("Fn").collect();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].variable, "TBL_TABLE");
    assert_eq!(references[0].target, Id::logical("Tbl"));

    // the written template reads back as the same wiring
    let reparsed = engine.parse(&template).unwrap();
    assert_eq!(reparsed.integrations.len(), 1);
    assert!(reparsed.integration("ReadTable", "Fn", "Tbl").is_some());
    assert_eq!(reparsed.permissions, graph.permissions);
    assert_eq!(reparsed.references, graph.references);
}

#[test]
fn serverless_integrations_use_provider_statements() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
service: orders
provider:
  name: aws
functions:
  hello:
    handler: handler.hello
resources:
  Resources:
    Tbl:
      Type: AWS::DynamoDB::Table
"#,
    );
    assert_eq!(graph.resource("hello").unwrap().resource_type, "Function");
    assert_eq!(graph.resource("Tbl").unwrap().resource_type, "Table");

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: AddIntegration, IntegrationType: ReadTable, \
                 SourceId: hello, TargetId: Tbl}",
            ),
        )
        .unwrap();

    let document = template.document();
    assert_eq!(
        document["provider"]["iam"]["role"]["statements"],
        json!([{
            "Effect": "Allow",
            "Action": ["dynamodb:GetItem", "dynamodb:Query", "dynamodb:Scan"],
            "Resource": [{"Fn::GetAtt": ["Tbl", "Arn"]}]
        }])
    );
    assert_eq!(
        document["functions"]["hello"]["environment"],
        json!({"TBL_TABLE": {"Ref": "Tbl"}})
    );

    let reparsed = engine.parse(&template).unwrap();
    assert!(reparsed.integration("ReadTable", "hello", "Tbl").is_some());
    assert_eq!(
        reparsed.permissions_of("hello").next().and_then(|p| p.target_resource()),
        Some("Tbl")
    );
}

#[test]
fn entries_referencing_only_a_network_stay_custom() {
    let registry = registry();
    let (_, graph) = parsed(
        &registry,
        r#"
Resources:
  Vpc:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: 10.0.0.0/16
  Endpoint:
    Type: AWS::EC2::VPCEndpoint
    Properties:
      VpcId: !Ref Vpc
      ServiceName: com.amazonaws.eu-west-1.s3
"#,
    );

    let endpoint = graph.resource("Endpoint").unwrap();
    assert!(endpoint.is_custom());
    assert_eq!(endpoint.grouping_type(), "AWS::EC2::VPCEndpoint");
    assert_eq!(
        owner_of(&graph, EntryId::resource("Endpoint")),
        Some(Owner::resource("Endpoint"))
    );
    assert_eq!(
        owner_of(&graph, EntryId::resource("Vpc")),
        Some(Owner::resource("Vpc"))
    );
}

#[test]
fn grouping_rules_decide_ownership() {
    let registry = registry();
    let (_, graph) = parsed(
        &registry,
        r#"
Parameters:
  Stage:
    Type: String
    Default: dev
Conditions:
  IsProd: !Equals [!Ref Stage, prod]
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Condition: IsProd
    Properties:
      Runtime: python3.12
  FnLogs:
    Type: AWS::Logs::LogGroup
    Properties:
      LogGroupName: !Sub "/aws/lambda/${Fn}"
  ExtraLogs:
    Type: AWS::Logs::LogGroup
    Properties:
      LogGroupName: !Sub "/aws/lambda/${Fn}-extra"
"#,
    );

    let fn_owner = Some(Owner::resource("Fn"));
    assert_eq!(owner_of(&graph, EntryId::resource("FnLogs")), fn_owner);
    assert_eq!(owner_of(&graph, EntryId::new(Section::Conditions, "IsProd")), fn_owner);
    assert_eq!(owner_of(&graph, EntryId::new(Section::Parameters, "Stage")), fn_owner);

    // the log group rule stops chaining and applies once per function
    assert_eq!(
        owner_of(&graph, EntryId::resource("ExtraLogs")),
        Some(Owner::resource("ExtraLogs"))
    );
    assert!(graph.resource("ExtraLogs").unwrap().is_custom());

    assert_eq!(graph.parameters.len(), 1);
    assert_eq!(graph.parameters[0].default, Some(json!("dev")));
}

#[test]
fn custom_resources_join_the_owner_referencing_them() {
    let registry = registry();
    let (_, graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      LoggingConfig:
        LogGroup: !Ref AppLogs
  AppLogs:
    Type: AWS::Logs::LogGroup
    Properties:
      RetentionInDays: 14
  Archive:
    Type: AWS::S3::Bucket
  ArchiveLogs:
    Type: AWS::Logs::LogGroup
    Properties:
      LogGroupName: !Ref Archive
"#,
    );

    assert_eq!(
        owner_of(&graph, EntryId::resource("AppLogs")),
        Some(Owner::resource("Fn"))
    );
    // no rule lets a bucket own a log group, whichever way the reference points
    assert_eq!(
        owner_of(&graph, EntryId::resource("ArchiveLogs")),
        Some(Owner::resource("ArchiveLogs"))
    );
    let ids: Vec<&str> = graph.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["Fn", "Archive", "ArchiveLogs"]);
}

#[test]
fn reference_cycles_terminate() {
    let registry = registry();
    let (_, graph) = parsed(
        &registry,
        r#"
Resources:
  Alpha:
    Type: AWS::SNS::Topic
    Properties:
      DisplayName: !GetAtt Beta.Arn
  Beta:
    Type: AWS::SNS::TopicPolicy
    Properties:
      Topics: [!Ref Alpha]
"#,
    );

    let ids: Vec<&str> = graph.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["Alpha"]);
    assert_eq!(
        owner_of(&graph, EntryId::resource("Beta")),
        Some(Owner::resource("Alpha"))
    );
}

#[test]
fn deleting_a_resource_cascades() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      Environment:
        Variables:
          TBL_TABLE: !Ref Tbl
      Policies:
        - Statement:
            - Effect: Allow
              Action: [dynamodb:GetItem]
              Resource: !GetAtt Tbl.Arn
  Tbl:
    Type: AWS::DynamoDB::Table
    Properties:
      BillingMode: PAY_PER_REQUEST
Outputs:
  TableName:
    Value: !Ref Tbl
  FunctionName:
    Value: !Ref Fn
"#,
    );
    assert!(graph.integration("ReadTable", "Fn", "Tbl").is_some());

    engine
        .apply(&mut template, &mut graph, &intent("{Action: DeleteResource, ResourceId: Tbl}"))
        .unwrap();

    assert_eq!(
        template.document(),
        &json!({
            "Resources": {
                "Fn": {
                    "Type": "AWS::Serverless::Function",
                    "Properties": {"Runtime": "nodejs20.x"}
                }
            },
            "Outputs": {
                "FunctionName": {"Value": {"Ref": "Fn"}}
            }
        })
    );
    assert!(graph.resource("Tbl").is_none());
    assert!(graph.integrations.is_empty());
    assert_eq!(graph.permissions_of("Fn").count(), 0);
    assert_eq!(graph.references_of("Fn").count(), 0);
    assert_eq!(graph, engine.parse(&template).unwrap());
}

#[test]
fn permissions_are_idempotent_and_removable() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(&registry, FUNCTION_AND_TABLE);
    let original = template.clone();
    let request = PermissionRequest::Typed {
        target_id: "Tbl".to_string(),
        permission_type: "Read".to_string(),
    };

    engine
        .add_permission(&mut template, &mut graph, "Fn", &request)
        .unwrap();
    let once = template.clone();
    engine
        .add_permission(&mut template, &mut graph, "Fn", &request)
        .unwrap();
    assert_eq!(template, once);

    let permissions: Vec<_> = graph.permissions_of("Fn").cloned().collect();
    assert_eq!(permissions.len(), 1);
    assert_eq!(
        permissions[0].kind,
        PermissionKind::Statement {
            effect: "Allow".to_string(),
            actions: vec![
                "dynamodb:GetItem".to_string(),
                "dynamodb:Query".to_string(),
                "dynamodb:Scan".to_string()
            ],
            resources: vec![json!({"Fn::GetAtt": ["Tbl", "Arn"]})],
        }
    );

    let selector = PermissionSelector::Matching(permissions[0].kind.clone());
    assert!(engine
        .delete_permission(&mut template, &mut graph, "Fn", &selector)
        .unwrap());
    assert_eq!(template, original);
    assert_eq!(graph.permissions_of("Fn").count(), 0);

    assert!(!engine
        .delete_permission(&mut template, &mut graph, "Fn", &selector)
        .unwrap());
}

#[test]
fn unsupported_permission_shapes_leave_the_template_untouched() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
service: orders
provider:
  name: aws
functions:
  hello:
    handler: handler.hello
"#,
    );
    let before = (template.clone(), graph.clone());

    let request = PermissionRequest::Managed {
        name: json!("arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess"),
    };
    let error = engine
        .add_permission(&mut template, &mut graph, "hello", &request)
        .unwrap_err();

    assert!(
        matches!(error, Error::NoLocation { what: "managed policies", .. }),
        "unexpected error {error:?}"
    );
    assert_eq!((template, graph), before);
}

#[test]
fn deleting_a_virtual_reference_removes_the_implying_grant() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      Policies:
        - Statement:
            - Effect: Allow
              Action: secretsmanager:GetSecretValue
              Resource: "*"
        - Statement:
            - Effect: Allow
              Action: [ssm:GetParameter]
              Resource: "*"
"#,
    );

    for id in ["Secrets", "ParameterStore"] {
        assert!(graph.resource(id).unwrap().is_virtual_reference_resource);
    }
    let variables: Vec<&str> = graph.references_of("Fn").map(|r| r.variable.as_str()).collect();
    assert_eq!(variables, vec!["Secrets", "ParameterStore"]);

    assert!(engine
        .delete_reference(&mut template, &mut graph, "Fn", "ParameterStore")
        .unwrap());

    assert_eq!(
        template.document()["Resources"]["Fn"]["Properties"]["Policies"],
        json!([{"Statement": [{
            "Effect": "Allow",
            "Action": "secretsmanager:GetSecretValue",
            "Resource": "*"
        }]}])
    );
    let variables: Vec<&str> = graph.references_of("Fn").map(|r| r.variable.as_str()).collect();
    assert_eq!(variables, vec!["Secrets"]);
}

#[test]
fn integrating_with_a_virtual_reference_resource_grants_its_default_permission() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
"#,
    );

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent("{Action: AddResource, ResourceType: Secrets, ResourceId: Secrets}"),
        )
        .unwrap();
    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: AddIntegration, IntegrationType: UseSecrets, \
                 SourceId: Fn, TargetId: Secrets}",
            ),
        )
        .unwrap();

    assert_eq!(
        template.document()["Resources"]["Fn"]["Properties"]["Policies"],
        json!([{"Statement": [{
            "Effect": "Allow",
            "Action": ["secretsmanager:GetSecretValue"],
            "Resource": ["*"]
        }]}])
    );
    let references: Vec<_> = graph.references_of("Fn").collect();
    assert_eq!(references.len(), 1);
    assert!(references[0].is_virtual_reference_resource);
    assert_eq!(references[0].target.resource_id(), Some("Secrets"));
}

#[test]
fn virtual_reference_resources_are_singletons() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
"#,
    );
    let before = (template.clone(), graph.clone());

    let error = engine
        .apply(
            &mut template,
            &mut graph,
            &intent("{Action: AddResource, ResourceType: Secrets, ResourceId: AppSecret}"),
        )
        .unwrap_err();
    assert!(
        matches!(
            error,
            Error::SingletonId { ref expected, ref found, .. }
                if expected == "Secrets" && found == "AppSecret"
        ),
        "unexpected error {error:?}"
    );
    assert_eq!((template.clone(), graph.clone()), before);

    assert!(engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: AddIntegration, IntegrationType: UseSecrets, \
                 SourceId: Fn, TargetId: AppSecret}",
            ),
        )
        .is_err());
    let ids: Vec<&str> = graph.resources.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["Fn"]);
}

#[test]
fn every_grant_implying_a_virtual_reference_is_removed_with_it() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      Policies:
        - Statement:
            - Effect: Allow
              Action: secretsmanager:GetSecretValue
              Resource: !Ref BackupSecret
        - Statement:
            - Effect: Allow
              Action: [secretsmanager:GetSecretValue, secretsmanager:DescribeSecret]
              Resource: "*"
        - Statement:
            - Effect: Allow
              Action: secretsmanager:GetSecretValue
              Resource: arn:aws:secretsmanager:*:*:secret:app/*
"#,
    );

    // both un-targeted grants land on the one singleton
    let secrets: Vec<&str> = graph
        .resources
        .iter()
        .filter(|r| r.resource_type == "Secrets")
        .map(|r| r.id.as_str())
        .collect();
    assert_eq!(secrets, vec!["Secrets"]);
    let targets: Vec<Option<&str>> = graph
        .permissions_of("Fn")
        .map(|p| p.target_resource())
        .collect();
    assert_eq!(targets, vec![Some("BackupSecret"), Some("Secrets"), Some("Secrets")]);
    let variables: Vec<&str> = graph.references_of("Fn").map(|r| r.variable.as_str()).collect();
    assert_eq!(variables, vec!["Secrets"]);

    assert!(engine
        .delete_reference(&mut template, &mut graph, "Fn", "Secrets")
        .unwrap());

    // the grant on another, undeclared secret overlaps in actions but is not implied
    assert_eq!(
        template.document()["Resources"]["Fn"]["Properties"]["Policies"],
        json!([{"Statement": [{
            "Effect": "Allow",
            "Action": "secretsmanager:GetSecretValue",
            "Resource": {"Ref": "BackupSecret"}
        }]}])
    );
    assert_eq!(graph.references_of("Fn").count(), 0);
    let targets: Vec<Option<&str>> = graph
        .permissions_of("Fn")
        .map(|p| p.target_resource())
        .collect();
    assert_eq!(targets, vec![Some("BackupSecret")]);
}

#[test]
fn placements_follow_deleted_subnets() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Vpc:
    Type: AWS::EC2::VPC
    Properties:
      CidrBlock: 10.0.0.0/16
  Subnet:
    Type: AWS::EC2::Subnet
    Properties:
      VpcId: !Ref Vpc
      CidrBlock: 10.0.1.0/24
  Sg:
    Type: AWS::EC2::SecurityGroup
    Properties:
      GroupDescription: function access
      VpcId: !Ref Vpc
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
"#,
    );

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: PutVirtualNetworkPlacement, ResourceId: Fn, \
                 VirtualNetworkId: Vpc, SubnetIds: [Subnet], SecurityGroupIds: [Sg]}",
            ),
        )
        .unwrap();
    assert_eq!(
        template.document()["Resources"]["Fn"]["Properties"]["VpcConfig"],
        json!({"SubnetIds": [{"Ref": "Subnet"}], "SecurityGroupIds": [{"Ref": "Sg"}]})
    );
    assert_eq!(
        graph.virtual_network_placements,
        engine.parse(&template).unwrap().virtual_network_placements
    );

    engine
        .apply(&mut template, &mut graph, &intent("{Action: DeleteResource, ResourceId: Subnet}"))
        .unwrap();

    let placement = graph.placement("Fn").unwrap();
    assert!(placement.subnet_ids.is_empty());
    assert_eq!(placement.security_group_ids, vec![Id::logical("Sg")]);
    assert_eq!(
        graph.virtual_network_placements,
        engine.parse(&template).unwrap().virtual_network_placements
    );
}

#[test]
fn added_resources_match_a_fresh_parse() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(&registry, FUNCTION_AND_TABLE);

    let add = intent(
        r#"
Action: AddResource
ResourceType: Function
ResourceId: Worker
Settings:
  MemorySize: 256
"#,
    );
    engine.apply(&mut template, &mut graph, &add).unwrap();

    assert_eq!(
        template.document()["Resources"]["Worker"],
        json!({
            "Type": "AWS::Serverless::Function",
            "Properties": {
                "Handler": "index.handler",
                "Runtime": "nodejs20.x",
                "MemorySize": 256
            }
        })
    );
    assert_eq!(
        owner_of(&graph, EntryId::resource("Worker")),
        Some(Owner::resource("Worker"))
    );

    let reparsed = engine.parse(&template).unwrap();
    assert_eq!(
        graph.resource("Worker").unwrap().settings,
        reparsed.resource("Worker").unwrap().settings
    );

    let error = engine.apply(&mut template, &mut graph, &add).unwrap_err();
    assert!(matches!(error, Error::DuplicateResource(ref id) if id == "Worker"));
}

#[test]
fn graphs_compare_resources_in_any_order() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Seed:
    Type: AWS::SSM::Parameter
    Properties:
      Type: String
      Value: seed
"#,
    );

    for text in [
        "{Action: AddResource, ResourceType: Function, ResourceId: Worker}",
        "{Action: AddResource, ResourceType: Table, ResourceId: Orders}",
        "{Action: AddIntegration, IntegrationType: ReadTable, SourceId: Worker, TargetId: Orders}",
    ] {
        engine.apply(&mut template, &mut graph, &intent(text)).unwrap();
    }

    let reparsed = engine.parse(&template).unwrap();
    let ids = |graph: &StackGraph| -> Vec<String> {
        graph.resources.iter().map(|r| r.id.clone()).collect()
    };
    assert_eq!(ids(&graph), vec!["Seed", "Worker", "Orders"]);
    assert_eq!(ids(&reparsed), vec!["Worker", "Orders", "Seed"]);
    assert_eq!(graph, reparsed);
}

#[test]
fn dependent_settings_fall_back_to_their_defaults() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
      Tracing: true
      TracingMode: Active
"#,
    );
    assert_eq!(
        graph.resource("Fn").unwrap().settings["TracingMode"].to_json(),
        json!("Active")
    );

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: UpdateResourceSetting, \
                 ResourceId: Fn, Setting: Tracing, Value: false}",
            ),
        )
        .unwrap();

    let properties = &template.document()["Resources"]["Fn"]["Properties"];
    assert_eq!(properties["Tracing"], json!(false));
    assert_eq!(properties["TracingMode"], json!("PassThrough"));
    assert_eq!(
        graph.resource("Fn").unwrap().settings["TracingMode"].to_json(),
        json!("PassThrough")
    );
}

#[test]
fn structural_settings_reparse_the_template() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Machine:
    Type: AWS::StepFunctions::StateMachine
    Properties:
      Definition:
        StartAt: First
        States:
          First: {Type: Pass, End: true}
"#,
    );

    engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: UpdateResourceSetting, ResourceId: Machine, Setting: Definition, \
                 Value: {StartAt: Done, States: {Done: {Type: Succeed}}}}",
            ),
        )
        .unwrap();

    let definition = json!({"StartAt": "Done", "States": {"Done": {"Type": "Succeed"}}});
    assert_eq!(
        template.document()["Resources"]["Machine"]["Properties"]["Definition"],
        definition
    );
    assert_eq!(
        graph.resource("Machine").unwrap().settings["Definition"].to_json(),
        definition
    );
    assert_eq!(graph, engine.parse(&template).unwrap());
}

#[test]
fn failed_changes_leave_template_and_graph_untouched() {
    let registry = registry();
    let engine = Engine::new(&registry);
    let (mut template, mut graph) = parsed(
        &registry,
        r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Runtime: nodejs20.x
  Jobs:
    Type: AWS::SQS::Queue
"#,
    );
    let before = (template.clone(), graph.clone());

    let error = engine
        .apply(
            &mut template,
            &mut graph,
            &intent(
                "{Action: AddIntegration, IntegrationType: ReadTable, \
                 SourceId: Fn, TargetId: Jobs}",
            ),
        )
        .unwrap_err();
    assert!(
        matches!(
            error,
            Error::IntegrationTarget { ref expected, ref found, .. }
                if expected == "Table" && found == "Queue"
        ),
        "unexpected error {error:?}"
    );

    let error = engine
        .apply(&mut template, &mut graph, &intent("{Action: DeleteResource, ResourceId: Missing}"))
        .unwrap_err();
    assert!(matches!(error, Error::UnknownResource(_)));

    assert_eq!((template, graph), before);
}
