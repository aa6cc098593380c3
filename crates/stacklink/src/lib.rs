//! # stacklink - templates as resource graphs
//!
//! `stacklink` keeps two views of one AWS stack in step: a CloudFormation-family template
//! (plain CloudFormation/SAM, or the Serverless Framework layout) and a normalized graph
//! of resources, their settings and the wiring between them.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `stacklink` works internally.
//!
//! ### Terms
//!
//! - a **template entry** is one item of the `Resources`, `Conditions` or `Parameters`
//!   section (and, for Serverless, of `functions`), see [template::EntryId]
//! - a **resource** is a typed node of the graph; it *owns* the entries it was built from
//! - a **facet** is a repeatable part of a resource (one route, one state)
//! - an **integration** wires a source resource to a target resource
//! - a **custom resource** wraps entries no schema claims
//!
//! Every entry ends up owned by exactly one resource, facet or integration.
//!
//! ### Schemas
//!
//! Nothing about concrete resource types is hard-coded. A [schema::SchemaRegistry] is
//! loaded from YAML/JSON and tells the engine, per resource type, where instances live
//! (`Locator`), how settings are read (`Settings`), which edits to run for a change
//! (`Reactions`), how it may be wired (`IntegrationTypes`, `PermissionTypes`) and which
//! other entries it may absorb (`GroupingRules`).
//!
//! Paths inside schemas use a small query language ([path]) and may contain placeholders
//! ([placeholder]) such as `%{resourceId}` or `%{SETTING:Runtime|Upper}`.
//!
//! ### Parsing
//!
//! see [parse::parse]
//!
//! Resources are located and built first, then integrations. Every entry nobody claimed
//! is merged into an owner following the references between entries, constrained by
//! grouping rules. Entries without a legal owner become custom resources; reference
//! cycles are broken by converting one entry. Permissions, references and virtual network
//! placements are derived from the result.
//!
//! **Example**
//!
//! ```yaml
//! Resources:
//!   Fn:
//!     Type: AWS::Serverless::Function
//!     Properties:
//!       Environment:
//!         Variables:
//!           TBL_TABLE: !Ref Tbl
//!       Policies:
//!         - DynamoDBReadPolicy: {TableName: !Ref Tbl}
//!   Tbl:
//!     Type: AWS::DynamoDB::Table
//! ```
//!
//! | **entity**                  | **owns** | **derived from**          |
//! |-----------------------------|----------|---------------------------|
//! | resource `Fn` (Function)    | `Fn`     | locator                   |
//! | resource `Tbl` (Table)      | `Tbl`    | locator                   |
//! | reference `Fn → Tbl`        |          | `Environment.Variables`   |
//! | permission `Fn → Tbl`       |          | `Policies`                |
//!
//! ### Mutation
//!
//! see [Engine]
//!
//! A [mutation::Intent] (add a resource, update a setting, add an integration, ...) runs
//! the reactions its schema declares for it. The entries of the template are compared
//! before and after each edit so ownership stays exact without parsing again.
//! Permissions and references vary too much between dialects for declarative edits and
//! are written by dedicated synthesizers ([Engine::add_permission],
//! [Engine::add_reference]).
//!
pub mod engine;
pub mod error;
pub mod id;
pub mod model;
pub mod mutation;
pub mod parse;
pub mod path;
pub mod permissions;
pub mod placeholder;
pub mod references;
pub mod schema;
pub mod template;
mod util;
pub mod value;
mod visit;

pub use engine::Engine;
pub use error::{Error, Result};
pub use model::StackGraph;
pub use mutation::Intent;
pub use schema::SchemaRegistry;
pub use template::Template;
