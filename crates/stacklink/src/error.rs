use crate::path::PathError;
use crate::placeholder::PlaceholderError;
use crate::schema::SchemaError;
use crate::template::LoadError;

/// Errors of engine operations
///
/// Any error aborts the whole operation; the caller's template and graph stay untouched.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
    #[error("unknown resource {0}")]
    UnknownResource(String),
    #[error("resource type {0} is not declared")]
    UnknownResourceType(String),
    #[error("{resource_type} declares no setting {setting}")]
    UnknownSetting {
        resource_type: String,
        setting: String,
    },
    #[error("{resource_type} declares no integration type {integration_type}")]
    UnknownIntegrationType {
        resource_type: String,
        integration_type: String,
    },
    #[error("{resource_type} declares no permission type {permission_type}")]
    UnknownPermissionType {
        resource_type: String,
        permission_type: String,
    },
    #[error("{resource_type} does not support permissions")]
    UnsupportedPermissions { resource_type: String },
    #[error("{resource_type} does not support references")]
    UnsupportedReferences { resource_type: String },
    #[error("{resource_type} does not support virtual network placement")]
    UnsupportedPlacement { resource_type: String },
    #[error("resource {resource_id} has no facet {facet_type}/{facet_id}")]
    UnknownFacet {
        resource_id: String,
        facet_type: String,
        facet_id: String,
    },
    #[error("no integration {integration_type} from {source_id} to {target_id}")]
    UnknownIntegration {
        integration_type: String,
        source_id: String,
        target_id: String,
    },
    #[error("{integration_type} expects a {expected} target, {target_id} is a {found}")]
    IntegrationTarget {
        integration_type: String,
        target_id: String,
        expected: String,
        found: String,
    },
    #[error("resource {0} already exists")]
    DuplicateResource(String),
    #[error("{resource_type} is a singleton and must be added as {expected}, not {found}")]
    SingletonId {
        resource_type: String,
        expected: String,
        found: String,
    },
    #[error("integration {integration_type} from {source_id} owns no {path}")]
    VirtualTargetNotFound {
        integration_type: String,
        source_id: String,
        path: String,
    },
    #[error("unable to place {resource_id}: {reason}")]
    Placement { resource_id: String, reason: String },
    #[error("{owner} may not absorb {entry}")]
    GroupingIllegal { owner: String, entry: String },
    #[error("{resource_id} has no location for {what} in {format} templates")]
    NoLocation {
        resource_id: String,
        what: &'static str,
        format: crate::template::Format,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
