use crate::error::Result;
use crate::model::StackGraph;
use crate::mutation::{Intent, Mutation};
use crate::permissions::{self, PermissionRequest, PermissionSelector};
use crate::references;
use crate::schema::SchemaRegistry;
use crate::template::Template;
use serde_json::Value as Json;

/// Entry point for callers holding a template and its parsed graph
///
/// Every operation works on copies of the template and the graph. The caller's values
/// are replaced only once the whole operation succeeded; on error they are untouched.
#[derive(Debug, Clone, Copy, derive_new::new)]
pub struct Engine<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> Engine<'r> {
    pub fn registry(&self) -> &'r SchemaRegistry {
        self.registry
    }

    pub fn parse(&self, template: &Template) -> Result<StackGraph> {
        crate::parse::parse(self.registry, template)
    }

    fn transaction<T>(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        operation: impl FnOnce(&'r SchemaRegistry, &mut Template, &mut StackGraph) -> Result<T>,
    ) -> Result<T> {
        let mut working_template = template.clone();
        let mut working_graph = graph.clone();
        let output = operation(self.registry, &mut working_template, &mut working_graph)?;
        *template = working_template;
        *graph = working_graph;
        Ok(output)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub fn apply(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        intent: &Intent,
    ) -> Result<()> {
        tracing::debug!(?intent, "apply");
        self.transaction(template, graph, |registry, template, graph| {
            Mutation::new(registry, template, graph).apply(intent)
        })
    }

    pub fn add_permission(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        resource_id: &str,
        request: &PermissionRequest,
    ) -> Result<()> {
        self.transaction(template, graph, |registry, template, graph| {
            permissions::add_permission(registry, template, graph, resource_id, request)
        })
    }

    /// Returns whether a permission was removed
    pub fn delete_permission(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        resource_id: &str,
        selector: &PermissionSelector,
    ) -> Result<bool> {
        self.transaction(template, graph, |registry, template, graph| {
            permissions::delete_permission(registry, template, graph, resource_id, selector)
        })
    }

    pub fn add_reference(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        source_id: &str,
        variable: &str,
        value: Json,
    ) -> Result<()> {
        self.transaction(template, graph, |registry, template, graph| {
            references::add_reference(registry, template, graph, source_id, variable, value)
        })
    }

    pub fn add_default_references(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        source_id: &str,
        target_id: &str,
    ) -> Result<()> {
        self.transaction(template, graph, |registry, template, graph| {
            references::add_default_references(registry, template, graph, source_id, target_id)
        })
    }

    /// Returns whether a reference was removed
    pub fn delete_reference(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        source_id: &str,
        variable: &str,
    ) -> Result<bool> {
        self.transaction(template, graph, |registry, template, graph| {
            references::delete_reference(registry, template, graph, source_id, variable)
        })
    }

    pub fn delete_resource(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        resource_id: &str,
    ) -> Result<()> {
        self.transaction(template, graph, |registry, template, graph| {
            Mutation::new(registry, template, graph).delete_resource(resource_id)
        })
    }

    /// Returns whether a facet was removed
    pub fn delete_facet(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        resource_id: &str,
        facet_type: &str,
        facet_id: &str,
    ) -> Result<bool> {
        self.transaction(template, graph, |registry, template, graph| {
            Mutation::new(registry, template, graph).delete_facet(resource_id, facet_type, facet_id)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_integration_setting(
        &self,
        template: &mut Template,
        graph: &mut StackGraph,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
        setting: &str,
        value: Json,
    ) -> Result<()> {
        self.transaction(template, graph, |registry, template, graph| {
            Mutation::new(registry, template, graph).update_integration_setting(
                integration_type,
                source_id,
                target_id,
                setting,
                value,
            )
        })
    }
}
