//! Graph mutations as template edits
//!
//! Each [Intent] selects the reactions its resource type declares for it and runs their
//! edits against the template. Ownership is kept in sync by diffing the template's
//! entries around every edit: new entries belong to the subject of the intent, vanished
//! entries are released.
//!
//! Settings flagged `ReparseRequired` rewrite structure that cannot be tracked
//! incrementally; the graph is parsed again after such an update.
mod operation;

use crate::error::{Error, Result};
use crate::id::{Classifier, Id};
use crate::model::{
    default_value, depends_on_met, insert_source, insert_target, Builder, Facet, Integration, Owner,
    Resource, StackGraph, VirtualNetworkPlacement,
};
use crate::placeholder::{Context, ContextKey, PlaceholderError, Strictness};
use crate::schema::{Action, ResourceTypeSchema, SchemaRegistry, SettingSchema, Trigger};
use crate::template::{self, EntryId, Format, Location, Template};
use crate::value::{Settings, Value};
use crate::{id, permissions, references};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value as Json;

/// A change to the graph
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "Action", rename_all_fields = "PascalCase")]
pub enum Intent {
    AddResource {
        resource_type: String,
        resource_id: String,
        #[serde(default)]
        settings: IndexMap<String, Json>,
    },
    DeleteResource {
        resource_id: String,
    },
    UpdateResourceSetting {
        resource_id: String,
        setting: String,
        value: Json,
    },
    AddFacet {
        resource_id: String,
        facet_type: String,
        facet_id: String,
        #[serde(default)]
        settings: IndexMap<String, Json>,
    },
    DeleteFacet {
        resource_id: String,
        facet_type: String,
        facet_id: String,
    },
    UpdateFacetSetting {
        resource_id: String,
        facet_type: String,
        facet_id: String,
        setting: String,
        value: Json,
    },
    AddIntegration {
        integration_type: String,
        source_id: String,
        target_id: String,
        #[serde(default)]
        facet_id: Option<String>,
        #[serde(default)]
        settings: IndexMap<String, Json>,
    },
    DeleteIntegration {
        integration_type: String,
        source_id: String,
        target_id: String,
    },
    UpdateIntegrationSetting {
        integration_type: String,
        source_id: String,
        target_id: String,
        setting: String,
        value: Json,
    },
    PutVirtualNetworkPlacement {
        resource_id: String,
        virtual_network_id: String,
        #[serde(default)]
        subnet_ids: Vec<String>,
        #[serde(default)]
        security_group_ids: Vec<String>,
    },
    DeleteVirtualNetworkPlacement {
        resource_id: String,
    },
}

/// One mutation in progress over a template and its graph
pub(crate) struct Mutation<'r, 'm> {
    registry: &'r SchemaRegistry,
    template: &'m mut Template,
    graph: &'m mut StackGraph,
}

impl<'r, 'm> Mutation<'r, 'm> {
    pub fn new(
        registry: &'r SchemaRegistry,
        template: &'m mut Template,
        graph: &'m mut StackGraph,
    ) -> Self {
        Self {
            registry,
            template,
            graph,
        }
    }

    pub fn apply(&mut self, intent: &Intent) -> Result<()> {
        match intent {
            Intent::AddResource {
                resource_type,
                resource_id,
                settings,
            } => self.add_resource(resource_type, resource_id, settings),
            Intent::DeleteResource { resource_id } => self.delete_resource(resource_id),
            Intent::UpdateResourceSetting {
                resource_id,
                setting,
                value,
            } => self.update_resource_setting(resource_id, setting, value.clone()),
            Intent::AddFacet {
                resource_id,
                facet_type,
                facet_id,
                settings,
            } => self.add_facet(resource_id, facet_type, facet_id, settings),
            Intent::DeleteFacet {
                resource_id,
                facet_type,
                facet_id,
            } => self.delete_facet(resource_id, facet_type, facet_id).map(drop),
            Intent::UpdateFacetSetting {
                resource_id,
                facet_type,
                facet_id,
                setting,
                value,
            } => {
                self.update_facet_setting(resource_id, facet_type, facet_id, setting, value.clone())
            }
            Intent::AddIntegration {
                integration_type,
                source_id,
                target_id,
                facet_id,
                settings,
            } => self.add_integration(
                integration_type,
                source_id,
                target_id,
                facet_id.as_deref(),
                settings,
            ),
            Intent::DeleteIntegration {
                integration_type,
                source_id,
                target_id,
            } => self.delete_integration(integration_type, source_id, target_id),
            Intent::UpdateIntegrationSetting {
                integration_type,
                source_id,
                target_id,
                setting,
                value,
            } => self.update_integration_setting(
                integration_type,
                source_id,
                target_id,
                setting,
                value.clone(),
            ),
            Intent::PutVirtualNetworkPlacement {
                resource_id,
                virtual_network_id,
                subnet_ids,
                security_group_ids,
            } => self.put_placement(
                resource_id,
                virtual_network_id,
                subnet_ids,
                security_group_ids,
            ),
            Intent::DeleteVirtualNetworkPlacement { resource_id } => {
                self.delete_placement(resource_id).map(drop)
            }
        }
    }

    fn format(&self) -> Format {
        self.template.format()
    }

    fn schema(&self, resource_type: &str) -> Result<&'r ResourceTypeSchema> {
        self.registry
            .get(resource_type)
            .ok_or_else(|| Error::UnknownResourceType(resource_type.to_string()))
    }

    fn resource(&self, resource_id: &str) -> Result<&Resource> {
        self.graph
            .resource(resource_id)
            .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))
    }

    fn resource_mut(&mut self, resource_id: &str) -> Result<&mut Resource> {
        self.graph
            .resource_mut(resource_id)
            .ok_or_else(|| Error::UnknownResource(resource_id.to_string()))
    }

    fn integration(
        &self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<&Integration> {
        self.graph
            .integration(integration_type, source_id, target_id)
            .ok_or_else(|| Error::UnknownIntegration {
                integration_type: integration_type.to_string(),
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
            })
    }

    /// Where relative reaction paths of `resource_id` start
    fn location_of(&self, resource_id: &str) -> Option<Location> {
        let entry = self.graph.resource(resource_id)?.primary_entry()?;
        self.template
            .contains(entry)
            .then(|| self.template.entry_location(entry))
    }

    fn base_context(&self) -> Context {
        let classifier = Classifier::new(&*self.template);
        Builder::new(&*self.template, &classifier, self.registry.region()).base_context()
    }

    fn resource_context(&self, resource_id: &str) -> Result<Context> {
        let resource = self.resource(resource_id)?;
        let classifier = Classifier::new(&*self.template);
        let builder = Builder::new(&*self.template, &classifier, self.registry.region());
        Ok(builder.resource_context(resource))
    }

    fn facet_context(&self, resource_id: &str, facet: &Facet) -> Result<Context> {
        let mut context = self.resource_context(resource_id)?;
        context.insert("facetId", facet.id.as_str());
        context.insert_all(
            ContextKey::FacetSetting,
            facet.settings.iter().map(|(k, v)| (k, v.to_json())),
        );
        Ok(context)
    }

    fn integration_context(&self, integration: &Integration) -> Result<Context> {
        let source = self.resource(&integration.source_id)?;
        let target = self.resource(&integration.target_id)?;
        let logical_id = source
            .primary_entry()
            .map_or(source.id.as_str(), |entry| entry.name.as_str());
        let mut context = self
            .base_context()
            .with("resourceId", source.id.as_str())
            .with("logicalId", logical_id);
        insert_source(&mut context, source);
        insert_target(&mut context, target);
        if let Some(facet_id) = &integration.facet_id {
            context.insert("facetId", facet_id.as_str());
        }
        context.insert_all(
            ContextKey::Setting,
            integration.settings.iter().map(|(k, v)| (k, v.to_json())),
        );
        Ok(context)
    }

    /// Convert a template fragment into a setting value
    fn classify(&self, value: &Json) -> Option<Value> {
        let classifier =
            Classifier::new(&*self.template).with_resources(self.graph.known_resources());
        Value::from_template(value, &classifier)
    }

    /// Resolve `given` settings on top of schema defaults, recording them in `context`
    fn initial_settings(
        &self,
        schemas: &IndexMap<String, SettingSchema>,
        given: &IndexMap<String, Json>,
        context: &mut Context,
        namespace: fn(String) -> ContextKey,
    ) -> Result<Settings> {
        let mut settings = Settings::new();
        for (name, schema) in schemas {
            if schema.facet_type.is_some() {
                continue;
            }
            let value = match given.get(name) {
                Some(value) => Some(value.clone()),
                None => match default_value(schema, context, Strictness::Strict) {
                    Ok(value) => value,
                    // defaults built from values that are not known yet are left unset
                    Err(Error::Placeholder(PlaceholderError::UndefinedContextKey(key))) => {
                        tracing::trace!(setting = %name, %key, "default not resolvable");
                        None
                    }
                    Err(e) => return Err(e),
                },
            };
            let Some(value) = value.filter(|value| !value.is_null()) else {
                continue;
            };
            context.insert(namespace(name.clone()), value.clone());
            if let Some(value) = self.classify(&value) {
                settings.insert(name.clone(), value);
            }
        }
        Ok(settings)
    }

    /// Run reactions, handing new entries to `owner` and releasing removed ones
    fn react(
        &mut self,
        owner: &Owner,
        schema: &ResourceTypeSchema,
        trigger: &Trigger<'_>,
        context: &Context,
        at: Option<&Location>,
    ) -> Result<()> {
        let before: IndexSet<EntryId> = self.template.entries().into_iter().collect();
        operation::react(self.template, schema, trigger, context, at)?;
        let after: IndexSet<EntryId> = self.template.entries().into_iter().collect();

        for entry in after.difference(&before) {
            match self.graph.partial_mut(owner) {
                Some(partial) => {
                    tracing::debug!(%entry, %owner, "claimed new entry");
                    partial.insert(entry.clone());
                }
                None => tracing::warn!(%entry, %owner, "new entry without owner"),
            }
        }
        for entry in before.difference(&after) {
            tracing::debug!(%entry, "released removed entry");
            self.graph.release(entry);
        }
        Ok(())
    }

    /// Remove the given entries from the template and the graph
    fn remove_entries(&mut self, entries: &[EntryId]) {
        for entry in entries {
            if self.template.remove_entry(entry).is_some() {
                tracing::debug!(%entry, "removed entry");
            }
            self.graph.release(entry);
        }
    }

    /// Derive references and permissions of a resource again
    fn refresh(&mut self, resource_id: &str) -> Result<()> {
        references::refresh(self.registry, &*self.template, self.graph, resource_id)?;
        permissions::refresh(self.registry, &*self.template, self.graph, resource_id)
    }

    fn reparse(&mut self) -> Result<()> {
        tracing::debug!("re-parsing after a structural edit");
        *self.graph = crate::parse::parse(self.registry, &*self.template)?;
        Ok(())
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(resource_type = resource_type, resource = resource_id)
    )]
    fn add_resource(
        &mut self,
        resource_type: &str,
        resource_id: &str,
        settings: &IndexMap<String, Json>,
    ) -> Result<()> {
        let schema = self.schema(resource_type)?;
        if self.graph.resource(resource_id).is_some()
            || self.template.resolve_logical(resource_id).is_some()
        {
            return Err(Error::DuplicateResource(resource_id.to_string()));
        }
        if let Some(virtual_reference) = &schema.virtual_reference {
            if virtual_reference.id != resource_id {
                return Err(Error::SingletonId {
                    resource_type: resource_type.to_string(),
                    expected: virtual_reference.id.clone(),
                    found: resource_id.to_string(),
                });
            }
        }

        let mut context = self
            .base_context()
            .with("resourceId", resource_id)
            .with("logicalId", resource_id);
        let mut resource = Resource::new(resource_type, resource_id);
        resource.is_virtual_reference_resource = schema.virtual_reference.is_some();
        resource.settings = self.initial_settings(
            &schema.settings,
            &IndexMap::new(),
            &mut context,
            ContextKey::Setting,
        )?;
        self.graph.resources.push(resource);

        let trigger = Trigger::new(Action::AddResource, self.format());
        self.react(&Owner::resource(resource_id), schema, &trigger, &context, None)?;
        tracing::info!(resource_type, resource = resource_id, "added resource");

        for (setting, value) in settings {
            self.update_resource_setting(resource_id, setting, value.clone())?;
        }
        self.refresh(resource_id)
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(resource = resource_id, setting = setting)
    )]
    fn update_resource_setting(
        &mut self,
        resource_id: &str,
        setting: &str,
        value: Json,
    ) -> Result<()> {
        let resource = self.resource(resource_id)?;
        let schema = self.schema(&resource.resource_type)?;
        let setting_schema = schema
            .settings
            .get(setting)
            .ok_or_else(|| Error::UnknownSetting {
                resource_type: resource.resource_type.clone(),
                setting: setting.to_string(),
            })?;
        let old = resource.settings.get(setting).map(Value::to_json);

        let mut context = self.resource_context(resource_id)?;
        context.insert("value", value.clone());
        if let Some(old) = &old {
            context.insert("oldValue", old.clone());
        }
        context.insert(ContextKey::Setting(setting.to_string()), value.clone());

        let trigger = Trigger {
            setting: Some(setting),
            old_value: old.as_ref(),
            new_value: Some(&value),
            ..Trigger::new(Action::UpdateResourceSetting, self.format())
        };
        let at = self.location_of(resource_id);
        self.react(&Owner::resource(resource_id), schema, &trigger, &context, at.as_ref())?;

        if setting_schema.reparse_required {
            return self.reparse();
        }

        let converted = self.classify(&value);
        let resource = self.resource_mut(resource_id)?;
        match converted {
            Some(value) => resource.settings.insert(setting.to_string(), value),
            None => resource.settings.shift_remove(setting),
        };
        tracing::debug!(resource = resource_id, setting, "updated setting");

        let context = self.resource_context(resource_id)?;
        for (dependent, default) in
            reset_dependents(&schema.settings, &context, ContextKey::Setting, setting)?
        {
            let current = self
                .resource(resource_id)?
                .settings
                .get(&dependent)
                .map_or(Json::Null, Value::to_json);
            if current != default {
                tracing::debug!(
                    resource = resource_id,
                    setting = %dependent,
                    "dependency no longer met, resetting"
                );
                self.update_resource_setting(resource_id, &dependent, default)?;
            }
        }
        self.refresh(resource_id)
    }

    fn facet(&self, resource_id: &str, facet_type: &str, facet_id: &str) -> Result<&Facet> {
        self.resource(resource_id)?
            .facet(facet_type, facet_id)
            .ok_or_else(|| Error::UnknownFacet {
                resource_id: resource_id.to_string(),
                facet_type: facet_type.to_string(),
                facet_id: facet_id.to_string(),
            })
    }

    fn add_facet(
        &mut self,
        resource_id: &str,
        facet_type: &str,
        facet_id: &str,
        settings: &IndexMap<String, Json>,
    ) -> Result<()> {
        let resource = self.resource(resource_id)?;
        let schema = self.schema(&resource.resource_type)?;
        let facet_schema = schema
            .facet_settings
            .get(facet_type)
            .ok_or_else(|| Error::UnknownSetting {
                resource_type: resource.resource_type.clone(),
                setting: facet_type.to_string(),
            })?;
        if resource.facet(facet_type, facet_id).is_some() {
            return Err(Error::DuplicateResource(format!("{resource_id}/{facet_type}/{facet_id}")));
        }

        let mut context = self.resource_context(resource_id)?;
        context.insert("facetId", facet_id);
        let mut facet = Facet::new(facet_type, facet_id);
        facet.settings = self.initial_settings(
            &facet_schema.settings,
            settings,
            &mut context,
            ContextKey::FacetSetting,
        )?;
        let owner = Owner::facet(resource_id, &facet);
        self.resource_mut(resource_id)?
            .facets
            .entry(facet_type.to_string())
            .or_default()
            .push(facet);

        let trigger = Trigger {
            facet_type: Some(facet_type),
            ..Trigger::new(Action::AddFacet, self.format())
        };
        let at = self.location_of(resource_id);
        self.react(&owner, schema, &trigger, &context, at.as_ref())?;
        tracing::info!(resource = resource_id, facet_type, facet = facet_id, "added facet");
        self.refresh(resource_id)
    }

    /// Remove a facet; a missing facet is not an error
    pub fn delete_facet(
        &mut self,
        resource_id: &str,
        facet_type: &str,
        facet_id: &str,
    ) -> Result<bool> {
        let resource = self.resource(resource_id)?;
        let Some(facet) = resource.facet(facet_type, facet_id) else {
            tracing::warn!(
                resource = resource_id,
                facet_type,
                facet = facet_id,
                "no such facet, nothing to delete"
            );
            return Ok(false);
        };
        let owner = Owner::facet(resource_id, facet);
        let context = self.facet_context(resource_id, facet)?;
        if let Some(schema) = self.registry.get(&resource.resource_type) {
            let trigger = Trigger {
                facet_type: Some(facet_type),
                ..Trigger::new(Action::DeleteFacet, self.format())
            };
            let at = self.location_of(resource_id);
            self.react(&owner, schema, &trigger, &context, at.as_ref())?;
        }

        let entries: Vec<EntryId> = self
            .facet(resource_id, facet_type, facet_id)?
            .template_partial
            .iter()
            .cloned()
            .collect();
        self.remove_entries(&entries);

        let resource = self.resource_mut(resource_id)?;
        if let Some(facets) = resource.facets.get_mut(facet_type) {
            facets.retain(|facet| facet.id != facet_id);
            if facets.is_empty() {
                resource.facets.shift_remove(facet_type);
            }
        }
        tracing::info!(resource = resource_id, facet_type, facet = facet_id, "deleted facet");
        self.refresh(resource_id)?;
        Ok(true)
    }

    fn update_facet_setting(
        &mut self,
        resource_id: &str,
        facet_type: &str,
        facet_id: &str,
        setting: &str,
        value: Json,
    ) -> Result<()> {
        let resource = self.resource(resource_id)?;
        let schema = self.schema(&resource.resource_type)?;
        let setting_schema = schema
            .setting(Some(facet_type), setting)
            .ok_or_else(|| Error::UnknownSetting {
                resource_type: format!("{}/{facet_type}", resource.resource_type),
                setting: setting.to_string(),
            })?;
        let facet = self.facet(resource_id, facet_type, facet_id)?;
        let owner = Owner::facet(resource_id, facet);
        let old = facet.settings.get(setting).map(Value::to_json);

        let mut context = self.facet_context(resource_id, facet)?;
        context.insert("value", value.clone());
        if let Some(old) = &old {
            context.insert("oldValue", old.clone());
        }
        context.insert(ContextKey::FacetSetting(setting.to_string()), value.clone());

        let trigger = Trigger {
            setting: Some(setting),
            facet_type: Some(facet_type),
            old_value: old.as_ref(),
            new_value: Some(&value),
            ..Trigger::new(Action::UpdateFacetSetting, self.format())
        };
        let at = self.location_of(resource_id);
        self.react(&owner, schema, &trigger, &context, at.as_ref())?;

        if setting_schema.reparse_required {
            return self.reparse();
        }

        let converted = self.classify(&value);
        let facet = self
            .resource_mut(resource_id)?
            .facet_mut(facet_type, facet_id)
            .ok_or_else(|| Error::UnknownFacet {
                resource_id: resource_id.to_string(),
                facet_type: facet_type.to_string(),
                facet_id: facet_id.to_string(),
            })?;
        match converted {
            Some(value) => facet.settings.insert(setting.to_string(), value),
            None => facet.settings.shift_remove(setting),
        };

        if let Some(facet_schema) = schema.facet_settings.get(facet_type) {
            let facet = self.facet(resource_id, facet_type, facet_id)?;
            let context = self.facet_context(resource_id, facet)?;
            let reset = reset_dependents(
                &facet_schema.settings,
                &context,
                ContextKey::FacetSetting,
                setting,
            )?;
            for (dependent, default) in reset {
                let current = self
                    .facet(resource_id, facet_type, facet_id)?
                    .settings
                    .get(&dependent)
                    .map_or(Json::Null, Value::to_json);
                if current != default {
                    self.update_facet_setting(
                        resource_id,
                        facet_type,
                        facet_id,
                        &dependent,
                        default,
                    )?;
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(integration_type = integration_type, source = source_id, target = target_id)
    )]
    fn add_integration(
        &mut self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
        facet_id: Option<&str>,
        settings: &IndexMap<String, Json>,
    ) -> Result<()> {
        let source = self.resource(source_id)?;
        let target = self.resource(target_id)?;
        let source_schema = self.schema(&source.resource_type)?;
        let schema = source_schema
            .integration_types
            .get(integration_type)
            .ok_or_else(|| Error::UnknownIntegrationType {
                resource_type: source.resource_type.clone(),
                integration_type: integration_type.to_string(),
            })?;
        if target.resource_type != schema.target_type {
            return Err(Error::IntegrationTarget {
                integration_type: integration_type.to_string(),
                target_id: target_id.to_string(),
                expected: schema.target_type.clone(),
                found: target.resource_type.clone(),
            });
        }
        if self.graph.integration(integration_type, source_id, target_id).is_some() {
            tracing::debug!(
                integration_type,
                source = source_id,
                target = target_id,
                "integration exists"
            );
            return Ok(());
        }
        let target_type = target.resource_type.clone();

        let mut integration = Integration::new(integration_type, source_id, target_id);
        integration.facet_type = schema.facet_type.clone();
        integration.facet_id = facet_id.map(str::to_string);
        let mut context = self.integration_context(&integration)?;
        integration.settings =
            self.initial_settings(&schema.settings, settings, &mut context, ContextKey::Setting)?;
        let owner = integration.owner();
        self.graph.integrations.push(integration);

        let trigger = Trigger {
            integration_type: Some(integration_type),
            target_type: Some(&target_type),
            ..Trigger::new(Action::AddIntegration, self.format())
        };
        let at = self.location_of(source_id);
        self.react(&owner, source_schema, &trigger, &context, at.as_ref())?;

        for permission_type in &schema.permissions {
            let request = permissions::PermissionRequest::Typed {
                target_id: target_id.to_string(),
                permission_type: permission_type.clone(),
            };
            permissions::add_permission(
                self.registry,
                self.template,
                self.graph,
                source_id,
                &request,
            )?;
        }
        if schema.references {
            references::add_default_references(
                self.registry,
                self.template,
                self.graph,
                source_id,
                target_id,
            )?;
        }

        tracing::info!(
            integration_type,
            source = source_id,
            target = target_id,
            "added integration"
        );
        self.refresh(source_id)
    }

    #[tracing::instrument(
        level = "trace",
        skip_all,
        fields(integration_type = integration_type, source = source_id, target = target_id)
    )]
    fn delete_integration(
        &mut self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
    ) -> Result<()> {
        let integration = self.integration(integration_type, source_id, target_id)?;
        let owner = integration.owner();
        let context = self.integration_context(integration)?;
        let source_type = self.resource(source_id)?.resource_type.clone();
        let target_type = self.resource(target_id)?.resource_type.clone();

        let source_schema = self.registry.get(&source_type);
        if let Some(source_schema) = source_schema {
            let trigger = Trigger {
                integration_type: Some(integration_type),
                target_type: Some(&target_type),
                ..Trigger::new(Action::DeleteIntegration, self.format())
            };
            let at = self.location_of(source_id);
            self.react(&owner, source_schema, &trigger, &context, at.as_ref())?;
        }

        let entries: Vec<EntryId> = self
            .integration(integration_type, source_id, target_id)?
            .template_partial
            .iter()
            .cloned()
            .collect();
        self.remove_entries(&entries);

        let integration_schema =
            source_schema.and_then(|schema| schema.integration_types.get(integration_type));
        if let Some(schema) = integration_schema {
            if !schema.permissions.is_empty() {
                permissions::delete_targeting(
                    self.registry,
                    self.template,
                    self.graph,
                    source_id,
                    target_id,
                )?;
            }
            if schema.references {
                self.delete_references_between(source_id, target_id)?;
            }
        }

        self.graph
            .integrations
            .retain(|integration| !integration.is(integration_type, source_id, target_id));
        tracing::info!(
            integration_type,
            source = source_id,
            target = target_id,
            "deleted integration"
        );
        self.refresh(source_id)
    }

    fn delete_references_between(&mut self, source_id: &str, target_id: &str) -> Result<()> {
        let variables: Vec<String> = self
            .graph
            .references_of(source_id)
            .filter(|r| r.target.resource_id() == Some(target_id))
            .map(|r| r.variable.clone())
            .collect();
        for variable in variables {
            references::delete_reference(
                self.registry,
                self.template,
                self.graph,
                source_id,
                &variable,
            )?;
        }
        Ok(())
    }

    pub fn update_integration_setting(
        &mut self,
        integration_type: &str,
        source_id: &str,
        target_id: &str,
        setting: &str,
        value: Json,
    ) -> Result<()> {
        let integration = self.integration(integration_type, source_id, target_id)?;
        let source_type = self.resource(source_id)?.resource_type.clone();
        let target_type = self.resource(target_id)?.resource_type.clone();
        let source_schema = self.schema(&source_type)?;
        let setting_schema = source_schema
            .integration_types
            .get(integration_type)
            .and_then(|schema| schema.settings.get(setting))
            .ok_or_else(|| Error::UnknownSetting {
                resource_type: integration_type.to_string(),
                setting: setting.to_string(),
            })?;
        let owner = integration.owner();
        let old = integration.settings.get(setting).map(Value::to_json);
        let at = integration
            .virtual_target
            .clone()
            .or_else(|| self.location_of(source_id));

        let mut context = self.integration_context(integration)?;
        context.insert("value", value.clone());
        if let Some(old) = &old {
            context.insert("oldValue", old.clone());
        }
        context.insert(ContextKey::Setting(setting.to_string()), value.clone());

        let trigger = Trigger {
            setting: Some(setting),
            integration_type: Some(integration_type),
            target_type: Some(&target_type),
            old_value: old.as_ref(),
            new_value: Some(&value),
            ..Trigger::new(Action::UpdateIntegrationSetting, self.format())
        };
        self.react(&owner, source_schema, &trigger, &context, at.as_ref())?;

        if setting_schema.reparse_required {
            return self.reparse();
        }

        let converted = self.classify(&value);
        if let Some(integration) =
            self.graph.integration_mut(integration_type, source_id, target_id)
        {
            match converted {
                Some(value) => integration.settings.insert(setting.to_string(), value),
                None => integration.settings.shift_remove(setting),
            };
        }
        tracing::debug!(
            integration_type,
            source = source_id,
            target = target_id,
            setting,
            "updated setting"
        );
        Ok(())
    }

    /// `Ref` expression of a resource's primary entry
    fn reference_to(&self, resource_id: &str) -> Result<Json> {
        let resource = self.resource(resource_id)?;
        let logical_id = resource
            .primary_entry()
            .map_or(resource.id.as_str(), |entry| entry.name.as_str());
        Ok(crate::util::reference(logical_id))
    }

    fn put_placement(
        &mut self,
        resource_id: &str,
        virtual_network_id: &str,
        subnet_ids: &[String],
        security_group_ids: &[String],
    ) -> Result<()> {
        let resource = self.resource(resource_id)?;
        let schema = self.schema(&resource.resource_type)?;
        if schema.virtual_network_placements.is_none() {
            return Err(Error::UnsupportedPlacement {
                resource_type: resource.resource_type.clone(),
            });
        }

        let mut context = self.resource_context(resource_id)?;
        context.insert("virtualNetworkId", virtual_network_id);
        context.insert("virtualNetworkRef", self.reference_to(virtual_network_id)?);
        let subnet_refs = subnet_ids
            .iter()
            .map(|id| self.reference_to(id))
            .collect::<Result<Vec<_>>>()?;
        let security_group_refs = security_group_ids
            .iter()
            .map(|id| self.reference_to(id))
            .collect::<Result<Vec<_>>>()?;
        context.insert("subnetIds", subnet_ids.to_vec());
        context.insert("subnetRefs", subnet_refs);
        context.insert("securityGroupIds", security_group_ids.to_vec());
        context.insert("securityGroupRefs", security_group_refs);

        let trigger = Trigger::new(Action::PutVirtualNetworkPlacement, self.format());
        let at = self.location_of(resource_id);
        self.react(&Owner::resource(resource_id), schema, &trigger, &context, at.as_ref())?;

        self.graph
            .virtual_network_placements
            .retain(|placement| placement.resource_id != resource_id);
        self.graph.virtual_network_placements.push(VirtualNetworkPlacement {
            resource_id: resource_id.to_string(),
            virtual_network_id: Id::logical(virtual_network_id),
            subnet_ids: subnet_ids.iter().map(Id::logical).collect(),
            security_group_ids: security_group_ids.iter().map(Id::logical).collect(),
        });
        tracing::info!(resource = resource_id, network = virtual_network_id, "placed resource");
        Ok(())
    }

    fn delete_placement(&mut self, resource_id: &str) -> Result<bool> {
        let resource = self.resource(resource_id)?;
        if self.graph.placement(resource_id).is_none() {
            tracing::warn!(resource = resource_id, "not placed, nothing to delete");
            return Ok(false);
        }
        if let Some(schema) = self.registry.get(&resource.resource_type) {
            let context = self.resource_context(resource_id)?;
            let trigger = Trigger::new(Action::DeleteVirtualNetworkPlacement, self.format());
            let at = self.location_of(resource_id);
            self.react(&Owner::resource(resource_id), schema, &trigger, &context, at.as_ref())?;
        }
        self.graph
            .virtual_network_placements
            .retain(|placement| placement.resource_id != resource_id);
        tracing::info!(resource = resource_id, "removed placement");
        Ok(true)
    }

    /// Remove a resource together with everything wired to it
    #[tracing::instrument(level = "trace", skip_all, fields(resource = resource_id))]
    pub fn delete_resource(&mut self, resource_id: &str) -> Result<()> {
        self.resource(resource_id)?;

        let touching: Vec<(String, String, String)> = self
            .graph
            .integrations
            .iter()
            .filter(|integration| integration.touches(resource_id))
            .map(|i| (i.integration_type.clone(), i.source_id.clone(), i.target_id.clone()))
            .collect();
        for (integration_type, source_id, target_id) in touching {
            self.delete_integration(&integration_type, &source_id, &target_id)?;
        }

        let granting: IndexSet<String> = self
            .graph
            .permissions
            .iter()
            .filter(|p| p.resource_id != resource_id && p.target_resource() == Some(resource_id))
            .map(|p| p.resource_id.clone())
            .collect();
        for source_id in granting {
            permissions::delete_targeting(
                self.registry,
                self.template,
                self.graph,
                &source_id,
                resource_id,
            )?;
        }

        let referencing: IndexSet<String> = self
            .graph
            .references
            .iter()
            .filter(|r| r.resource_id != resource_id && r.target.resource_id() == Some(resource_id))
            .map(|r| r.resource_id.clone())
            .collect();
        for source_id in referencing {
            self.delete_references_between(&source_id, resource_id)?;
        }

        self.detach_placements(resource_id)?;
        if self.graph.placement(resource_id).is_some() {
            self.delete_placement(resource_id)?;
        }

        let resource = self.resource(resource_id)?;
        if let Some(schema) = self.registry.get(&resource.resource_type) {
            let context = self.resource_context(resource_id)?;
            let trigger = Trigger::new(Action::DeleteResource, self.format());
            let at = self.location_of(resource_id);
            self.react(&Owner::resource(resource_id), schema, &trigger, &context, at.as_ref())?;
        }

        let resource = self.resource(resource_id)?;
        let entries: Vec<EntryId> = resource
            .template_partial
            .iter()
            .chain(resource.facets().flat_map(|facet| &facet.template_partial))
            .cloned()
            .collect();
        self.remove_outputs(&entries);
        self.remove_entries(&entries);

        self.graph.resources.retain(|resource| resource.id != resource_id);
        self.graph.permissions.retain(|p| p.resource_id != resource_id);
        self.graph.references.retain(|r| r.resource_id != resource_id);
        tracing::info!(resource = resource_id, entries = entries.len(), "deleted resource");
        Ok(())
    }

    /// Drop a removed network, subnet or security group from other resources' placements
    fn detach_placements(&mut self, resource_id: &str) -> Result<()> {
        let affected: Vec<VirtualNetworkPlacement> = self
            .graph
            .virtual_network_placements
            .iter()
            .filter(|p| p.resource_id != resource_id && p.mentions(resource_id))
            .cloned()
            .collect();

        for placement in affected {
            let keep = |ids: &[Id]| -> Vec<String> {
                ids.iter()
                    .filter_map(Id::resource_id)
                    .filter(|id| *id != resource_id)
                    .map(str::to_string)
                    .collect()
            };
            let subnet_ids = keep(&placement.subnet_ids);
            let security_group_ids = keep(&placement.security_group_ids);
            let network = placement
                .virtual_network_id
                .resource_id()
                .filter(|id| *id != resource_id);

            match network {
                Some(network) if !(subnet_ids.is_empty() && security_group_ids.is_empty()) => {
                    self.put_placement(
                        &placement.resource_id,
                        network,
                        &subnet_ids,
                        &security_group_ids,
                    )?
                }
                _ => {
                    self.delete_placement(&placement.resource_id)?;
                }
            }
        }
        Ok(())
    }

    /// Remove outputs mentioning any of `entries`
    fn remove_outputs(&mut self, entries: &[EntryId]) {
        let outputs = match self.format() {
            Format::Plain => Location::root().child("Outputs"),
            Format::Serverless => Location::root().child("resources").child("Outputs"),
        };
        let stale: Vec<String> = {
            let Some(Json::Object(declared)) = template::get(self.template.document(), &outputs)
            else {
                return;
            };
            let classifier = Classifier::new(&*self.template);
            declared
                .iter()
                .filter(|(_, output)| {
                    id::mentions(&classifier, output)
                        .iter()
                        .any(|mention| entries.contains(&mention.entry))
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        let document = self.template.document_mut();
        for name in stale {
            tracing::debug!(output = %name, "removed output of deleted entry");
            template::remove(document, &outputs.child(name.as_str()));
        }
        template::prune_empty(document, &outputs, 0);
    }
}

/// Dependents of `changed` whose `DependsOn` no longer holds, with their defaults
fn reset_dependents(
    schemas: &IndexMap<String, SettingSchema>,
    context: &Context,
    namespace: fn(String) -> ContextKey,
    changed: &str,
) -> Result<Vec<(String, Json)>> {
    let mut reset = vec![];
    for (name, schema) in schemas {
        if !schema.depends_on.contains_key(changed) || depends_on_met(schema, context, namespace) {
            continue;
        }
        let default =
            default_value(schema, context, Strictness::AllowUndefined)?.unwrap_or(Json::Null);
        reset.push((name.clone(), default));
    }
    Ok(reset)
}
