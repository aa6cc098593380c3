use crate::error::Result;
use crate::id::{mentions, Classifier, KnownResource, Mention};
use crate::model::{
    insert_source, insert_target, Builder, Integration, Owner, Owners, Resource, StackGraph,
    TemplatePartial,
};
use crate::placeholder::ContextKey;
use crate::schema::{CompiledGroupingRule, SchemaRegistry};
use crate::template::{EntryId, Section, Template};
use indexmap::IndexMap;
use std::collections::HashSet;

/// CloudFormation types that only exist for deployment tooling bookkeeping
const NOISE_TYPES: &[&str] = &["AWS::CDK::Metadata"];
/// Entries the Serverless Framework adds to every stack
const NOISE_NAMES: &[&str] = &["ServerlessDeploymentBucket", "ServerlessDeploymentBucketPolicy"];

/// Whether an entry is dropped from the graph
pub fn is_noise_entry(template: &Template, entry: &EntryId) -> bool {
    entry.section == Section::Resources
        && (NOISE_NAMES.contains(&entry.name.as_str())
            || NOISE_TYPES.contains(&template.entry_type(entry).as_str()))
}

/// State of one parse run
///
/// All ownership changes go through [ParseSession::claim], so an entry is never owned
/// twice and every owner's `template_partial` matches the ownership map.
pub(crate) struct ParseSession<'r> {
    registry: &'r SchemaRegistry,
    template: &'r Template,
    resources: IndexMap<String, Resource>,
    integrations: Vec<Integration>,
    owners: IndexMap<EntryId, Owner>,
    /// entry → entries it mentions
    relationships: IndexMap<EntryId, Vec<Mention>>,
    /// entries merged through a stop-chaining rule; they do not pass ownership on
    terminal: HashSet<EntryId>,
    /// stop-chaining rules already consumed by an owner
    rules_in_use: HashSet<(Owner, usize)>,
}

impl<'r> ParseSession<'r> {
    pub fn new(registry: &'r SchemaRegistry, template: &'r Template) -> Self {
        Self {
            registry,
            template,
            resources: Default::default(),
            integrations: Default::default(),
            owners: Default::default(),
            relationships: Default::default(),
            terminal: Default::default(),
            rules_in_use: Default::default(),
        }
    }

    fn known_resources(&self) -> Vec<KnownResource> {
        self.resources.values().map(Resource::known).collect()
    }

    /// Locate and build every typed resource
    pub fn locate_resources(&mut self) -> Result<()> {
        // a first pass learns physical names so the second one can classify them
        let first_pass = self.build_resources(&Classifier::new(self.template))?;
        let known: Vec<_> = first_pass.iter().map(Resource::known).collect();
        let classifier = Classifier::new(self.template).with_resources(known);

        for resource in self.build_resources(&classifier)? {
            self.add_resource(resource);
        }
        Ok(())
    }

    fn build_resources(&self, classifier: &Classifier<'_>) -> Result<Vec<Resource>> {
        let builder = Builder::new(self.template, classifier, self.registry.region());
        let mut resources = vec![];
        for (resource_type, schema) in self.registry.resource_types() {
            for located in builder.locate(schema)? {
                tracing::trace!(%resource_type, location = %located.node.location, "locator hit");
                resources.push(builder.build(resource_type, schema, &located)?);
            }
        }
        Ok(resources)
    }

    fn add_resource(&mut self, mut resource: Resource) {
        let entries = std::mem::take(&mut resource.template_partial);
        let facet_entries: Vec<(Owner, TemplatePartial)> = resource
            .facets
            .values_mut()
            .flatten()
            .map(|facet| {
                let owner = Owner::facet(&resource.id, facet);
                (owner, std::mem::take(&mut facet.template_partial))
            })
            .collect();

        let id = resource.id.clone();
        match self.resources.get_mut(&id) {
            Some(existing) if existing.resource_type == resource.resource_type => {
                tracing::debug!(%id, "coalescing singleton hit");
                existing.coalesce(resource);
            }
            Some(existing) => {
                tracing::warn!(
                    %id,
                    existing = %existing.resource_type,
                    ignored = %resource.resource_type,
                    "resource id used by two resource types"
                );
                return;
            }
            None => {
                self.resources.insert(id.clone(), resource);
            }
        }

        let owner = Owner::resource(&id);
        for entry in entries {
            self.claim(&entry, &owner);
        }
        for (owner, entries) in facet_entries {
            for entry in entries {
                self.claim(&entry, &owner);
            }
        }
    }

    /// Locate integrations of every integration type
    pub fn locate_integrations(&mut self) -> Result<()> {
        let owners = Owners(self.owners.clone());
        let known = self.known_resources();
        let classifier = Classifier::new(self.template)
            .with_resources(known)
            .resolving_owner(&owners);
        let builder = Builder::new(self.template, &classifier, self.registry.region());

        let mut found = vec![];
        for (source_type, schema) in self.registry.resource_types() {
            for (integration_type, integration_schema) in &schema.integration_types {
                let Some(locator) = &integration_schema.locator else {
                    continue;
                };

                // (source id, hit)
                let mut hits = vec![];
                if let Some(source) = &integration_schema.source {
                    let context = builder.base_context();
                    for hit in builder.select(locator, None, &context)? {
                        let expression = builder.select(source, Some(&hit), &context)?;
                        let Some(source_id) = expression.first().and_then(|node| {
                            classifier.classify(node.value).resource_id().map(str::to_string)
                        }) else {
                            continue;
                        };
                        hits.push((source_id, hit));
                    }
                } else {
                    for resource in self.resources.values() {
                        if &resource.resource_type != source_type {
                            continue;
                        }
                        let Some(entry) = resource.primary_entry() else {
                            continue;
                        };
                        let Some(fragment) = builder.fragment(entry) else {
                            continue;
                        };
                        let context = builder
                            .base_context()
                            .with("resourceId", resource.id.as_str());
                        for hit in builder.select(locator, Some(&fragment), &context)? {
                            hits.push((resource.id.clone(), hit));
                        }
                    }
                }

                for (source_id, hit) in hits {
                    let Some(source) = self.resources.get(&source_id) else {
                        continue;
                    };
                    if &source.resource_type != source_type {
                        continue;
                    }

                    let mut context = builder.base_context();
                    let target = match &integration_schema.target {
                        Some(target) => {
                            builder.select(target, Some(&hit), &context)?.into_iter().next()
                        }
                        None => Some(hit.clone()),
                    };
                    let Some(target_id) = target.and_then(|node| {
                        classifier.classify(node.value).resource_id().map(str::to_string)
                    }) else {
                        tracing::trace!(
                            %integration_type,
                            location = %hit.location,
                            "integration target unresolved"
                        );
                        continue;
                    };
                    let Some(target) = self.resources.get(&target_id) else {
                        continue;
                    };
                    if target.resource_type != integration_schema.target_type {
                        tracing::trace!(
                            %integration_type,
                            %target_id,
                            "integration target has another type"
                        );
                        continue;
                    }

                    insert_source(&mut context, source);
                    insert_target(&mut context, target);

                    let mut integration =
                        Integration::new(integration_type.as_str(), source_id, target_id);
                    integration.facet_type = integration_schema.facet_type.clone();
                    integration.settings = builder
                        .resolve_settings(
                            &integration_schema.settings,
                            &hit,
                            &mut context,
                            ContextKey::Setting,
                        )?
                        .settings;
                    let located = builder.located(hit);
                    if located.is_entry {
                        integration.template_partial.extend(located.entry);
                    }
                    found.push(integration);
                }
            }
        }

        for mut integration in found {
            let entries = std::mem::take(&mut integration.template_partial);
            let owner = integration.owner();
            if !self
                .integrations
                .iter()
                .any(|i| {
                    i.is(
                        &integration.integration_type,
                        &integration.source_id,
                        &integration.target_id,
                    )
                })
            {
                tracing::debug!(integration = %owner, "integration");
                self.integrations.push(integration);
            }
            for entry in entries {
                self.claim(&entry, &owner);
            }
        }
        Ok(())
    }

    /// Reference graph over the whole template
    pub fn build_relationships(&mut self) {
        let known = self.known_resources();
        let classifier = Classifier::new(self.template).with_resources(known);

        for entry in self.template.entries() {
            if is_noise_entry(self.template, &entry) {
                continue;
            }
            let Some(value) = self.template.entry(&entry) else {
                continue;
            };
            let found = mentions(&classifier, value)
                .into_iter()
                .filter(|mention| mention.entry != entry)
                .collect();
            self.relationships.insert(entry, found);
        }
    }

    /// Fixpoint merge of unowned entries
    pub fn resolve_ownership(&mut self) {
        let mut remaining: Vec<EntryId> = self
            .relationships
            .keys()
            .filter(|entry| !self.owners.contains_key(*entry))
            .cloned()
            .collect();

        while !remaining.is_empty() {
            let mut progress = false;
            let mut index = 0;
            while index < remaining.len() {
                let Some(candidates) = self.candidates(&remaining[index], &remaining) else {
                    index += 1;
                    continue;
                };

                let entry = remaining.remove(index);
                progress = true;
                match self.choose(&entry, &candidates) {
                    Some((owner, rule)) => self.merge(&entry, owner, rule),
                    None => {
                        tracing::debug!(%entry, "no legal owner, standalone custom resource");
                        self.promote(&entry);
                    }
                }
            }

            if !progress {
                let entry = remaining.remove(0);
                self.force_convert(&entry);
            }
        }
    }

    /// Owners the entry could be merged into; `None` while an edge is still unowned
    fn candidates(&self, entry: &EntryId, remaining: &[EntryId]) -> Option<Vec<Owner>> {
        let edges = self.edges(entry);
        if edges.iter().any(|edge| remaining.contains(edge)) {
            return None;
        }

        let mut candidates = vec![];
        for edge in edges {
            if self.terminal.contains(&edge) {
                continue;
            }
            if let Some(owner) = self.owners.get(&edge) {
                if !candidates.contains(owner) {
                    candidates.push(owner.clone());
                }
            }
        }
        Some(candidates)
    }

    /// Edges that decide ownership
    ///
    /// Conditions and parameters go where their users go; everything else follows its own
    /// strong mentions.
    fn edges(&self, entry: &EntryId) -> Vec<EntryId> {
        match entry.section {
            Section::Conditions | Section::Parameters => self
                .relationships
                .iter()
                .filter(|(_, found)| found.iter().any(|mention| &mention.entry == entry))
                .map(|(user, _)| user.clone())
                .collect(),
            Section::Resources | Section::Functions => self
                .relationships
                .get(entry)
                .into_iter()
                .flatten()
                .filter(|mention| !mention.weak)
                .map(|mention| mention.entry.clone())
                .collect(),
        }
    }

    /// Priority: integration, typed resource (or facet), custom resource
    fn choose(
        &self,
        entry: &EntryId,
        candidates: &[Owner],
    ) -> Option<(Owner, &'r CompiledGroupingRule)> {
        let target_type = self.template.entry_type(entry);
        let resource_ids: Vec<&str> = candidates.iter().filter_map(Owner::resource_id).collect();

        let integrations = self
            .integrations
            .iter()
            .filter(|i| {
                resource_ids.contains(&i.source_id.as_str())
                    && resource_ids.contains(&i.target_id.as_str())
            })
            .map(Integration::owner);

        let typed = candidates.iter().filter(|owner| !self.is_custom(owner)).cloned();
        let custom = candidates.iter().filter(|owner| self.is_custom(owner)).cloned();

        integrations
            .chain(typed)
            .chain(custom)
            .find_map(|owner| {
                let rule = self.permitted(&owner, &target_type)?;
                Some((owner, rule))
            })
    }

    fn is_custom(&self, owner: &Owner) -> bool {
        match owner {
            Owner::Resource { resource_id } => self
                .resources
                .get(resource_id)
                .is_some_and(Resource::is_custom),
            _ => false,
        }
    }

    fn owner_type(&self, owner: &Owner) -> Option<String> {
        Some(match owner {
            Owner::Resource { resource_id } => {
                self.resources.get(resource_id)?.grouping_type().to_string()
            }
            Owner::Facet { facet_type, .. } => facet_type.clone(),
            Owner::Integration {
                integration_type, ..
            } => integration_type.clone(),
        })
    }

    /// The first grouping rule allowing `owner` to absorb an entry of `target_type`
    fn permitted(&self, owner: &Owner, target_type: &str) -> Option<&'r CompiledGroupingRule> {
        let owner_type = self.owner_type(owner)?;
        self.registry.rules().iter().find(|rule| {
            rule.permits(&owner_type, target_type)
                && !(rule.stop_chaining && self.rules_in_use.contains(&(owner.clone(), rule.index)))
        })
    }

    fn merge(&mut self, entry: &EntryId, owner: Owner, rule: &CompiledGroupingRule) {
        tracing::debug!(%entry, %owner, rule = rule.index, "merge");
        if self.claim(entry, &owner) && rule.stop_chaining {
            self.terminal.insert(entry.clone());
            self.rules_in_use.insert((owner, rule.index));
        }
    }

    /// Turn an entry into a standalone custom resource
    fn promote(&mut self, entry: &EntryId) {
        let cfn_type = self.template.entry_type(entry);
        let mut resource = Resource::custom(entry.clone(), &cfn_type);
        let mut suffix = 1;
        while self.resources.contains_key(&resource.id) {
            resource.id = format!("{}{}{suffix}", entry.name, entry.section);
            suffix += 1;
        }
        let entries = std::mem::take(&mut resource.template_partial);
        let owner = Owner::resource(&resource.id);
        self.resources.insert(resource.id.clone(), resource);
        for entry in entries {
            self.claim(&entry, &owner);
        }
    }

    /// Break a cycle by promoting an entry that is not ready yet
    fn force_convert(&mut self, entry: &EntryId) {
        tracing::debug!(%entry, "no progress, forcing standalone custom resource");
        self.promote(entry);
    }

    /// Fold custom resources into owners that grouping rules now permit
    ///
    /// A custom resource may join the owner of an entry it references, or the owner of an
    /// entry referencing it.
    pub fn reabsorb(&mut self) {
        loop {
            let folded = self
                .resources
                .values()
                .filter(|resource| resource.is_custom())
                .find_map(|resource| {
                    let target_type = resource.grouping_type();
                    let candidates = self.reabsorb_candidates(resource);
                    let typed = candidates.iter().filter(|c| !self.is_custom(c));
                    let custom = candidates.iter().filter(|c| self.is_custom(c));
                    typed.chain(custom).find_map(|candidate| {
                        let rule = self.permitted(candidate, target_type)?;
                        Some((resource.id.clone(), candidate.clone(), rule))
                    })
                });

            let Some((custom_id, owner, rule)) = folded else {
                break;
            };

            tracing::debug!(resource = %custom_id, %owner, "re-absorbing custom resource");
            let Some(custom) = self.resources.shift_remove(&custom_id) else {
                break;
            };
            for entry in custom.template_partial {
                self.owners.shift_remove(&entry);
                self.merge(&entry, owner.clone(), rule);
            }
        }
    }

    /// Owners reachable from a custom resource, referenced ones first
    fn reabsorb_candidates(&self, resource: &Resource) -> Vec<Owner> {
        let own = Owner::resource(&resource.id);
        let referenced = resource
            .template_partial
            .iter()
            .flat_map(|entry| self.edges(entry));
        let referencing = self
            .relationships
            .iter()
            .filter(|(_, found)| {
                found.iter().any(|mention| {
                    !mention.weak && resource.template_partial.contains(&mention.entry)
                })
            })
            .map(|(user, _)| user.clone());

        let mut candidates: Vec<Owner> = vec![];
        for edge in referenced.chain(referencing) {
            if self.terminal.contains(&edge) {
                continue;
            }
            match self.owners.get(&edge) {
                Some(found) if *found != own && !candidates.contains(found) => {
                    candidates.push(found.clone())
                }
                _ => {}
            }
        }
        candidates
    }

    /// Record `owner` for `entry`; false when someone else owns it already
    pub fn claim(&mut self, entry: &EntryId, owner: &Owner) -> bool {
        if let Some(existing) = self.owners.get(entry) {
            if existing != owner {
                tracing::trace!(%entry, %existing, claimant = %owner, "already owned");
            }
            return existing == owner;
        }

        let Some(partial) = self.partial_mut(owner) else {
            return false;
        };
        partial.insert(entry.clone());
        self.owners.insert(entry.clone(), owner.clone());
        tracing::trace!(%entry, %owner, "claim");
        true
    }

    fn partial_mut(&mut self, owner: &Owner) -> Option<&mut TemplatePartial> {
        match owner {
            Owner::Resource { resource_id } => {
                Some(&mut self.resources.get_mut(resource_id)?.template_partial)
            }
            Owner::Facet {
                resource_id,
                facet_type,
                facet_id,
            } => Some(
                &mut self
                    .resources
                    .get_mut(resource_id)?
                    .facet_mut(facet_type, facet_id)?
                    .template_partial,
            ),
            Owner::Integration {
                integration_type,
                source_id,
                target_id,
            } => Some(
                &mut self
                    .integrations
                    .iter_mut()
                    .find(|i| i.is(integration_type, source_id, target_id))?
                    .template_partial,
            ),
        }
    }

    pub fn finish(self) -> StackGraph {
        StackGraph {
            resources: self.resources.into_values().collect(),
            integrations: self.integrations,
            ..Default::default()
        }
    }
}
