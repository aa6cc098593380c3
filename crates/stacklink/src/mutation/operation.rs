use crate::error::Result;
use crate::path::{self, Node, Scope};
use crate::placeholder::{self, Context, Strictness};
use crate::schema::{Operation, ResourceTypeSchema, Trigger};
use crate::template::{self, Location, Template};
use serde_json::Value as Json;

/// Run every reaction of `schema` matching `trigger`, in schema order
///
/// Relative paths start at `at` (the subject's fragment) when it exists, at the document
/// root otherwise.
pub(crate) fn react(
    template: &mut Template,
    schema: &ResourceTypeSchema,
    trigger: &Trigger<'_>,
    context: &Context,
    at: Option<&Location>,
) -> Result<usize> {
    let mut applied = 0;
    for reaction in schema.reactions_for(trigger) {
        tracing::debug!(
            action = ?reaction.action,
            operations = reaction.operations.len(),
            "reaction"
        );
        for operation in &reaction.operations {
            execute(template, operation, context, at)?;
            applied += 1;
        }
    }
    Ok(applied)
}

fn scope<'a, 'c>(document: &'a Json, context: &'c Context, at: Option<&Location>) -> Scope<'a, 'c> {
    let scope = Scope::new(document, context);
    let Some(location) = at else {
        return scope;
    };
    match template::get(document, location) {
        Some(value) => scope.at(Node {
            location: location.clone(),
            value,
        }),
        None => scope,
    }
}

/// Apply one edit
pub(crate) fn execute(
    template: &mut Template,
    operation: &Operation,
    context: &Context,
    at: Option<&Location>,
) -> Result<()> {
    let format = template.format();
    let (Operation::Upsert { path: spec, .. }
    | Operation::Delete { path: spec }
    | Operation::Append { path: spec, .. }
    | Operation::RenameKey { path: spec, .. }) = operation;
    let Some(steps) = spec.steps(format) else {
        tracing::trace!(%format, "edit does not apply to this format");
        return Ok(());
    };

    match operation {
        Operation::Upsert {
            value, create_path, ..
        } => {
            let value = placeholder::expand_json(value, context, Strictness::Strict)?;
            let scope = scope(template.document(), context, at);
            let locations = path::select_for_write(&steps, &scope)?;
            let document = template.document_mut();
            for location in locations {
                let parent_exists = location
                    .parent()
                    .map_or(true, |(parent, _)| template::get(document, &parent).is_some());
                if !create_path && !parent_exists {
                    tracing::trace!(%location, "parent missing, not created");
                    continue;
                }
                if let Some(slot) = template::ensure(document, &location) {
                    tracing::trace!(%location, "upsert");
                    *slot = value.clone();
                }
            }
        }
        Operation::Delete { .. } => {
            let scope = scope(template.document(), context, at);
            let locations: Vec<Location> = path::select(&steps, &scope)?
                .into_iter()
                .map(|node| node.location)
                .collect();
            let document = template.document_mut();
            // back to front so array indices stay valid
            for location in locations.iter().rev() {
                tracing::trace!(%location, "delete");
                template::remove(document, location);
            }
        }
        Operation::Append { value, unique, .. } => {
            let value = placeholder::expand_json(value, context, Strictness::Strict)?;
            let scope = scope(template.document(), context, at);
            let locations = path::select_for_write(&steps, &scope)?;
            let document = template.document_mut();
            for location in locations {
                let Some(slot) = template::ensure(document, &location) else {
                    continue;
                };
                if !slot.is_array() {
                    *slot = match slot.take() {
                        Json::Null => Json::Array(vec![]),
                        single => Json::Array(vec![single]),
                    };
                }
                if let Json::Array(list) = slot {
                    if *unique && list.contains(&value) {
                        continue;
                    }
                    tracing::trace!(%location, "append");
                    list.push(value.clone());
                }
            }
        }
        Operation::RenameKey { from, to, .. } => {
            let from = placeholder::expand_to_string(from, context, Strictness::Strict)?;
            let to = placeholder::expand_to_string(to, context, Strictness::Strict)?;
            let scope = scope(template.document(), context, at);
            let locations: Vec<Location> = path::select(&steps, &scope)?
                .into_iter()
                .map(|node| node.location)
                .collect();
            let document = template.document_mut();
            for location in locations {
                if let Some(Json::Object(object)) = template::get_mut(document, &location) {
                    if let Some(value) = object.remove(&from) {
                        tracing::trace!(%location, %from, %to, "rename");
                        object.insert(to.clone(), value);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::template;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn operation(yaml: &str) -> Operation {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn upsert_creates_paths_unless_told_not_to() {
        let mut template = template!("Resources: {Fn: {Type: AWS::Serverless::Function}}");
        let context = Context::new().with("resourceId", "Fn").with("value", 30);
        let at = Location::root().child("Resources").child("Fn");

        let upsert = operation("{Op: Upsert, Path: '@.Properties.Timeout', Value: '%{value}'}");
        execute(&mut template, &upsert, &context, Some(&at)).unwrap();
        let guarded = operation(
            "{Op: Upsert, Path: '@.Properties.Tracing.Mode', Value: Active, CreatePath: false}",
        );
        execute(&mut template, &guarded, &context, Some(&at)).unwrap();

        assert_eq!(
            template.entry(&template::EntryId::resource("Fn")).unwrap(),
            &json!({"Type": "AWS::Serverless::Function", "Properties": {"Timeout": 30}})
        );
    }

    #[test]
    fn append_delete_and_rename() {
        let mut template = template!(
            "Resources: {Fn: {Type: F, Properties: {Layers: [a, b, c], Env: {OLD: 1}}}}"
        );
        let context = Context::new();
        let at = Location::root().child("Resources").child("Fn");

        for yaml in [
            "{Op: Append, Path: '@.Properties.Layers', Value: d, Unique: true}",
            "{Op: Append, Path: '@.Properties.Layers', Value: a, Unique: true}",
            "{Op: Delete, Path: \"@.Properties.Layers[?(@ == 'a' || @ == 'b')]\"}",
            "{Op: RenameKey, Path: '@.Properties.Env', From: OLD, To: NEW}",
        ] {
            execute(&mut template, &operation(yaml), &context, Some(&at)).unwrap();
        }

        assert_eq!(
            template.entry(&template::EntryId::resource("Fn")).unwrap()["Properties"],
            json!({"Layers": ["c", "d"], "Env": {"NEW": 1}})
        );
    }
}
