//! `get`: one entity, or one attribute, from the first snapshot.

use serde::Serialize;
use serde_json::Value;

use hassflow_core::{EntityState, Runtime, StateValue};

use crate::cli::{GetArgs, GlobalOpts};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

/// Entity with its state converted through the definitions.
#[derive(Debug, Serialize)]
struct EntityDetail {
    #[serde(flatten)]
    entity: EntityState,
    value: StateValue,
}

#[derive(Debug, Serialize)]
struct AttributeDetail {
    entity_id: String,
    attribute: String,
    value: Value,
}

enum Fetched {
    Entity(Box<EntityDetail>),
    Attribute(AttributeDetail),
}

pub async fn handle(
    resolved: Resolved,
    args: GetArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let (entities, services) = resolved.definitions.into_parts();
    let GetArgs {
        entity: entity_id,
        attr,
        previous,
    } = args;

    let fetched = Runtime::oneshot(resolved.connection, entities, services, |runtime| async move {
        match attr {
            Some(attribute) => {
                let value = runtime.get_entity_attribute_state(&entity_id, &attribute, previous)?;
                Ok(Fetched::Attribute(AttributeDetail {
                    entity_id,
                    attribute,
                    value,
                }))
            }
            None => {
                let entity = runtime.entity(&entity_id, previous)?;
                let value = runtime.get_entity_state(&entity_id, previous)?;
                Ok(Fetched::Entity(Box::new(EntityDetail { entity, value })))
            }
        }
    })
    .await?;

    let out = match fetched {
        Fetched::Entity(detail) => output::render_single(
            &global.output,
            &*detail,
            |d| entity_detail(d, output::should_color(&global.color)),
            |d| d.value.to_string(),
        ),
        Fetched::Attribute(detail) => output::render_single(
            &global.output,
            &detail,
            |d| attribute_text(&d.value),
            |d| attribute_text(&d.value),
        ),
    };
    output::print_output(&out, global.quiet);
    Ok(())
}

fn entity_detail(detail: &EntityDetail, color: bool) -> String {
    let entity = &detail.entity;
    let mut pairs = vec![
        ("Entity", output::paint_entity(&entity.entity_id, color)),
        ("State", output::paint_state(&entity.state, color)),
        (
            "Type",
            if detail.value.is_number() { "number" } else { "string" }.to_owned(),
        ),
        ("Last changed", entity.last_changed.to_rfc3339()),
        ("Last updated", entity.last_updated.to_rfc3339()),
    ];
    if let Some(name) = entity.friendly_name() {
        pairs.insert(1, ("Name", name.to_owned()));
    }
    let mut out = output::detail_lines(&pairs);
    if !entity.attributes.is_empty() {
        out.push_str("\n\nAttributes:");
        for (key, value) in &entity.attributes {
            out.push_str(&format!("\n  {key}: {}", attribute_text(value)));
        }
    }
    out
}

fn attribute_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
