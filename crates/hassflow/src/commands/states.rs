//! `states`: one-shot table of every entity in the first snapshot.

use tabled::Tabled;

use hassflow_core::{EntityState, Runtime};

use crate::cli::{GlobalOpts, StatesArgs};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Entity")]
    entity_id: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Unit")]
    unit: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Changed")]
    changed: String,
}

fn to_row(entity: &EntityState, color: bool) -> StateRow {
    StateRow {
        entity_id: entity.entity_id.clone(),
        state: output::paint_state(&entity.state, color),
        unit: entity
            .attribute("unit_of_measurement")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        name: entity.friendly_name().unwrap_or_default().to_owned(),
        changed: entity
            .last_changed
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    }
}

pub async fn handle(
    resolved: Resolved,
    args: StatesArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let (entities, services) = resolved.definitions.into_parts();
    let snapshot = Runtime::oneshot(resolved.connection, entities, services, |runtime| async move {
        runtime.snapshot(false)
    })
    .await?;

    let states: Vec<EntityState> = snapshot
        .iter()
        .map(|(_, entity)| entity)
        .filter(|entity| args.domain.as_deref().is_none_or(|d| entity.domain() == d))
        .cloned()
        .collect();

    let color = output::should_color(&global.color);
    let out = output::render_list(
        &global.output,
        &states,
        |entity| to_row(entity, color),
        |entity| entity.entity_id.clone(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
