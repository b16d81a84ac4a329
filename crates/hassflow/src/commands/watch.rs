//! `watch`: stream edge-triggered changes until Ctrl-C.

use std::fmt::Display;

use chrono::Local;
use serde::Serialize;
use serde_json::Value;

use hassflow_core::{Remover, Runtime, RuntimeState, StateChange};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

use super::within;

/// One line of `--output json` streaming output.
#[derive(Debug, Serialize)]
struct ChangeEvent<'a, T: Serialize> {
    entity_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribute: Option<&'a str>,
    value: T,
    previous: T,
    at: String,
}

#[derive(Clone)]
struct Printer {
    json: bool,
    color: bool,
    quiet: bool,
}

impl Printer {
    fn new(global: &GlobalOpts) -> Self {
        Self {
            json: matches!(global.output, OutputFormat::Json | OutputFormat::JsonCompact),
            color: output::should_color(&global.color),
            quiet: global.quiet,
        }
    }

    fn change<T: Serialize + Display>(
        &self,
        entity_id: &str,
        attribute: Option<&str>,
        value: T,
        change: StateChange<T>,
    ) {
        let now = Local::now();
        let line = if self.json {
            output::render_json_line(&ChangeEvent {
                entity_id,
                attribute,
                at: now.to_rfc3339(),
                value,
                previous: change.prev_state,
            })
        } else {
            let label = match attribute {
                Some(attr) => format!("{}[{attr}]", output::paint_entity(entity_id, self.color)),
                None => output::paint_entity(entity_id, self.color),
            };
            format!(
                "{}  {label}  {}",
                now.format("%H:%M:%S"),
                output::paint_transition(
                    &change.prev_state.to_string(),
                    &value.to_string(),
                    self.color
                ),
            )
        };
        output::print_output(&line, self.quiet);
    }
}

pub async fn handle(
    resolved: Resolved,
    args: WatchArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let timeout = resolved.connection.timeout;
    let (entities, services) = resolved.definitions.into_parts();
    let runtime = Runtime::connect(resolved.connection, entities, services)?;

    let outcome = watch(&runtime, &args, global, timeout).await;
    let closed = runtime.close().await;
    outcome?;
    closed?;
    Ok(())
}

async fn watch(
    runtime: &Runtime,
    args: &WatchArgs,
    global: &GlobalOpts,
    timeout: std::time::Duration,
) -> Result<(), CliError> {
    within(timeout, async { Ok(runtime.wait_ready().await?) }).await?;

    for entity_id in &args.entities {
        runtime.entity(entity_id, false)?;
    }

    let printer = Printer::new(global);
    let removers: Vec<Remover> = args
        .entities
        .iter()
        .map(|entity_id| register(runtime, entity_id, args.attr.as_deref(), printer.clone()))
        .collect();
    let _all = Remover::combine(removers);

    if !global.quiet {
        eprintln!(
            "Watching {} {} (Ctrl-C to stop)",
            args.entities.len(),
            if args.entities.len() == 1 { "entity" } else { "entities" }
        );
    }

    let mut state = runtime.subscribe_state();
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::debug!("interrupted");
            Ok(())
        }
        ended = state.wait_for(|s| matches!(s, RuntimeState::Failed(_) | RuntimeState::Closed)) => {
            let reason = match ended {
                Ok(current) => current.clone(),
                Err(_) => RuntimeState::Closed,
            };
            tracing::debug!(state = %reason, "runtime stopped");
            Err(CliError::Disconnected)
        }
    }
}

fn register(
    runtime: &Runtime,
    entity_id: &str,
    attribute: Option<&str>,
    printer: Printer,
) -> Remover {
    let id = entity_id.to_owned();
    match attribute {
        Some(attr) => {
            let attr_name = attr.to_owned();
            runtime.on_entity_attribute_change(entity_id, attr, move |value: Value, change| {
                printer.change(&id, Some(&attr_name), AttrValue(value), StateChange {
                    prev_state: AttrValue(change.prev_state),
                });
            })
        }
        None => runtime.on_state_change(entity_id, move |value, change| {
            printer.change(&id, None, value, change);
        }),
    }
}

/// Attribute values print like the REST API shows them: strings bare.
#[derive(Serialize)]
#[serde(transparent)]
struct AttrValue(Value);

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => other.fmt(f),
        }
    }
}
