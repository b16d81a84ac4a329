//! `call`: invoke one service and print Home Assistant's response.

use serde_json::Value;

use hassflow_core::{Runtime, ServiceTarget};

use crate::cli::{CallArgs, GlobalOpts};
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

use super::within;

/// `--data` must be a JSON object when given.
fn parse_data(raw: Option<&str>) -> Result<Option<Value>, CliError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(CliError::Validation {
            field: "data".into(),
            reason: "service data must be a JSON object".into(),
        });
    }
    Ok(Some(value))
}

fn build_target(args: &CallArgs) -> Option<ServiceTarget> {
    let mut target = ServiceTarget::entities(args.entity.iter().cloned());
    for device in &args.device {
        target = target.with_device(device.clone());
    }
    for area in &args.area {
        target = target.with_area(area.clone());
    }
    (!target.is_empty()).then_some(target)
}

pub async fn handle(
    resolved: Resolved,
    args: CallArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let data = parse_data(args.data.as_deref())?;
    let target = build_target(&args);

    let (entities, services) = resolved.definitions.into_parts();
    if !services.is_empty() && !services.contains(&args.action) {
        tracing::warn!(action = %args.action, "service is not in the definitions file");
    }

    let timeout = resolved.connection.timeout;
    let runtime = Runtime::connect(resolved.connection, entities, services)?;
    let outcome = within(timeout, async {
        Ok(runtime.call_service(&args.action, data, target).await?)
    })
    .await;
    let closed = runtime.close().await;
    let response = outcome?;
    closed?;

    let out = output::render_single(
        &global.output,
        &response,
        |r| match r {
            Value::Null => format!("Called {}", args.action),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        },
        |_| args.action.clone(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
