//! `check`: REST call for reachability and token validity.

use serde::Serialize;

use crate::cli::GlobalOpts;
use crate::config::Resolved;
use crate::error::CliError;
use crate::output;

#[derive(Debug, Serialize)]
struct CheckReport {
    profile: String,
    url: String,
    message: String,
    version: String,
    location: String,
    time_zone: String,
    components: usize,
}

pub async fn handle(resolved: &Resolved, global: &GlobalOpts) -> Result<(), CliError> {
    let client = resolved.connection.rest_client()?;

    let status = client.check().await.map_err(hassflow_core::CoreError::from)?;
    let config = client.config().await.map_err(hassflow_core::CoreError::from)?;

    let report = CheckReport {
        profile: resolved.profile.clone(),
        url: resolved.connection.url.to_string(),
        message: status.message,
        version: config.version,
        location: config.location_name,
        time_zone: config.time_zone,
        components: config.components.len(),
    };

    let out = output::render_single(
        &global.output,
        &report,
        |r| {
            output::detail_lines(&[
                ("Profile", r.profile.clone()),
                ("URL", r.url.clone()),
                ("Status", r.message.clone()),
                ("Version", r.version.clone()),
                ("Location", r.location.clone()),
                ("Time zone", r.time_zone.clone()),
                ("Components", r.components.to_string()),
            ])
        },
        |r| r.version.clone(),
    );
    output::print_output(&out, global.quiet);
    Ok(())
}
