//! Config subcommand handlers.

use hassflow_config::{self as config, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init {
            name,
            instance_url,
            token_env,
            definitions_file,
            make_default,
        } => {
            config::parse_url(&instance_url)?;

            let path = config::config_path();
            let mut cfg = config::load_config_from(&path)?;
            let replaced = cfg
                .profiles
                .insert(
                    name.clone(),
                    Profile {
                        url: Some(instance_url),
                        token_env,
                        definitions: definitions_file,
                        ..Profile::default()
                    },
                )
                .is_some();
            if make_default || cfg.profiles.len() == 1 {
                cfg.default_profile = Some(name.clone());
            }
            config::save_config_to(&cfg, &path)?;

            if !global.quiet {
                let verb = if replaced { "Updated" } else { "Added" };
                eprintln!("{verb} profile '{name}' in {}", path.display());
            }
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load_config_or_default();
            output::print_output(&config::format_config_redacted(&cfg), global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), false);
            Ok(())
        }

        ConfigCommand::Profiles => {
            let cfg = config::load_config_or_default();
            let active = crate::config::active_profile_name(global, &cfg);
            let lines: Vec<String> = cfg
                .profiles
                .iter()
                .map(|(name, profile)| {
                    let marker = if *name == active { "*" } else { " " };
                    let url = profile.url.as_deref().unwrap_or("(no url)");
                    format!("{marker} {name}  {url}")
                })
                .collect();
            if lines.is_empty() && !global.quiet {
                eprintln!(
                    "No profiles configured. Create one with: hassflow config init --instance-url <URL>"
                );
            }
            output::print_output(&lines.join("\n"), global.quiet);
            Ok(())
        }
    }
}
