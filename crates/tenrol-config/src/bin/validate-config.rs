//! Config validation CLI tool
//!
//! Validates a tenrold configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use tenrol_api::EmailKind;
use tenrol_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a tenrold configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            eprintln!("  validate-config config.example.toml");
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match tenrol_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", tenrol_config::CURRENT_CONFIG_VERSION);
            println!("  Enabled: {}", settings.enrolments.enabled);
            match settings.enrolments.marker_role {
                Some(role) => println!("  Marker role: {}", role),
                None => println!("  Marker role: (unset, handlers are inactive)"),
            }
            println!(
                "  Duration: {}s ({} days)",
                settings.enrolments.duration_seconds,
                tenrol_util::days_left(settings.enrolments.duration_seconds, 0)
            );
            println!(
                "  Reminder interval: {} days",
                settings.enrolments.reminder_interval_days
            );
            println!(
                "  Existing assignments: manage={} send_email={} start={:?}",
                settings.existing_assignments.manage,
                settings.existing_assignments.send_email,
                settings.existing_assignments.start
            );

            println!();
            println!("Emails:");
            for kind in EmailKind::ALL {
                let state = if settings.email_template(kind).is_some() {
                    "on"
                } else {
                    "off"
                };
                println!("  - {}: {}", kind, state);
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                tenrol_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                tenrol_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                tenrol_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                tenrol_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        tenrol_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
