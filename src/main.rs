//! modelvisor-cli entry point.
//!
//! ## CLI Subcommands
//!
//! - `modelvisor-cli` or `modelvisor-cli serve` - Serve models until Ctrl-C (default)
//! - `modelvisor-cli validate <FILE>` - Validate a model configuration file
//! - `modelvisor-cli status <FILE>` - Load a configuration once and print version states
//! - `modelvisor-cli config show|defaults` - Print environment configuration

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use modelvisor::cli::{self, flag_value, has_flag};
use modelvisor::config::{self as env_config, EnvConfig};
use modelvisor::health::HealthChecker;
use modelvisor::models::{Manager, MmapBackend, ModelConfig};
use modelvisor::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => {
            let env = env_config::load();
            if let Err(e) = telemetry::init_logging(&env.log) {
                eprintln!("Logging setup failed: {}", e);
                return ExitCode::from(cli::EXIT_CONFIG_ERROR as u8);
            }
            telemetry::init_metrics();
            ExitCode::from(run_serve(env, args.get(1..).unwrap_or(&[])).await as u8)
        }
        "validate" => match args.get(2) {
            Some(path) => ExitCode::from(cli::run_validate(Path::new(path)) as u8),
            None => {
                eprintln!("validate requires a configuration file");
                print_command_help("validate");
                ExitCode::FAILURE
            }
        },
        "status" => match args.get(2).filter(|a| !a.starts_with("--")) {
            Some(path) => {
                let json = has_flag(&args, "--json");
                ExitCode::from(cli::run_status(Path::new(path), json).await as u8)
            }
            None => {
                eprintln!("status requires a configuration file");
                print_command_help("status");
                ExitCode::FAILURE
            }
        },
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => ExitCode::from(cli::config_cmd::run_show(has_flag(&args, "--json")) as u8),
                "defaults" => {
                    cli::config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("modelvisor {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// Serve until Ctrl-C. Returns the process exit code.
async fn run_serve(env: EnvConfig, args: &[String]) -> i32 {
    let manager = Manager::new(env.manager_config(), Arc::new(MmapBackend::new()));
    let health = HealthChecker::default();

    let single = match (flag_value(args, "--model-name"), flag_value(args, "--model-path")) {
        (Some(name), Some(path)) => Some(ModelConfig::new(name, PathBuf::from(path))),
        (None, None) => None,
        _ => {
            eprintln!("--model-name and --model-path must be given together");
            return cli::EXIT_CONFIG_ERROR;
        }
    };
    let config_path = flag_value(args, "--config").map(PathBuf::from).or(env.config_path.clone());

    let report = match (single, config_path) {
        (Some(model), _) => manager.serve_single_model(model).await,
        (None, Some(path)) => match manager.load_configuration(&path).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "initial configuration rejected");
                return cli::EXIT_CONFIG_ERROR;
            }
        },
        (None, None) => {
            eprintln!("Nothing to serve: set MODELVISOR_CONFIG_PATH, --config, or --model-name/--model-path");
            return cli::EXIT_CONFIG_ERROR;
        }
    };
    for (model, error) in &report.failures {
        tracing::warn!(model = %model, error = %error, "model not reconciled at startup");
    }

    manager.start_watcher();
    tracing::info!(
        models = manager.served_models().len(),
        ready = health.is_ready(&manager),
        "modelvisor serving"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutdown requested");
    manager.shutdown();
    let drained = manager.wait_for_settled(std::time::Duration::from_secs(30)).await;
    let report = health.report(&manager);
    tracing::info!(drained, uptime_secs = report.uptime_secs, "modelvisor stopped");
    cli::EXIT_OK
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "modelvisor - model version lifecycle manager v{}

USAGE:
    modelvisor-cli [COMMAND] [OPTIONS]

COMMANDS:
    serve        Serve models until Ctrl-C (default when no command given)
    validate     Validate a model configuration file
    status       Load a configuration once and print version states
    config       Show environment configuration (show, defaults)
    version      Show version information
    help         Show this help message

EXAMPLES:
    modelvisor-cli serve --config /etc/modelvisor/config.json
    modelvisor-cli serve --model-name resnet --model-path /models/resnet
    modelvisor-cli validate config.json
    modelvisor-cli status config.json --json
    modelvisor-cli config show

ENVIRONMENT:
    MODELVISOR_CONFIG_PATH          Model configuration file
    MODELVISOR_WATCH_INTERVAL_SECS  Watcher period in seconds (0 disables)
    MODELVISOR_LOAD_WAIT_MS         Request wait on loading versions
    MODELVISOR_LOG_LEVEL            Log filter (debug, info, warn, error)
    MODELVISOR_LOG_FORMAT           json or pretty
    MODELVISOR_LOG_FILE             Log file (stderr if unset)
    MODELVISOR_MODEL_ROOT           Directory every base path must resolve inside

EXIT CODES:
    0  Success
    1  Failure (a model or version did not load)
    2  Configuration error
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "serve" => {
            eprintln!(
                "modelvisor-cli serve - Serve models

USAGE:
    modelvisor-cli serve [--config FILE | --model-name NAME --model-path DIR]

DESCRIPTION:
    Loads the model configuration, starts the watcher and keeps every
    configured version loaded until Ctrl-C. The watcher reloads the file
    when its contents change and picks up new version directories on disk.
"
            );
        }
        "validate" => {
            eprintln!(
                "modelvisor-cli validate - Validate a configuration file

USAGE:
    modelvisor-cli validate <FILE>

EXIT CODES:
    0  Valid
    2  Invalid
"
            );
        }
        "status" => {
            eprintln!(
                "modelvisor-cli status - Print version states

USAGE:
    modelvisor-cli status <FILE> [--json]

DESCRIPTION:
    Loads every model in the file once, waits for the loads to settle and
    prints the state and error code of each version.
"
            );
        }
        "config" => {
            eprintln!(
                "modelvisor-cli config - Show configuration

USAGE:
    modelvisor-cli config <show [--json] | defaults>
"
            );
        }
        _ => {
            eprintln!(
                "No detailed help available for '{}'. Use 'modelvisor-cli help' for general usage.",
                command
            );
        }
    }
}
