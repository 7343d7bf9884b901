//! Bot deployer - Entry Point
//!
//! Takes no positional arguments. Everything comes from the environment;
//! see `storage::settings` for the key tables.

use std::env;
use std::process::ExitCode;

use botdeploy::app::run::run;
use botdeploy::deploy::docker::DockerCli;
use botdeploy::logs::{init_logging, LogOptions};
use botdeploy::models::deployment::{DeploymentOutcome, RollbackReport};
use botdeploy::storage::settings::Settings;
use botdeploy::utils::version_info;

use colored::Colorize;
use tracing::{error, info};

const USAGE: &str = "usage: botdeploy [--version | --check-config]";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line flags
    let mut flags = Vec::new();
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--version" | "--check-config" => flags.push(arg),
            _ => {
                eprintln!("unexpected argument '{}'\n{}", arg, USAGE);
                return ExitCode::FAILURE;
            }
        }
    }

    // Print version and exit
    if flags.iter().any(|f| f == "--version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    // Every required key is checked before anything else happens
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            let _ = init_logging(LogOptions::default());
            error!("Invalid configuration: {}", e);
            eprintln!("{} {}", "[ERROR]".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(settings.log.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if flags.iter().any(|f| f == "--check-config") {
        println!("image: {}", settings.image);
        println!("container: {}", settings.container_name);
        println!("runtime: {}", settings.docker_binary);
        println!("env file: {}", settings.layout.env_file().path().display());
        for key in settings.service_env.keys() {
            println!("  {}=<set>", key);
        }
        return ExitCode::SUCCESS;
    }

    let version = version_info();
    info!("botdeploy {} ({})", version.version, version.git_hash);

    let runtime = DockerCli::new()
        .with_binary(settings.docker_binary.clone())
        .with_daemon_restart(settings.daemon_restart.clone());
    match run(&settings, &runtime).await {
        Ok(outcome) => {
            report(&outcome);
            ExitCode::from(outcome.exit_code() as u8)
        }
        Err(e) => {
            error!("Deployment aborted: {}", e);
            eprintln!("{} {}", "[FAILED]".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Print the outcome as JSON on stdout and a verdict with the log tail on stderr
fn report(outcome: &DeploymentOutcome) {
    match serde_json::to_string_pretty(outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize outcome: {}", e),
    }

    let verdict = match (&outcome.failure, &outcome.rollback) {
        (None, _) => "[SUCCESS]".green().bold(),
        (Some(_), RollbackReport::Succeeded { .. }) => "[ROLLED BACK]".yellow().bold(),
        (Some(_), _) => "[FAILED]".red().bold(),
    };
    let detail = match &outcome.failure {
        None => format!("{} is running {}", outcome.container, outcome.image),
        Some(failure) => failure.message.clone(),
    };
    eprintln!("{} {}", verdict, detail);

    if !outcome.diagnostics.is_empty() {
        eprintln!("Last {} log line(s) of the failed instance:", outcome.diagnostics.len());
        for line in &outcome.diagnostics {
            eprintln!("  {}", line);
        }
    }
}
