// Aurora database user provisioning
// Library entry point: logging, the Lambda handler, and the local run modes

pub mod config;
pub mod database;
pub mod models;
pub mod provisioning;
pub mod utils;

use anyhow::Context;
use lambda_runtime::{service_fn, LambdaEvent};
use log::{error, info};
use serde_json::Value;

use crate::config::{ConfigError, LogSettings, ProvisionerConfig};
use crate::database::connection::{DbConnector, RealDbConnector};
use crate::models::responses::{HandlerResponse, ProvisionReport, SUCCESS_BODY};
use crate::provisioning::Provisioner;

/// Initialize logging to stdout (the platform forwards stdout to its log service).
pub fn init_logging(settings: &LogSettings) -> Result<(), Box<dyn std::error::Error>> {
    let json = settings.json;

    fern::Dispatch::new()
        .level(settings.level)
        // Driver and runtime internals are only interesting when something breaks.
        .level_for("sqlx", log::LevelFilter::Warn)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("hyper_util", log::LevelFilter::Warn)
        .level_for("lambda_runtime", log::LevelFilter::Warn)
        .format(move |out, message, record| {
            let message_str = format!("{}", message);
            let (phase, step, cleaned_message) = utils::logging::parse_log_metadata(&message_str);
            if json {
                let request_id = utils::logging::current_request_id();
                let line = utils::logging::format_json_log(
                    &chrono::Utc::now().to_rfc3339(),
                    record.level(),
                    record.target(),
                    &cleaned_message,
                    phase.as_deref(),
                    step.as_deref(),
                    request_id.as_deref(),
                );
                out.finish(format_args!("{}", line));
            } else {
                let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                let line = utils::logging::format_human_readable_log(
                    &timestamp_local.to_string(),
                    record.level(),
                    record.target(),
                    &cleaned_message,
                    phase.as_deref(),
                    step.as_deref(),
                );
                out.finish(format_args!("{}", line));
            }
        })
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}

/// Run one provisioning pass.
///
/// Takes the configuration result rather than the configuration so the start of the invocation is
/// logged even when the environment is incomplete.
pub async fn provision_users<C: DbConnector>(
    config: Result<ProvisionerConfig, ConfigError>,
    connector: C,
) -> anyhow::Result<ProvisionReport> {
    let engine = match &config {
        Ok(c) => c.engine.to_string(),
        Err(_) => "unconfigured engine".to_string(),
    };
    info!(
        "[PHASE: handler] [STEP: start] Starting user creation for {}",
        engine
    );

    let config = config.context("Failed to load configuration")?;
    Provisioner::new(config, connector).run().await
}

/// Map one provisioning pass onto the invocation result the platform reports.
pub async fn respond<C: DbConnector>(
    config: Result<ProvisionerConfig, ConfigError>,
    connector: C,
) -> Result<HandlerResponse, lambda_runtime::Error> {
    match provision_users(config, connector).await {
        Ok(_) => Ok(HandlerResponse::ok(SUCCESS_BODY)),
        Err(e) => {
            error!("[PHASE: handler] [STEP: failed] Error creating users: {:#}", e);
            Err(e.into())
        }
    }
}

/// Lambda handler. The event payload is ignored: everything comes from the environment.
pub async fn handle_event(
    event: LambdaEvent<Value>,
) -> Result<HandlerResponse, lambda_runtime::Error> {
    utils::logging::set_request_id(Some(event.context.request_id.clone()));
    let outcome = respond(ProvisionerConfig::from_env(), RealDbConnector).await;
    utils::logging::set_request_id(None);
    outcome
}

fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Default mode: serve invocations from the Lambda runtime API.
pub fn run_lambda() {
    if let Err(e) = init_logging(&LogSettings::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let result = match build_runtime() {
        Ok(rt) => rt.block_on(lambda_runtime::run(service_fn(handle_event))),
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        error!("[PHASE: runtime] Lambda runtime exited with error: {}", e);
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

/// `--run-once`: one provisioning pass against the configured cluster, outside Lambda.
pub fn run_once() {
    if let Err(e) = init_logging(&LogSettings::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let result = match build_runtime() {
        Ok(rt) => rt.block_on(provision_users(ProvisionerConfig::from_env(), RealDbConnector)),
        Err(e) => Err(anyhow::anyhow!("Failed to create async runtime: {}", e)),
    };

    match result {
        Ok(report) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_default()
            );
        }
        Err(e) => {
            error!("[PHASE: handler] [STEP: failed] Error creating users: {:#}", e);
            eprintln!("Error creating users: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// `--dry-run`: print the statements a run would execute, passwords redacted. No connection.
pub fn run_dry_run() {
    if let Err(e) = init_logging(&LogSettings::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let config = match ProvisionerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    println!("-- {} on {}", config.engine, config.connection.describe());
    for statement in Provisioner::new(config, RealDbConnector).plan() {
        println!("-- [{}]\n{}", statement.step, statement.redacted);
    }
}
