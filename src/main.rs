//! Command line access to the metas of a stored entity.
//!
//! ```text
//! metable [--config FILE] <table> <id> get KEY
//! metable [--config FILE] <table> <id> set KEY VALUE
//! metable [--config FILE] <table> <id> unset KEY
//! metable [--config FILE] <table> <id> list
//! ```
use std::env;
use std::process::ExitCode;

use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use metable::{Database, EntityType, FlushStatus, MetableError, Result, SaveReport, Settings, Value};

const USAGE: &str = "usage: metable [--config FILE] <table> <id> (get KEY | set KEY VALUE | unset KEY | list)";

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let config_file = take_option(&mut args, "--config");
    let settings = match Settings::load(config_file.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&settings, &args) {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

fn take_option(args: &mut Vec<String>, name: &str) -> Option<String> {
    let position = args.iter().position(|arg| arg == name)?;
    if position + 1 >= args.len() {
        return None;
    }
    let value = args.remove(position + 1);
    args.remove(position);
    Some(value)
}

fn run(settings: &Settings, args: &[String]) -> Result<String> {
    let [table, id, command, rest @ ..] = args else {
        return Err(MetableError::Config(USAGE.to_owned()));
    };
    let id: i64 = id
        .parse()
        .map_err(|_| MetableError::Config(format!("'{}' is not an id", id)))?;

    let db = Database::from_settings(settings)?;
    db.register(EntityType::new(table.as_str()))?;
    db.migrate(table)?;
    let mut entity = db.find_or_fail(table, id)?;
    info!(entity = %entity.reference(), command = %command, "running");

    match (command.as_str(), rest) {
        ("get", [key]) => Ok(entity.get_meta(key)?.to_json().to_string()),
        ("set", [key, value]) => {
            entity.set_meta(key, parse_value(value))?;
            summarize(&entity.save()?)
        }
        ("unset", [key]) => {
            entity.unset_meta(key)?;
            summarize(&entity.save()?)
        }
        ("list", []) => Ok(serde_json::to_string_pretty(&entity.to_json()?)?),
        _ => Err(MetableError::Config(USAGE.to_owned())),
    }
}

// integers, doubles and booleans are stored with their own type tag
fn parse_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Float(f);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::from(raw),
    }
}

fn summarize(report: &SaveReport) -> Result<String> {
    let metas: Vec<_> = report
        .metas
        .iter()
        .map(|outcome| {
            let status = match &outcome.status {
                FlushStatus::Created => "created".to_owned(),
                FlushStatus::Updated => "updated".to_owned(),
                FlushStatus::Deleted => "deleted".to_owned(),
                FlushStatus::Skipped => "skipped".to_owned(),
                FlushStatus::Vetoed(event) => format!("vetoed by {}", event),
                FlushStatus::Failed(e) => format!("failed: {}", e),
            };
            json!({ "key": outcome.key, "status": status })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&json!({ "metas": metas }))?)
}
