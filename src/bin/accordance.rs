//! Accordance command-line driver.
//!
//! Loads a JSON corpus of applications and policies into in-memory stores,
//! runs one detection pass, and prints the report and findings as JSON.

use std::path::PathBuf;
use std::process::ExitCode;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use accordance::{
    AccordError, Application, ApplicationId, Conflict, ConflictFilter, DetectionEngine, DetectionReport,
    DetectionScope, EngineConfig, EngineStores, InconsistencyFilter, InconsistentEnforcement, Policy,
};

/// Command-line options.
struct Options {
    policies: PathBuf,
    config: Option<PathBuf>,
    cross_application: bool,
    applications: Vec<ApplicationId>,
}

const USAGE: &str = "\
accordance - detect conflicting and inconsistent authorization policies

USAGE:
    accordance --policies <FILE> [OPTIONS]

OPTIONS:
    -p, --policies <FILE>   JSON corpus: {\"applications\": [...], \"policies\": [...]}
    -c, --config <FILE>     Engine configuration (TOML)
    -x, --cross-app         Compare across applications instead of within each
    -a, --app <ID>          Limit detection to an application (repeatable)
    -h, --help              Print help information";

fn parse_args() -> Result<Options, String> {
    let mut args = std::env::args().skip(1);
    let mut policies = None;
    let mut config = None;
    let mut cross_application = false;
    let mut applications = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--policies" | "-p" => {
                policies = Some(PathBuf::from(args.next().ok_or("--policies requires a value")?));
            }
            "--config" | "-c" => {
                config = Some(PathBuf::from(args.next().ok_or("--config requires a value")?));
            }
            "--cross-app" | "-x" => cross_application = true,
            "--app" | "-a" => {
                applications.push(ApplicationId::new(args.next().ok_or("--app requires a value")?));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(Options {
        policies: policies.ok_or("--policies is required")?,
        config,
        cross_application,
        applications,
    })
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Debug, Deserialize)]
struct Corpus {
    #[serde(default)]
    applications: Vec<Application>,
    policies: Vec<Policy>,
}

#[derive(Debug, Serialize)]
struct Output {
    report: DetectionReport,
    conflicts: Vec<Conflict>,
    inconsistent_enforcement: Vec<InconsistentEnforcement>,
}

/// Rejects records the builder would refuse.
fn check_record(policy: &Policy) -> Result<(), AccordError> {
    Policy::builder()
        .id(policy.id)
        .resource(policy.resource.clone())
        .action(policy.action.clone())
        .build()
        .map(|_| ())
        .map_err(AccordError::from)
}

fn run(options: &Options) -> Result<Output, Box<dyn std::error::Error>> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let corpus: Corpus = serde_json::from_str(&std::fs::read_to_string(&options.policies)?)?;

    let engine = DetectionEngine::new(EngineStores::in_memory(), config)?;
    for application in corpus.applications {
        engine.stores().applications.upsert(application)?;
    }
    let total = corpus.policies.len();
    for policy in corpus.policies {
        check_record(&policy).map_err(|e| format!("policy {}: {e}", policy.id))?;
        engine.stores().policies.insert(policy)?;
    }
    info!(policies = total, "corpus loaded");

    let scope = if options.applications.is_empty() {
        DetectionScope::All
    } else {
        DetectionScope::Applications(options.applications.iter().cloned().collect())
    };
    let report = engine.detect(&scope, options.cross_application)?;

    Ok(Output {
        report,
        conflicts: engine.list_conflicts(&ConflictFilter::pending())?,
        inconsistent_enforcement: engine.list_inconsistencies(&InconsistencyFilter::default())?,
    })
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };
    init_tracing();

    match run(&options).and_then(|output| Ok(serde_json::to_string_pretty(&output)?)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "detection failed");
            ExitCode::FAILURE
        }
    }
}
