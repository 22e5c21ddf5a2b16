use std::path::{Component, Path, PathBuf};
use std::sync::Once;

use actorvm_core::perf::scenarios::{Scenario, find_scenario, scenarios};
use actorvm_core::rt::{RuntimeConfig, RuntimeStats};
use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

static TRACE_INIT: Once = Once::new();
const DEFAULT_TRACE_FILTER: &str = "actorvm_core=info,actorvm_cli=info";
const TRACE_ENV: &str = "ACTORVM_TRACE";


#[derive(Debug, Parser)]
#[command(name = "actorvm", author, version, about = "Run actorvm workloads", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a built-in scenario and print its result
    Run {
        /// Scenario key, see `actorvm scenarios`
        scenario: String,
        /// Runtime config file (TOML)
        #[arg(long, value_name = "FILE", value_parser = parse_sanitized_path)]
        config: Option<PathBuf>,
        /// Force the current-thread runtime
        #[arg(long)]
        single_thread: bool,
        /// Print the result and runtime stats as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the built-in scenarios
    Scenarios,
    /// Print the effective runtime config as JSON
    Config {
        #[arg(long, value_name = "FILE", value_parser = parse_sanitized_path)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    scenario: &'a str,
    value: String,
    stats: RuntimeStats,
}

fn sanitize_path(raw: &str) -> anyhow::Result<PathBuf> {
    let p = Path::new(raw);

    for comp in p.components() {
        if matches!(comp, Component::ParentDir) {
            return Err(anyhow::anyhow!(
                "Parent directory components ('..') are not allowed in file paths."
            ));
        }
    }

    Ok(p.to_path_buf())
}

fn parse_sanitized_path(raw: &str) -> Result<PathBuf, String> {
    sanitize_path(raw).map_err(|e| e.to_string())
}

fn env_toggle_enabled(raw: &str) -> bool {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return false;
    }
    !(trimmed.eq_ignore_ascii_case("0") || trimmed.eq_ignore_ascii_case("false") || trimmed.eq_ignore_ascii_case("off"))
}

fn filter_expr_from(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("1")
        || trimmed.eq_ignore_ascii_case("true")
        || trimmed.eq_ignore_ascii_case("on")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn maybe_init_tracing() {
    let raw = match std::env::var(TRACE_ENV) {
        Ok(value) => value,
        Err(_) => return,
    };

    if !env_toggle_enabled(&raw) {
        return;
    }

    TRACE_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::fmt;

        let filter_expr = filter_expr_from(&raw).or_else(|| std::env::var("RUST_LOG").ok());

        let builder = fmt().with_writer(std::io::stderr);

        let builder = match filter_expr.and_then(|expr| EnvFilter::try_new(expr).ok()) {
            Some(filter) => builder.with_env_filter(filter),
            None => builder.with_env_filter(DEFAULT_TRACE_FILTER),
        };

        let _ = builder.try_init();
    });
}

/// File settings first, then `ACTORVM_*` variables, then flags.
fn load_config(path: Option<&Path>, single_thread: bool) -> anyhow::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_toml_file(path)?,
        None => RuntimeConfig::default(),
    };
    let mut config = config.with_env()?;
    if single_thread {
        config.single_thread = true;
    }
    Ok(config)
}

fn lookup_scenario(key: &str) -> anyhow::Result<&'static Scenario> {
    match find_scenario(key) {
        Some(scenario) => Ok(scenario),
        None => {
            let known = scenarios().iter().map(Scenario::key).collect::<Vec<_>>().join(", ");
            bail!("unknown scenario '{key}' (known: {known})")
        }
    }
}

fn run_scenario(key: &str, config: RuntimeConfig, json: bool) -> anyhow::Result<()> {
    let scenario = lookup_scenario(key)?;
    info!(scenario = scenario.key(), single_thread = config.single_thread, "running scenario");
    let outcome = scenario.run(config)?;
    if json {
        let report = RunReport {
            scenario: scenario.key(),
            value: outcome.value.to_string(),
            stats: outcome.stats,
        };
        println!("{}", serde_json::to_string_pretty(&report).context("serializing report")?);
    } else {
        println!("{}", outcome.value);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    maybe_init_tracing();

    let CliArgs { command } = CliArgs::parse();
    match command {
        Commands::Run {
            scenario,
            config,
            single_thread,
            json,
        } => {
            let config = load_config(config.as_deref(), single_thread)?;
            run_scenario(&scenario, config, json)
        }
        Commands::Scenarios => {
            for scenario in scenarios() {
                println!("{:<12} {} (= {})", scenario.key(), scenario.title(), scenario.expected());
            }
            Ok(())
        }
        Commands::Config { config } => {
            let config = load_config(config.as_deref(), false)?;
            println!("{}", serde_json::to_string_pretty(&config).context("serializing config")?);
            Ok(())
        }
    }
}
