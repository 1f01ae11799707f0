#![warn(missing_docs)]

//! querybox: validate and run database scripts in the sandbox.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use querybox_config::{find_config_file, InstanceConfig, QueryboxConfig, SandboxOverrides};
use querybox_sandbox::audit::TracingAuditLogger;
use querybox_sandbox::{
    BackendKind, ExecutionMode, ExecutionRequest, InstanceCatalog, InstanceEntry, SandboxConfig,
    ScriptExecutor, StaticCatalog,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "querybox", version, about = "Run untrusted database scripts in a sandbox")]
struct Cli {
    /// Config file (default: $QUERYBOX_CONFIG, then ./querybox.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a script against the validator without running it
    Validate {
        /// Script file, or "-" for stdin
        script: PathBuf,
    },

    /// Validate and execute a script against a configured instance
    Run {
        /// Script file, or "-" for stdin
        script: PathBuf,

        /// Instance identifier from the config file
        #[arg(long)]
        instance: String,

        /// Database to open on the instance
        #[arg(long)]
        database: String,

        /// Backend kind, when the instance does not declare one
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Per-run timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// List configured instances
    Instances,
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(overrides: &SandboxOverrides) -> Result<SandboxConfig> {
    let mut config = SandboxConfig::default();
    if let Some(secs) = overrides.timeout_secs {
        config.timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = overrides.grace_secs {
        config.grace = Duration::from_secs(secs);
    }
    if let Some(heap) = overrides.max_heap_mb {
        config.max_heap_size = heap * 1024 * 1024;
    }
    if let Some(concurrent) = overrides.max_concurrent {
        config.max_concurrent = concurrent;
    }
    if let Some(kb) = overrides.max_code_size_kb {
        config.max_script_size = kb * 1024;
    }
    if let Some(rows) = overrides.preview_rows {
        config.limits.preview_rows = rows;
    }
    if let Some(docs) = overrides.max_documents {
        config.limits.max_documents = docs;
    }
    if let Some(ref mode) = overrides.execution_mode {
        config.execution_mode = match mode.as_str() {
            "in_process" => ExecutionMode::InProcess,
            "child_process" => ExecutionMode::ChildProcess,
            other => anyhow::bail!(
                "unknown execution_mode '{other}' (expected child_process or in_process)"
            ),
        };
    }
    if let Some(ref bin) = overrides.worker_bin {
        config.worker_bin = Some(bin.clone());
    }
    Ok(config)
}

fn to_instance_entry(instance: &InstanceConfig) -> Result<InstanceEntry> {
    let kind = instance
        .kind
        .parse::<BackendKind>()
        .map_err(anyhow::Error::msg)?;
    Ok(InstanceEntry {
        kind: Some(kind),
        host: instance.host.clone(),
        port: instance.port,
        user: instance.user.clone(),
        password: instance.password.clone(),
        uri: instance.uri.clone(),
        credentials_env_prefix: instance.credentials_env_prefix.clone(),
    })
}

fn build_catalog(config: &QueryboxConfig) -> Result<StaticCatalog> {
    let mut instances = BTreeMap::new();
    for (id, instance) in &config.instances {
        let entry = to_instance_entry(instance).with_context(|| format!("instance '{id}'"))?;
        instances.insert(id.clone(), entry);
    }
    Ok(StaticCatalog::new(instances))
}

fn load_config(explicit: Option<&Path>) -> Result<QueryboxConfig> {
    match find_config_file(explicit) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            QueryboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(QueryboxConfig::default())
        }
    }
}

fn read_script(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut script = String::new();
        std::io::stdin()
            .read_to_string(&mut script)
            .context("failed to read script from stdin")?;
        return Ok(script);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script {}", path.display()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { script } => {
            let script = read_script(&script)?;
            let config = load_config(cli.config.as_deref())?;
            let sandbox = build_sandbox_config(&config.sandbox)?;
            let result = querybox_sandbox::validator::validate_with_limit(
                &script,
                sandbox.max_script_size,
            );
            print_json(&result)?;
            if !result.valid {
                std::process::exit(1);
            }
        }
        Command::Run {
            script,
            instance,
            database,
            backend,
            timeout_ms,
        } => {
            let script = read_script(&script)?;
            let config = load_config(cli.config.as_deref())?;
            let catalog = build_catalog(&config)?;
            let kind = catalog
                .backend_kind(&instance)
                .or(backend)
                .with_context(|| {
                    format!("instance '{instance}' is not configured and no --backend was given")
                })?;

            let sandbox = build_sandbox_config(&config.sandbox)?;
            let executor = ScriptExecutor::new(sandbox, Arc::new(catalog))
                .with_audit_logger(Arc::new(TracingAuditLogger));

            let mut request = ExecutionRequest::new(script, kind, instance, database);
            if let Some(ms) = timeout_ms {
                request = request.with_timeout_ms(ms);
            }

            let result = executor.execute(&request).await;
            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        Command::Instances => {
            let config = load_config(cli.config.as_deref())?;
            for (id, instance) in &config.instances {
                println!("{id}\t{}", instance.kind);
            }
        }
    }

    Ok(())
}
