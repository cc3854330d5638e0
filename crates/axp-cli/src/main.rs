//! axp admin CLI: migrations, registry management, execution inspection,
//! and the explicit rerun path.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::Utc;

use axp_execution::{AttemptStore, IntentStore, OutcomeStore};
use axp_registry::{NewRegistryEntry, RegistryError, RegistryStore};
use axp_resilience::TracingMetricsSink;
use axp_runtime::{DedupingGateway, HttpToolGateway, Orchestrator};
use axp_schemas::StartInput;
use axp_store::{KvStore, PgKvStore};

#[derive(Parser)]
#[command(name = "axp")]
#[command(about = "Action execution pipeline admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (defaults first, overrides last)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Action-type registry commands
    Registry {
        #[command(subcommand)]
        cmd: RegistryCmd,
    },

    /// Execution inspection and the explicit rerun path
    Execution {
        #[command(subcommand)]
        cmd: ExecutionCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
    /// Delete expired rows (TTL sweep)
    SweepExpired,
}

#[derive(Subcommand)]
enum RegistryCmd {
    /// Register every entry in a YAML seed file (versions auto-assigned)
    Seed {
        /// Seed file: a YAML list of registry entries
        file: String,
    },
    /// Print the entries for an action type
    Show {
        action_type: String,
        /// Specific version; latest when omitted
        #[arg(long)]
        version: Option<i64>,
    },
}

#[derive(Subcommand)]
enum ExecutionCmd {
    /// Print the resolved status for an intent (outcome > attempt > intent)
    Status {
        intent_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        account: String,
    },
    /// Explicit rerun of a terminal execution (the only path that may
    /// transition terminal -> RUNNING)
    Rerun {
        intent_id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        account: String,
        /// Tool gateway endpoint
        #[arg(long)]
        gateway_url: String,
        /// Layered config paths in merge order (defaults when omitted)
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = axp_store::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = axp_store::status(&pool).await?;
                    println!("db_ok={} has_kv_table={}", s.ok, s.has_kv_table);
                }
                DbCmd::Migrate => {
                    axp_store::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
                DbCmd::SweepExpired => {
                    let store = PgKvStore::new(pool);
                    let swept = store
                        .sweep_expired(Utc::now().timestamp())
                        .await
                        .map_err(anyhow::Error::new)?;
                    println!("rows_swept={swept}");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = axp_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Registry { cmd } => {
            let store = store_from_env().await?;
            let registry = RegistryStore::new(store);
            match cmd {
                RegistryCmd::Seed { file } => {
                    let raw = std::fs::read_to_string(&file)
                        .with_context(|| format!("read seed file: {file}"))?;
                    let entries: Vec<NewRegistryEntry> =
                        serde_yaml::from_str(&raw).context("parse seed file")?;
                    for entry in entries {
                        let registered = register_with_one_retry(&registry, entry).await?;
                        println!(
                            "registered action_type={} registry_version={} tool_name={}",
                            registered.action_type,
                            registered.registry_version,
                            registered.tool_name
                        );
                    }
                }
                RegistryCmd::Show { action_type, version } => {
                    match registry.get_mapping(&action_type, version).await? {
                        Some(entry) => {
                            println!("action_type={}", entry.action_type);
                            println!("registry_version={}", entry.registry_version);
                            println!("tool_name={}", entry.tool_name);
                            println!("tool_schema_version={}", entry.tool_schema_version);
                            println!("risk_class={:?}", entry.risk_class);
                            println!("compensation_strategy={:?}", entry.compensation_strategy);
                            println!("mappings={}", entry.parameter_mapping.len());
                        }
                        None => println!("mapping_found=false"),
                    }
                }
            }
        }

        Commands::Execution { cmd } => match cmd {
            ExecutionCmd::Status {
                intent_id,
                tenant,
                account,
            } => {
                let store = store_from_env().await?;
                print_execution_status(store, &intent_id, &tenant, &account).await?;
            }
            ExecutionCmd::Rerun {
                intent_id,
                tenant,
                account,
                gateway_url,
                config_paths,
            } => {
                let store = store_from_env().await?;
                let config = if config_paths.is_empty() {
                    axp_config::ExecutionConfig::default()
                } else {
                    let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
                    axp_config::load_layered_yaml(&path_refs)?.execution()
                };

                let gateway = DedupingGateway::new(
                    HttpToolGateway::new(),
                    dedupe_store_for(store.clone(), &config),
                    axp_ledger::EventLedger::new(store.clone()),
                    Arc::new(TracingMetricsSink),
                );
                let orchestrator = Orchestrator::new(
                    store,
                    gateway,
                    Arc::new(TracingMetricsSink),
                    &config,
                    gateway_url,
                );

                let outcome = orchestrator
                    .rerun(StartInput {
                        action_intent_id: intent_id,
                        tenant_id: tenant,
                        account_id: account,
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("rerun failed: {e}"))?;

                println!("status={}", outcome.status.as_str());
                println!("attempt_count={}", outcome.attempt_count);
                println!("tool_run_ref={}", outcome.tool_run_ref);
                println!("trace_id={}", outcome.trace_id);
            }
        },
    }

    Ok(())
}

async fn store_from_env() -> Result<Arc<dyn KvStore>> {
    let pool = axp_store::connect_from_env().await?;
    Ok(Arc::new(PgKvStore::new(pool)))
}

fn dedupe_store_for(
    store: Arc<dyn KvStore>,
    config: &axp_config::ExecutionConfig,
) -> axp_idempotency::DedupeStore<Arc<dyn KvStore>> {
    axp_idempotency::DedupeStore::new(store).with_retention_days(config.dedupe_retention_days)
}

/// Two admins can race the same next version; retry the read-assign-create
/// cycle once, then surface the conflict.
async fn register_with_one_retry(
    registry: &RegistryStore<Arc<dyn KvStore>>,
    entry: NewRegistryEntry,
) -> Result<axp_schemas::RegistryEntry> {
    match registry.register(entry.clone()).await {
        Ok(registered) => Ok(registered),
        Err(RegistryError::VersionConflict { .. }) => {
            registry.register(entry).await.map_err(anyhow::Error::new)
        }
        Err(e) => Err(anyhow::Error::new(e)),
    }
}

async fn print_execution_status(
    store: Arc<dyn KvStore>,
    intent_id: &str,
    tenant: &str,
    account: &str,
) -> Result<()> {
    let outcomes = OutcomeStore::new(store.clone());
    if let Some(outcome) = outcomes.get(intent_id, tenant, account).await? {
        println!("source=outcome");
        println!("status={}", outcome.status.as_str());
        println!("tool_name={}", outcome.tool_name);
        println!("attempt_count={}", outcome.attempt_count);
        println!("completed_at={}", outcome.completed_at.to_rfc3339());
        if let Some(class) = outcome.error_class {
            println!("error_class={class}");
        }
        return Ok(());
    }

    let attempts = AttemptStore::new(store.clone());
    if let Some(attempt) = attempts.get_attempt(intent_id, tenant, account).await? {
        println!("source=attempt");
        println!("status={}", attempt.status.as_str());
        println!("attempt_count={}", attempt.attempt_count);
        println!("trace_id={}", attempt.trace_id);
        return Ok(());
    }

    let intents = IntentStore::new(store);
    match intents.get(intent_id, tenant, account).await? {
        Some(intent) => {
            println!("source=intent");
            let status = if intent.is_expired(Utc::now().timestamp()) {
                "EXPIRED"
            } else {
                "PENDING"
            };
            println!("status={status}");
        }
        None => println!("status=NOT_FOUND"),
    }
    Ok(())
}
