//! Gatekeeper CLI entry point.
//!
//! `serve` runs the drift scheduler and policy watcher until Ctrl-C; every
//! other subcommand performs one operation and prints JSON on stdout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use gatekeeper::audit::metrics::GovernanceMetrics;
use gatekeeper::audit::GovernanceLogger;
use gatekeeper::config::{config_dir, load_or_default, Config, PathsConfig};
use gatekeeper::drift::scheduler::{run_drift_scheduler, ScheduledScan};
use gatekeeper::governance::{GovernanceDeps, GovernanceService, GovernanceSettings, PromotionRequest};
use gatekeeper::policy::watcher::{load_dir, PolicyWatcher};
use gatekeeper::policy::{PolicyBundle, PolicyEvaluator, PolicyRegistry, RuleBasedEvaluator};
use gatekeeper::proof::canonical::spec_hash;
use gatekeeper::proof::signing::generate_secret;
use gatekeeper::remediation::ApplyOptions;
use gatekeeper::store::sqlite::SqliteStore;
use gatekeeper::types::{Actor, ActorRole, AgentRecord, AgentSpec};
use gatekeeper::{credentials, logging};

/// Gatekeeper: admission control and policy governance for agents.
#[derive(Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Config file (default: ~/.gatekeeper/gatekeeper.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the drift scheduler and policy watcher until interrupted.
    Serve,
    /// Decide whether an agent may start.
    Check {
        /// Agent identifier.
        agent_id: String,
    },
    /// Store an agent record read from a JSON file.
    Register {
        /// Path to the agent record.
        record: PathBuf,
    },
    /// Promote a sandbox agent to governed.
    Promote {
        /// Agent identifier.
        agent_id: String,
        /// Path to the promotion request.
        request: PathBuf,
        /// Actor performing the promotion.
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Hot-reload a policy bundle.
    Reload {
        /// Policy set name.
        policy_set: String,
        /// Path to the bundle.
        bundle: PathBuf,
        /// Actor performing the reload.
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Scan every governed agent for drift.
    Scan,
    /// Detect drift on one agent and apply its remediation plan.
    Remediate {
        /// Agent identifier.
        agent_id: String,
        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,
        /// Apply plans that require approval (unsafe actions are still skipped).
        #[arg(long)]
        force: bool,
    },
    /// Revoke a signing authority.
    Revoke {
        /// Authority name.
        authority: String,
    },
    /// Restore trust in a signing authority.
    Unrevoke {
        /// Authority name.
        authority: String,
    },
    /// Print the spec hash of an agent record or spec file.
    SpecHash {
        /// Path to the agent record or spec.
        agent: PathBuf,
    },
    /// Print a fresh random signing secret.
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => handle_serve(cli.config).await,
        Command::SpecHash { agent } => {
            logging::init_cli();
            handle_spec_hash(&agent)
        }
        Command::Keygen => print_json(&serde_json::json!({ "secret": generate_secret() })),
        command => {
            logging::init_cli();
            let runtime = Runtime::open(cli.config).await?;
            runtime.handle(command).await
        }
    }
}

/// Everything a subcommand needs.
struct Runtime {
    config: Config,
    base_dir: PathBuf,
    service: Arc<GovernanceService>,
}

impl Runtime {
    async fn open(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_path = match config_path {
            Some(path) => path,
            None => config_dir()?.join("gatekeeper.toml"),
        };
        let base_dir = config_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let config = load_or_default(&config_path)?;

        let db_path = PathsConfig::resolve(&base_dir, &config.paths.database);
        let store = Arc::new(SqliteStore::open(&db_path).await?);

        let env_file = config
            .signing
            .env_file
            .as_ref()
            .map(|p| PathsConfig::resolve(&base_dir, p));
        let mut signing = config.signing.clone();
        signing.env_file = env_file;
        let (attestor, keyring) =
            credentials::load_signing_keys(&signing).context("failed to load signing keys")?;

        let registry = Arc::new(PolicyRegistry::new(store.clone(), store.clone()));
        let mut policy_sets = store.stored_policy_sets().await?;
        for set in &config.policy.policy_sets {
            if !policy_sets.contains(set) {
                policy_sets.push(set.clone());
            }
        }
        registry
            .restore(&policy_sets)
            .await
            .context("failed to restore policy registry")?;

        let evaluator: Arc<dyn PolicyEvaluator> = match &config.policy.allowed_capabilities {
            Some(allowed) => Arc::new(RuleBasedEvaluator::with_allowed_capabilities(
                allowed.iter().cloned(),
            )),
            None => Arc::new(RuleBasedEvaluator::new()),
        };

        let deps = GovernanceDeps {
            registry,
            agents: store.clone(),
            evaluator,
            attestor,
            keyring,
            logger: Arc::new(GovernanceLogger::new(store.clone())),
            metrics: Arc::new(GovernanceMetrics::new()),
        };
        let service = Arc::new(GovernanceService::new(
            deps,
            &config.admission,
            GovernanceSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            base_dir,
            service,
        })
    }

    async fn handle(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Check { agent_id } => {
                print_json(&self.service.check_admission(&agent_id).await)
            }
            Command::Register { record } => {
                let submitted: AgentRecord = read_json(&record)?;
                let record = self
                    .service
                    .register_sandbox(&submitted.id, submitted.spec)
                    .await?;
                print_json(&serde_json::json!({
                    "registered": record.id,
                    "status": record.status,
                    "expires_at": record.expires_at,
                }))
            }
            Command::Promote {
                agent_id,
                request,
                actor,
            } => {
                let request: PromotionRequest = read_json(&request)?;
                let actor = Actor::new(actor, ActorRole::AgentAdmin);
                print_json(&self.service.promote(&agent_id, request, &actor).await?)
            }
            Command::Reload {
                policy_set,
                bundle,
                actor,
            } => {
                let bundle: PolicyBundle = read_json(&bundle)?;
                let actor = Actor::new(actor, ActorRole::PolicyAdmin);
                print_json(&self.service.hot_reload_policy(&policy_set, bundle, &actor).await?)
            }
            Command::Scan => print_json(&self.service.run_drift_scan().await?),
            Command::Remediate {
                agent_id,
                dry_run,
                force,
            } => {
                let options = ApplyOptions { dry_run, force };
                print_json(&self.service.remediate(&agent_id, options).await?)
            }
            Command::Revoke { authority } => {
                let changed = self.service.revoke_signer(&authority).await?;
                print_json(&serde_json::json!({ "authority": authority, "revoked": true, "changed": changed }))
            }
            Command::Unrevoke { authority } => {
                let changed = self.service.unrevoke_signer(&authority).await?;
                print_json(&serde_json::json!({ "authority": authority, "revoked": false, "changed": changed }))
            }
            Command::Serve | Command::SpecHash { .. } | Command::Keygen => {
                anyhow::bail!("subcommand is not handled by the runtime")
            }
        }
    }
}

/// Run the scheduler and watcher until Ctrl-C.
async fn handle_serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    // Logging needs the config, so load it before opening the runtime.
    let probe_path = match &config_path {
        Some(path) => path.clone(),
        None => config_dir()?.join("gatekeeper.toml"),
    };
    let probe = load_or_default(&probe_path)?;
    let probe_base = probe_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let logging_guard = logging::init_serve(&probe.paths, &probe_base)?;
    info!(logs_dir = %logging_guard.logs_dir().display(), "logging to file");

    let runtime = Runtime::open(Some(probe_path)).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = if runtime.config.drift.enabled {
        let task: Arc<dyn ScheduledScan> = runtime.service.clone();
        Some(tokio::spawn(run_drift_scheduler(
            task,
            runtime.config.drift.interval_secs,
            shutdown_rx.clone(),
        )))
    } else {
        info!("drift scheduler disabled");
        None
    };

    let _watcher = match &runtime.config.paths.policy_dir {
        Some(dir) => {
            let dir = PathsConfig::resolve(&runtime.base_dir, dir);
            for update in load_dir(&dir)? {
                runtime.service.apply_policy_update(update).await;
            }
            let (watcher, mut updates) = PolicyWatcher::start(&dir)?;
            let service = runtime.service.clone();
            let mut stop = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = updates.recv() => match update {
                            Some(update) => {
                                service.apply_policy_update(update).await;
                            }
                            None => break,
                        },
                        _ = stop.changed() => break,
                    }
                }
            });
            Some(watcher)
        }
        None => None,
    };

    info!(
        policy_sets = ?runtime.service.registry().policy_sets(),
        "gatekeeper serving"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("no background tasks were listening for shutdown");
    }
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!(error = %e, "drift scheduler task failed");
        }
    }

    info!(metrics = ?runtime.service.metrics().snapshot(), "gatekeeper stopped");
    Ok(())
}

fn handle_spec_hash(path: &Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let spec = match serde_json::from_str::<AgentRecord>(&text) {
        Ok(record) => record.spec,
        Err(_) => serde_json::from_str::<AgentSpec>(&text)
            .with_context(|| format!("{} is neither an agent record nor a spec", path.display()))?,
    };
    print_json(&serde_json::json!({ "spec_hash": spec_hash(&spec)? }))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}
