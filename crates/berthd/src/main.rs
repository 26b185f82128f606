//! berthd — the berth operator CLI and daemon.
//!
//! One binary drives the whole engine:
//! - Topology resolution and stack composition
//! - Rollouts against the local Docker engine
//! - nginx site management
//! - Certificate issuance and renewal
//! - REST API (`serve`)
//!
//! # Usage
//!
//! ```text
//! berthd --config berth.toml validate
//! berthd rollout production --dry-run
//! berthd serve --listen 127.0.0.1:7300
//! ```
//!
//! Exit codes: 0 success, 1 partial, 2 invalid configuration, 3 failed
//! precondition (control plane or proxy unreachable, rollout in progress).

mod api;
mod daemon;
mod docker;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use berth_certs::{CertConfig, CertbotAuthority};
use berth_compose::{ComposeError, GraphError, ServiceId, ServiceSpec, compose, rollout_waves};
use berth_core::{ConfigError, EnvironmentName, RawConfig, ServiceKind, Topology, resolve};
use berth_proxy::{NginxSink, ProxyError, RenderOptions};
use berth_rollout::{
    ControlPlane, ControlPlaneError, MemoryControlPlane, RolloutConfig, RolloutController,
    RolloutError, RolloutResult,
};
use berth_state::{StateError, StateStore};

use crate::daemon::{Daemon, DaemonConfig, DeployError, Deployment, PublishError};
use crate::docker::DockerControlPlane;

#[derive(Parser)]
#[command(name = "berthd", about = "Staging and production stacks on one host")]
struct Cli {
    /// Topology file.
    #[arg(long, short, global = true, env = "BERTH_CONFIG", default_value = "berth.toml")]
    config: PathBuf,

    /// Directory for the state store.
    #[arg(long, global = true, env = "BERTH_DATA_DIR", default_value = "/var/lib/berth")]
    data_dir: PathBuf,

    #[command(flatten)]
    host: HostArgs,

    #[command(subcommand)]
    command: Command,
}

/// Where the host's collaborators live.
#[derive(Args, Debug, Clone)]
struct HostArgs {
    /// Site file nginx includes.
    #[arg(long, global = true, env = "BERTH_NGINX_SITE", default_value = "/etc/nginx/conf.d/berth.conf")]
    nginx_site: PathBuf,

    #[arg(long, global = true, env = "BERTH_NGINX_BIN", default_value = "nginx")]
    nginx_bin: PathBuf,

    /// Webroot for ACME http-01 challenges.
    #[arg(long, global = true, env = "BERTH_ACME_WEBROOT", default_value = "/var/www/berth-acme")]
    acme_webroot: PathBuf,

    /// Contact address registered with the certificate authority.
    #[arg(long, global = true, env = "BERTH_ACME_EMAIL")]
    acme_email: Option<String>,

    /// Issue from the ACME staging endpoint.
    #[arg(long, global = true, env = "BERTH_ACME_STAGING")]
    acme_staging: bool,

    /// Seconds a new instance may take to become healthy.
    #[arg(long, global = true, env = "BERTH_HEALTH_TIMEOUT", default_value = "120")]
    health_timeout: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve and compose every environment; report problems.
    Validate,

    /// Print the service specs and rollout waves of one environment.
    Compose { env: EnvironmentName },

    /// Converge one environment to the configured stack.
    Rollout {
        env: EnvironmentName,

        /// Simulate against a snapshot of the live instances.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-apply the previous spec of one service.
    Rollback {
        env: EnvironmentName,
        service: ServiceKind,
    },

    /// Issue or renew certificates that need it.
    CertPass,

    /// Show the last rollout report of one environment.
    Status { env: EnvironmentName },

    /// Run the daemon: REST API and scheduled certificate passes.
    Serve {
        #[arg(long, env = "BERTH_LISTEN", default_value = "127.0.0.1:7300")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,berthd=debug,berth=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Validate => validate(&cli.config),
        Command::Compose { env } => compose_env(&cli.config, env),
        Command::Rollout { env, dry_run: true } => dry_run(&cli.config, env).await,
        Command::Rollout { env, dry_run: false } => {
            let daemon = build_daemon(&cli.config, &cli.data_dir, &cli.host)?;
            daemon.sync_live_state().await;
            let deployment = daemon.deploy(env).await?;
            print_json(&deployment.view())?;
            Ok(deployment_exit(&deployment))
        }
        Command::Rollback { env, service } => {
            let daemon = build_daemon(&cli.config, &cli.data_dir, &cli.host)?;
            daemon.sync_live_state().await;
            let deployment = daemon.rollback(env, service).await?;
            print_json(&deployment.view())?;
            Ok(deployment_exit(&deployment))
        }
        Command::CertPass => {
            let daemon = build_daemon(&cli.config, &cli.data_dir, &cli.host)?;
            daemon.sync_live_state().await;
            let report = daemon.certificate_pass().await?;
            print_json(&report)?;
            Ok(if report.failed.is_empty() && report.reload_error.is_none() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Command::Status { env } => {
            let store = open_store(&cli.data_dir)?;
            match store.get_rollout_report::<RolloutResult>(env)? {
                Some(report) => print_json(&report)?,
                None => println!("no rollout of {env} recorded"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { listen } => {
            let daemon = build_daemon(&cli.config, &cli.data_dir, &cli.host)?;
            serve(Arc::new(daemon), listen).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── Assembly ───────────────────────────────────────────────────────

fn load_topology(path: &Path) -> anyhow::Result<Topology> {
    let raw = RawConfig::from_file(path)?;
    Ok(resolve(&raw)?)
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("cannot create {}", data_dir.display()))?;
    let path = data_dir.join("berth.redb");
    let store = StateStore::open(&path)?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

fn build_daemon(config: &Path, data_dir: &Path, host: &HostArgs) -> anyhow::Result<Daemon> {
    let topology = load_topology(config)?;
    let store = open_store(data_dir)?;
    let control_plane = Arc::new(DockerControlPlane::connect(&topology.project)?);
    let sink = Arc::new(NginxSink::new(&host.nginx_site).with_binary(&host.nginx_bin));

    let mut authority = CertbotAuthority::new(&host.acme_webroot, host.acme_email.clone());
    authority.staging = host.acme_staging;

    let config = DaemonConfig {
        rollout: RolloutConfig {
            health_timeout_secs: host.health_timeout,
            ..Default::default()
        },
        certs: CertConfig::default(),
        render: RenderOptions {
            acme_webroot: host.acme_webroot.clone(),
            ..Default::default()
        },
    };
    Ok(Daemon::new(
        topology,
        control_plane,
        sink,
        Arc::new(authority),
        store,
        config,
    ))
}

// ── Commands ───────────────────────────────────────────────────────

fn validate(config: &Path) -> anyhow::Result<ExitCode> {
    let topology = load_topology(config)?;
    println!("project {}", topology.project);
    for env in topology.environments.values() {
        if !env.enabled {
            println!("  {}: disabled", env.name);
            continue;
        }
        let specs = compose(env)?;
        let waves = rollout_waves(&specs)?;
        let domains: Vec<&str> = env.domains().collect();
        println!(
            "  {}: {} services in {} waves, port {}, {}{}",
            env.name,
            specs.len(),
            waves.len(),
            env.port,
            if env.ssl { "https " } else { "http " },
            domains.join(", ")
        );
    }
    println!("configuration valid");
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct ComposedService<'a> {
    revision: String,
    #[serde(flatten)]
    spec: &'a ServiceSpec,
}

#[derive(Serialize)]
struct Composition<'a> {
    environment: EnvironmentName,
    services: Vec<ComposedService<'a>>,
    waves: Vec<Vec<ServiceId>>,
}

fn compose_env(config: &Path, env: EnvironmentName) -> anyhow::Result<ExitCode> {
    let topology = load_topology(config)?;
    let environment = topology
        .environment(env)
        .ok_or(DeployError::NotDeployable(env))?;
    let specs = compose(environment)?;
    let waves = rollout_waves(&specs)?;
    print_json(&Composition {
        environment: env,
        services: specs
            .iter()
            .map(|spec| ComposedService {
                revision: spec.revision(),
                spec,
            })
            .collect(),
        waves,
    })?;
    Ok(ExitCode::SUCCESS)
}

/// Run the rollout against an in-memory copy of the live instances and
/// print what it would do.
async fn dry_run(config: &Path, env: EnvironmentName) -> anyhow::Result<ExitCode> {
    let topology = load_topology(config)?;
    let environment = topology
        .environment(env)
        .filter(|e| e.enabled)
        .ok_or(DeployError::NotDeployable(env))?;
    let specs = compose(environment)?;

    let docker = DockerControlPlane::connect(&topology.project)?;
    let live = docker.observe(env).await?;

    let simulated = Arc::new(MemoryControlPlane::with_startup_probes(0));
    simulated.seed(live);
    let controller = RolloutController::new(
        simulated.clone(),
        StateStore::open_in_memory()?,
        RolloutConfig {
            poll_interval_ms: 1,
            ..Default::default()
        },
    );
    let plan = controller.plan(env, &specs).await?;
    let result = controller.rollout(env, specs).await?;

    #[derive(Serialize)]
    struct DryRun {
        plan: berth_rollout::RolloutPlan,
        steps: Vec<berth_rollout::ControlPlaneEvent>,
        result: RolloutResult,
    }
    print_json(&DryRun {
        plan,
        steps: simulated.events(),
        result,
    })?;
    Ok(ExitCode::SUCCESS)
}

async fn serve(daemon: Arc<Daemon>, listen: SocketAddr) -> anyhow::Result<()> {
    info!(
        project = %daemon.topology().project,
        environments = daemon.topology().enabled_environments().count(),
        "berth daemon starting"
    );

    if let Err(e) = daemon.prime().await {
        warn!(error = %e, "initial proxy activation failed");
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let certs_handle = {
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move { daemon.run_certificates(shutdown_rx).await })
    };

    // ── API server ─────────────────────────────────────────────

    let router = api::build_router(Arc::clone(&daemon));
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listen, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for shutdown signal");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = certs_handle.await;
    info!("berth daemon stopped");
    Ok(())
}

// ── Output and exit codes ──────────────────────────────────────────

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn deployment_exit(deployment: &Deployment) -> ExitCode {
    match &deployment.published {
        Err(PublishError::Observe(_)) | Err(PublishError::Proxy(ProxyError::Unreachable(_))) => {
            ExitCode::from(3)
        }
        Err(_) => ExitCode::from(1),
        Ok(_) if !deployment.result.is_success() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
    }
}

/// Map a failed command onto the documented exit codes.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if cause.is::<ConfigError>() || cause.is::<ComposeError>() || cause.is::<GraphError>() {
            return 2;
        }
        if let Some(e) = cause.downcast_ref::<DeployError>() {
            return match e {
                DeployError::NotDeployable(_) | DeployError::Compose(_) => 2,
                DeployError::Rollout(e) => rollout_exit(e),
            };
        }
        if let Some(e) = cause.downcast_ref::<RolloutError>() {
            return rollout_exit(e);
        }
        if cause.is::<ControlPlaneError>() {
            return 3;
        }
        if let Some(ProxyError::Unreachable(_)) = cause.downcast_ref::<ProxyError>() {
            return 3;
        }
        if let Some(StateError::Locked(_)) = cause.downcast_ref::<StateError>() {
            return 3;
        }
    }
    1
}

fn rollout_exit(e: &RolloutError) -> u8 {
    match e {
        RolloutError::InProgress(_) | RolloutError::Precondition { .. } => 3,
        RolloutError::InvalidGraph(_) => 2,
        RolloutError::NoHistory(_) | RolloutError::State(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn rollout_arguments_parse() {
        let cli = Cli::try_parse_from(["berthd", "rollout", "production", "--dry-run"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Rollout {
                env: EnvironmentName::Production,
                dry_run: true
            }
        ));

        let cli = Cli::try_parse_from(["berthd", "rollback", "staging", "worker-default"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Rollback {
                env: EnvironmentName::Staging,
                service: ServiceKind::WorkerDefault
            }
        ));

        assert!(Cli::try_parse_from(["berthd", "rollout", "qa"]).is_err());
    }

    #[test]
    fn config_errors_exit_with_two() {
        let err = anyhow::Error::from(ConfigError::UnknownEnvironment("qa".to_string()));
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::from(DeployError::NotDeployable(EnvironmentName::Staging));
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn preconditions_exit_with_three() {
        let err = anyhow::Error::from(DeployError::Rollout(RolloutError::InProgress(
            EnvironmentName::Production,
        )));
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::from(RolloutError::Precondition {
            environment: EnvironmentName::Production,
            reason: "control plane unreachable".to_string(),
        });
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::from(ControlPlaneError::Unreachable("socket".to_string()))
            .context("observing live instances");
        assert_eq!(exit_code(&err), 3);

        let err = anyhow::Error::from(StateError::Locked(PathBuf::from("/var/lib/berth/berth.redb")));
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn other_failures_exit_with_one() {
        let err = anyhow::Error::from(RolloutError::NoHistory("production/web".to_string()));
        assert_eq!(exit_code(&err), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("boom")), 1);
    }
}
