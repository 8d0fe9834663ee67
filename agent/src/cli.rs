//! CLI argument parsing with clap derive, and process bootstrap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hive_common::Mode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::ConfigStore;
use crate::application::services::agent::{Agent, AgentDeps, Channels, Link};
use crate::domain::AgentExit;
use crate::infra::config_store::{CONFIG_FILE, JsonConfigStore};
use crate::infra::keys::ChannelKeys;
use crate::infra::network::{DEFAULT_IP_SERVICE_URL, NetworkResolver};
use crate::infra::process_workload::{CommandLine, ProcessWorkloadFactory};
use crate::infra::transport::{InboundChannel, OutboundChannel};

/// Sensor agent: keeps an encrypted control channel to the hive coordinator
/// and supervises the sensor workload it is told to run.
#[derive(Parser, Debug)]
#[command(name = "hive-agent", version)]
pub struct Cli {
    /// Directory holding the configuration file and `certificates/`
    #[arg(long, env = "HIVE_WORK_DIR", default_value = ".")]
    pub work_dir: PathBuf,

    /// Configuration file [default: <WORK_DIR>/hive.json]
    #[arg(long, env = "HIVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Unix socket local producers write `TOPIC PAYLOAD` lines to
    #[arg(long, env = "HIVE_LOCAL_SOCKET")]
    pub local_socket: Option<PathBuf>,

    /// Command line that runs the honeypot workload
    #[arg(long, env = "HIVE_HONEYPOT_CMD")]
    pub honeypot_cmd: Option<String>,

    /// Command line that runs the client workload
    #[arg(long, env = "HIVE_CLIENT_CMD")]
    pub client_cmd: Option<String>,

    /// Service that echoes the caller's public address
    #[arg(long, env = "HIVE_IP_SERVICE_URL", default_value = DEFAULT_IP_SERVICE_URL)]
    pub ip_service_url: String,
}

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub work_dir: PathBuf,
    pub config_path: PathBuf,
    pub local_socket: Option<PathBuf>,
    pub workloads: Vec<(Mode, CommandLine)>,
    pub ip_service_url: String,
}

impl Cli {
    /// Resolve defaults and parse workload command lines.
    ///
    /// # Errors
    ///
    /// Returns an error if a workload command line is empty.
    pub fn settings(self) -> Result<AgentSettings> {
        let config_path = self
            .config
            .unwrap_or_else(|| self.work_dir.join(CONFIG_FILE));
        let mut workloads = Vec::new();
        for (mode, text) in [
            (Mode::Honeypot, self.honeypot_cmd),
            (Mode::Client, self.client_cmd),
        ] {
            if let Some(text) = text {
                let command =
                    CommandLine::parse(&text).with_context(|| format!("parsing {mode} command"))?;
                workloads.push((mode, command));
            }
        }
        Ok(AgentSettings {
            work_dir: self.work_dir,
            config_path,
            local_socket: self.local_socket,
            workloads,
            ip_service_url: self.ip_service_url,
        })
    }

    /// # Errors
    ///
    /// See [`run_agent`].
    pub async fn run(self) -> Result<AgentExit> {
        run_agent(self.settings()?).await
    }
}

/// Wire the adapters together and run the agent until it exits.
///
/// # Errors
///
/// Returns an error if the configuration or keys cannot be loaded, or when
/// the agent escalates a fault.
pub async fn run_agent(settings: AgentSettings) -> Result<AgentExit> {
    let store = Arc::new(JsonConfigStore::new(settings.config_path.clone()));
    let config = store.load().await?.with_context(|| {
        format!(
            "no configuration found at {}",
            settings.config_path.display()
        )
    })?;
    let keys = Arc::new(ChannelKeys::load(&settings.work_dir).context("loading channel keys")?);
    let resolver = Arc::new(NetworkResolver::new(settings.ip_service_url.as_str())?);

    let mut factory = ProcessWorkloadFactory::new(settings.work_dir.clone(), settings.config_path);
    for (mode, command) in settings.workloads {
        factory = factory.with_command(mode, command);
    }

    // Endpoints are read once; a CONFIG that moves them applies on restart.
    let endpoints = config.coordinator.clone();
    let agent = Agent::new(
        config,
        AgentDeps {
            store,
            factory: Arc::new(factory),
            resolver,
        },
    )
    .await?;
    let shutdown = agent.shutdown_token();
    spawn_signal_listener(shutdown.clone());

    let (outbound, outbound_events) = OutboundChannel::connect(
        &endpoints.event_url,
        Arc::clone(&keys),
        shutdown.child_token(),
    )?;
    let (inbound, inbound_events) = InboundChannel::connect(
        &endpoints.command_url,
        keys,
        agent.identity().as_str(),
        shutdown.child_token(),
    )?;

    #[cfg(unix)]
    let (socket, local) = match &settings.local_socket {
        Some(path) => {
            let (socket, rx) =
                crate::infra::local_socket::LocalSocket::bind(path, shutdown.child_token())?;
            (Some(socket), Some(rx))
        }
        None => (None, None),
    };
    #[cfg(not(unix))]
    let local = {
        if settings.local_socket.is_some() {
            warn!("local socket is only supported on unix, ignoring");
        }
        None
    };

    info!(agent_id = %agent.identity(), "agent starting");
    let exit = agent
        .run(Channels {
            outbound: Link {
                channel: outbound,
                events: outbound_events,
                endpoint: endpoints.event_url,
            },
            inbound: Link {
                channel: inbound,
                events: inbound_events,
                endpoint: endpoints.command_url,
            },
            local,
        })
        .await;
    #[cfg(unix)]
    drop(socket);
    exit
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = termination_signal() => {}
        }
        info!("received termination signal");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                () = ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM");
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
