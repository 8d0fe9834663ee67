//! Sensor workloads run as external processes.
//!
//! Each mode maps to a command line. The child is started with
//! `--config <path>` pointing at the persisted configuration, reads
//! pass-through coordinator commands on stdin (one per line) and writes
//! `TOPIC PAYLOAD` event lines on stdout. Closing stdin asks it to exit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use hive_common::Mode;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{Workload, WorkloadContext, WorkloadFactory};
use crate::domain::OutboundMessage;

/// A program and its fixed leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Split a whitespace-separated command line.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty command line.
    pub fn parse(text: &str) -> Result<Self> {
        let mut words = text.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| anyhow!("workload command must not be empty"))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

/// Builds a [`ProcessWorkload`] for each mode that has a command.
pub struct ProcessWorkloadFactory {
    work_dir: PathBuf,
    config_path: PathBuf,
    commands: HashMap<Mode, CommandLine>,
}

impl ProcessWorkloadFactory {
    #[must_use]
    pub fn new(work_dir: PathBuf, config_path: PathBuf) -> Self {
        Self {
            work_dir,
            config_path,
            commands: HashMap::new(),
        }
    }

    /// Register the command that runs `mode`.
    #[must_use]
    pub fn with_command(mut self, mode: Mode, command: CommandLine) -> Self {
        self.commands.insert(mode, command);
        self
    }
}

impl WorkloadFactory for ProcessWorkloadFactory {
    fn build(&self, mode: Mode, ctx: WorkloadContext) -> Result<Arc<dyn Workload>> {
        let command = self
            .commands
            .get(&mode)
            .ok_or_else(|| anyhow!("no command configured for {mode} mode"))?;
        Ok(Arc::new(ProcessWorkload {
            mode,
            command: command.clone(),
            work_dir: self.work_dir.clone(),
            config_path: self.config_path.clone(),
            agent_id: ctx.agent_id.to_string(),
            public_ip: ctx.public_ip,
            commands: Mutex::new(Some(ctx.commands)),
            events: ctx.events,
            stop: CancellationToken::new(),
        }))
    }
}

pub struct ProcessWorkload {
    mode: Mode,
    command: CommandLine,
    work_dir: PathBuf,
    config_path: PathBuf,
    agent_id: String,
    public_ip: String,
    commands: Mutex<Option<broadcast::Receiver<String>>>,
    events: mpsc::Sender<OutboundMessage>,
    stop: CancellationToken,
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn start(&self) -> Result<()> {
        let mut commands = self
            .commands
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| anyhow!("{} workload already started", self.mode))?;

        let program = &self.command.program;
        let mut child = tokio::process::Command::new(program)
            .args(&self.command.args)
            .arg("--config")
            .arg(&self.config_path)
            .current_dir(&self.work_dir)
            .env("HIVE_AGENT_ID", &self.agent_id)
            .env("HIVE_PUBLIC_IP", &self.public_ip)
            .env("HIVE_MODE", self.mode.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;
        info!(mode = %self.mode, %program, pid = child.id(), "workload process started");

        let mut stdin = child.stdin.take();
        let mut lines = child
            .stdout
            .take()
            .map(|out| BufReader::new(out).lines())
            .context("workload stdout not captured")?;
        let mut stdout_open = true;
        let mut commands_open = true;

        let status = loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled(), if stdin.is_some() => {
                    debug!(mode = %self.mode, "closing workload stdin");
                    stdin = None;
                }
                line = lines.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => self.forward(&line).await,
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(mode = %self.mode, error = %e, "reading workload output failed");
                        stdout_open = false;
                    }
                },
                command = commands.recv(), if commands_open && stdin.is_some() => match command {
                    Ok(line) => {
                        if let Some(pipe) = stdin.as_mut() {
                            if let Err(e) = write_line(pipe, &line).await {
                                warn!(mode = %self.mode, error = %e, "workload stopped reading commands");
                                stdin = None;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(mode = %self.mode, skipped, "workload missed commands");
                    }
                    Err(broadcast::error::RecvError::Closed) => commands_open = false,
                },
                status = child.wait() => {
                    break status.with_context(|| format!("waiting for {program}"))?;
                }
            }
        };

        if self.stop.is_cancelled() || status.success() {
            debug!(mode = %self.mode, %status, "workload process exited");
            return Ok(());
        }
        bail!("{program} exited with {status}")
    }

    async fn stop(&self) {
        self.stop.cancel();
    }
}

impl ProcessWorkload {
    async fn forward(&self, line: &str) {
        let Some(msg) = OutboundMessage::parse_local(line) else {
            return;
        };
        if self.events.send(msg).await.is_err() {
            debug!(mode = %self.mode, "relay queue closed, dropping workload event");
        }
    }
}

async fn write_line(pipe: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.write_all(b"\n").await?;
    pipe.flush().await
}
