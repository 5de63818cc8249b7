//! Owns one agent subprocess: spawn, health-poll, idle timer, crash detection, restart
//! backoff, stop (spec.md §4.2 "Supervisor algorithm").

use std::process::Stdio;
use std::time::Duration;

use agent_client::AgentClient;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::instance::InstanceConfig;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub agent_binary: String,
    pub startup_timeout: Duration,
    pub health_check_interval: Duration,
    pub idle_timeout: Duration,
    pub restart_delay: Duration,
    pub max_restart_attempts: u32,
}

/// What the watchdog task reports; the manager is the sole writer of durable state, so the
/// supervisor only ever signals outcomes, never mutates the store itself.
#[derive(Debug)]
pub enum SupervisorOutcome {
    Crashed { exit_code: Option<i32> },
    HealthLost,
    IdleTimeout,
    Stopped,
}

/// A live, healthy instance. Once constructed, the subprocess is owned by a background
/// watchdog task (so it can `select!` over process exit, health polls, and the idle timer
/// concurrently); this handle only exchanges commands/outcomes with that task.
pub struct RunningInstance {
    pub config: InstanceConfig,
    pub port: u16,
    pub pid: Option<i32>,
    outcome_rx: mpsc::Receiver<SupervisorOutcome>,
    activity_tx: mpsc::UnboundedSender<()>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl RunningInstance {
    /// Blocks until the watchdog decides the instance needs attention (crash, health loss,
    /// idle timeout, or a completed stop request).
    pub async fn next_outcome(&mut self) -> SupervisorOutcome {
        self.outcome_rx
            .recv()
            .await
            .unwrap_or(SupervisorOutcome::Crashed { exit_code: None })
    }

    pub fn record_activity(&self) {
        let _ = self.activity_tx.send(());
    }

    /// Requests SIGTERM→5s-wait→SIGKILL from the watchdog task and waits for confirmation
    /// (spec.md §4.2 step 6).
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        while let Some(outcome) = self.outcome_rx.recv().await {
            if matches!(outcome, SupervisorOutcome::Stopped) {
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
const SIGTERM: i32 = 15;

#[cfg(unix)]
unsafe fn send_signal(pid: i32, signal: i32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    kill(pid, signal);
}

/// Best-effort: identify and terminate a stale listener on `port` before spawning. Ignored
/// if `lsof` is unavailable (spec.md §4.2 step 1).
async fn clear_stale_listener(port: u16) {
    let output = Command::new("lsof").args(["-ti", &format!(":{port}")]).output().await;
    let Ok(output) = output else { return };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Ok(pid) = line.trim().parse::<i32>() {
            #[cfg(unix)]
            unsafe {
                send_signal(pid, SIGTERM);
            }
            warn!(port, pid, "terminated stale listener before spawn");
        }
    }
}

fn spawn_log_pump(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    instance_id: String,
    stream: &'static str,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(instance_id = %instance_id, stream, "{line}");
        }
    });
}

/// Spawns the agent subprocess and polls until it is healthy or the startup timeout /
/// early exit wins. Does not bind a sessionID (spec.md §4.2 step 3 rationale — left to the
/// `instance:ready` subscriber, see router).
pub async fn spawn_and_wait_healthy(
    config: InstanceConfig,
    port: u16,
    opts: SupervisorOptions,
) -> Result<RunningInstance> {
    clear_stale_listener(port).await;

    let mut cmd = Command::new(&opts.agent_binary);
    cmd.args(["serve", "--port", &port.to_string()])
        .current_dir(&config.work_dir)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| OrchestratorError::Spawn(e.to_string()))?;
    let pid = child.id().map(|p| p as i32);

    if let Some(stdout) = child.stdout.take() {
        spawn_log_pump(stdout, config.instance_id.clone(), "stdout");
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_pump(stderr, config.instance_id.clone(), "stderr");
    }

    let client = AgentClient::new(format!("http://127.0.0.1:{port}"))
        .map_err(|e| OrchestratorError::Spawn(e.to_string()))?;
    let health_deadline = Instant::now() + opts.startup_timeout;
    loop {
        if Instant::now() >= health_deadline {
            child.kill().await.ok();
            return Err(OrchestratorError::StartupTimeout(opts.startup_timeout));
        }
        if let Ok(Some(status)) = child.try_wait() {
            return Err(OrchestratorError::ExitedDuringStartup(status.code()));
        }
        if client.list_sessions().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    info!(instance_id = %config.instance_id, port, "instance healthy");

    let (outcome_tx, outcome_rx) = mpsc::channel(4);
    let (activity_tx, activity_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    spawn_watchdog(config.instance_id.clone(), client, child, opts, outcome_tx, activity_rx, stop_rx);

    Ok(RunningInstance {
        config,
        port,
        pid,
        outcome_rx,
        activity_tx,
        stop_tx: Some(stop_tx),
    })
}

fn spawn_watchdog(
    instance_id: String,
    client: AgentClient,
    mut child: Child,
    opts: SupervisorOptions,
    outcome_tx: mpsc::Sender<SupervisorOutcome>,
    mut activity_rx: mpsc::UnboundedReceiver<()>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut last_activity = Instant::now();
        let mut health_interval = tokio::time::interval(opts.health_check_interval);
        loop {
            let idle_remaining = opts.idle_timeout.saturating_sub(last_activity.elapsed());
            tokio::select! {
                exit = child.wait() => {
                    let exit_code = exit.ok().and_then(|s| s.code());
                    warn!(instance_id, ?exit_code, "agent process exited");
                    let _ = outcome_tx.send(SupervisorOutcome::Crashed { exit_code }).await;
                    return;
                }
                _ = health_interval.tick() => {
                    if client.health().await.is_err() {
                        warn!(instance_id, "health poll failed, marking crashed");
                        let _ = outcome_tx.send(SupervisorOutcome::HealthLost).await;
                        return;
                    }
                }
                _ = activity_rx.recv() => {
                    last_activity = Instant::now();
                }
                _ = tokio::time::sleep(idle_remaining), if !idle_remaining.is_zero() => {
                    info!(instance_id, "idle timeout elapsed");
                    let _ = outcome_tx.send(SupervisorOutcome::IdleTimeout).await;
                    return;
                }
                _ = &mut stop_rx => {
                    if let Some(pid) = child.id() {
                        #[cfg(unix)]
                        unsafe { send_signal(pid as i32, SIGTERM); }
                    }
                    let exited = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
                    if exited.is_err() {
                        child.kill().await.ok();
                    }
                    let _ = outcome_tx.send(SupervisorOutcome::Stopped).await;
                    return;
                }
            }
        }
    });
}

/// Linear restart backoff: `restartDelayMs * restartCount`, capped at `maxRestartAttempts`
/// (spec.md §4.2 step 5, §7).
pub fn restart_delay(restart_delay_ms: u64, restart_count: u32) -> Duration {
    Duration::from_millis(restart_delay_ms.saturating_mul(restart_count.max(1) as u64))
}

pub fn restart_allowed(restart_count: u32, max_attempts: u32) -> bool {
    restart_count < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_scales_linearly() {
        assert_eq!(restart_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(restart_delay(1000, 3), Duration::from_millis(3000));
    }

    #[test]
    fn restart_allowed_respects_cap() {
        assert!(restart_allowed(2, 5));
        assert!(!restart_allowed(5, 5));
        assert!(!restart_allowed(6, 5));
    }
}
