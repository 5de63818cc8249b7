//! Single writer of instance state: one control task draining a command channel, serializing
//! every mutation of the port pool, the running-instance map, and the state store
//! (spec.md §4.2, §5).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use store::{InstanceRecord, InstanceState, InstanceStore};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::events::{EventBus, InstanceEvent};
use crate::instance::{instance_id_for_topic, InstanceConfig};
use crate::port_pool::{PortPool, PortPoolStatus};
use crate::supervisor::{self, RunningInstance, SupervisorOptions, SupervisorOutcome};

#[derive(Debug, Clone, Default)]
pub struct GetOrCreateOptions {
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub topic_id: i64,
    pub port: u16,
    pub work_dir: String,
    pub state: InstanceState,
    pub session_id: Option<String>,
}

impl From<InstanceRecord> for InstanceInfo {
    fn from(r: InstanceRecord) -> Self {
        Self {
            instance_id: r.instance_id,
            topic_id: r.topic_id,
            port: r.port,
            work_dir: r.work_dir,
            state: r.state,
            session_id: r.session_id,
        }
    }
}

#[derive(Default)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub failed: usize,
}

enum Command {
    GetOrCreate {
        topic_id: i64,
        work_dir: String,
        options: GetOrCreateOptions,
        reply: oneshot::Sender<Result<InstanceInfo>>,
    },
    Stop {
        instance_id: String,
        reason: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        instance_id: String,
        reply: oneshot::Sender<Result<InstanceInfo>>,
    },
    RemoveInstance {
        instance_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RecordActivity {
        instance_id: String,
    },
    GetByTopic {
        topic_id: i64,
        reply: oneshot::Sender<Option<InstanceInfo>>,
    },
    GetRunningCount {
        reply: oneshot::Sender<usize>,
    },
    PortPoolStatus {
        reply: oneshot::Sender<PortPoolStatus>,
    },
    Recover {
        reply: oneshot::Sender<RecoveryReport>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<InstanceEvent>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the orchestrator's control task. Cheap to clone; every method sends a command
/// and awaits its reply, so callers observe the same serialized order the control task does.
#[derive(Clone)]
pub struct OrchestratorManager {
    cmd_tx: mpsc::Sender<Command>,
}

impl OrchestratorManager {
    pub fn spawn(store: Arc<InstanceStore>, start_port: u16, pool_size: u16, opts: SupervisorOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let actor = Actor {
            store,
            pool: PortPool::new(start_port, pool_size),
            running: HashMap::new(),
            events: EventBus::new(),
            opts,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub async fn get_or_create(
        &self,
        topic_id: i64,
        work_dir: String,
        options: GetOrCreateOptions,
    ) -> Result<InstanceInfo> {
        self.call(|reply| Command::GetOrCreate { topic_id, work_dir, options, reply }).await
    }

    pub async fn stop(&self, instance_id: String, reason: String) -> Result<()> {
        self.call(|reply| Command::Stop { instance_id, reason, reply }).await
    }

    pub async fn restart(&self, instance_id: String) -> Result<InstanceInfo> {
        self.call(|reply| Command::Restart { instance_id, reply }).await
    }

    pub async fn remove_instance(&self, instance_id: String) -> Result<()> {
        self.call(|reply| Command::RemoveInstance { instance_id, reply }).await
    }

    pub async fn record_activity(&self, instance_id: String) {
        let _ = self.cmd_tx.send(Command::RecordActivity { instance_id }).await;
    }

    pub async fn get_by_topic(&self, topic_id: i64) -> Option<InstanceInfo> {
        self.call_infallible(|reply| Command::GetByTopic { topic_id, reply }).await
    }

    pub async fn get_running_count(&self) -> usize {
        self.call_infallible(|reply| Command::GetRunningCount { reply }).await
    }

    pub async fn port_pool_status(&self) -> PortPoolStatus {
        self.call_infallible(|reply| Command::PortPoolStatus { reply }).await
    }

    /// On startup: marks any persisted `{running, starting, stopping}` instance `crashed`,
    /// then issues a single start attempt per crashed record (spec.md §4.2 "recover()").
    pub async fn recover(&self) -> RecoveryReport {
        self.call_infallible(|reply| Command::Recover { reply }).await
    }

    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<InstanceEvent> {
        self.call_infallible(|reply| Command::Subscribe { reply }).await
    }

    pub async fn shutdown(&self) {
        self.call_infallible(|reply| Command::Shutdown { reply }).await
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| OrchestratorError::Spawn("orchestrator control task gone".into()))?;
        reply_rx
            .await
            .map_err(|_| OrchestratorError::Spawn("orchestrator control task dropped reply".into()))?
    }

    async fn call_infallible<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> T
    where
        T: Default,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(build(reply_tx)).await.is_err() {
            return T::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

struct Actor {
    store: Arc<InstanceStore>,
    pool: PortPool,
    running: HashMap<String, RunningInstance>,
    events: EventBus,
    opts: SupervisorOptions,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => return,
                    }
                }
                (instance_id, outcome) = next_running_outcome(&mut self.running) => {
                    self.handle_outcome(instance_id, outcome).await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::GetOrCreate { topic_id, work_dir, options, reply } => {
                let result = self.get_or_create(topic_id, work_dir, options).await;
                let _ = reply.send(result);
            }
            Command::Stop { instance_id, reason, reply } => {
                let result = self.stop_instance(&instance_id, &reason).await;
                let _ = reply.send(result);
            }
            Command::Restart { instance_id, reply } => {
                let result = self.restart_instance(&instance_id).await;
                let _ = reply.send(result);
            }
            Command::RemoveInstance { instance_id, reply } => {
                let _ = self.stop_instance(&instance_id, "removed").await;
                let result = self.store.delete(&instance_id).map_err(OrchestratorError::from);
                let _ = reply.send(result);
            }
            Command::RecordActivity { instance_id } => {
                if let Some(running) = self.running.get(&instance_id) {
                    running.record_activity();
                }
                if let Ok(Some(mut record)) = self.store.get(&instance_id) {
                    record.last_activity_at = Some(store::now_ms());
                    let _ = self.store.upsert(&record);
                }
            }
            Command::GetByTopic { topic_id, reply } => {
                let info = self.store.get_by_topic(topic_id).ok().flatten().map(InstanceInfo::from);
                let _ = reply.send(info);
            }
            Command::GetRunningCount { reply } => {
                let _ = reply.send(self.running.len());
            }
            Command::PortPoolStatus { reply } => {
                let _ = reply.send(self.pool.status());
            }
            Command::Recover { reply } => {
                let report = self.recover_impl().await;
                let _ = reply.send(report);
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            Command::Shutdown { reply } => {
                self.shutdown_impl().await;
                let _ = reply.send(());
            }
        }
    }

    async fn get_or_create(
        &mut self,
        topic_id: i64,
        work_dir: String,
        options: GetOrCreateOptions,
    ) -> Result<InstanceInfo> {
        let instance_id = instance_id_for_topic(topic_id);

        if let Some(existing) = self.store.get(&instance_id)? {
            match existing.state {
                InstanceState::Running if existing.work_dir == work_dir => {
                    return Ok(existing.into());
                }
                InstanceState::Running => {
                    // workDir differs: topic re-link — stop then fall through to respawn.
                    self.stop_instance(&instance_id, "workdir changed").await?;
                }
                InstanceState::Crashed | InstanceState::Failed => {
                    return self.restart_instance(&instance_id).await;
                }
                InstanceState::Starting | InstanceState::Stopping => {
                    return Ok(existing.into());
                }
                InstanceState::Stopped => {}
            }
        }

        let port = self.pool.allocate(&instance_id).ok_or(OrchestratorError::PortExhausted)?;
        self.spawn_instance(instance_id, topic_id, work_dir, options, port, 0).await
    }

    async fn spawn_instance(
        &mut self,
        instance_id: String,
        topic_id: i64,
        work_dir: String,
        options: GetOrCreateOptions,
        port: u16,
        restart_count: u32,
    ) -> Result<InstanceInfo> {
        self.events.publish(InstanceEvent::Starting { instance_id: instance_id.clone(), topic_id });

        let mut record = store::InstanceRecord {
            instance_id: instance_id.clone(),
            topic_id,
            port,
            work_dir: work_dir.clone(),
            name: options.name.clone(),
            session_id: None,
            state: InstanceState::Starting,
            pid: None,
            started_at: None,
            last_activity_at: None,
            restart_count: restart_count as i64,
            env_json: serde_json::to_string(&options.env).ok(),
            created_at: store::now_ms(),
            updated_at: store::now_ms(),
        };
        self.store.upsert(&record)?;

        let config = InstanceConfig {
            instance_id: instance_id.clone(),
            topic_id,
            work_dir: work_dir.clone(),
            env: options.env,
            idle_timeout_ms: options.idle_timeout_ms,
        };
        let mut opts = self.opts.clone();
        if let Some(idle_ms) = config.idle_timeout_ms {
            opts.idle_timeout = Duration::from_millis(idle_ms);
        }

        match supervisor::spawn_and_wait_healthy(config, port, opts).await {
            Ok(running) => {
                record.state = InstanceState::Running;
                record.pid = running.pid;
                record.started_at = Some(store::now_ms());
                record.updated_at = store::now_ms();
                self.store.upsert(&record)?;
                self.running.insert(instance_id.clone(), running);
                self.events.publish(InstanceEvent::Ready {
                    instance_id: instance_id.clone(),
                    topic_id,
                    port,
                    session_id: None,
                });
                Ok(record.into())
            }
            Err(e) => {
                self.pool.release(port);
                record.state = InstanceState::Failed;
                record.updated_at = store::now_ms();
                let _ = self.store.upsert(&record);
                self.events.publish(InstanceEvent::Failed {
                    instance_id,
                    topic_id,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn restart_instance(&mut self, instance_id: &str) -> Result<InstanceInfo> {
        let record = self.store.get(instance_id)?.ok_or(OrchestratorError::NotFound(0))?;
        if !supervisor::restart_allowed(record.restart_count as u32, self.opts.max_restart_attempts) {
            return Err(OrchestratorError::Spawn("restart cap exceeded".into()));
        }
        let delay = supervisor::restart_delay(self.opts.restart_delay.as_millis() as u64, record.restart_count as u32);
        tokio::time::sleep(delay).await;
        self.pool.reserve(record.port, instance_id)?;
        let options = GetOrCreateOptions {
            name: record.name.clone(),
            env: record
                .env_json
                .as_deref()
                .and_then(|j| serde_json::from_str(j).ok())
                .unwrap_or_default(),
            idle_timeout_ms: None,
        };
        self.spawn_instance(
            instance_id.to_string(),
            record.topic_id,
            record.work_dir.clone(),
            options,
            record.port,
            record.restart_count as u32,
        )
        .await
    }

    async fn stop_instance(&mut self, instance_id: &str, reason: &str) -> Result<()> {
        if let Some(running) = self.running.remove(instance_id) {
            info!(instance_id, reason, "stopping instance");
            running.stop().await?;
        }
        self.pool.release_by_instance(instance_id);
        if let Ok(Some(mut record)) = self.store.get(instance_id) {
            record.state = InstanceState::Stopped;
            record.updated_at = store::now_ms();
            let _ = self.store.upsert(&record);
            self.events.publish(InstanceEvent::Stopped {
                instance_id: instance_id.to_string(),
                topic_id: record.topic_id,
            });
        }
        Ok(())
    }

    async fn handle_outcome(&mut self, instance_id: String, outcome: SupervisorOutcome) {
        let Some(record) = self.store.get(&instance_id).ok().flatten() else { return };
        let exit_code = match outcome {
            SupervisorOutcome::Stopped => return, // handled synchronously by stop_instance
            SupervisorOutcome::IdleTimeout => {
                self.events.publish(InstanceEvent::IdleTimeout {
                    instance_id: instance_id.clone(),
                    topic_id: record.topic_id,
                });
                let _ = self.stop_instance(&instance_id, "idle timeout").await;
                return;
            }
            SupervisorOutcome::Crashed { exit_code } => exit_code,
            SupervisorOutcome::HealthLost => None,
        };

        self.running.remove(&instance_id);
        self.pool.release(record.port);
        let new_count = self.store.increment_restart_count(&instance_id).unwrap_or(record.restart_count + 1);
        let will_restart = supervisor::restart_allowed(new_count as u32, self.opts.max_restart_attempts);
        let mut updated = record.clone();
        updated.restart_count = new_count;
        updated.state = InstanceState::Crashed;
        updated.updated_at = store::now_ms();
        let _ = self.store.upsert(&updated);
        warn!(instance_id, ?exit_code, will_restart, "instance crashed");
        self.events.publish(InstanceEvent::Crashed {
            instance_id: instance_id.clone(),
            topic_id: record.topic_id,
            exit_code,
            will_restart,
        });
        if will_restart {
            let _ = self.restart_instance(&instance_id).await;
        } else {
            let mut failed = updated;
            failed.state = InstanceState::Failed;
            let _ = self.store.upsert(&failed);
            self.events.publish(InstanceEvent::Failed {
                instance_id,
                topic_id: record.topic_id,
                reason: "restart cap exceeded".into(),
            });
        }
    }

    /// Marks any persisted `{running, starting, stopping}` instance `crashed`, then issues a
    /// single start attempt per crashed record, reserving its stored port first
    /// (spec.md §4.2, §8 "Recovery fidelity").
    async fn recover_impl(&mut self) -> RecoveryReport {
        let marked = self.store.mark_stale_as_crashed().unwrap_or(0);
        info!(marked, "recovery: marked stale instances crashed");
        let crashed = self.store.list_by_state(InstanceState::Crashed).unwrap_or_default();
        let mut recovered = 0;
        let mut failed = 0;
        for record in crashed {
            if self.pool.reserve(record.port, &record.instance_id).is_err() {
                failed += 1;
                continue;
            }
            match self.restart_instance(&record.instance_id).await {
                Ok(_) => recovered += 1,
                Err(e) => {
                    error!(instance_id = %record.instance_id, error = %e, "recovery attempt failed");
                    failed += 1;
                }
            }
        }
        RecoveryReport { recovered, failed }
    }

    async fn shutdown_impl(&mut self) {
        let ids: Vec<String> = self.running.keys().cloned().collect();
        let stops: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.running.remove(&id).map(|r| (id, r)))
            .collect();
        futures::future::join_all(stops.into_iter().map(|(id, running)| async move {
            if let Err(e) = running.stop().await {
                warn!(instance_id = %id, error = %e, "error stopping instance during shutdown");
            }
        }))
        .await;
    }
}

/// Polls every running instance's outcome channel concurrently, returning the first that
/// fires. An empty map waits forever so the `select!` in `run` just falls through to the
/// command branch.
async fn next_running_outcome(running: &mut HashMap<String, RunningInstance>) -> (String, SupervisorOutcome) {
    use futures::stream::FuturesUnordered;
    use futures::StreamExt;

    if running.is_empty() {
        std::future::pending::<()>().await;
        unreachable!()
    }

    let mut polls: FuturesUnordered<_> = running
        .iter_mut()
        .map(|(id, inst)| async move { (id.clone(), inst.next_outcome().await) })
        .collect();
    polls.next().await.expect("non-empty")
}
