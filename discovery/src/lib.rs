//! Enumerates local agent processes and reconciles them with their live sessions so
//! externally-started agents can be reconnected to (spec.md §4.7).

mod error;
mod probe;
mod scanner;

use agent_client::{AgentClient, Session};

pub use error::{DiscoveryError, Result};
pub use probe::{is_port_alive, is_session_alive};
pub use scanner::{CandidateProcess, LocalProcessScanner, SysinfoScanner};

/// One discovered agent process, with whatever sessions it reported.
#[derive(Debug, Clone)]
pub struct DiscoveredInstance {
    pub pid: i32,
    pub port: Option<u16>,
    pub work_dir: Option<String>,
    /// True for an interactively-run agent; false for one we (or a prior run) started in
    /// `serve` mode, which the supervisor can take over (spec.md §4.7).
    pub is_tui: bool,
    pub sessions: Vec<Session>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoverOptions {
    pub only_active: bool,
}

/// One `(instance, session)` pairing, flattened for the caller.
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    pub pid: i32,
    pub port: Option<u16>,
    pub work_dir: Option<String>,
    pub is_tui: bool,
    pub session: Session,
}

fn is_tui_process(cmd: &[String]) -> bool {
    !cmd.iter().any(|arg| arg == "serve")
}

/// Scans for processes matching `agent_binary`, queries each for its sessions, and returns
/// the discovered instances (no session-level dedup — use [`discover_sessions`] for that).
pub async fn discover_instances(scanner: &dyn LocalProcessScanner, agent_binary: &str) -> Vec<DiscoveredInstance> {
    let candidates = scanner.scan(agent_binary);
    let mut instances = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let port = scanner.listening_port(candidate.pid);
        let sessions = match port {
            Some(port) => query_sessions(port).await,
            None => Vec::new(),
        };
        instances.push(DiscoveredInstance {
            pid: candidate.pid,
            port,
            work_dir: candidate.cwd,
            is_tui: is_tui_process(&candidate.cmd),
            sessions,
        });
    }
    instances
}

async fn query_sessions(port: u16) -> Vec<Session> {
    let Ok(client) = AgentClient::new(format!("http://127.0.0.1:{port}")) else {
        return Vec::new();
    };
    client.list_sessions().await.unwrap_or_default()
}

/// Flattens [`discover_instances`] into one record per session, deduplicated by session id;
/// when `only_active` is set, collapses each instance's sessions to its single most
/// recently updated one (spec.md §4.7).
pub async fn discover_sessions(
    scanner: &dyn LocalProcessScanner,
    agent_binary: &str,
    opts: DiscoverOptions,
) -> Vec<DiscoveredSession> {
    let instances = discover_instances(scanner, agent_binary).await;
    let mut by_session_id = std::collections::HashMap::new();
    for instance in &instances {
        for session in &instance.sessions {
            by_session_id.entry(session.id.clone()).or_insert_with(|| DiscoveredSession {
                pid: instance.pid,
                port: instance.port,
                work_dir: instance.work_dir.clone(),
                is_tui: instance.is_tui,
                session: session.clone(),
            });
        }
    }
    let mut flattened: Vec<DiscoveredSession> = by_session_id.into_values().collect();

    if opts.only_active {
        let mut latest_per_instance: std::collections::HashMap<i32, DiscoveredSession> = std::collections::HashMap::new();
        for entry in flattened {
            let updated = entry.session.time.as_ref().map(|t| t.updated).unwrap_or(0);
            latest_per_instance
                .entry(entry.pid)
                .and_modify(|existing| {
                    let existing_updated = existing.session.time.as_ref().map(|t| t.updated).unwrap_or(0);
                    if updated > existing_updated {
                        *existing = entry.clone();
                    }
                })
                .or_insert(entry);
        }
        flattened = latest_per_instance.into_values().collect();
    }
    flattened
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanner::FixedScanner;
    use std::collections::HashMap;

    fn candidate(pid: i32, cwd: &str, serve: bool) -> CandidateProcess {
        let mut cmd = vec!["opencode".to_string()];
        if serve {
            cmd.push("serve".to_string());
        }
        CandidateProcess { pid, cmd, cwd: Some(cwd.to_string()) }
    }

    #[test]
    fn is_tui_process_detects_serve_subcommand() {
        assert!(!is_tui_process(&["opencode".into(), "serve".into()]));
        assert!(is_tui_process(&["opencode".into()]));
    }

    #[tokio::test]
    async fn discover_instances_skips_sessions_when_port_unknown() {
        let scanner = FixedScanner {
            processes: vec![candidate(1, "/work/a", true)],
            ports: HashMap::new(),
        };
        let instances = discover_instances(&scanner, "opencode").await;
        assert_eq!(instances.len(), 1);
        assert!(instances[0].sessions.is_empty());
        assert!(!instances[0].is_tui);
    }

    #[tokio::test]
    async fn discover_instances_marks_non_serve_processes_as_tui() {
        let scanner = FixedScanner {
            processes: vec![candidate(2, "/work/b", false)],
            ports: HashMap::new(),
        };
        let instances = discover_instances(&scanner, "opencode").await;
        assert!(instances[0].is_tui);
    }
}
