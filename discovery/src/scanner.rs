//! Process enumeration behind a trait so discovery can be unit-tested without spawning
//! real agent processes (spec.md §9 guidance generalized from the router abstraction).

use sysinfo::{Pid, System};

/// A local process whose command line names the configured agent binary.
#[derive(Debug, Clone)]
pub struct CandidateProcess {
    pub pid: i32,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
}

pub trait LocalProcessScanner: Send + Sync {
    /// Lists running processes whose command line contains `binary_name`.
    fn scan(&self, binary_name: &str) -> Vec<CandidateProcess>;

    /// Reads the TCP port the given pid is listening on, if discoverable.
    fn listening_port(&self, pid: i32) -> Option<u16>;
}

/// Production scanner: enumerates `/proc` via `sysinfo`, then reads
/// `/proc/<pid>/net/tcp` (Linux-only) for the listening port (spec.md §4.7).
pub struct SysinfoScanner;

impl SysinfoScanner {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SysinfoScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalProcessScanner for SysinfoScanner {
    fn scan(&self, binary_name: &str) -> Vec<CandidateProcess> {
        let mut system = System::new();
        system.refresh_all();
        system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let cmd: Vec<String> = process.cmd().iter().map(|s| s.to_string_lossy().to_string()).collect();
                let name_matches = process.name().to_string_lossy().contains(binary_name)
                    || cmd.iter().any(|c| c.contains(binary_name));
                if !name_matches {
                    return None;
                }
                Some(CandidateProcess {
                    pid: pid.as_u32() as i32,
                    cmd,
                    cwd: process.cwd().map(|p| p.to_string_lossy().to_string()),
                })
            })
            .collect()
    }

    fn listening_port(&self, pid: i32) -> Option<u16> {
        read_listening_port_linux(pid)
    }
}

#[cfg(target_os = "linux")]
fn read_listening_port_linux(pid: i32) -> Option<u16> {
    // /proc/<pid>/net/tcp lists `local_address` as `HEXIP:HEXPORT` with `st` 0A = LISTEN.
    let contents = std::fs::read_to_string(format!("/proc/{pid}/net/tcp")).ok()?;
    for line in contents.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(local_address) = fields.first() else { continue };
        let Some(state) = fields.get(3) else { continue };
        if *state != "0A" {
            continue;
        }
        if let Some((_, port_hex)) = local_address.split_once(':') {
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                return Some(port);
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_listening_port_linux(_pid: i32) -> Option<u16> {
    None
}

/// A scanner used in tests: returns a fixed, caller-supplied process list.
#[cfg(test)]
pub struct FixedScanner {
    pub processes: Vec<CandidateProcess>,
    pub ports: std::collections::HashMap<i32, u16>,
}

#[cfg(test)]
impl LocalProcessScanner for FixedScanner {
    fn scan(&self, binary_name: &str) -> Vec<CandidateProcess> {
        self.processes
            .iter()
            .filter(|p| p.cmd.iter().any(|c| c.contains(binary_name)))
            .cloned()
            .collect()
    }

    fn listening_port(&self, pid: i32) -> Option<u16> {
        self.ports.get(&pid).copied()
    }
}
