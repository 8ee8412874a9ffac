//! Descendant sweep
//!
//! A process group only holds descendants that stay in it. Anything the
//! runner forks that calls `setsid()` or `setpgid()` leaves the group, so
//! teardown also scans `/proc` for processes carrying the execution's
//! [`EXECUTION_ID_ENV`] marker, plus everything parented by them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Marker variable injected into every runner's environment
pub const EXECUTION_ID_ENV: &str = "SANDBOX_EXECUTION_ID";

/// Scans per sweep; each pass catches processes forked during the last one
const MAX_PASSES: usize = 8;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Identifier unique across concurrent executions of this host
pub fn execution_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed),
        nanos
    )
}

/// One live entry of the process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub marked: bool,
}

/// SIGKILL every live process carrying `id`, every descendant of `root`,
/// and everything below those. Returns how many processes were signalled.
pub fn kill_marked(id: &str, root: Pid) -> usize {
    let marker = format!("{}={}", EXECUTION_ID_ENV, id);
    let own = std::process::id() as i32;
    let mut signalled = HashSet::new();

    for _ in 0..MAX_PASSES {
        let table = match process_table(&marker) {
            Ok(table) => table,
            Err(e) => {
                warn!("cannot scan the process table, relying on the group kill: {}", e);
                break;
            }
        };

        let targets: Vec<i32> = doomed(&table, root.as_raw())
            .into_iter()
            .filter(|pid| *pid != own && !signalled.contains(pid))
            .collect();
        if targets.is_empty() {
            break;
        }

        for pid in targets {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("kill({}) failed: {}", pid, e),
            }
            signalled.insert(pid);
        }
    }

    if !signalled.is_empty() {
        debug!("swept {} process(es) of execution {}", signalled.len(), id);
    }
    signalled.len()
}

/// Marked processes and the descendants of `root` or of any marked process
pub(crate) fn doomed(table: &[ProcessEntry], root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry.pid);
    }

    let mut pending: Vec<i32> = table
        .iter()
        .filter(|entry| entry.marked)
        .map(|entry| entry.pid)
        .collect();
    pending.extend(children.get(&root).into_iter().flatten().copied());

    let mut found = HashSet::new();
    while let Some(pid) = pending.pop() {
        if found.insert(pid) {
            pending.extend(children.get(&pid).into_iter().flatten().copied());
        }
    }

    let mut found: Vec<i32> = found.into_iter().collect();
    found.sort_unstable();
    found
}

/// Live (non-zombie) processes, with whether their environment holds `marker`
fn process_table(marker: &str) -> std::io::Result<Vec<ProcessEntry>> {
    let mut table = Vec::new();

    for entry in std::fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };

        // Processes vanish mid-scan; skip whatever cannot be read
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((state, ppid)) = parse_stat(&stat) else {
            continue;
        };
        if state == 'Z' || state == 'X' {
            continue;
        }

        let marked = std::fs::read(entry.path().join("environ"))
            .map(|environ| holds_entry(&environ, marker))
            .unwrap_or(false);

        table.push(ProcessEntry { pid, ppid, marked });
    }

    Ok(table)
}

/// State and parent pid from a `/proc/<pid>/stat` line
pub(crate) fn parse_stat(stat: &str) -> Option<(char, i32)> {
    // The command name may itself contain spaces and parentheses
    let mut fields = stat.rsplit_once(')')?.1.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

/// Whether a NUL-separated environment block contains exactly `entry`
pub(crate) fn holds_entry(environ: &[u8], entry: &str) -> bool {
    environ
        .split(|byte| *byte == 0)
        .any(|item| item == entry.as_bytes())
}
