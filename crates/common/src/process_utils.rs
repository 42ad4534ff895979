// OS process inspection helpers shared by the registry and the supervisor.

use std::io;

#[cfg(target_os = "linux")]
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Upper bound of PIDs accepted from persisted records (Linux `pid_max` ceiling).
pub const MAX_PID: u32 = 4_194_304;

/// Subset of `/proc/[pid]/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    pub ppid: u32,
    pub starttime: u64,
}

/// A row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: String,
}

pub fn pid_in_range(pid: u32) -> bool {
    (1..=MAX_PID).contains(&pid)
}

/// Read state, ppid and starttime from `/proc/[pid]/stat`.
///
/// The command name (field 2) may contain spaces and parentheses, so fields are
/// counted from the last `)`.
#[cfg(target_os = "linux")]
pub fn read_proc_stat(pid: u32) -> io::Result<ProcStat> {
    let path = format!("/proc/{}/stat", pid);
    let content = std::fs::read_to_string(&path)?;
    parse_proc_stat(&content).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Malformed stat line in {}", path),
        )
    })
}

#[cfg(not(target_os = "linux"))]
pub fn read_proc_stat(_pid: u32) -> io::Result<ProcStat> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "/proc is not available on this platform",
    ))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let close = content.rfind(')')?;
    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    // rest[0] = state (field 3), rest[1] = ppid (field 4), rest[19] = starttime (field 22)
    let state = rest.first()?.chars().next()?;
    let ppid = rest.get(1)?.parse().ok()?;
    let starttime = rest.get(19)?.parse().ok()?;
    Some(ProcStat {
        state,
        ppid,
        starttime,
    })
}

/// True when `kill(pid, 0)` finds the process and it is not a zombie.
///
/// `EPERM` still means the process exists (owned by another user).
pub fn process_exists(pid: u32) -> bool {
    if !pid_in_range(pid) {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Exited but not yet reaped by its parent.
pub fn is_zombie(pid: u32) -> bool {
    read_proc_stat(pid)
        .map(|stat| stat.state == 'Z')
        .unwrap_or(false)
}

/// Full command line of `pid`, arguments joined by spaces.
#[cfg(target_os = "linux")]
pub fn read_cmdline(pid: u32) -> io::Result<String> {
    let raw = std::fs::read(Path::new("/proc").join(pid.to_string()).join("cmdline"))?;
    Ok(join_cmdline(&raw))
}

#[cfg(not(target_os = "linux"))]
pub fn read_cmdline(pid: u32) -> io::Result<String> {
    let output = std::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Process {} not found", pid),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn join_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Snapshot of the process table. Processes that vanish mid-scan are skipped.
#[cfg(target_os = "linux")]
pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
    let mut processes = Vec::new();
    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if let Ok(cmdline) = read_cmdline(pid) {
            if !cmdline.is_empty() {
                processes.push(ProcessInfo { pid, cmdline });
            }
        }
    }
    Ok(processes)
}

#[cfg(not(target_os = "linux"))]
pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,command="])
        .output()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, cmdline) = line.split_once(char::is_whitespace)?;
            Some(ProcessInfo {
                pid: pid.parse().ok()?,
                cmdline: cmdline.trim().to_string(),
            })
        })
        .collect())
}

/// Parent chain of `pid`, nearest first, stopping before pid 1 or at the first unreadable entry.
pub fn ancestors(pid: u32) -> Vec<u32> {
    let mut chain = Vec::new();
    let mut current = pid;
    while let Ok(stat) = read_proc_stat(current) {
        if stat.ppid <= 1 || chain.contains(&stat.ppid) || chain.len() >= 256 {
            break;
        }
        chain.push(stat.ppid);
        current = stat.ppid;
    }
    chain
}

/// Real uid owning `pid`.
#[cfg(target_os = "linux")]
pub fn process_uid(pid: u32) -> io::Result<u32> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(Path::new("/proc").join(pid.to_string()))?.uid())
}

#[cfg(not(target_os = "linux"))]
pub fn process_uid(_pid: u32) -> io::Result<u32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "/proc is not available on this platform",
    ))
}

/// Whether `pid` leads its own process group (true for children spawned with `setsid`).
pub fn is_group_leader(pid: u32) -> bool {
    nix::unistd::getpgid(Some(Pid::from_raw(pid as i32)))
        .map(|pgid| pgid.as_raw() == pid as i32)
        .unwrap_or(false)
}
