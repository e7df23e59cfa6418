//! Process access through `/proc`, for running the target under Wine/Proton.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use super::process::{Generation, ProcessMemory, ProcessTarget};
use super::reader::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

/// Open connection to a target process.
#[derive(Debug)]
pub struct ProcessHandle {
    mem: File,
    pub pid: u32,
    pub base_address: u64,
    start_time: u64,
    generation: Generation,
}

impl ProcessHandle {
    /// Find and open the target. Single-shot.
    pub fn open(target: &ProcessTarget) -> Result<Self> {
        let (pid, module_name) = match target {
            ProcessTarget::Name(name) => (find_pid_by_name(name)?, Some(name.as_str())),
            ProcessTarget::Pid(pid) => (*pid, None),
        };

        let start_time = read_start_time(pid)
            .ok_or_else(|| Error::ProcessNotFound(format!("pid {pid}")))?;

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;

        let maps = fs::read_to_string(format!("/proc/{pid}/maps"))
            .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;
        let base_address = find_module_base(&maps, module_name)
            .ok_or_else(|| Error::ModuleNotFound(module_name.unwrap_or("<main>").to_string()))?;
        debug!("Opened pid {} (base: {:#x})", pid, base_address);

        Ok(Self {
            mem,
            pid,
            base_address,
            start_time,
            generation: Generation::next(),
        })
    }

    /// Close the connection. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl ReadMemory for ProcessHandle {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        self.mem
            .read_exact_at(&mut buffer, address)
            .map_err(|e| Error::read_failed(address, e.to_string()))?;
        Ok(buffer)
    }
}

impl WriteMemory for ProcessHandle {
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        self.mem
            .write_all_at(data, address)
            .map_err(|e| Error::write_failed(address, e.to_string()))
    }
}

impl ProcessMemory for ProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn generation(&self) -> Generation {
        self.generation
    }

    fn module_base(&self) -> u64 {
        self.base_address
    }

    fn is_alive(&self) -> bool {
        // A recycled pid has a different start time
        read_start_time(self.pid) == Some(self.start_time)
    }
}

/// Start time (field 22 of `/proc/<pid>/stat`), in clock ticks since boot.
fn read_start_time(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

fn parse_start_time(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    // `rest` starts at field 3 (state), so field 22 is index 19
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Final path component, accepting both `/` and `\` separators.
fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn find_pid_by_name(name: &str) -> Result<u32> {
    let entries = fs::read_dir("/proc")?;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if process_matches(&entry.path(), name) {
            return Ok(pid);
        }
    }
    Err(Error::ProcessNotFound(name.to_string()))
}

fn process_matches(dir: &Path, name: &str) -> bool {
    // comm is truncated to 15 bytes, so argv[0] is checked as well
    if let Ok(comm) = fs::read_to_string(dir.join("comm"))
        && comm.trim_end().eq_ignore_ascii_case(name)
    {
        return true;
    }
    fs::read(dir.join("cmdline"))
        .ok()
        .and_then(|cmdline| {
            let argv0 = cmdline.split(|&b| b == 0).next()?;
            Some(file_name(&String::from_utf8_lossy(argv0)).eq_ignore_ascii_case(name))
        })
        .unwrap_or(false)
}

/// Lowest mapping of `module_name` in a `/proc/<pid>/maps` listing, or of the
/// first file-backed mapping if `None`.
fn find_module_base(maps: &str, module_name: Option<&str>) -> Option<u64> {
    maps.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let range = fields.next()?;
            let path = fields.nth(4)?;
            let start = u64::from_str_radix(range.split('-').next()?, 16).ok()?;
            Some((start, path))
        })
        .filter(|(_, path)| match module_name {
            Some(name) => file_name(path).eq_ignore_ascii_case(name),
            None => path.starts_with('/'),
        })
        .map(|(start, _)| start)
        .min()
}
