//! Process access through the Win32 API.

use std::ffi::c_void;
use std::mem;

use tracing::debug;
use windows::Win32::Foundation::{CloseHandle, HANDLE, STILL_ACTIVE};
use windows::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, MODULEENTRY32W, Module32FirstW, Module32NextW, PROCESSENTRY32W,
    Process32FirstW, Process32NextW, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use super::process::{Generation, ProcessMemory, ProcessTarget};
use super::reader::{ReadMemory, WriteMemory};
use crate::error::{Error, Result};

/// Owned Win32 handle, closed on drop.
#[derive(Debug)]
pub(crate) struct OwnedHandle(pub(crate) HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            // SAFETY: the handle was returned by a successful Win32 call and is
            // closed exactly once here.
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

// SAFETY: a process or snapshot handle is a kernel object reference that may
// be used from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

/// Open connection to a target process.
#[derive(Debug)]
pub struct ProcessHandle {
    handle: OwnedHandle,
    pub pid: u32,
    pub base_address: u64,
    generation: Generation,
}

impl ProcessHandle {
    /// Find and open the target. Single-shot.
    pub fn open(target: &ProcessTarget) -> Result<Self> {
        let (pid, module_name) = match target {
            ProcessTarget::Name(name) => (find_pid_by_name(name)?, Some(name.as_str())),
            ProcessTarget::Pid(pid) => (*pid, None),
        };

        // SAFETY: OpenProcess has no memory-safety preconditions.
        let raw = unsafe {
            OpenProcess(
                PROCESS_VM_READ
                    | PROCESS_VM_WRITE
                    | PROCESS_VM_OPERATION
                    | PROCESS_QUERY_LIMITED_INFORMATION,
                false,
                pid,
            )
        }
        .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;
        let handle = OwnedHandle(raw);

        let base_address = find_module_base(pid, module_name)?;
        debug!("Opened pid {} (base: {:#x})", pid, base_address);

        Ok(Self {
            handle,
            pid,
            base_address,
            generation: Generation::next(),
        })
    }

    /// Close the connection. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl ReadMemory for ProcessHandle {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        let mut read = 0usize;
        // SAFETY: the buffer is valid for `size` bytes and outlives the call.
        unsafe {
            ReadProcessMemory(
                self.handle.0,
                address as *const c_void,
                buffer.as_mut_ptr().cast(),
                size,
                Some(&mut read),
            )
        }
        .map_err(|e| Error::read_failed(address, e.to_string()))?;

        if read != size {
            return Err(Error::read_failed(
                address,
                format!("short read: {read} of {size} bytes"),
            ));
        }
        Ok(buffer)
    }
}

impl WriteMemory for ProcessHandle {
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        // SAFETY: `data` is valid for its length for the duration of the call.
        unsafe {
            WriteProcessMemory(
                self.handle.0,
                address as *const c_void,
                data.as_ptr().cast(),
                data.len(),
                Some(&mut written),
            )
        }
        .map_err(|e| Error::write_failed(address, e.to_string()))?;

        if written != data.len() {
            return Err(Error::write_failed(
                address,
                format!("short write: {written} of {} bytes", data.len()),
            ));
        }
        Ok(())
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
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        let ok = unsafe { GetExitCodeProcess(self.handle.0, &mut code) }.is_ok();
        ok && code == STILL_ACTIVE.0 as u32
    }
}

fn wide_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

/// Find the pid of the first process whose image name matches `name`.
pub(crate) fn find_pid_by_name(name: &str) -> Result<u32> {
    // SAFETY: snapshot creation has no memory-safety preconditions.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map(OwnedHandle)
        .map_err(|e| Error::ProcessOpenFailed(format!("process snapshot: {e}")))?;

    let mut entry = PROCESSENTRY32W {
        dwSize: mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    // SAFETY: `entry` is initialised with its size as the API requires.
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        if wide_to_string(&entry.szExeFile).eq_ignore_ascii_case(name) {
            return Ok(entry.th32ProcessID);
        }
        // SAFETY: as above.
        more = unsafe { Process32NextW(snapshot.0, &mut entry) }.is_ok();
    }

    Err(Error::ProcessNotFound(name.to_string()))
}

/// Base address of `module_name` in `pid`, or of the main module if `None`.
pub(crate) fn find_module_base(pid: u32, module_name: Option<&str>) -> Result<u64> {
    // SAFETY: snapshot creation has no memory-safety preconditions.
    let snapshot =
        unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) }
            .map(OwnedHandle)
            .map_err(|e| Error::ProcessOpenFailed(format!("module snapshot of {pid}: {e}")))?;

    let mut entry = MODULEENTRY32W {
        dwSize: mem::size_of::<MODULEENTRY32W>() as u32,
        ..Default::default()
    };

    // SAFETY: `entry` is initialised with its size as the API requires.
    let mut more = unsafe { Module32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        let matches = match module_name {
            Some(name) => wide_to_string(&entry.szModule).eq_ignore_ascii_case(name),
            // The first module in the snapshot is the executable itself
            None => true,
        };
        if matches {
            return Ok(entry.modBaseAddr as u64);
        }
        // SAFETY: as above.
        more = unsafe { Module32NextW(snapshot.0, &mut entry) }.is_ok();
    }

    Err(Error::ModuleNotFound(
        module_name.unwrap_or("<main>").to_string(),
    ))
}
