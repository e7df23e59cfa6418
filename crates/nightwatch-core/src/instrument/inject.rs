//! Agent injection backend.
//!
//! On Windows the agent is a DLL. It is mapped into the target with a remote
//! `LoadLibraryW`, which must not start any work from `DllMain`. The backend
//! then calls the DLL's start export in a second remote thread, passing the
//! loopback port to report to. Unloading calls `FreeLibrary` the same way.

use std::path::PathBuf;
use std::time::Duration;

use crate::memory::layout;

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    /// Agent DLL, loaded verbatim
    pub library: PathBuf,
    /// Export called with the report port as its only argument
    pub start_export: String,
    pub port: u16,
    /// How long to wait for the agent to connect after start
    pub connect_timeout: Duration,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            library: PathBuf::from("nightwatch_agent.dll"),
            start_export: layout::AGENT_START_EXPORT.to_string(),
            port: layout::AGENT_PORT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InjectorBackend {
    config: InjectorConfig,
}

impl InjectorBackend {
    pub fn new(config: InjectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InjectorConfig {
        &self.config
    }
}

#[cfg(target_os = "windows")]
pub use win::{InjectedAgent, InjectedSession};

#[cfg(target_os = "windows")]
mod win {
    use std::ffi::c_void;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::sync::Arc;

    use tracing::{debug, info};
    use windows::Win32::Foundation::{HANDLE, HMODULE, STILL_ACTIVE, WAIT_OBJECT_0};
    use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows::Win32::System::LibraryLoader::{
        DONT_RESOLVE_DLL_REFERENCES, FreeLibrary, GetModuleHandleW, GetProcAddress, LoadLibraryExW,
    };
    use windows::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE, VirtualAllocEx, VirtualFreeEx,
    };
    use windows::Win32::System::Threading::{
        CreateRemoteThread, GetExitCodeProcess, GetExitCodeThread, OpenProcess,
        PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION, PROCESS_VM_READ,
        PROCESS_VM_WRITE, WaitForSingleObject,
    };
    use windows::core::{PCSTR, PCWSTR, s, w};

    use super::{InjectorBackend, InjectorConfig};
    use crate::error::{Error, Result};
    use crate::instrument::pump::MessagePump;
    use crate::instrument::session::{Agent, InstrumentationBackend, MessageHandler, TargetSession};
    use crate::memory::ProcessTarget;
    use crate::memory::win32::{OwnedHandle, find_module_base, find_pid_by_name};

    const REMOTE_CALL_TIMEOUT_MS: u32 = 10_000;

    fn wide(path: &Path) -> Vec<u16> {
        path.as_os_str().encode_wide().chain(Some(0)).collect()
    }

    fn injection_error(step: &str, e: impl std::fmt::Display) -> Error {
        Error::Instrumentation(format!("{step}: {e}"))
    }

    /// Run `routine(parameter)` on a new thread in the target and return its
    /// exit code.
    fn call_remote(process: &OwnedHandle, routine: usize, parameter: usize) -> Result<u32> {
        // SAFETY: `routine` is the address of a function with the thread-start
        // signature inside the target's address space.
        let start = unsafe {
            std::mem::transmute::<usize, unsafe extern "system" fn(*mut c_void) -> u32>(routine)
        };
        // SAFETY: the process handle carries PROCESS_CREATE_THREAD.
        let thread = unsafe {
            CreateRemoteThread(
                process.0,
                None,
                0,
                Some(start),
                Some(parameter as *const c_void),
                0,
                None,
            )
        }
        .map(OwnedHandle)
        .map_err(|e| injection_error("CreateRemoteThread", e))?;

        // SAFETY: `thread` is a valid thread handle.
        if unsafe { WaitForSingleObject(thread.0, REMOTE_CALL_TIMEOUT_MS) } != WAIT_OBJECT_0 {
            return Err(Error::Instrumentation("remote call timed out".to_string()));
        }
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        unsafe { GetExitCodeThread(thread.0, &mut code) }
            .map_err(|e| injection_error("GetExitCodeThread", e))?;
        Ok(code)
    }

    fn kernel32_export(name: PCSTR) -> Result<usize> {
        // SAFETY: kernel32 is always loaded; both strings are static and
        // NUL-terminated.
        unsafe {
            let kernel32 = GetModuleHandleW(w!("kernel32.dll"))
                .map_err(|e| injection_error("GetModuleHandleW", e))?;
            GetProcAddress(kernel32, name)
                .map(|f| f as usize)
                .ok_or_else(|| Error::Instrumentation("kernel32 export missing".to_string()))
        }
    }

    /// Offset of `export` from the DLL's image base, found by mapping the DLL
    /// locally without running its entry point.
    fn export_rva(library: &Path, export: &str) -> Result<usize> {
        let path = wide(library);
        let mut name = export.as_bytes().to_vec();
        name.push(0);

        // SAFETY: `path` and `name` are NUL-terminated and outlive the calls;
        // DONT_RESOLVE_DLL_REFERENCES skips DllMain.
        unsafe {
            let module: HMODULE = LoadLibraryExW(
                PCWSTR(path.as_ptr()),
                HANDLE::default(),
                DONT_RESOLVE_DLL_REFERENCES,
            )
            .map_err(|e| injection_error("LoadLibraryExW", e))?;
            let address = GetProcAddress(module, PCSTR(name.as_ptr())).map(|f| f as usize);
            let base = module.0 as usize;
            let _ = FreeLibrary(module);
            address
                .map(|a| a - base)
                .ok_or_else(|| Error::Instrumentation(format!("export {export} not found")))
        }
    }

    fn is_running(process: &OwnedHandle) -> bool {
        let mut code = 0u32;
        // SAFETY: `code` is a valid out pointer.
        let ok = unsafe { GetExitCodeProcess(process.0, &mut code) }.is_ok();
        ok && code == STILL_ACTIVE.0 as u32
    }

    impl InstrumentationBackend for InjectorBackend {
        type Session = InjectedSession;

        fn attach(&self, target: &ProcessTarget) -> Result<InjectedSession> {
            let pid = match target {
                ProcessTarget::Name(name) => find_pid_by_name(name)?,
                ProcessTarget::Pid(pid) => *pid,
            };
            // SAFETY: OpenProcess has no memory-safety preconditions.
            let process = unsafe {
                OpenProcess(
                    PROCESS_CREATE_THREAD
                        | PROCESS_QUERY_INFORMATION
                        | PROCESS_VM_OPERATION
                        | PROCESS_VM_READ
                        | PROCESS_VM_WRITE,
                    false,
                    pid,
                )
            }
            .map(OwnedHandle)
            .map_err(|e| Error::ProcessOpenFailed(format!("pid {pid}: {e}")))?;
            debug!("Attached to pid {}", pid);

            Ok(InjectedSession {
                process: Arc::new(process),
                pid,
                config: self.config.clone(),
                detached: false,
            })
        }
    }

    pub struct InjectedSession {
        process: Arc<OwnedHandle>,
        pid: u32,
        config: InjectorConfig,
        detached: bool,
    }

    impl InjectedSession {
        /// Copy the library path into the target and `LoadLibraryW` it there.
        fn load_library(&self) -> Result<u64> {
            let path = wide(&self.config.library);
            let size = path.len() * std::mem::size_of::<u16>();

            // SAFETY: the allocation is sized for `path` and released below.
            let remote = unsafe {
                VirtualAllocEx(
                    self.process.0,
                    None,
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if remote.is_null() {
                return Err(Error::Instrumentation("VirtualAllocEx failed".to_string()));
            }

            // SAFETY: `remote` holds `size` writable bytes in the target.
            let result = unsafe {
                WriteProcessMemory(
                    self.process.0,
                    remote,
                    path.as_ptr().cast(),
                    size,
                    None,
                )
            }
            .map_err(|e| injection_error("WriteProcessMemory", e))
            .and_then(|()| {
                let load_library = kernel32_export(s!("LoadLibraryW"))?;
                call_remote(&self.process, load_library, remote as usize)
            });

            // SAFETY: `remote` was allocated above and is no longer used.
            unsafe {
                let _ = VirtualFreeEx(self.process.0, remote, 0, MEM_RELEASE);
            }

            // The thread exit code is a truncated HMODULE; zero means failure
            if result? == 0 {
                return Err(Error::Instrumentation(format!(
                    "LoadLibraryW failed for {}",
                    self.config.library.display()
                )));
            }

            let module_name = self
                .config
                .library
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            find_module_base(self.pid, Some(module_name))
        }
    }

    impl TargetSession for InjectedSession {
        type Agent = InjectedAgent;

        fn load_agent(&mut self, handler: MessageHandler) -> Result<InjectedAgent> {
            if !self.config.library.is_file() {
                return Err(Error::Instrumentation(format!(
                    "agent library not found: {}",
                    self.config.library.display()
                )));
            }
            let rva = export_rva(&self.config.library, &self.config.start_export)?;

            let mut pump = MessagePump::bind(self.config.port)?;
            pump.start(handler)?;

            let base = self.load_library()?;
            info!("Agent loaded at {:#x}", base);

            Ok(InjectedAgent {
                process: Arc::clone(&self.process),
                base,
                start: base + rva as u64,
                port: pump.port(),
                pump,
                connect_timeout: self.config.connect_timeout,
                loaded: true,
            })
        }

        fn is_attached(&self) -> bool {
            !self.detached && is_running(&self.process)
        }

        fn detach(&mut self) -> Result<()> {
            self.detached = true;
            Ok(())
        }
    }

    pub struct InjectedAgent {
        process: Arc<OwnedHandle>,
        base: u64,
        start: u64,
        port: u16,
        pump: MessagePump,
        connect_timeout: std::time::Duration,
        loaded: bool,
    }

    impl Agent for InjectedAgent {
        fn start(&mut self) -> Result<()> {
            let code = call_remote(&self.process, self.start as usize, self.port as usize)?;
            if code != 0 {
                return Err(Error::Instrumentation(format!(
                    "agent start returned {code}"
                )));
            }
            if !self.pump.wait_connected(self.connect_timeout) {
                return Err(Error::Instrumentation(
                    "agent did not connect back".to_string(),
                ));
            }
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            self.loaded && !self.pump.is_closed()
        }

        fn unload(&mut self) -> Result<()> {
            self.pump.shutdown();
            if !self.loaded {
                return Ok(());
            }
            self.loaded = false;
            if !is_running(&self.process) {
                return Ok(());
            }
            let free_library = kernel32_export(s!("FreeLibrary"))?;
            let code = call_remote(&self.process, free_library, self.base as usize)?;
            if code == 0 {
                return Err(Error::Instrumentation("FreeLibrary failed".to_string()));
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "windows"))]
mod unsupported {
    use std::convert::Infallible;

    use super::InjectorBackend;
    use crate::error::{Error, Result};
    use crate::instrument::session::{Agent, InstrumentationBackend, MessageHandler, TargetSession};
    use crate::memory::ProcessTarget;

    /// Placeholder session on platforms without an injection backend.
    pub struct InjectedSession {
        never: Infallible,
    }

    pub struct InjectedAgent {
        never: Infallible,
    }

    impl InstrumentationBackend for InjectorBackend {
        type Session = InjectedSession;

        fn attach(&self, target: &ProcessTarget) -> Result<InjectedSession> {
            Err(Error::Unsupported(format!(
                "cannot instrument {target}: agent injection is only implemented for Windows"
            )))
        }
    }

    impl TargetSession for InjectedSession {
        type Agent = InjectedAgent;

        fn load_agent(&mut self, _handler: MessageHandler) -> Result<InjectedAgent> {
            match self.never {}
        }
        fn is_attached(&self) -> bool {
            match self.never {}
        }
        fn detach(&mut self) -> Result<()> {
            match self.never {}
        }
    }

    impl Agent for InjectedAgent {
        fn start(&mut self) -> Result<()> {
            match self.never {}
        }
        fn is_loaded(&self) -> bool {
            match self.never {}
        }
        fn unload(&mut self) -> Result<()> {
            match self.never {}
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub use unsupported::{InjectedAgent, InjectedSession};
