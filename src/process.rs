use std::ffi::c_void;

#[cfg(unix)]
use libloading::os::unix::Library;
#[cfg(windows)]
use libloading::os::windows::Library;

#[cfg(windows)]
use crate::error::NarwhalError;
use crate::NarwhalResult;

/// Capability for answering "what address does the running process export
/// under this name". The engine consults it as the final resolution tier and
/// takes it as an injected value, so a test can substitute a deterministic
/// table for the real dynamic loader.
pub trait ProcessSymbols {
    /// Look up `name`, given unprefixed the way the dynamic loader indexes it.
    fn resolve(&self, name: &str) -> Option<*const u8>;
}

/// The host process's own symbol table: everything statically linked into the
/// binary's dynamic symbol table plus every shared library it has loaded.
pub struct HostProcess {
    lib: Library,
}

impl HostProcess {
    pub fn new() -> NarwhalResult<Self> {
        #[cfg(unix)]
        {
            Ok(Self {
                lib: Library::this(),
            })
        }

        #[cfg(windows)]
        {
            Library::this()
                .map(|lib| Self { lib })
                .map_err(|e| NarwhalError::ProcessTableUnavailable {
                    message: e.to_string(),
                })
        }
    }
}

impl ProcessSymbols for HostProcess {
    fn resolve(&self, name: &str) -> Option<*const u8> {
        // SAFETY: the symbol is only materialized as an address here; nothing
        // is called or dereferenced through it.
        let symbol = unsafe { self.lib.get::<*mut c_void>(name.as_bytes()) }.ok()?;
        Some(*symbol as *const u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn finds_libc_symbols() {
        let process = HostProcess::new().unwrap();
        assert!(process.resolve("malloc").is_some());
    }

    #[test]
    fn misses_are_none() {
        let process = HostProcess::new().unwrap();
        assert!(process.resolve("narwhal_no_such_symbol_anywhere").is_none());
    }
}
