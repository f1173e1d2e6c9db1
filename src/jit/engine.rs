//! The JIT manager: module lifecycle plus name resolution.
//!
//! Modules are compiled on submission, appended to an insertion-ordered
//! registry, and torn down on explicit removal. Resolution searches the
//! registry newest-first and falls back to the host process's symbol table,
//! so a REPL-style caller gets "last definition wins" without unloading
//! anything.

use log::{debug, trace};

use super::compile::{CompileLayer, ImportResolver};
use super::object::{ModuleHandle, ObjectLayer};
use crate::error::NarwhalError;
use crate::ir::IrModule;
use crate::mangle::Mangler;
use crate::process::{HostProcess, ProcessSymbols};
use crate::target::{OptLevel, TargetDescriptor};
use crate::NarwhalResult;

/// Construction-time options for [`JitEngine`].
pub struct JitConfig {
    pub opt_level: OptLevel,
    /// Override for the process-fallback tier. `None` installs the real
    /// host-process table; tests inject a deterministic one.
    pub process_symbols: Option<Box<dyn ProcessSymbols>>,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::default(),
            process_symbols: None,
        }
    }
}

/// A resolved symbol. Materialized fresh on every successful lookup; nothing
/// is cached between lookups.
#[derive(Debug, Clone)]
pub struct JitSymbol {
    /// The mangled name the symbol was found under.
    pub name: String,
    pub address: *const u8,
    /// True for exported definitions and for everything served by the host
    /// process; false for a module's local definitions.
    pub exported: bool,
}

/// The JIT compilation manager.
///
/// Single-threaded by design: no operation blocks or synchronizes, and a
/// multi-threaded host must wrap the whole engine in one lock. The engine is
/// the sole authority over the executable memory it allocates; code compiled
/// from a module stays mapped until that module is removed or the engine is
/// dropped, and never longer.
pub struct JitEngine {
    target: TargetDescriptor,
    mangler: Mangler,
    compiler: CompileLayer,
    objects: ObjectLayer,
    /// Insertion order of live handles; resolution walks it back to front.
    modules: Vec<ModuleHandle>,
    process: Box<dyn ProcessSymbols>,
}

impl JitEngine {
    /// Build an engine targeting the host machine. Fails only on environment
    /// errors (no native backend for this architecture, unopenable process
    /// symbol table); per-module problems surface from [`Self::add_module`]
    /// instead.
    pub fn new() -> NarwhalResult<Self> {
        Self::with_config(JitConfig::default())
    }

    pub fn with_config(config: JitConfig) -> NarwhalResult<Self> {
        let target = TargetDescriptor::host(config.opt_level)?;
        let mangler = Mangler::new(target.triple());
        let compiler = CompileLayer::new(&target);
        let process: Box<dyn ProcessSymbols> = match config.process_symbols {
            Some(process) => process,
            None => Box::new(HostProcess::new()?),
        };

        debug!("engine targeting {}", target.triple());
        Ok(Self {
            target,
            mangler,
            compiler,
            objects: ObjectLayer::new(),
            modules: Vec::new(),
            process,
        })
    }

    /// The target this engine compiles for, for callers that build modules
    /// against it.
    pub fn target(&self) -> &TargetDescriptor {
        &self.target
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Compile and link `module`, consuming it, and register the artifact.
    ///
    /// Undefined references inside the module resolve against the registry
    /// as it is right now (newest module first) and then the host process,
    /// so new code can call anything loaded before it. On error nothing is
    /// registered and the returned diagnostic carries the failing name.
    pub fn add_module(&mut self, module: IrModule) -> NarwhalResult<ModuleHandle> {
        let view = RegistryView {
            objects: &self.objects,
            order: &self.modules,
            mangler: &self.mangler,
            process: self.process.as_ref(),
        };
        let artifact = self.compiler.compile(module, &self.mangler, &view)?;

        let name = artifact.name().to_owned();
        let handle = self.objects.insert(artifact);
        self.modules.push(handle);
        debug!("added module '{}' ({} loaded)", name, self.modules.len());
        Ok(handle)
    }

    /// Remove a module and release its executable memory. Symbols it defined
    /// stop resolving immediately (older definitions or the host process may
    /// take over). Removing a handle twice is caller misuse and reports
    /// `UnknownHandle`.
    pub fn remove_module(&mut self, handle: ModuleHandle) -> NarwhalResult<()> {
        let artifact = self
            .objects
            .remove(handle)
            .ok_or(NarwhalError::UnknownHandle)?;
        self.modules.retain(|&live| live != handle);
        debug!(
            "removed module '{}' ({} loaded)",
            artifact.name(),
            self.modules.len()
        );
        Ok(())
    }

    /// Resolve a logical name to an address. A miss is a normal outcome and
    /// returns `None`, never an error.
    pub fn find_symbol(&self, name: &str) -> Option<JitSymbol> {
        let mangled = self.mangler.mangle(name);
        resolve_mangled(
            &self.objects,
            &self.modules,
            &self.mangler,
            self.process.as_ref(),
            &mangled,
        )
    }
}

/// Borrowed view of the engine's registry handed to the compile layer, so a
/// module being linked resolves names through the same search the engine
/// itself uses. A view rather than the engine: compilation must not be able
/// to mutate the registry it is searching.
struct RegistryView<'a> {
    objects: &'a ObjectLayer,
    order: &'a [ModuleHandle],
    mangler: &'a Mangler,
    process: &'a dyn ProcessSymbols,
}

impl ImportResolver for RegistryView<'_> {
    fn resolve(&self, mangled: &str) -> Option<*const u8> {
        resolve_mangled(self.objects, self.order, self.mangler, self.process, mangled)
            .map(|symbol| symbol.address)
    }
}

/// The resolution order. Tier one scans loaded modules from last added to
/// first added, the opposite of dlsym's search order: in an incremental
/// workflow a later redefinition should shadow the older one without the
/// older module being unloaded. Local definitions count. Tier two asks the
/// host process, whose loader indexes plain names, so the platform prefix
/// comes off first.
fn resolve_mangled(
    objects: &ObjectLayer,
    order: &[ModuleHandle],
    mangler: &Mangler,
    process: &dyn ProcessSymbols,
    mangled: &str,
) -> Option<JitSymbol> {
    for &handle in order.iter().rev() {
        if let Some(def) = objects.lookup_in(handle, mangled, true) {
            trace!("'{}' resolved from a loaded module", mangled);
            return Some(JitSymbol {
                name: mangled.to_owned(),
                address: def.address,
                exported: def.exported,
            });
        }
    }

    let address = process.resolve(mangler.strip(mangled))?;
    trace!("'{}' resolved from the host process", mangled);
    Some(JitSymbol {
        name: mangled.to_owned(),
        address,
        exported: true,
    })
}
