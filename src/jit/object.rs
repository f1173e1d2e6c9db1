use cranelift_jit::JITModule;
use rustc_hash::FxHashMap;
use slotmap::{new_key_type, DenseSlotMap};

new_key_type! {
    /// Generational key identifying one compiled-and-loaded module. A stale
    /// handle (already removed, or minted by another engine) fails the
    /// registry lookup instead of reaching freed memory.
    pub struct ModuleHandle;
}

/// Address and linkage of one definition inside a linked artifact.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolDef {
    pub address: *const u8,
    pub exported: bool,
}

/// One module compiled and linked into executable memory. The artifact owns
/// its own `JITModule` and therefore its own code and data pages; dropping
/// the artifact is the only path that unmaps them.
pub(crate) struct LinkedArtifact {
    name: String,
    symbols: FxHashMap<String, SymbolDef>,
    module: Option<JITModule>,
}

impl std::fmt::Debug for LinkedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedArtifact")
            .field("name", &self.name)
            .field("symbols", &self.symbols)
            .field("module", &self.module.as_ref().map(|_| "<JITModule>"))
            .finish()
    }
}

impl LinkedArtifact {
    pub(crate) fn new(
        name: String,
        symbols: FxHashMap<String, SymbolDef>,
        module: JITModule,
    ) -> Self {
        Self {
            name,
            symbols,
            module: Some(module),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Look up a mangled name in this artifact. With `include_local` the
    /// search also sees non-exported definitions.
    pub(crate) fn lookup(&self, mangled: &str, include_local: bool) -> Option<SymbolDef> {
        let def = self.symbols.get(mangled).copied()?;
        if def.exported || include_local {
            Some(def)
        } else {
            None
        }
    }
}

impl Drop for LinkedArtifact {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: the engine is the sole owner of this artifact, and
            // explicit removal or engine teardown is the only way it drops.
            // Running code out of a removed module is a caller contract
            // violation, the same as calling through any freed pointer.
            unsafe { module.free_memory() };
        }
    }
}

/// Holds linked artifacts resident and resolvable, keyed by generational
/// handles. Insertion order is tracked by the engine, not here.
pub(crate) struct ObjectLayer {
    artifacts: DenseSlotMap<ModuleHandle, LinkedArtifact>,
}

impl ObjectLayer {
    pub(crate) fn new() -> Self {
        Self {
            artifacts: DenseSlotMap::with_key(),
        }
    }

    pub(crate) fn insert(&mut self, artifact: LinkedArtifact) -> ModuleHandle {
        self.artifacts.insert(artifact)
    }

    pub(crate) fn remove(&mut self, handle: ModuleHandle) -> Option<LinkedArtifact> {
        self.artifacts.remove(handle)
    }

    pub(crate) fn lookup_in(
        &self,
        handle: ModuleHandle,
        mangled: &str,
        include_local: bool,
    ) -> Option<SymbolDef> {
        self.artifacts
            .get(handle)
            .and_then(|artifact| artifact.lookup(mangled, include_local))
    }
}
