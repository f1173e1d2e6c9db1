use std::fmt;

use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use target_lexicon::Triple;

use crate::error::NarwhalError;
use crate::NarwhalResult;

/// Optimization level applied by the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn as_flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// The machine-code target the engine compiles for. Selected once at engine
/// construction, owned by the engine, never mutated.
pub struct TargetDescriptor {
    isa: OwnedTargetIsa,
}

impl TargetDescriptor {
    /// Select the host machine as the compilation target.
    ///
    /// Fails with `HostTargetUnavailable` when no native backend exists for
    /// this architecture; the engine cannot be constructed in that case.
    pub fn host(opt_level: OptLevel) -> NarwhalResult<Self> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level.as_flag())
            .map_err(|e| NarwhalError::HostTargetUnavailable {
                message: e.to_string(),
            })?;
        // Finalized JIT code is never relocated, so PIC buys nothing.
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| NarwhalError::HostTargetUnavailable {
                message: e.to_string(),
            })?;

        let isa_builder =
            cranelift_native::builder().map_err(|msg| NarwhalError::HostTargetUnavailable {
                message: msg.to_string(),
            })?;

        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| NarwhalError::HostTargetUnavailable {
                message: e.to_string(),
            })?;

        Ok(Self { isa })
    }

    /// The triple code is generated for.
    pub fn triple(&self) -> &Triple {
        self.isa.triple()
    }

    pub(crate) fn isa(&self) -> OwnedTargetIsa {
        self.isa.clone()
    }
}

impl fmt::Debug for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetDescriptor")
            .field("triple", &self.triple().to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_target_is_available() {
        let target = TargetDescriptor::host(OptLevel::default()).unwrap();
        assert!(!target.triple().to_string().is_empty());
    }
}
