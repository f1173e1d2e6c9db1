use target_lexicon::{Architecture, BinaryFormat, Triple};

/// Escape marker that suppresses mangling: a name starting with `\x01` is
/// emitted verbatim with the escape stripped, whatever the target.
const VERBATIM_ESCAPE: char = '\u{1}';

/// Maps logical symbol names to the names the target's object format expects.
/// Stateless once derived from the triple; any input maps to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mangler {
    prefix: Option<char>,
}

impl Mangler {
    /// Derive the mangling convention from the target triple. Mach-O and
    /// 32-bit x86 COFF objects prepend an underscore to every global name;
    /// ELF emits names verbatim.
    pub fn new(triple: &Triple) -> Self {
        let prefix = match triple.binary_format {
            BinaryFormat::Macho => Some('_'),
            BinaryFormat::Coff if matches!(triple.architecture, Architecture::X86_32(_)) => {
                Some('_')
            }
            _ => None,
        };

        Self { prefix }
    }

    pub fn mangle(&self, name: &str) -> String {
        if let Some(verbatim) = name.strip_prefix(VERBATIM_ESCAPE) {
            return verbatim.to_owned();
        }

        match self.prefix {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_owned(),
        }
    }

    /// Undo the platform prefix on an already-mangled name. Dynamic loaders
    /// index plain names (`dlsym("strlen")`, never `"_strlen"`), so lookups
    /// against the host process go through this.
    pub fn strip<'a>(&self, mangled: &'a str) -> &'a str {
        match self.prefix {
            Some(prefix) => mangled.strip_prefix(prefix).unwrap_or(mangled),
            None => mangled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mangler_for(triple: &str) -> Mangler {
        Mangler::new(&triple.parse::<Triple>().unwrap())
    }

    #[test]
    fn macho_prepends_underscore() {
        let mangler = mangler_for("x86_64-apple-darwin");
        assert_eq!(mangler.mangle("main"), "_main");
        assert_eq!(mangler.strip("_main"), "main");
    }

    #[test]
    fn elf_is_identity() {
        let mangler = mangler_for("x86_64-unknown-linux-gnu");
        assert_eq!(mangler.mangle("main"), "main");
        assert_eq!(mangler.strip("main"), "main");
    }

    #[test]
    fn coff_x86_32_prepends_underscore() {
        let mangler = mangler_for("i686-pc-windows-msvc");
        assert_eq!(mangler.mangle("main"), "_main");
    }

    #[test]
    fn coff_x86_64_is_identity() {
        let mangler = mangler_for("x86_64-pc-windows-msvc");
        assert_eq!(mangler.mangle("main"), "main");
    }

    #[test]
    fn verbatim_escape_suppresses_prefix() {
        let mangler = mangler_for("aarch64-apple-darwin");
        assert_eq!(mangler.mangle("\u{1}raw_name"), "raw_name");
    }

    #[test]
    fn strip_leaves_unprefixed_names_alone() {
        let mangler = mangler_for("aarch64-apple-darwin");
        assert_eq!(mangler.strip("already_plain"), "already_plain");
    }
}
