use thiserror::Error;

#[derive(Error, Debug)]
pub enum NarwhalError {
    #[error("no usable native code target for this host: {message}")]
    HostTargetUnavailable { message: String },

    #[error("cannot open the host process's symbol table: {message}")]
    ProcessTableUnavailable { message: String },

    #[error("unknown module handle (already removed or never issued by this engine)")]
    UnknownHandle,

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Errors produced while compiling and linking a submitted module. Nothing is
/// registered with the engine when one of these is returned.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("module '{module}' defines symbol '{name}' more than once")]
    DuplicateSymbol { module: String, name: String },

    #[error("unresolved reference to '{name}' while linking module '{module}'")]
    UnresolvedSymbol { module: String, name: String },

    #[error("call to '{callee}' in module '{module}' passes {got} argument(s) but the definition takes {expected}")]
    ArityMismatch {
        module: String,
        callee: String,
        expected: usize,
        got: usize,
    },

    #[error("argument index {index} out of range for function '{function}' with {arity} parameter(s)")]
    ArgOutOfRange {
        function: String,
        index: usize,
        arity: usize,
    },

    #[error("code generation failed: {0}")]
    Codegen(#[from] cranelift_module::ModuleError),
}
