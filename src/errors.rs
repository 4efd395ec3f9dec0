/// Error types surfaced by the runtime.
///
/// Diagnostics leave the core through the host `error` callback as
/// (kind, module, line, message) tuples; the public `interpret` entry point
/// additionally returns a `WispError` summarizing the failure.

use thiserror::Error;

/// The kind of diagnostic being delivered to the host error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A syntax or resolution error found during compilation. Carries the
    /// module name and 1-based source line.
    Compile,
    /// An uncaught fiber abort. Module is absent and line is -1.
    Runtime,
    /// One stack frame of the trace following a runtime error, top first.
    StackTrace,
}

/// Result of interpreting a module.
#[derive(Debug, Clone, Error)]
pub enum WispError {
    #[error("compile error in module '{module}'")]
    Compile { module: String },
    #[error("runtime error: {message}")]
    Runtime { message: String },
}

pub type InterpretResult = Result<(), WispError>;
