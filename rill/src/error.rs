use thiserror::Error;

use crate::ObjectRef;

/// Recoverable language-level failures.
///
/// Whatever variant reaches a task is turned into an `Error` object with a
/// message and a stack trace, so user code only ever sees one shape.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Message(String),

    #[error("type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: String,
    },

    #[error("unsupported operand types for {op}: {lhs} and {rhs}")]
    UnsupportedOperands {
        op: &'static str,
        lhs: String,
        rhs: String,
    },

    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    #[error("`{target}` has no member `{member}`")]
    NoMember { target: String, member: String },

    #[error("`{0}` is not callable")]
    NotCallable(String),

    #[error("missing argument {0}")]
    MissingArgument(usize),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("no enclosing block to leave")]
    ContextUnderflow,

    #[error("can only raise Error objects, got {0}")]
    NotAnError(String),

    #[error("module `{0}` not found")]
    ModuleNotFound(String),

    #[error("out of memory: {live} live objects after collection exceeds the limit of {max}")]
    OutOfMemory { live: usize, max: usize },

    #[error("stale object reference")]
    StaleReference,

    #[error("remote object no longer exists")]
    RemoteGone,

    #[error("{0}")]
    InheritanceCycle(String),

    #[error("malformed instruction at {ins}: {reason}")]
    MalformedInstruction { ins: usize, reason: &'static str },

    /// An error object that already exists in the running task's heap.
    #[error("raised error object")]
    Raised(ObjectRef),
}

/// Host-level failures: loading, registering and validating modules.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("module `{0}` not found")]
    ModuleNotFound(String),

    #[error("module `{0}` is already registered")]
    DuplicateModule(String),

    #[error("class `{class}` names unknown superclass `{super_name}`")]
    UnknownSuperclass { class: String, super_name: String },

    #[error("class `{0}` would inherit from itself")]
    InheritanceCycle(String),

    #[error("malformed tape at {ins} ({op}): {reason}")]
    MalformedTape {
        ins: usize,
        op: &'static str,
        reason: String,
    },

    #[error("malformed module: {0}")]
    MalformedModule(String),

    #[error("{file}:{line}: {message}")]
    Assembly {
        file: String,
        line: usize,
        message: String,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn message(message: impl Into<String>) -> Self {
        RuntimeError::Message(message.into())
    }
}

impl From<VmError> for RuntimeError {
    fn from(value: VmError) -> Self {
        match value {
            VmError::ModuleNotFound(name) => RuntimeError::ModuleNotFound(name),
            other => RuntimeError::Message(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_render_messages() {
        let err = RuntimeError::IndexOutOfBounds { index: 5, len: 2 };
        assert_eq!(err.to_string(), "index 5 out of bounds for length 2");
        let err = RuntimeError::UnknownIdentifier("x".into());
        assert_eq!(err.to_string(), "unknown identifier `x`");
    }

    #[test]
    fn vm_module_errors_convert() {
        let err: RuntimeError = VmError::ModuleNotFound("io".into()).into();
        assert_eq!(err, RuntimeError::ModuleNotFound("io".into()));
    }
}
