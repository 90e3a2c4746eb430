/// Typed error enums for the VM core: runtime faults raised while
/// executing bytecode, load faults raised while deserializing a `.bu.bc`
/// file, and native faults a host binding hands back across the FFI
/// boundary. `CompileError` is an opaque placeholder: actual compilation
/// is owned by the (out of scope) front-end collaborator, and
/// `ScriptException` is simply a `Value` propagated through the try/catch
/// machinery rather than a Rust error type.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub source_id: u32,
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(source_id: u32, start: usize, end: usize) -> Self {
        Span { source_id, start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            source_id: self.source_id,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span { source_id: 0, start: 0, end: 0 }
    }
}

/// Opaque handle to a compile error produced by the external compiler;
/// this crate never constructs one, only threads it through the host API.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl std::error::Error for CompileError {}

/// Faults raised while the interpreter executes bytecode.
#[derive(Debug, Error, Clone)]
pub enum RuntimeError {
    #[error("[AXM_501] undefined global '{name}'")]
    UndefinedGlobal { name: String, span: Span },

    #[error("[AXM_502] type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String, span: Span },

    #[error("[AXM_503] wrong arity: expected {expected} arguments, found {found}")]
    ArityMismatch { expected: usize, found: usize, span: Span },

    #[error("[AXM_504] index {index} out of bounds for length {length}")]
    IndexOutOfBounds { index: i64, length: usize, span: Span },

    #[error("[AXM_505] division by zero")]
    DivisionByZero { span: Span },

    #[error("[AXM_506] attempt to call nil value — {hint}")]
    NilCall { hint: String, span: Span },

    #[error("[AXM_507] attempt to call non-callable value of type '{type_name}'")]
    NotCallable { type_name: String, span: Span },

    #[error("[AXM_508] undefined method '{method_name}' on class '{class_name}'")]
    UndefinedMethod { class_name: String, method_name: String, span: Span },

    #[error("[AXM_509] stack overflow: exceeded {limit} frames")]
    StackOverflow { limit: usize },

    #[error("[AXM_510] operand stack overflow: exceeded {limit} slots")]
    OperandStackOverflow { limit: usize },

    #[error("[AXM_511] gosub stack overflow: exceeded {limit} entries")]
    GosubStackOverflow { limit: usize },

    #[error("[AXM_512] try-handler stack overflow: exceeded {limit} entries")]
    TryStackOverflow { limit: usize },

    #[error("[AXM_513] uncaught exception: {message}")]
    UncaughtException { message: String },

    #[error("[AXM_514] too many pending returns across finally blocks: {limit}")]
    PendingReturnOverflow { limit: usize },

    #[error("{message}")]
    Generic { message: String, span: Span },
}

impl RuntimeError {
    pub fn span(&self) -> Span {
        match self {
            RuntimeError::UndefinedGlobal { span, .. }
            | RuntimeError::TypeMismatch { span, .. }
            | RuntimeError::ArityMismatch { span, .. }
            | RuntimeError::IndexOutOfBounds { span, .. }
            | RuntimeError::DivisionByZero { span }
            | RuntimeError::NilCall { span, .. }
            | RuntimeError::NotCallable { span, .. }
            | RuntimeError::UndefinedMethod { span, .. }
            | RuntimeError::Generic { span, .. } => *span,
            _ => Span::default(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::UndefinedGlobal { .. } => "AXM_501",
            RuntimeError::TypeMismatch { .. } => "AXM_502",
            RuntimeError::ArityMismatch { .. } => "AXM_503",
            RuntimeError::IndexOutOfBounds { .. } => "AXM_504",
            RuntimeError::DivisionByZero { .. } => "AXM_505",
            RuntimeError::NilCall { .. } => "AXM_506",
            RuntimeError::NotCallable { .. } => "AXM_507",
            RuntimeError::UndefinedMethod { .. } => "AXM_508",
            RuntimeError::StackOverflow { .. } => "AXM_509",
            RuntimeError::OperandStackOverflow { .. } => "AXM_510",
            RuntimeError::GosubStackOverflow { .. } => "AXM_511",
            RuntimeError::TryStackOverflow { .. } => "AXM_512",
            RuntimeError::UncaughtException { .. } => "AXM_513",
            RuntimeError::PendingReturnOverflow { .. } => "AXM_514",
            RuntimeError::Generic { .. } => "AXM_599",
        }
    }
}

/// Faults raised while reading/writing a `.bu.bc` bytecode file.
#[derive(Debug, Error, Clone)]
pub enum LoadError {
    #[error("[AXM_601] bad magic number: expected 'BUBC'")]
    BadMagic,

    #[error("[AXM_602] unsupported bytecode version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("[AXM_603] truncated or corrupt section: {section}")]
    TruncatedSection { section: String },

    #[error("[AXM_604] unknown constant tag {tag}")]
    UnknownConstantTag { tag: u8 },

    #[error("[AXM_605] I/O error: {message}")]
    Io { message: String },

    #[error("[AXM_606] checksum mismatch")]
    ChecksumMismatch,

    #[error("[AXM_607] native function '{name}' arity mismatch: file expects {expected}, runtime has {found}")]
    NativeArityMismatch { name: String, expected: u8, found: u8 },
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        LoadError::Io { message: e.to_string() }
    }
}

/// Faults a native binding hands back when an argument is the wrong type,
/// out of range, or the binding otherwise can't complete the call.
#[derive(Debug, Error, Clone)]
#[error("[AXM_701] native error: {message}")]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        NativeError { message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_codes_are_stable() {
        assert_eq!(
            RuntimeError::DivisionByZero { span: Span::default() }.code(),
            "AXM_505"
        );
    }

    #[test]
    fn span_merge_takes_outer_bounds() {
        let a = Span::new(0, 5, 10);
        let b = Span::new(0, 2, 8);
        let merged = a.merge(b);
        assert_eq!(merged.start, 2);
        assert_eq!(merged.end, 10);
    }

    #[test]
    fn load_error_wraps_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing file");
        let load_err: LoadError = io_err.into();
        assert!(matches!(load_err, LoadError::Io { .. }));
    }
}
