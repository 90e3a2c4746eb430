/// Human-readable rendering for VM-core errors — rustc-grade terminal
/// output for a crate that otherwise only deals in bytecode.
///
/// FEATURES
/// ────────
/// • Source context: shows 2 lines above + error line + caret (^^^^) underneath
/// • Row / column / line coordinates pinpointed from byte spans
/// • Levenshtein spell-check for undefined-global lookups ("did you mean X?")
/// • Every error routed through AxiomDiagnostic → miette graphical renderer
/// • AXM_5xx (runtime) / AXM_6xx (load) / AXM_7xx (native) taxonomy
///
/// The lexer/parser/type-checker code ranges (AXM_1xx-3xx) from the
/// front-end compiler don't exist here — that collaborator owns its own
/// diagnostics. This module only renders the errors this crate can
/// actually raise: `RuntimeError`, `LoadError`, `NativeError`.

use std::fmt;
use miette::{Diagnostic, SourceSpan, NamedSource};
use thiserror::Error as ThisError;
use crate::errors::{LoadError, RuntimeError, Span};

// ═══════════════════════════════════════════════════════════════════════════
// Error Code Taxonomy (AXM_500-799, runtime / load / native)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    UndefinedGlobal         = 501,
    TypeMismatch            = 502,
    ArityMismatch           = 503,
    IndexOutOfBounds        = 504,
    DivisionByZero          = 505,
    NilCall                 = 506,
    NotCallable             = 507,
    UndefinedMethod         = 508,
    StackOverflow           = 509,
    OperandStackOverflow    = 510,
    GosubStackOverflow      = 511,
    TryStackOverflow        = 512,
    UncaughtException       = 513,
    PendingReturnOverflow   = 514,
    Generic                 = 599,

    BadMagic                = 601,
    UnsupportedVersion      = 602,
    TruncatedSection        = 603,
    UnknownConstantTag      = 604,
    Io                      = 605,
    ChecksumMismatch        = 606,

    NativeError             = 701,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 { self as u32 }

    pub fn prefix(self) -> String {
        format!("[AXM_{:03}]", self as u32)
    }

    pub fn summary(self) -> &'static str {
        match self {
            Self::UndefinedGlobal       => "Undefined global",
            Self::TypeMismatch          => "Type mismatch in operation",
            Self::ArityMismatch         => "Argument count mismatch",
            Self::IndexOutOfBounds      => "Index out of bounds",
            Self::DivisionByZero        => "Division by zero",
            Self::NilCall               => "Attempt to call nil value",
            Self::NotCallable           => "Attempt to call non-callable value",
            Self::UndefinedMethod       => "Undefined method on class",
            Self::StackOverflow         => "Call stack overflow",
            Self::OperandStackOverflow  => "Operand stack overflow",
            Self::GosubStackOverflow    => "Gosub stack overflow",
            Self::TryStackOverflow      => "Try-handler stack overflow",
            Self::UncaughtException     => "Uncaught exception",
            Self::PendingReturnOverflow => "Too many pending returns across finally blocks",
            Self::Generic               => "Runtime error",
            Self::BadMagic              => "Bad bytecode magic number",
            Self::UnsupportedVersion    => "Unsupported bytecode version",
            Self::TruncatedSection      => "Truncated or corrupt bytecode section",
            Self::UnknownConstantTag    => "Unknown constant tag in bytecode",
            Self::Io                    => "I/O error loading bytecode",
            Self::ChecksumMismatch      => "Bytecode checksum mismatch",
            Self::NativeError           => "Native binding error",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            Self::NilCall =>
                "Ensure the identifier is defined before use. Closures capture upvalues at definition time — verify the variable exists in the enclosing scope.",
            Self::UndefinedGlobal =>
                "Check that the global was declared and assigned before this point ran.",
            Self::ArityMismatch =>
                "Check the function signature. The number of call-site arguments must match declared parameters exactly.",
            Self::TypeMismatch =>
                "Mixed-type arithmetic promotes Byte -> Int -> UInt -> Float -> Double; an explicit conversion may be required outside that lattice.",
            Self::DivisionByZero =>
                "Guard the divisor before dividing.",
            Self::IndexOutOfBounds =>
                "Check bounds before indexing.",
            Self::StackOverflow =>
                "Use iteration instead of deep recursion, or raise the configured frame capacity.",
            Self::OperandStackOverflow | Self::GosubStackOverflow | Self::TryStackOverflow =>
                "This capacity is fixed at startup via the conf layer; raise it if the script legitimately needs more headroom.",
            Self::BadMagic | Self::UnsupportedVersion | Self::TruncatedSection | Self::UnknownConstantTag | Self::ChecksumMismatch =>
                "The bytecode file is not a file this build of the VM produced. Recompile it with a matching toolchain.",
            _ => "See the crate documentation for this error code.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.prefix(), self.summary())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Levenshtein distance — for "did you mean X?" global-name suggestions
// ═══════════════════════════════════════════════════════════════════════════

/// Compute the Levenshtein edit distance between two strings.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    if m == 0 { return n; }
    if n == 0 { return m; }

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (curr[j - 1] + 1)
                .min(prev[j] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Find the closest match to `name` in `candidates`.
pub fn closest_match<'a>(name: &str, candidates: &[&'a str], threshold: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|c| (*c, levenshtein(name, c)))
        .filter(|(_, d)| *d <= threshold)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

// ═══════════════════════════════════════════════════════════════════════════
// Source location helpers
// ═══════════════════════════════════════════════════════════════════════════

pub fn byte_to_line_col(source: &str, byte_offset: usize) -> (usize, usize) {
    let safe_offset = byte_offset.min(source.len());
    let prefix = &source[..safe_offset];
    let line = prefix.chars().filter(|&c| c == '\n').count() + 1;
    let col = match prefix.rfind('\n') {
        Some(nl) => byte_offset - nl,
        None     => byte_offset + 1,
    };
    (line, col)
}

pub fn get_line(source: &str, line_number: usize) -> Option<&str> {
    source.lines().nth(line_number.saturating_sub(1))
}

// ═══════════════════════════════════════════════════════════════════════════
// AxiomDiagnostic — miette-backed error type
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, ThisError, Diagnostic)]
#[error("{} {message}", self.code.prefix())]
#[diagnostic(help("{hint}"))]
pub struct AxiomDiagnostic {
    pub message:  String,
    pub code:     ErrorCode,
    pub hint:     String,
    pub suggestion: Option<String>,
    #[source_code]
    pub src:      NamedSource,
    #[label("here")]
    pub span:     SourceSpan,
}

impl AxiomDiagnostic {
    pub fn new(
        code:        ErrorCode,
        message:     impl Into<String>,
        source_name: impl Into<String>,
        source_text: impl Into<String>,
        byte_start:  usize,
        byte_len:    usize,
    ) -> Self {
        AxiomDiagnostic {
            hint:       code.hint().into(),
            message:    message.into(),
            suggestion: None,
            code,
            src:        NamedSource::new(source_name.into(), source_text.into()),
            span:       (byte_start, byte_len.max(1)).into(),
        }
    }

    pub fn no_source(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message, "<bytecode>", " ", 0, 0)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        let s = suggestion.into();
        self.hint = format!("{}  →  Did you mean '{}'?", self.hint, s);
        self.suggestion = Some(s);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RustcRenderer — manual rustc-style source context (fallback / supplement)
// ═══════════════════════════════════════════════════════════════════════════

pub fn render_rustc_style(
    code:        ErrorCode,
    message:     &str,
    source_name: &str,
    source_text: &str,
    byte_start:  usize,
    byte_len:    usize,
    hint:        &str,
) -> String {
    use std::fmt::Write as FmtWrite;
    let mut out = String::new();

    let (line, col) = byte_to_line_col(source_text, byte_start);
    let span_len = byte_len.max(1);

    let _ = writeln!(out, "\x1b[1;31merror\x1b[0m\x1b[1m[{}]\x1b[0m: {}", code.prefix(), message);
    let _ = writeln!(out, " \x1b[1;34m-->\x1b[0m {}:{}:{}", source_name, line, col);
    let _ = writeln!(out, "  \x1b[1;34m|\x1b[0m");

    if line > 1 {
        if let Some(prev_line_text) = get_line(source_text, line - 1) {
            let _ = writeln!(out, "\x1b[1;34m{:>3} |\x1b[0m {}", line - 1, prev_line_text);
        }
    }

    if let Some(err_line_text) = get_line(source_text, line) {
        let _ = writeln!(out, "\x1b[1;34m{:>3} |\x1b[0m {}", line, err_line_text);
        let prefix_spaces = " ".repeat(col.saturating_sub(1) + 4 + 2);
        let carets = "^".repeat(span_len);
        let _ = writeln!(out, "  \x1b[1;34m|\x1b[0m {}\x1b[1;31m{}\x1b[0m", prefix_spaces, carets);
    }

    let _ = writeln!(out, "  \x1b[1;34m|\x1b[0m");
    let _ = writeln!(out, "  \x1b[1;34m=\x1b[0m \x1b[1mhelp\x1b[0m: {}", hint);
    let _ = writeln!(out);

    out
}

// ═══════════════════════════════════════════════════════════════════════════
// DiagnosticEngine — single reporting interface
// ═══════════════════════════════════════════════════════════════════════════

pub struct DiagnosticEngine {
    source_name: String,
    source_text: String,
    known_globals: Vec<String>,
}

impl DiagnosticEngine {
    pub fn new(source_name: impl Into<String>, source_text: impl Into<String>) -> Self {
        DiagnosticEngine {
            source_name: source_name.into(),
            source_text: source_text.into(),
            known_globals: Vec::new(),
        }
    }

    pub fn register_globals(&mut self, names: impl IntoIterator<Item = String>) {
        self.known_globals.extend(names);
    }

    pub fn source_name(&self) -> &str { &self.source_name }
    pub fn source_text(&self) -> &str { &self.source_text }

    fn span_len(span: Span) -> usize {
        span.end.saturating_sub(span.start).max(1)
    }

    /// Convert a RuntimeError into a fully-spanned AxiomDiagnostic, with a
    /// Levenshtein "did you mean" suggestion for undefined-global lookups.
    pub fn from_runtime(&self, err: &RuntimeError) -> AxiomDiagnostic {
        let span = err.span();
        let (code, msg) = match err {
            RuntimeError::UndefinedGlobal { name, .. } => {
                let refs: Vec<&str> = self.known_globals.iter().map(|s| s.as_str()).collect();
                let suggestion = closest_match(name, &refs, 2);
                let message = match suggestion {
                    Some(s) => format!("'{}' is not defined — did you mean '{}'?", name, s),
                    None => format!("'{}' is not defined in the globals table", name),
                };
                let mut diag = AxiomDiagnostic::new(
                    ErrorCode::UndefinedGlobal, message,
                    &self.source_name, &self.source_text,
                    span.start, Self::span_len(span),
                );
                if let Some(s) = suggestion {
                    diag = diag.with_suggestion(s);
                }
                return diag;
            }
            RuntimeError::NilCall { hint, .. } => (ErrorCode::NilCall, hint.clone()),
            RuntimeError::NotCallable { type_name, .. } =>
                (ErrorCode::NotCallable, format!("value of type '{}' is not callable", type_name)),
            RuntimeError::TypeMismatch { expected, found, .. } =>
                (ErrorCode::TypeMismatch, format!("expected {}, found {}", expected, found)),
            RuntimeError::ArityMismatch { expected, found, .. } =>
                (ErrorCode::ArityMismatch, format!("expected {} arguments, found {}", expected, found)),
            RuntimeError::IndexOutOfBounds { index, length, .. } =>
                (ErrorCode::IndexOutOfBounds, format!("index {} out of bounds for length {}", index, length)),
            RuntimeError::DivisionByZero { .. } => (ErrorCode::DivisionByZero, "division by zero".into()),
            RuntimeError::UndefinedMethod { class_name, method_name, .. } =>
                (ErrorCode::UndefinedMethod, format!("'{}' has no method '{}'", class_name, method_name)),
            RuntimeError::StackOverflow { limit } =>
                (ErrorCode::StackOverflow, format!("exceeded {} call frames", limit)),
            RuntimeError::OperandStackOverflow { limit } =>
                (ErrorCode::OperandStackOverflow, format!("exceeded {} operand slots", limit)),
            RuntimeError::GosubStackOverflow { limit } =>
                (ErrorCode::GosubStackOverflow, format!("exceeded {} gosub entries", limit)),
            RuntimeError::TryStackOverflow { limit } =>
                (ErrorCode::TryStackOverflow, format!("exceeded {} try-handler entries", limit)),
            RuntimeError::UncaughtException { message } =>
                (ErrorCode::UncaughtException, message.clone()),
            RuntimeError::PendingReturnOverflow { limit } =>
                (ErrorCode::PendingReturnOverflow, format!("limit is {}", limit)),
            RuntimeError::Generic { message, .. } => (ErrorCode::Generic, message.clone()),
        };

        AxiomDiagnostic::new(
            code, msg,
            &self.source_name, &self.source_text,
            span.start, Self::span_len(span),
        )
    }

    /// Convert a LoadError into a sourceless diagnostic — bytecode files
    /// have no useful byte-span to point at.
    pub fn from_load(&self, err: &LoadError) -> AxiomDiagnostic {
        let (code, msg) = match err {
            LoadError::BadMagic => (ErrorCode::BadMagic, "expected magic 'BUBC'".to_string()),
            LoadError::UnsupportedVersion { major, minor } =>
                (ErrorCode::UnsupportedVersion, format!("file is version {major}.{minor}")),
            LoadError::TruncatedSection { section } =>
                (ErrorCode::TruncatedSection, format!("section '{section}' is truncated")),
            LoadError::UnknownConstantTag { tag } =>
                (ErrorCode::UnknownConstantTag, format!("tag byte {tag}")),
            LoadError::Io { message } => (ErrorCode::Io, message.clone()),
            LoadError::ChecksumMismatch => (ErrorCode::ChecksumMismatch, "stored checksum does not match contents".to_string()),
        };
        AxiomDiagnostic::no_source(code, msg)
    }

    pub fn emit(&self, diag: &AxiomDiagnostic) {
        use miette::GraphicalReportHandler;
        let mut out = String::new();
        let _ = GraphicalReportHandler::new().render_report(&mut out, diag);
        eprintln!("{}", out);
    }

    pub fn emit_runtime(&self, err: &RuntimeError) {
        self.emit(&self.from_runtime(err));
    }

    pub fn emit_load(&self, err: &LoadError) {
        self.emit(&self.from_load(err));
    }

    pub fn emit_rustc(&self, code: ErrorCode, message: &str, byte_start: usize, byte_len: usize) {
        let hint = code.hint();
        let rendered = render_rustc_style(
            code, message,
            &self.source_name, &self.source_text,
            byte_start, byte_len, hint,
        );
        eprint!("{}", rendered);
    }

    pub fn format_diagnostic(&self, diag: &AxiomDiagnostic) -> String {
        use miette::GraphicalReportHandler;
        let mut out = String::new();
        let _ = GraphicalReportHandler::new().render_report(&mut out, diag);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levenshtein_exact() {
        assert_eq!(levenshtein("hello", "hello"), 0);
    }

    #[test]
    fn test_levenshtein_one_edit() {
        assert_eq!(levenshtein("mesage", "message"), 1);
        assert_eq!(levenshtein("pint", "print"), 1);
    }

    #[test]
    fn test_closest_match_suggestion() {
        let candidates = ["message", "value", "counter", "print"];
        let result = closest_match("mesage", &candidates, 2);
        assert_eq!(result, Some("message"));
    }

    #[test]
    fn test_closest_match_no_suggestion() {
        let candidates = ["message", "value"];
        let result = closest_match("xyz", &candidates, 2);
        assert_eq!(result, None);
    }

    #[test]
    fn test_byte_to_line_col() {
        let src = "let x = 1\nlet y = 2\nlet z = 3";
        let (line, col) = byte_to_line_col(src, 20);
        assert_eq!(line, 3);
        assert_eq!(col, 1);
    }

    #[test]
    fn test_error_code_prefix() {
        assert_eq!(ErrorCode::NilCall.prefix(), "[AXM_506]");
        assert_eq!(ErrorCode::BadMagic.prefix(), "[AXM_601]");
    }

    #[test]
    fn test_diagnostic_no_source() {
        let d = AxiomDiagnostic::no_source(ErrorCode::DivisionByZero, "Division by zero");
        assert!(d.message.contains("Division by zero"));
        assert!(d.code == ErrorCode::DivisionByZero);
    }

    #[test]
    fn test_undefined_global_suggestion() {
        let mut engine = DiagnosticEngine::new("demo.bu.bc", "");
        engine.register_globals(vec!["counter".into(), "print".into()]);
        let err = RuntimeError::UndefinedGlobal { name: "countr".into(), span: Span::new(0, 0, 0) };
        let diag = engine.from_runtime(&err);
        assert!(diag.message.contains("did you mean 'counter'"));
        assert_eq!(diag.code, ErrorCode::UndefinedGlobal);
    }

    #[test]
    fn test_rustc_render_no_panic() {
        let src = "let x = 10\nlet y = 0\nprint(x + y)\n";
        let rendered = render_rustc_style(
            ErrorCode::DivisionByZero,
            "division by zero",
            "test.bu.bc", src,
            18, 2,
            ErrorCode::DivisionByZero.hint(),
        );
        assert!(rendered.contains("AXM_505"));
        assert!(rendered.contains("test.bu.bc:2:"));
    }

    #[test]
    fn test_load_error_has_no_source_span() {
        let engine = DiagnosticEngine::new("demo.bu.bc", "");
        let diag = engine.from_load(&LoadError::BadMagic);
        assert_eq!(diag.code, ErrorCode::BadMagic);
    }
}
