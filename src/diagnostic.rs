use std::fmt;
use std::io;

use crate::span::Span;

/// A lowering diagnostic (error or warning).
///
/// Every failure in this crate is reported synchronously as a `Diagnostic`.
/// None of them is retryable: the caller either gets a fully lowered pair
/// or an untouched module plus one of these.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    /// Text the span points into, e.g. a printed function or a config file.
    pub snippet: Option<Snippet>,
    pub span: Span,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Error taxonomy of the lowering engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Pipeline configuration is unsupported or a region overflows LDS.
    Configuration,
    /// A value required to be workgroup-uniform is not.
    Divergence,
    /// Input IR is inconsistent with the declared pipeline (e.g. payload size).
    MalformedInput,
    /// Entry point is missing, of the wrong stage, or already lowered.
    InvalidState,
    /// Lowered IR failed verification.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Divergence => "divergence",
            ErrorKind::MalformedInput => "malformed-input",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct Snippet {
    pub name: String,
    pub text: String,
}

impl Diagnostic {
    pub fn error(kind: ErrorKind, message: String) -> Self {
        Self {
            severity: Severity::Error,
            kind,
            message,
            snippet: None,
            span: Span::dummy(),
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(kind: ErrorKind, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(kind, message)
        }
    }

    pub fn configuration(message: String) -> Self {
        Self::error(ErrorKind::Configuration, message)
    }

    pub fn divergence(message: String) -> Self {
        Self::error(ErrorKind::Divergence, message)
    }

    pub fn malformed(message: String) -> Self {
        Self::error(ErrorKind::MalformedInput, message)
    }

    pub fn invalid_state(message: String) -> Self {
        Self::error(ErrorKind::InvalidState, message)
    }

    pub fn internal(message: String) -> Self {
        Self::error(ErrorKind::Internal, message)
    }

    pub fn with_snippet(mut self, name: impl Into<String>, text: String, span: Span) -> Self {
        self.snippet = Some(Snippet {
            name: name.into(),
            text,
        });
        self.span = span;
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Write the diagnostic using ariadne. Without a snippet a plain
    /// one-line header (plus notes) is written instead.
    pub fn write_report<W: io::Write>(&self, mut w: W) -> io::Result<()> {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let Some(snippet) = &self.snippet else {
            writeln!(w, "{}", self)?;
            for note in &self.notes {
                writeln!(w, "  = note: {}", note)?;
            }
            if let Some(help) = &self.help {
                writeln!(w, "  = help: {}", help)?;
            }
            return Ok(());
        };

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };
        let color = match self.severity {
            Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
        };

        let name = snippet.name.as_str();
        let mut report = Report::build(kind, name, self.span.start as usize)
            .with_code(self.kind)
            .with_message(&self.message)
            .with_label(
                Label::new((name, self.span.range()))
                    .with_message(&self.message)
                    .with_color(color),
            );

        for note in &self.notes {
            report = report.with_note(note);
        }
        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report
            .finish()
            .write((name, Source::from(snippet.text.as_str())), w)
    }

    /// Render the diagnostic to stderr.
    pub fn render(&self) {
        let _ = self.write_report(io::stderr());
    }

    pub fn render_to_string(&self) -> String {
        let mut buf = Vec::new();
        let _ = self.write_report(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{}[{}]: {}", level, self.kind, self.message)
    }
}

impl std::error::Error for Diagnostic {}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic]) {
    for diag in diagnostics {
        diag.render();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let d = Diagnostic::configuration("LDS overflow".to_string());
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.kind, ErrorKind::Configuration);
        assert_eq!(d.message, "LDS overflow");
        assert!(d.span.is_dummy());
        assert!(d.notes.is_empty());
        assert!(d.help.is_none());
        assert!(d.is_error());
    }

    #[test]
    fn test_warning_construction() {
        let d = Diagnostic::warning(ErrorKind::MalformedInput, "unused payload".to_string());
        assert_eq!(d.severity, Severity::Warning);
        assert_eq!(d.kind, ErrorKind::MalformedInput);
        assert!(!d.is_error());
    }

    #[test]
    fn test_chained_builders() {
        let d = Diagnostic::divergence("launch count is divergent".to_string())
            .with_note("note 1".to_string())
            .with_help("compute counts from uniform values".to_string())
            .with_note("note 2".to_string());
        assert_eq!(d.notes.len(), 2);
        assert!(d.help.is_some());
    }

    #[test]
    fn test_display_header() {
        let d = Diagnostic::malformed("payload offset 20000 out of range".to_string());
        insta::assert_snapshot!(d.to_string(), @"error[malformed-input]: payload offset 20000 out of range");
    }

    #[test]
    fn test_plain_report_without_snippet() {
        let d = Diagnostic::invalid_state("already lowered".to_string())
            .with_note("function `main`".to_string());
        let text = d.render_to_string();
        assert!(text.starts_with("error[invalid-state]: already lowered"));
        assert!(text.contains("= note: function `main`"));
    }

    #[test]
    fn test_render_with_snippet_does_not_panic() {
        let source = "bb0:\n  %0 = hw.thread_id_in_wave i32\n  ret\n";
        let d = Diagnostic::divergence("divergent".to_string()).with_snippet(
            "main",
            source.to_string(),
            Span::new(5, 33),
        );
        let text = d.render_to_string();
        assert!(text.contains("divergent"));
    }
}
