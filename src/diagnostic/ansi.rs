use super::{line_col, line_text, Diagnostic, Severity};

pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    fn dim(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[2m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        let severity_label = match d.severity {
            Severity::Error => self.bold_red("error"),
            Severity::Warning => self.bold(&self.cyan("warning")),
        };
        match d.code {
            Some(code) => out.push_str(&format!(
                "{}[{}]: {}\n",
                severity_label,
                code,
                self.bold(&d.message)
            )),
            None => out.push_str(&format!("{}: {}\n", severity_label, self.bold(&d.message))),
        }

        // First label gets the source snippet when source text is present.
        if let (Some(label), Some(source)) = (d.labels.first(), &d.source) {
            let (line, col) = line_col(source, label.span.start);
            let text = line_text(source, line);

            out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), line, col));

            let gutter = line.to_string().len();
            let pipe = self.cyan("|");
            let pad = " ".repeat(gutter);

            out.push_str(&format!("{pad} {pipe}\n"));
            let line_num = self.cyan(&format!("{line:>gutter$}"));
            out.push_str(&format!("{line_num} {pipe} {text}\n"));

            let caret_len = (label.span.end.saturating_sub(label.span.start)).max(1);
            let carets = self.bold_red(&"^".repeat(caret_len));
            let indent = " ".repeat(col.saturating_sub(1));
            if label.message.is_empty() {
                out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
            } else {
                out.push_str(&format!(
                    "{pad} {pipe} {indent}{carets} {}\n",
                    self.bold_red(&label.message)
                ));
            }
            out.push_str(&format!("{pad} {pipe}\n"));
        }

        for note in &d.notes {
            out.push_str(&format!("  {} note: {}\n", self.dim("="), note));
        }

        if let Some(suggestion) = &d.suggestion {
            out.push_str(&format!("  {} suggestion: {}\n", self.dim("="), suggestion));
        }

        out
    }
}
