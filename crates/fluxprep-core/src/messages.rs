use std::fmt;

use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "ERROR",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity-bucketed messages. Checks append; nothing is ever short-circuited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessageLog {
    errors: Vec<String>,
    warnings: Vec<String>,
    info: Vec<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, message: impl Into<String>) {
        let bucket = match severity {
            Severity::Error => &mut self.errors,
            Severity::Warning => &mut self.warnings,
            Severity::Info => &mut self.info,
        };
        bucket.push(message.into());
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(Severity::Error, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.push(Severity::Warning, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(Severity::Info, message);
    }

    pub fn messages(&self, severity: Severity) -> &[String] {
        match severity {
            Severity::Error => &self.errors,
            Severity::Warning => &self.warnings,
            Severity::Info => &self.info,
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn infos(&self) -> &[String] {
        &self.info
    }

    /// True when no ERROR has been recorded.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len() + self.warnings.len() + self.info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend(&mut self, other: MessageLog) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.info.extend(other.info);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Severity, &str)> + '_ {
        let errors = self.errors.iter().map(|m| (Severity::Error, m.as_str()));
        let warnings = self.warnings.iter().map(|m| (Severity::Warning, m.as_str()));
        let info = self.info.iter().map(|m| (Severity::Info, m.as_str()));
        errors.chain(warnings).chain(info)
    }

    /// Emits every message as a tracing event at its matching level.
    pub fn emit(&self, context: &str) {
        for (severity, message) in self.iter() {
            match severity {
                Severity::Error => error!(context, "{message}"),
                Severity::Warning => warn!(context, "{message}"),
                Severity::Info => info!(context, "{message}"),
            }
        }
    }
}
