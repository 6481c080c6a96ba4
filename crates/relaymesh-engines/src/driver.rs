//! Per-engine translation from [`StartOptions`] to a concrete launch

use crate::catalog::EngineKind;
use crate::deploy::{shell_quote, systemd_quote};
use crate::error::EngineError;
use crate::options::StartOptions;
use crate::runtime::LineSignal;
use std::path::{Path, PathBuf};

/// A configuration artifact the engine reads at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Fully rendered process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub files: Vec<ConfigFile>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn file(mut self, path: PathBuf, contents: String) -> Self {
        self.files.push(ConfigFile { path, contents });
        self
    }

    /// Shell-quoted command line
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Command line in systemd `ExecStart=` syntax
    ///
    /// A program starting with one of systemd's executable prefixes is always
    /// quoted so it is not read as `-`, `@`, `:`, `+` or `!` flags.
    pub fn exec_start(&self) -> String {
        let program = systemd_quote(&self.program);
        let program = if program.starts_with(['-', '@', ':', '+', '!']) {
            format!("\"{}\"", program)
        } else {
            program
        };
        std::iter::once(program)
            .chain(self.args.iter().map(String::as_str).map(systemd_quote))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Engine-specific behaviour plugged into the generic [`crate::Adapter`]
///
/// Implementations are pure: `render` never touches the filesystem, so the same
/// rendering serves both the live start path and deployment export.
pub trait EngineDriver: Send + Sync + 'static {
    fn kind(&self) -> EngineKind;

    /// Render argv and config files; config files live under `config_dir`
    fn render(
        &self,
        tunnel_id: &str,
        options: &StartOptions,
        config_dir: &Path,
    ) -> Result<LaunchSpec, EngineError>;

    /// Recognize known success/failure phrases in one output line
    fn classify(&self, line: &str) -> Option<LineSignal>;

    /// POSIX shell snippet installing the engine binary
    fn install_script(&self) -> String;
}

/// Match `line` against ordered phrase tables (case-insensitive)
pub(crate) fn classify_phrases(
    line: &str,
    connected: &[&str],
    auth_failed: &[&str],
    error: &[&str],
    disconnected: &[&str],
) -> Option<LineSignal> {
    let lower = line.to_ascii_lowercase();
    let hit = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

    if hit(auth_failed) {
        Some(LineSignal::AuthFailed(line.trim().to_string()))
    } else if hit(error) {
        Some(LineSignal::Error(line.trim().to_string()))
    } else if hit(disconnected) {
        Some(LineSignal::Disconnected(line.trim().to_string()))
    } else if hit(connected) {
        Some(LineSignal::Connected)
    } else {
        None
    }
}
