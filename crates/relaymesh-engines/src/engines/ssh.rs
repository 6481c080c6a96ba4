//! OpenSSH port forwarding

use crate::catalog::EngineKind;
use crate::driver::{classify_phrases, EngineDriver, LaunchSpec};
use crate::error::EngineError;
use crate::options::{EngineMode, StartOptions};
use crate::runtime::LineSignal;
use std::path::Path;

/// Drives `ssh -N` with a local (`-L`) or remote (`-R`) forward
///
/// Client mode on transport `tcp` opens `port` on the near node and forwards it
/// to `target` as seen from the far node. Server mode, or transport `reverse`,
/// asks the far node to listen on `port` and forward back to `target` locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshDriver;

const CONNECTED: &[&str] = &[
    "authenticated to",
    "entering interactive session",
    "remote forward success",
];
const AUTH_FAILED: &[&str] = &["permission denied", "too many authentication failures"];
const ERROR: &[&str] = &[
    "remote port forwarding failed",
    "could not request local forwarding",
    "address already in use",
    "connection refused",
    "could not resolve hostname",
    "connection timed out",
    "no route to host",
    "host key verification failed",
];
const DISCONNECTED: &[&str] = &[
    "connection closed by",
    "broken pipe",
    "connection reset",
    "timeout, server",
];

impl EngineDriver for SshDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Ssh
    }

    fn render(
        &self,
        _tunnel_id: &str,
        options: &StartOptions,
        _config_dir: &Path,
    ) -> Result<LaunchSpec, EngineError> {
        if options.remote_host.trim().is_empty() {
            return Err(EngineError::invalid(self.kind(), "remote_host is required"));
        }
        if options.target_parts().is_none() {
            return Err(EngineError::invalid(
                self.kind(),
                format!("target must be host:port, got {:?}", options.target),
            ));
        }

        let reverse = options.mode == EngineMode::Server || options.transport == "reverse";
        let forward = format!("0.0.0.0:{}:{}", options.port, options.target);

        let mut spec = LaunchSpec::new(options.program("ssh")).args([
            "-N",
            "-v",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "ServerAliveCountMax=3",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            "BatchMode=yes",
        ]);

        spec = spec.arg("-p").arg(options.remote_ssh_port.to_string());

        if let Some(identity) = options.extra_str("identity_file") {
            spec = spec.arg("-i").arg(identity);
        }

        let destination = match options.remote_user.as_deref() {
            Some(user) => format!("{}@{}", user, options.remote_host),
            None => options.remote_host.clone(),
        };

        Ok(spec
            .arg(if reverse { "-R" } else { "-L" })
            .arg(forward)
            .arg(destination))
    }

    fn classify(&self, line: &str) -> Option<LineSignal> {
        classify_phrases(line, CONNECTED, AUTH_FAILED, ERROR, DISCONNECTED)
    }

    fn install_script(&self) -> String {
        r#"if command -v apt-get >/dev/null 2>&1; then
  apt-get update -y && apt-get install -y openssh-client
elif command -v dnf >/dev/null 2>&1; then
  dnf install -y openssh-clients
else
  echo "install openssh-client manually" >&2
  exit 1
fi"#
        .to_string()
    }
}
