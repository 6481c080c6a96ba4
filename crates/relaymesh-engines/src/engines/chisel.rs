//! chisel client/server over WebSocket

use super::endpoint_url;
use crate::catalog::EngineKind;
use crate::driver::{classify_phrases, EngineDriver, LaunchSpec};
use crate::error::EngineError;
use crate::options::{EngineMode, StartOptions};
use crate::runtime::LineSignal;
use std::path::Path;

/// Drives `chisel server` / `chisel client`
///
/// Transport `websocket` dials `http://`, `wss` dials `https://` and enables
/// TLS on the server when `cert_file`/`key_file` are supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChiselDriver;

const CONNECTED: &[&str] = &["connected (latency", "listening on"];
const AUTH_FAILED: &[&str] = &[
    "authentication failed",
    "ssh: handshake failed",
    "ssh: unable to authenticate",
];
const ERROR: &[&str] = &["cannot connect", "connection refused", "address already in use"];
const DISCONNECTED: &[&str] = &["connection error", "retrying in", "disconnected"];

impl ChiselDriver {
    fn auth(options: &StartOptions) -> Option<String> {
        options.token.as_ref().map(|token| {
            let user = options.extra_str("user").unwrap_or("relaymesh");
            format!("{}:{}", user, token)
        })
    }
}

impl EngineDriver for ChiselDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Chisel
    }

    fn render(
        &self,
        _tunnel_id: &str,
        options: &StartOptions,
        _config_dir: &Path,
    ) -> Result<LaunchSpec, EngineError> {
        let tls = match options.transport.as_str() {
            "websocket" => false,
            "wss" => true,
            other => {
                return Err(EngineError::invalid(
                    self.kind(),
                    format!("unsupported transport {:?}", other),
                ))
            }
        };
        let keepalive = options.extra_str("keepalive").unwrap_or("25s");

        let mut spec = LaunchSpec::new(options.program("chisel"));
        match options.mode {
            EngineMode::Server => {
                spec = spec
                    .arg("server")
                    .arg("--host")
                    .arg("0.0.0.0")
                    .arg("--port")
                    .arg(options.port.to_string())
                    .arg("--keepalive")
                    .arg(keepalive);
                if let Some(auth) = Self::auth(options) {
                    spec = spec.arg("--auth").arg(auth);
                }
                if options.extra_bool("reverse") {
                    spec = spec.arg("--reverse");
                }
                if tls {
                    if let (Some(cert), Some(key)) =
                        (options.extra_str("cert_file"), options.extra_str("key_file"))
                    {
                        spec = spec.arg("--tls-cert").arg(cert).arg("--tls-key").arg(key);
                    }
                }
            }
            EngineMode::Client => {
                if options.remote_host.trim().is_empty() {
                    return Err(EngineError::invalid(self.kind(), "remote_host is required"));
                }
                spec = spec.arg("client").arg("--keepalive").arg(keepalive);
                if let Some(auth) = Self::auth(options) {
                    spec = spec.arg("--auth").arg(auth);
                }
                let scheme = if tls { "https" } else { "http" };
                let server = endpoint_url(self.kind(), scheme, &options.remote_host, options.port)?;
                spec = spec
                    .arg(server.to_string())
                    .arg(format!("{}:{}", options.local_port, options.target));
            }
        }

        Ok(spec)
    }

    fn classify(&self, line: &str) -> Option<LineSignal> {
        classify_phrases(line, CONNECTED, AUTH_FAILED, ERROR, DISCONNECTED)
    }

    fn install_script(&self) -> String {
        "curl -fsSL https://i.jpillora.com/chisel! | bash".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_args() {
        let mut opts = StartOptions::new(EngineMode::Server, 25000, "websocket");
        opts.token = Some("pw".to_string());
        let spec = ChiselDriver.render("t", &opts, Path::new("/tmp")).unwrap();
        assert_eq!(
            spec.command_line(),
            "chisel server --host 0.0.0.0 --port 25000 --keepalive 25s --auth relaymesh:pw"
        );
    }

    #[test]
    fn test_client_args() {
        let mut opts = StartOptions::new(EngineMode::Client, 25000, "wss");
        opts.remote_host = "far.example.net".to_string();
        opts.local_port = 3306;
        opts.target = "10.0.0.5:3306".to_string();
        let spec = ChiselDriver.render("t", &opts, Path::new("/tmp")).unwrap();
        assert_eq!(
            spec.command_line(),
            "chisel client --keepalive 25s https://far.example.net:25000/ 3306:10.0.0.5:3306"
        );
    }

    #[test]
    fn test_client_server_url_is_validated() {
        let mut opts = StartOptions::new(EngineMode::Client, 25000, "websocket");
        opts.remote_host = "fd00::5".to_string();
        opts.target = "10.0.0.5:3306".to_string();
        opts.local_port = 3306;
        let spec = ChiselDriver.render("t", &opts, Path::new("/tmp")).unwrap();
        assert_eq!(spec.args[3], "http://[fd00::5]:25000/");

        opts.remote_host = "user@far.example.net".to_string();
        assert!(matches!(
            ChiselDriver.render("t", &opts, Path::new("/tmp")),
            Err(EngineError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            ChiselDriver.classify("2025/03/01 10:00:00 client: Connected (Latency 12.3ms)"),
            Some(LineSignal::Connected)
        );
        assert!(matches!(
            ChiselDriver.classify("client: Connection error: websocket: bad handshake"),
            Some(LineSignal::Disconnected(_))
        ));
        assert!(matches!(
            ChiselDriver.classify("client: Authentication failed"),
            Some(LineSignal::AuthFailed(_))
        ));
    }
}
