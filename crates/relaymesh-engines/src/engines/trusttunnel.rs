//! TrustTunnel HTTP/3 camouflage transport
//!
//! In server mode the endpoint also serves an inert decoy site on the same
//! listener: any request that does not carry valid tunnel credentials falls
//! through to a static directory, so passive inspection sees ordinary web
//! hosting. Plain HTTP on port 80 redirects to the HTTPS listener.

use super::render_toml;
use crate::catalog::EngineKind;
use crate::driver::{classify_phrases, EngineDriver, LaunchSpec};
use crate::error::EngineError;
use crate::options::{EngineMode, StartOptions};
use crate::runtime::LineSignal;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default)]
pub struct TrustTunnelDriver;

const CONNECTED: &[&str] = &[
    "endpoint started",
    "listening on",
    "tunnel established",
    "connected to endpoint",
];
const AUTH_FAILED: &[&str] = &["authentication failed", "invalid credentials"];
const ERROR: &[&str] = &[
    "tls handshake failed",
    "certificate verify failed",
    "address already in use",
    "failed to bind",
];
const DISCONNECTED: &[&str] = &["connection lost", "endpoint unreachable", "reconnecting"];

#[derive(Debug, Serialize)]
struct EndpointConfig<'a> {
    listen_address: String,
    protocols: &'static [&'static str],
    tls: EndpointTls<'a>,
    credentials: Vec<Credential<'a>>,
    fallback: Fallback,
}

#[derive(Debug, Serialize)]
struct EndpointTls<'a> {
    cert_file: String,
    key_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Credential<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct Fallback {
    kind: &'static str,
    root: String,
    server_header: &'static str,
    http: PlainHttp,
}

#[derive(Debug, Serialize)]
struct PlainHttp {
    listen_address: &'static str,
    redirect_https: bool,
}

#[derive(Debug, Serialize)]
struct ClientConfig<'a> {
    endpoint: String,
    protocol: &'static str,
    server_name: &'a str,
    username: &'a str,
    password: &'a str,
    socks: Socks,
}

#[derive(Debug, Serialize)]
struct Socks {
    listen_address: String,
}

impl TrustTunnelDriver {
    fn protocols(transport: &str) -> &'static [&'static str] {
        match transport {
            "h2" => &["http2"],
            _ => &["http3", "http2"],
        }
    }

    fn server_config(options: &StartOptions, config_dir: &Path, token: &str) -> Result<String, EngineError> {
        let cert_file = options
            .extra_str("cert_file")
            .map(str::to_string)
            .unwrap_or_else(|| config_dir.join("tls/cert.pem").display().to_string());
        let key_file = options
            .extra_str("key_file")
            .map(str::to_string)
            .unwrap_or_else(|| config_dir.join("tls/key.pem").display().to_string());

        let config = EndpointConfig {
            listen_address: format!("0.0.0.0:{}", options.port),
            protocols: Self::protocols(&options.transport),
            tls: EndpointTls {
                cert_file,
                key_file,
                hostname: options.extra_str("sni"),
            },
            credentials: vec![Credential {
                username: options.extra_str("user").unwrap_or("relaymesh"),
                password: token,
            }],
            fallback: Fallback {
                kind: "static",
                root: config_dir.join("decoy").display().to_string(),
                server_header: "nginx",
                http: PlainHttp {
                    listen_address: "0.0.0.0:80",
                    redirect_https: true,
                },
            },
        };
        render_toml(EngineKind::TrustTunnel, &config)
    }

    fn client_config(options: &StartOptions, token: &str) -> Result<String, EngineError> {
        let config = ClientConfig {
            endpoint: format!("{}:{}", options.remote_host, options.port),
            protocol: if options.transport == "h2" { "http2" } else { "http3" },
            server_name: options.extra_str("sni").unwrap_or(&options.remote_host),
            username: options.extra_str("user").unwrap_or("relaymesh"),
            password: token,
            socks: Socks {
                listen_address: format!("127.0.0.1:{}", options.local_port),
            },
        };
        render_toml(EngineKind::TrustTunnel, &config)
    }

    fn decoy_index(title: &str) -> String {
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
</head>
<body>
<h1>{title}</h1>
<p>This site is under construction. Please check back soon.</p>
</body>
</html>
"#,
            title = title
        )
    }
}

impl EngineDriver for TrustTunnelDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::TrustTunnel
    }

    fn render(
        &self,
        _tunnel_id: &str,
        options: &StartOptions,
        config_dir: &Path,
    ) -> Result<LaunchSpec, EngineError> {
        let token = options
            .token
            .as_deref()
            .ok_or_else(|| EngineError::invalid(self.kind(), "token is required for credentials"))?;

        match options.mode {
            EngineMode::Server => {
                let config_path = config_dir.join("endpoint.toml");
                let decoy = config_dir.join("decoy");
                let title = options.extra_str("decoy_title").unwrap_or("Welcome");

                Ok(LaunchSpec::new(options.program("trusttunnel_endpoint"))
                    .arg("--config")
                    .arg(config_path.display().to_string())
                    .file(config_path, Self::server_config(options, config_dir, token)?)
                    .file(decoy.join("index.html"), Self::decoy_index(title))
                    .file(
                        decoy.join("robots.txt"),
                        "User-agent: *\nDisallow:\n".to_string(),
                    ))
            }
            EngineMode::Client => {
                if options.remote_host.trim().is_empty() {
                    return Err(EngineError::invalid(self.kind(), "remote_host is required"));
                }
                let config_path = config_dir.join("client.toml");
                Ok(LaunchSpec::new(options.program("trusttunnel_client"))
                    .arg("--config")
                    .arg(config_path.display().to_string())
                    .file(config_path, Self::client_config(options, token)?))
            }
        }
    }

    fn classify(&self, line: &str) -> Option<LineSignal> {
        classify_phrases(line, CONNECTED, AUTH_FAILED, ERROR, DISCONNECTED)
    }

    fn install_script(&self) -> String {
        r#"curl -fsSL -o /tmp/trusttunnel.tar.gz "https://github.com/TrustTunnel/TrustTunnel/releases/latest/download/trusttunnel-linux-${ARCH}.tar.gz"
tar -xzf /tmp/trusttunnel.tar.gz -C /usr/local/bin trusttunnel_endpoint trusttunnel_client
rm -f /tmp/trusttunnel.tar.gz"#
            .to_string()
    }
}
