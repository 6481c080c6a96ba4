//! frp (frpc/frps) with a rendered TOML config

use super::render_toml;
use crate::catalog::EngineKind;
use crate::driver::{classify_phrases, EngineDriver, LaunchSpec};
use crate::error::EngineError;
use crate::options::{EngineMode, StartOptions};
use crate::runtime::LineSignal;
use serde::Serialize;
use std::path::Path;

/// Default frps control port when the option bag does not set `server_port`
pub const DEFAULT_SERVER_PORT: u16 = 7000;

/// Drives `frpc` (client) or `frps` (server)
///
/// The frps side accepts the tunnel's `port` as a remote port; the frpc side
/// registers one TCP proxy named after the tunnel that maps `port` back to
/// `target`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrpDriver;

const CONNECTED: &[&str] = &[
    "start proxy success",
    "login to server success",
    "frps started successfully",
    "start frps success",
];
const AUTH_FAILED: &[&str] = &[
    "authorization failed",
    "token in login doesn't match",
    "authentication failed",
];
const ERROR: &[&str] = &[
    "connect to server error",
    "login to the server failed",
    "port already used",
    "port not allowed",
    "address already in use",
];
const DISCONNECTED: &[&str] = &[
    "work connection closed",
    "try to reconnect",
    "control writer is closing",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientConfig<'a> {
    server_addr: &'a str,
    server_port: u16,
    login_fail_exit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<TokenAuth<'a>>,
    transport: ClientTransport,
    proxies: Vec<Proxy<'a>>,
}

#[derive(Debug, Serialize)]
struct TokenAuth<'a> {
    method: &'static str,
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct ClientTransport {
    protocol: &'static str,
    tls: TlsEnable,
}

#[derive(Debug, Serialize)]
struct TlsEnable {
    enable: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Proxy<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    proxy_type: &'static str,
    #[serde(rename = "localIP")]
    local_ip: &'a str,
    local_port: u16,
    remote_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerConfig<'a> {
    bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    kcp_bind_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quic_bind_port: Option<u16>,
    allow_ports: Vec<AllowPort>,
    transport: ServerTransport,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<TokenAuth<'a>>,
}

#[derive(Debug, Serialize)]
struct AllowPort {
    single: u16,
}

#[derive(Debug, Serialize)]
struct ServerTransport {
    tls: TlsForce,
}

#[derive(Debug, Serialize)]
struct TlsForce {
    force: bool,
}

fn token_auth(token: Option<&str>) -> Option<TokenAuth<'_>> {
    token.map(|token| TokenAuth {
        method: "token",
        token,
    })
}

impl FrpDriver {
    fn protocol(transport: &str) -> &'static str {
        match transport {
            "kcp" => "kcp",
            "quic" => "quic",
            "websocket" => "websocket",
            "wss" => "wss",
            _ => "tcp",
        }
    }

    fn client_config(tunnel_id: &str, options: &StartOptions, server_port: u16) -> Result<String, EngineError> {
        let (target_host, target_port) = options.target_parts().ok_or_else(|| {
            EngineError::invalid(EngineKind::Frp, format!("target must be host:port, got {:?}", options.target))
        })?;

        let config = ClientConfig {
            server_addr: &options.remote_host,
            server_port,
            login_fail_exit: false,
            auth: token_auth(options.token.as_deref()),
            transport: ClientTransport {
                protocol: Self::protocol(&options.transport),
                tls: TlsEnable { enable: true },
            },
            proxies: vec![Proxy {
                name: tunnel_id,
                proxy_type: "tcp",
                local_ip: target_host,
                local_port: target_port,
                remote_port: options.port,
            }],
        };
        render_toml(EngineKind::Frp, &config)
    }

    fn server_config(options: &StartOptions, server_port: u16) -> Result<String, EngineError> {
        let protocol = Self::protocol(&options.transport);
        let config = ServerConfig {
            bind_port: server_port,
            kcp_bind_port: (protocol == "kcp").then_some(server_port),
            quic_bind_port: (protocol == "quic").then_some(server_port),
            allow_ports: vec![AllowPort {
                single: options.port,
            }],
            transport: ServerTransport {
                tls: TlsForce { force: true },
            },
            auth: token_auth(options.token.as_deref()),
        };
        render_toml(EngineKind::Frp, &config)
    }
}

impl EngineDriver for FrpDriver {
    fn kind(&self) -> EngineKind {
        EngineKind::Frp
    }

    fn render(
        &self,
        tunnel_id: &str,
        options: &StartOptions,
        config_dir: &Path,
    ) -> Result<LaunchSpec, EngineError> {
        let server_port = options.extra_u16("server_port").unwrap_or(DEFAULT_SERVER_PORT);
        if server_port == options.port {
            return Err(EngineError::invalid(
                self.kind(),
                format!("server_port {} collides with the tunnel port", server_port),
            ));
        }

        let (program, file_name, contents) = match options.mode {
            EngineMode::Client => {
                if options.remote_host.trim().is_empty() {
                    return Err(EngineError::invalid(self.kind(), "remote_host is required"));
                }
                (
                    options.program("frpc"),
                    "frpc.toml",
                    Self::client_config(tunnel_id, options, server_port)?,
                )
            }
            EngineMode::Server => (
                options.program("frps"),
                "frps.toml",
                Self::server_config(options, server_port)?,
            ),
        };

        let path = config_dir.join(file_name);
        Ok(LaunchSpec::new(program)
            .arg("-c")
            .arg(path.display().to_string())
            .file(path, contents))
    }

    fn classify(&self, line: &str) -> Option<LineSignal> {
        classify_phrases(line, CONNECTED, AUTH_FAILED, ERROR, DISCONNECTED)
    }

    fn install_script(&self) -> String {
        r#"FRP_VERSION=0.61.0
curl -fsSL -o /tmp/frp.tar.gz "https://github.com/fatedier/frp/releases/download/v${FRP_VERSION}/frp_${FRP_VERSION}_linux_${ARCH}.tar.gz"
tar -xzf /tmp/frp.tar.gz -C /tmp
install -m 0755 "/tmp/frp_${FRP_VERSION}_linux_${ARCH}/frpc" "/tmp/frp_${FRP_VERSION}_linux_${ARCH}/frps" /usr/local/bin/
rm -rf /tmp/frp.tar.gz "/tmp/frp_${FRP_VERSION}_linux_${ARCH}""#
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> toml::Table {
        contents.parse::<toml::Table>().unwrap()
    }

    #[test]
    fn test_client_config() {
        let mut opts = StartOptions::new(EngineMode::Client, 31000, "kcp");
        opts.remote_host = "far.example.net".to_string();
        opts.target = "127.0.0.1:22".to_string();
        opts.token = Some("s3cret".to_string());

        let spec = FrpDriver.render("tunnel-7", &opts, Path::new("/run/rm")).unwrap();
        assert_eq!(spec.program, "frpc");
        assert_eq!(spec.args, vec!["-c", "/run/rm/frpc.toml"]);

        let config = parse(&spec.files[0].contents);
        assert_eq!(config["serverAddr"].as_str(), Some("far.example.net"));
        assert_eq!(config["serverPort"].as_integer(), Some(7000));
        assert_eq!(config["loginFailExit"].as_bool(), Some(false));
        assert_eq!(config["auth"]["method"].as_str(), Some("token"));
        assert_eq!(config["auth"]["token"].as_str(), Some("s3cret"));
        assert_eq!(config["transport"]["protocol"].as_str(), Some("kcp"));
        assert_eq!(config["transport"]["tls"]["enable"].as_bool(), Some(true));

        let proxy = &config["proxies"][0];
        assert_eq!(proxy["name"].as_str(), Some("tunnel-7"));
        assert_eq!(proxy["type"].as_str(), Some("tcp"));
        assert_eq!(proxy["localIP"].as_str(), Some("127.0.0.1"));
        assert_eq!(proxy["localPort"].as_integer(), Some(22));
        assert_eq!(proxy["remotePort"].as_integer(), Some(31000));
    }

    #[test]
    fn test_client_config_without_token_has_no_auth() {
        let mut opts = StartOptions::new(EngineMode::Client, 31000, "tcp");
        opts.remote_host = "far.example.net".to_string();
        opts.target = "127.0.0.1:22".to_string();

        let spec = FrpDriver.render("t", &opts, Path::new("/run/rm")).unwrap();
        let config = parse(&spec.files[0].contents);
        assert!(config.get("auth").is_none());
        assert_eq!(config["transport"]["protocol"].as_str(), Some("tcp"));
    }

    #[test]
    fn test_special_characters_survive_rendering() {
        let token = "a\"b\\c\nd\u{7f}e'f";
        let mut opts = StartOptions::new(EngineMode::Client, 31000, "tcp");
        opts.remote_host = "far.example.net".to_string();
        opts.target = "127.0.0.1:22".to_string();
        opts.token = Some(token.to_string());

        let spec = FrpDriver.render("tunnel \"x\"", &opts, Path::new("/run/rm")).unwrap();
        let config = parse(&spec.files[0].contents);
        assert_eq!(config["auth"]["token"].as_str(), Some(token));
        assert_eq!(config["proxies"][0]["name"].as_str(), Some("tunnel \"x\""));

        let mut opts = StartOptions::new(EngineMode::Server, 31000, "tcp");
        opts.token = Some(token.to_string());
        let spec = FrpDriver.render("t", &opts, Path::new("/run/rm")).unwrap();
        let config = parse(&spec.files[0].contents);
        assert_eq!(config["auth"]["token"].as_str(), Some(token));
    }

    #[test]
    fn test_server_config() {
        let opts = StartOptions::new(EngineMode::Server, 31000, "quic");
        let spec = FrpDriver.render("tunnel-7", &opts, Path::new("/run/rm")).unwrap();
        assert_eq!(spec.program, "frps");

        let config = parse(&spec.files[0].contents);
        assert_eq!(config["bindPort"].as_integer(), Some(7000));
        assert_eq!(config["quicBindPort"].as_integer(), Some(7000));
        assert!(config.get("kcpBindPort").is_none());
        assert_eq!(config["allowPorts"][0]["single"].as_integer(), Some(31000));
        assert_eq!(config["transport"]["tls"]["force"].as_bool(), Some(true));
        assert!(config.get("auth").is_none());
    }

    #[test]
    fn test_server_port_collision_rejected() {
        let opts = StartOptions::new(EngineMode::Server, 7000, "tcp");
        assert!(matches!(
            FrpDriver.render("t", &opts, Path::new("/tmp")),
            Err(EngineError::InvalidOptions { .. })
        ));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            FrpDriver.classify("2025/03/01 10:00:00 [I] [proxy_manager.go:144] [tunnel-7] start proxy success"),
            Some(LineSignal::Connected)
        );
        assert!(matches!(
            FrpDriver.classify("[W] login to server failed: token in login doesn't match token from configuration"),
            Some(LineSignal::AuthFailed(_))
        ));
        assert!(matches!(
            FrpDriver.classify("[W] [service.go:160] try to reconnect to server..."),
            Some(LineSignal::Disconnected(_))
        ));
    }
}
