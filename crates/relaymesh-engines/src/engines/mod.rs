//! The five engine drivers and their adapter aliases

mod chisel;
mod frp;
mod gost;
mod ssh;
mod trusttunnel;

pub use chisel::ChiselDriver;
pub use frp::FrpDriver;
pub use gost::GostDriver;
pub use ssh::SshDriver;
pub use trusttunnel::TrustTunnelDriver;

use crate::adapter::Adapter;
use crate::catalog::EngineKind;
use crate::error::EngineError;
use serde::Serialize;
use url::Url;

pub type SshAdapter = Adapter<SshDriver>;
pub type FrpAdapter = Adapter<FrpDriver>;
pub type GostAdapter = Adapter<GostDriver>;
pub type ChiselAdapter = Adapter<ChiselDriver>;
pub type TrustTunnelAdapter = Adapter<TrustTunnelDriver>;

/// Serialize an engine config document as TOML
fn render_toml<T: Serialize>(kind: EngineKind, document: &T) -> Result<String, EngineError> {
    toml::to_string_pretty(document)
        .map_err(|e| EngineError::invalid(kind, format!("config is not representable as TOML: {}", e)))
}

/// Build `scheme://host:port`, bracketing bare IPv6 literals
fn endpoint_url(kind: EngineKind, scheme: &str, host: &str, port: u16) -> Result<Url, EngineError> {
    let host = host.trim();
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let mut url = Url::parse(&format!("{}://localhost", scheme))
        .map_err(|e| EngineError::invalid(kind, format!("invalid scheme {:?}: {}", scheme, e)))?;
    url.set_host(Some(&host))
        .map_err(|e| EngineError::invalid(kind, format!("invalid host {:?}: {}", host, e)))?;
    url.set_port(Some(port))
        .map_err(|()| EngineError::invalid(kind, format!("cannot set port on {}", url)))?;
    Ok(url)
}

/// Attach `user:secret@` credentials
///
/// The url crate leaves `%` untouched in userinfo, so it is escaped first to
/// keep literal percent signs from being decoded on the far side.
fn set_credentials(kind: EngineKind, url: &mut Url, user: &str, secret: &str) -> Result<(), EngineError> {
    url.set_username(&user.replace('%', "%25"))
        .and_then(|()| url.set_password(Some(&secret.replace('%', "%25"))))
        .map_err(|()| EngineError::invalid(kind, "endpoint cannot carry credentials"))
}
