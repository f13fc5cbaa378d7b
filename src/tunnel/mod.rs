//! Public reachability for the local listener.
//!
//! A [`Tunnel`] turns the local port into a URL a remote browser can open.
//! Provider-backed tunnels (ngrok, cloudflared) live outside this crate; the
//! built-in [`DirectTunnel`] just reports the local address, for deployments
//! where TLS and routing are handled by something in front of the process.

use async_trait::async_trait;
use thiserror::Error;

/// The tunnel could not be brought up.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("tunnel unavailable: {0}")]
pub struct TunnelUnavailable(pub String);

#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Human-readable provider name for logs.
    fn name(&self) -> &'static str;

    /// Expose `local_port` and return the public base URL.
    async fn start(&self, local_port: u16) -> Result<String, TunnelUnavailable>;
}

/// No tunnel: the access URL is the local address.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTunnel;

#[async_trait]
impl Tunnel for DirectTunnel {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn start(&self, local_port: u16) -> Result<String, TunnelUnavailable> {
        if local_port == 0 {
            return Err(TunnelUnavailable("listener has no port".into()));
        }
        Ok(format!("http://localhost:{local_port}"))
    }
}

/// URL a visitor opens: the public base with the token as a query parameter.
pub fn access_url(base: &str, token: &str) -> String {
    format!("{}/?token={token}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_tunnel_reports_localhost() {
        assert_eq!(
            DirectTunnel.start(3000).await.unwrap(),
            "http://localhost:3000"
        );
        assert!(DirectTunnel.start(0).await.is_err());
    }

    #[test]
    fn test_access_url() {
        assert_eq!(
            access_url("https://abc.example/", "tok"),
            "https://abc.example/?token=tok"
        );
        assert_eq!(
            access_url("http://localhost:3000", "tok"),
            "http://localhost:3000/?token=tok"
        );
    }
}
