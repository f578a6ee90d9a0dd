use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::http::request::Request;

/// Everything the pipeline knows about the request being served.
///
/// Built by the connection once the request has been read and handed by
/// reference to each stage in turn. Nothing here outlives the request.
#[derive(Debug)]
pub struct RequestContext<'a> {
    pub config: &'a ServerConfig,
    pub request: Request,
    /// Client address, when the transport has one
    pub peer: Option<SocketAddr>,
    /// Port the client connected to
    pub local_port: Option<u16>,
    /// Set once an `-auth` descriptor has accepted the client's credentials
    pub remote_user: Option<String>,
}

impl<'a> RequestContext<'a> {
    pub fn new(
        config: &'a ServerConfig,
        request: Request,
        peer: Option<SocketAddr>,
        local_port: Option<u16>,
    ) -> Self {
        Self {
            config,
            request,
            peer,
            local_port,
            remote_user: None,
        }
    }

    pub fn remote_addr(&self) -> String {
        self.peer
            .map(|p| p.ip().to_canonical().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.peer.map(|p| p.port())
    }

    pub fn server_port(&self) -> u16 {
        self.local_port
            .or(self.config.port)
            .unwrap_or(if self.config.https { 443 } else { 80 })
    }
}
