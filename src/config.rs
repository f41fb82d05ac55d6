use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// Everything the core needs from its environment: where the relay lives and
/// which discovery-assistance servers the peer session may use.
#[derive(Debug, Clone)]
pub struct Config {
    pub relay_url: String,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".into(),
            ice_servers: default_ice_servers(),
        }
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun-0".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

/// Rejects entries the peer connection would silently fail on.
pub fn validate_ice_servers(servers: &[ServerConfig]) -> Result<()> {
    for server in servers {
        if server.url.is_empty() {
            return Err(Error::InvalidIceServer(format!(
                "server {:?} has an empty url",
                server.id
            )));
        }
        if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
            return Err(Error::InvalidIceServer(format!(
                "turn server {:?} requires username and credential",
                server.id
            )));
        }
    }
    Ok(())
}

pub fn rtc_configuration(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect();

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}
