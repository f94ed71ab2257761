//! Forwarding rules and the local listener that feeds relays
//!
//! A rule `tcp:8899 -> tcp:127.0.0.1:8899` binds the local endpoint, and for
//! every accepted connection asks the session layer ([`ChannelOpener`]) for a
//! channel to the named service, then hands both to a [`ChannelHandler`] in
//! its own task.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ForwardConfig;
use crate::relay::{BoxStream, ChannelHandler, RelayError};

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("Invalid forward rule {rule:?}: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Failed to bind {local}: {source}")]
    Bind {
        local: LocalSpec,
        #[source]
        source: std::io::Error,
    },
}

/// Local endpoint spec: `tcp:<port>` or `tcp:<host>:<port>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalSpec {
    Tcp { host: String, port: u16 },
}

impl FromStr for LocalSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = parse_tcp(s)?;
        Ok(LocalSpec::Tcp { host, port })
    }
}

impl fmt::Display for LocalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalSpec::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// `<local-endpoint-spec> -> <remote-service-name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub local: LocalSpec,
    pub service: String,
}

impl ForwardRule {
    pub fn new(local: &str, service: &str) -> Result<Self, ForwardError> {
        let invalid = |reason: String| ForwardError::InvalidRule {
            rule: format!("{} -> {}", local, service),
            reason,
        };
        let local = local.trim().parse().map_err(invalid)?;
        let service = service.trim();
        if service.is_empty() {
            return Err(invalid("empty service name".to_string()));
        }
        Ok(Self {
            local,
            service: service.to_string(),
        })
    }
}

impl FromStr for ForwardRule {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, service) = s.split_once("->").ok_or_else(|| ForwardError::InvalidRule {
            rule: s.to_string(),
            reason: "expected `<local> -> <service>`".to_string(),
        })?;
        Self::new(local, service)
    }
}

impl TryFrom<&ForwardConfig> for ForwardRule {
    type Error = ForwardError;

    fn try_from(config: &ForwardConfig) -> Result<Self, Self::Error> {
        Self::new(&config.local, &config.service)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.service)
    }
}

/// Session layer side: opens a channel to a named service on the device.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, service: &str) -> Result<BoxStream, RelayError>;
}

/// Opens `tcp:<port>` / `tcp:<host>:<port>` services as plain TCP connections.
///
/// Stands in for a device session when the far end is reachable over TCP
/// (for instance a port the device transport already exposes locally).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpChannelOpener;

#[async_trait]
impl ChannelOpener for TcpChannelOpener {
    async fn open(&self, service: &str) -> Result<BoxStream, RelayError> {
        let open_err = |reason: String| RelayError::Open {
            service: service.to_string(),
            reason,
        };
        let (host, port) = parse_tcp(service).map_err(open_err)?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| open_err(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

/// A bound forwarding rule
pub struct ForwardServer {
    rule: ForwardRule,
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    handler: Arc<dyn ChannelHandler>,
}

impl ForwardServer {
    pub async fn bind(
        rule: ForwardRule,
        opener: Arc<dyn ChannelOpener>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Self, ForwardError> {
        let LocalSpec::Tcp { host, port } = &rule.local;
        let listener = TcpListener::bind((host.as_str(), *port))
            .await
            .map_err(|source| ForwardError::Bind {
                local: rule.local.clone(),
                source,
            })?;
        Ok(Self {
            rule,
            listener,
            opener,
            handler,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    /// Accept connections until `shutdown` fires, then abort live relays.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut relays = JoinSet::new();
        info!(rule = %self.rule, "Forwarding");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(_) = relays.join_next(), if !relays.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(rule = %self.rule, error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    let service = self.rule.service.clone();
                    let opener = Arc::clone(&self.opener);
                    let handler = Arc::clone(&self.handler);
                    relays.spawn(serve_connection(stream, peer, service, opener, handler));
                }
            }
        }

        debug!(rule = %self.rule, active = relays.len(), "Stopping forward");
        relays.abort_all();
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: String,
    opener: Arc<dyn ChannelOpener>,
    handler: Arc<dyn ChannelHandler>,
) {
    debug!(%peer, %service, "Accepted connection");
    let channel = match opener.open(&service).await {
        Ok(channel) => channel,
        Err(e) => {
            warn!(%peer, error = %e, "Could not open remote channel");
            return;
        }
    };
    match handler.on_channel_open(Box::new(stream), channel).await {
        Ok(stats) => debug!(
            %peer,
            sent = stats.local_to_remote,
            received = stats.remote_to_local,
            closed_by = %stats.closed_by,
            "Connection finished"
        ),
        Err(e) => warn!(%peer, error = %e, "Relay failed"),
    }
}

/// `tcp:<port>` (loopback) or `tcp:<host>:<port>`
fn parse_tcp(spec: &str) -> Result<(String, u16), String> {
    let rest = spec
        .strip_prefix("tcp:")
        .ok_or_else(|| format!("unsupported endpoint {:?}, expected tcp:...", spec))?;
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host.trim_start_matches('[').trim_end_matches(']'), port),
        None => ("127.0.0.1", rest),
    };
    if host.is_empty() {
        return Err(format!("missing host in {:?}", spec));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in {:?}", spec))?;
    Ok((host.to_string(), port))
}
