use crate::config::{ConfigError, ConnectionConfig};
use crate::error::Error;
use async_trait::async_trait;
use futures_util::{Sink, Stream, StreamExt};
use http::header::USER_AGENT;
use http::HeaderValue;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::TcpSocket;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, Error as WsError, Message,
};
use tokio_tungstenite::{client_async_tls_with_config, Connector};
use tracing::debug;
use url::Url;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Both halves of an established gateway connection
pub struct GatewayTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl GatewayTransport {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to the gateway.
///
/// The session only talks to this trait, so tests can swap the network
/// for an in-memory gateway.
#[async_trait]
pub trait GatewayConnector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<GatewayTransport, Error>;
}

/// WebSocket connector over TCP with optional TLS
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    user_agent: String,
}

impl WebSocketConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl GatewayConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<GatewayTransport, Error> {
        let host = url.host_str().ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: "No host in URL".to_string(),
        })?;

        let is_tls = url.scheme() == "wss";
        let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| Error::ConnectionFailed {
                    attempts: 0,
                    last_error: format!("Invalid WebSocket request: {}", e),
                })?;

        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            request.headers_mut().insert(USER_AGENT, value);
        }

        let tcp_stream = connect_direct(host, port).await?;
        set_tcp_options(&tcp_stream);

        let connector = if is_tls {
            let tls = native_tls::TlsConnector::new().map_err(|e| Error::ConnectionFailed {
                attempts: 0,
                last_error: format!("TLS error: {}", e),
            })?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws_stream, response) =
            client_async_tls_with_config(request, tcp_stream, None, connector)
                .await
                .map_err(Error::WebSocket)?;
        debug!("Handshake with {} completed ({})", host, response.status());

        let (sink, stream) = ws_stream.split();
        Ok(GatewayTransport::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Build the connection URL with the negotiated query parameters.
pub fn gateway_url(base: &str, config: &ConnectionConfig) -> Result<Url, ConfigError> {
    let mut url = Url::parse(base).map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", base, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported gateway scheme '{}'",
                other
            )))
        }
    }

    url.query_pairs_mut()
        .clear()
        .append_pair("v", &config.version.to_string())
        .append_pair("encoding", &config.encoding);
    if let Some(compress) = &config.compression {
        url.query_pairs_mut().append_pair("compress", compress);
    }

    Ok(url)
}

async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("DNS lookup failed: {}", e),
        })?
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("No addresses found for {}", host),
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Failed to create socket: {}", e),
    })?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TCP connect to {} failed: {}", dest_addr, e),
        })
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Disable Nagle
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_query() {
        let url = gateway_url("wss://gateway.discord.gg", &ConnectionConfig::default()).unwrap();
        assert_eq!(url.as_str(), "wss://gateway.discord.gg/?v=10&encoding=json");
    }

    #[test]
    fn test_gateway_url_replaces_existing_query() {
        let config = ConnectionConfig {
            compression: Some("zlib-stream".to_string()),
            ..Default::default()
        };
        let url = gateway_url("wss://gateway.discord.gg/?v=6&encoding=etf", &config).unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("v".to_string(), "10".to_string()),
                ("encoding".to_string(), "json".to_string()),
                ("compress".to_string(), "zlib-stream".to_string()),
            ]
        );
    }

    #[test]
    fn test_gateway_url_rejects_http() {
        let result = gateway_url("https://discord.com", &ConnectionConfig::default());
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WebSocketConnector::new("test-agent");
        let url = Url::parse(&format!("ws://127.0.0.1:{}/", port)).unwrap();
        let result = connector.connect(&url).await;

        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
    }
}
