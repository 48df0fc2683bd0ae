// src/network/transport.rs
//! Pool transport seam
//!
//! The session only sees a sink and a stream of text frames. [`WsConnector`]
//! provides them over a WebSocket; tests plug in in-memory connectors.

use crate::utils::error::MinerError;
use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tungstenite::protocol::Message;
use url::Url;

/// Outgoing text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = MinerError> + Send>>;

/// Incoming text frames; the stream ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, MinerError>> + Send>>;

/// An open connection to a pool server
pub struct PoolLink {
    /// Frames to the pool
    pub sink: FrameSink,
    /// Frames from the pool
    pub stream: FrameStream,
}

/// Opens connections to pool servers
pub trait Connector: Send + Sync {
    /// Connects to `host:port`
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<PoolLink, MinerError>>;
}

/// WebSocket transport
#[derive(Debug, Clone)]
pub struct WsConnector {
    secure: bool,
    timeout: Duration,
}

impl WsConnector {
    /// # Arguments
    /// * `secure` - Use `wss://` instead of `ws://`
    /// * `timeout` - Upper bound for the TCP, TLS and WebSocket handshakes
    pub fn new(secure: bool, timeout: Duration) -> Self {
        WsConnector { secure, timeout }
    }

    /// Endpoint URL for `host:port`
    pub fn endpoint(&self, host: &str, port: u16) -> Result<Url, MinerError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let url = Url::parse(&format!("{}://{}:{}", scheme, host, port))?;
        if url.host_str().is_none() {
            return Err(MinerError::ConfigError(format!("Invalid pool host '{}'", host)));
        }
        Ok(url)
    }
}

impl Connector for WsConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, Result<PoolLink, MinerError>> {
        Box::pin(async move {
            let url = self.endpoint(host, port)?;

            let (ws_stream, _) =
                tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url.as_str()))
                    .await
                    .map_err(|_| {
                        MinerError::ConnectionError(format!(
                            "Timed out after {:?} connecting to {}",
                            self.timeout, url
                        ))
                    })?
                    .map_err(|e| {
                        if e.to_string().contains("dns error") {
                            MinerError::ConnectionError(format!(
                                "DNS resolution failed. Check pool host: {}",
                                host
                            ))
                        } else {
                            MinerError::from(e)
                        }
                    })?;

            let (sink, stream) = ws_stream.split();
            let sink = sink
                .sink_map_err(MinerError::from)
                .with(|text: String| future::ready(Ok::<_, MinerError>(Message::Text(text.into()))));
            let stream = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes.to_vec()).map_err(|e| {
                        MinerError::ProtocolError(format!("Binary frame is not UTF-8: {}", e))
                    })),
                    // Control frames are answered by tungstenite itself
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                })
            });

            Ok::<_, MinerError>(PoolLink {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_endpoint_by_default_scheme() {
        let connector = WsConnector::new(true, Duration::from_secs(5));
        let url = connector.endpoint("eu.sushipool.com", 443).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.host_str(), Some("eu.sushipool.com"));
        assert_eq!(url.port_or_known_default(), Some(443));
    }

    #[test]
    fn plain_endpoint_keeps_port() {
        let connector = WsConnector::new(false, Duration::from_secs(5));
        let url = connector.endpoint("127.0.0.1", 8444).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8444/");
    }

    #[test]
    fn rejects_garbage_hosts() {
        let connector = WsConnector::new(true, Duration::from_secs(5));
        assert!(connector.endpoint("not a host", 443).is_err());
    }

    #[tokio::test]
    async fn unreachable_pool_is_a_connection_failure() {
        let connector = WsConnector::new(false, Duration::from_secs(5));
        // Port 1 on localhost refuses immediately
        assert!(connector.connect("127.0.0.1", 1).await.is_err());
    }
}
