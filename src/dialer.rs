//! Connection establishment seam
//!
//! The transport dials through a [`Dialer`] so tests can substitute a
//! scripted connection factory; [`WsDialer`] is the production
//! implementation over tokio-tungstenite, with optional HTTP CONNECT
//! forwarding-proxy support.

use crate::config::{ProxyOptions, TransportOptions};
use crate::error::TransportError;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

/// A live text-frame duplex to the peer
pub struct Connection {
    pub sink: Pin<Box<dyn Sink<String, Error = TransportError> + Send>>,
    pub stream: Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>,
}

/// Creates one connection per call; owned by the transport's driver task
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, options: &TransportOptions) -> Result<Connection, TransportError>;
}

/// Dials ws/wss URLs, directly or through a forwarding proxy
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, options: &TransportOptions) -> Result<Connection, TransportError> {
        let url = Url::parse(&options.url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            _ => return Err(TransportError::UnsupportedScheme(options.url.clone())),
        }

        let ws = match &options.proxy {
            Some(proxy) => connect_via_proxy(&options.url, &url, proxy).await?,
            None => {
                let (ws, _response) = connect_async(options.url.as_str()).await?;
                ws
            }
        };

        Ok(frame_connection(ws))
    }
}

/// Adapt a WebSocket into the text-frame duplex the transport drives.
/// Binary, ping and pong frames are dropped here; a Close frame surfaces
/// as a terminal error item.
fn frame_connection<S>(ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink
        .sink_map_err(TransportError::from)
        .with(|frame: String| future::ready(Ok::<Message, TransportError>(Message::Text(frame.into()))));

    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(text.to_string())),
            Ok(Message::Close(_)) => Some(Err(TransportError::ConnectionClosed)),
            Ok(_) => None,
            Err(err) => Some(Err(TransportError::from(err))),
        })
    });

    Connection {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    }
}

/// Open a TCP tunnel through the proxy, then run the WebSocket (and TLS,
/// for wss) handshake over it
async fn connect_via_proxy(
    url: &str,
    target: &Url,
    proxy: &ProxyOptions,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let host = target
        .host_str()
        .ok_or_else(|| TransportError::ProxyConnect("target url has no host".to_string()))?;
    let port = target.port_or_known_default().unwrap_or(80);

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let mut connect_req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = &proxy.auth {
        let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        connect_req.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    connect_req.push_str("\r\n");

    stream.write_all(connect_req.as_bytes()).await?;

    // Read the response head byte-wise up to the blank line; the tunnel
    // bytes that follow belong to the WebSocket handshake
    let mut response = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::ProxyConnect(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        response.push(byte[0]);
        if response.len() > 8192 {
            return Err(TransportError::ProxyConnect(
                "oversized CONNECT response".to_string(),
            ));
        }
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or_default();
    if !status_line.contains(" 200") {
        return Err(TransportError::ProxyConnect(status_line.to_string()));
    }

    let (ws, _response) = client_async_tls(url, stream).await?;
    Ok(ws)
}
