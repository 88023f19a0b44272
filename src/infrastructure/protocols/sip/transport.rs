//! SIP transport facade
//!
//! The engine only ever sees [`TransportFacade::send`] and the
//! [`IncomingMessage`] values handed to it. Adapters: [`UdpTransport`] for
//! the network, [`ChannelTransport`] to capture traffic in-process.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::message::{SipError, SipHeaders, SipMessage, SipRequest, SipResponse};
use crate::domain::shared::SipUri;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
            TransportProtocol::Wss => "WSS",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportProtocol::Udp),
            "tcp" => Some(TransportProtocol::Tcp),
            "tls" => Some(TransportProtocol::Tls),
            "ws" => Some(TransportProtocol::Ws),
            "wss" => Some(TransportProtocol::Wss),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp => 5060,
            TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
            TransportProtocol::Ws => 80,
            TransportProtocol::Wss => 443,
        }
    }

    /// Reliable transports skip retransmissions and wait timers
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an established connection-oriented flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Where a message is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipTarget {
    pub host: String,
    pub port: u16,
    pub protocol: TransportProtocol,
    /// Reuse this flow instead of opening a new one
    pub connection: Option<ConnectionId>,
}

impl SipTarget {
    pub fn new(host: impl Into<String>, port: u16, protocol: TransportProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            connection: None,
        }
    }

    /// Transport from the `transport` parameter, `sips` implying TLS
    pub fn from_uri(uri: &SipUri, default_protocol: TransportProtocol) -> Self {
        let protocol = uri
            .transport()
            .and_then(TransportProtocol::parse)
            .unwrap_or(if uri.is_secure() {
                TransportProtocol::Tls
            } else {
                default_protocol
            });
        let port = uri.port().unwrap_or_else(|| protocol.default_port());
        Self::new(uri.host(), port, protocol)
    }

    pub fn from_addr(addr: SocketAddr, protocol: TransportProtocol) -> Self {
        Self::new(addr.ip().to_string(), addr.port(), protocol)
    }

    pub fn with_connection(mut self, connection: Option<ConnectionId>) -> Self {
        self.connection = connection;
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.protocol.is_reliable()
    }
}

impl fmt::Display for SipTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.protocol)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
    pub connection: Option<ConnectionId>,
}

impl IncomingMessage {
    pub fn new(message: SipMessage, source: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            message,
            source,
            protocol,
            connection: None,
        }
    }

    /// Where replies to this message go: the top Via's received/rport,
    /// falling back to the packet source
    pub fn reply_target(&self) -> SipTarget {
        let via = match &self.message {
            SipMessage::Request(req) => req.top_via(),
            SipMessage::Response(resp) => resp.top_via(),
        };
        let target = match via {
            Some(via) => {
                let (host, port) = via.response_address();
                SipTarget::new(host, port, self.protocol)
            }
            None => SipTarget::from_addr(self.source, self.protocol),
        };
        target.with_connection(self.connection)
    }
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message: SipMessage,
    pub target: SipTarget,
}

/// Sending side of a transport, as seen by the engine
#[async_trait::async_trait]
pub trait TransportFacade: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;
}

/// Destination of an outgoing request.
///
/// Priority: an explicit connection, then a loose-routing top Route, then
/// the outbound proxy, then the request-URI.
pub fn request_target(
    request: &SipRequest,
    connection: Option<ConnectionId>,
    outbound_proxy: Option<&SipUri>,
    default_protocol: TransportProtocol,
) -> Result<SipTarget, SipError> {
    let request_uri = SipUri::parse(&request.uri_string())?;

    if connection.is_some() {
        return Ok(SipTarget::from_uri(&request_uri, default_protocol).with_connection(connection));
    }

    if let Some(route) = request.routes().first() {
        let route_uri = SipUri::parse(route)?;
        if route_uri.has_param("lr") {
            return Ok(SipTarget::from_uri(&route_uri, default_protocol));
        }
    }

    if let Some(proxy) = outbound_proxy {
        return Ok(SipTarget::from_uri(proxy, default_protocol));
    }

    Ok(SipTarget::from_uri(&request_uri, default_protocol))
}

/// Destination of an outgoing response: the top Via's received/rport
pub fn response_target(response: &SipResponse) -> Result<SipTarget, SipError> {
    let via = response
        .top_via()
        .ok_or_else(|| SipError::InvalidMessage("response without Via".to_string()))?;
    let (host, port) = via.response_address();
    Ok(SipTarget::new(host, port, via.transport()))
}

/// In-process adapter: every message sent is forwarded on a channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl TransportFacade for ChannelTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        self.tx
            .send(message)
            .map_err(|e| SipError::TransportError(format!("channel closed: {}", e)))
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        if let Ok(local) = socket.local_addr() {
            info!("UDP transport listening on {}", local);
        }

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });

        Ok(())
    }

    /// Incoming messages; can be taken once
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage::new(message, source, TransportProtocol::Udp);
                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl TransportFacade for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        if message.target.protocol != TransportProtocol::Udp {
            warn!(
                "No {} adapter, sending to {} over UDP",
                message.target.protocol, message.target
            );
        }

        let host = message.target.host.trim_start_matches('[').trim_end_matches(']');
        let destination = tokio::net::lookup_host((host, message.target.port))
            .await
            .map_err(|e| SipError::TransportError(format!("Cannot resolve {}: {}", message.target, e)))?
            .next()
            .ok_or_else(|| SipError::TransportError(format!("No address for {}", message.target)))?;

        let data = message.message.to_bytes();
        debug!("Sending {} bytes to {} via UDP", data.len(), destination);

        socket
            .send_to(&data, destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(extra: &str) -> SipRequest {
        let data = format!(
            "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP client.atlanta.example.com:5060;branch=z9hG4bK74bf9;received=192.0.2.101;rport=6000\r\n\
             {}\
             From: Alice <sip:alice@atlanta.example.com>;tag=9fxced76sl\r\n\
             To: Bob <sip:bob@biloxi.example.com>\r\n\
             Call-ID: 3848276298220188511@atlanta.example.com\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
            extra
        );
        SipRequest::parse(data.as_bytes()).unwrap()
    }

    #[test]
    fn test_request_target_priority() {
        let plain = request("");
        let target = request_target(&plain, None, None, TransportProtocol::Udp).unwrap();
        assert_eq!(target.host, "biloxi.example.com");
        assert_eq!(target.port, 5060);

        let proxy = SipUri::parse("sip:outbound.example.com:5080;transport=tcp").unwrap();
        let target = request_target(&plain, None, Some(&proxy), TransportProtocol::Udp).unwrap();
        assert_eq!(target.host, "outbound.example.com");
        assert_eq!(target.protocol, TransportProtocol::Tcp);

        let routed = request("Route: <sip:edge.example.com;lr>\r\n");
        let target = request_target(&routed, None, Some(&proxy), TransportProtocol::Udp).unwrap();
        assert_eq!(target.host, "edge.example.com");

        let target = request_target(&routed, Some(ConnectionId(7)), Some(&proxy), TransportProtocol::Udp).unwrap();
        assert_eq!(target.connection, Some(ConnectionId(7)));
        assert_eq!(target.host, "biloxi.example.com");
    }

    #[test]
    fn test_reply_target_uses_received_and_rport() {
        let incoming = IncomingMessage::new(
            SipMessage::Request(request("")),
            "192.0.2.101:6000".parse().unwrap(),
            TransportProtocol::Udp,
        );
        let target = incoming.reply_target();
        assert_eq!(target.host, "192.0.2.101");
        assert_eq!(target.port, 6000);
    }

    #[tokio::test]
    async fn test_channel_transport_captures() {
        let (transport, mut rx) = ChannelTransport::new();
        let target = SipTarget::new("127.0.0.1", 5060, TransportProtocol::Udp);
        transport
            .send(OutgoingMessage {
                message: SipMessage::Request(request("")),
                target: target.clone(),
            })
            .await
            .unwrap();
        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.target, target);
        assert!(sent.message.is_request());
    }
}
