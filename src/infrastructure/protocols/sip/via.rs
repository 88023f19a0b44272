//! Via header handling
//!
//! Branch and tag generation, loop tags and the RFC 3581 `received`/`rport`
//! stamping done on every request that enters the node.

use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

use super::message::SipError;
use super::transport::TransportProtocol;

/// RFC 3261 branch prefix
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// Parsed Via entry: `SIP/2.0/UDP host:port;branch=...;rport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl ViaHeader {
    pub fn new(protocol: TransportProtocol, host: &str, port: u16, branch: &str) -> Self {
        Self {
            protocol: protocol.as_str().to_string(),
            host: host.to_string(),
            port: Some(port),
            params: vec![
                ("branch".to_string(), Some(branch.to_string())),
                ("rport".to_string(), None),
            ],
        }
    }

    pub fn parse(value: &str) -> Result<Self, SipError> {
        let value = value.trim();
        let (sent_protocol, rest) = value
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::ParseError(format!("malformed Via '{}'", value)))?;

        let protocol = sent_protocol
            .rsplit('/')
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SipError::ParseError(format!("malformed Via protocol '{}'", sent_protocol)))?
            .to_ascii_uppercase();

        let mut segments = rest.trim().split(';');
        let sent_by = segments.next().unwrap_or_default().trim();
        let (host, port) = if let Some(stripped) = sent_by.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| SipError::ParseError(format!("malformed Via host '{}'", sent_by)))?;
            let port = stripped[end + 1..].strip_prefix(':');
            (format!("[{}]", &stripped[..end]), port)
        } else {
            match sent_by.split_once(':') {
                Some((h, p)) => (h.to_string(), Some(p)),
                None => (sent_by.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(SipError::ParseError(format!("Via without host '{}'", value)));
        }
        let port = match port {
            Some(p) => Some(
                p.trim()
                    .parse::<u16>()
                    .map_err(|_| SipError::ParseError(format!("bad Via port '{}'", p)))?,
            ),
            None => None,
        };

        let params = segments
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), Some(v.trim().to_string())),
                None => (s.to_ascii_lowercase(), None),
            })
            .collect();

        Ok(Self {
            protocol,
            host,
            port,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        match self.params.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name.to_string(), value)),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch").filter(|b| !b.is_empty())
    }

    pub fn received(&self) -> Option<&str> {
        self.param("received").filter(|r| !r.is_empty())
    }

    pub fn rport(&self) -> Option<u16> {
        self.param("rport").and_then(|p| p.parse().ok())
    }

    pub fn transport(&self) -> TransportProtocol {
        TransportProtocol::parse(&self.protocol).unwrap_or(TransportProtocol::Udp)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.transport().default_port())
    }

    pub fn sent_by(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Where responses for this hop go: received/rport win over sent-by
    pub fn response_address(&self) -> (String, u16) {
        let host = self.received().unwrap_or(&self.host).to_string();
        let port = self.rport().unwrap_or_else(|| self.port_or_default());
        (host, port)
    }

    /// Record the observed source address (RFC 3581)
    pub fn stamp_source(&mut self, source: SocketAddr) {
        let ip = source.ip().to_string();
        if self.host != ip {
            self.set_param("received", Some(ip.clone()));
        }
        if self.param("rport").is_some() {
            self.set_param("rport", Some(source.port().to_string()));
        }
        debug!("Stamped Via {} with source {}", self.sent_by(), source);
    }

    pub fn is_from(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port_or_default() == port
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.protocol, self.sent_by())?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Fresh RFC 3261 branch
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", MAGIC_COOKIE, random)
}

/// Branch ending with a loop tag so that the request can be recognised if
/// it comes back to this node
pub fn branch_with_loop_tag(loop_tag: &str) -> String {
    let random: u32 = rand::thread_rng().gen();
    format!("{}{:08x}.{}", MAGIC_COOKIE, random, loop_tag)
}

/// From/To tag
pub fn generate_tag() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{:x}", random)
}

/// Hash identifying a request's routing-relevant identity
pub fn loop_tag(request_uri: &str, from_tag: &str, call_id: &str, cseq: u32) -> String {
    let digest = md5::compute(format!("{}|{}|{}|{}", request_uri, from_tag, call_id, cseq));
    hex::encode(&digest.0[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let via = ViaHeader::parse("SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776;rport").unwrap();
        assert_eq!(via.protocol, "UDP");
        assert_eq!(via.host, "192.168.1.100");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776"));
        assert_eq!(via.rport(), None);
        assert_eq!(via.to_string(), "SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776;rport");
    }

    #[test]
    fn test_stamp_source_behind_nat() {
        let mut via = ViaHeader::parse("SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776;rport").unwrap();
        via.stamp_source("203.0.113.5:40000".parse().unwrap());
        assert_eq!(via.received(), Some("203.0.113.5"));
        assert_eq!(via.rport(), Some(40000));
        assert_eq!(via.response_address(), ("203.0.113.5".to_string(), 40000));
    }

    #[test]
    fn test_stamp_source_without_rport() {
        let mut via = ViaHeader::parse("SIP/2.0/TCP 10.0.0.1;branch=z9hG4bKx").unwrap();
        via.stamp_source("10.0.0.1:33000".parse().unwrap());
        assert_eq!(via.received(), None);
        assert_eq!(via.response_address(), ("10.0.0.1".to_string(), 5060));
    }

    #[test]
    fn test_tls_default_port() {
        let via = ViaHeader::parse("SIP/2.0/TLS edge.example.com;branch=z9hG4bKx").unwrap();
        assert_eq!(via.port_or_default(), 5061);
    }

    #[test]
    fn test_branch_generation() {
        assert!(generate_branch().starts_with(MAGIC_COOKIE));
        let tag = loop_tag("sip:bob@example.com", "abc", "call-1", 1);
        let branch = branch_with_loop_tag(&tag);
        assert!(branch.starts_with(MAGIC_COOKIE));
        assert!(branch.ends_with(&tag));
        assert_ne!(tag, loop_tag("sip:bob@example.com", "abc", "call-1", 2));
    }
}
