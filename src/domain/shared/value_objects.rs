//! Shared value objects used across multiple bounded contexts

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::DomainError;

pub const DEFAULT_SIP_PORT: u16 = 5060;
pub const DEFAULT_SIPS_PORT: u16 = 5061;

/// SIP URI value object
///
/// Accepts bare URIs (`sip:alice@example.com:5060;transport=tcp`) as well as
/// name-addr forms (`"Alice" <sip:alice@example.com>;tag=1234`), in which case
/// only the part between the angle brackets is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    scheme: String,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user,
            host,
            port,
            params: Vec::new(),
        }
    }

    pub fn parse(uri: &str) -> Result<Self, DomainError> {
        let uri = uri.trim();
        let uri = match (uri.find('<'), uri.rfind('>')) {
            (Some(start), Some(end)) if start < end => &uri[start + 1..end],
            _ => uri,
        };

        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| DomainError::ValidationError(format!("missing scheme in '{}'", uri)))?;
        let scheme = scheme.to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(DomainError::ValidationError(format!(
                "unsupported URI scheme '{}'",
                scheme
            )));
        }

        // Header part is never needed for routing
        let rest = rest.split('?').next().unwrap_or_default();

        let (user, host_part) = match rest.rfind('@') {
            Some(idx) => {
                let user = &rest[..idx];
                let user = user.split(':').next().unwrap_or_default();
                (Some(user.to_string()), &rest[idx + 1..])
            }
            None => (None, rest),
        };

        let mut segments = host_part.split(';');
        let host_port = segments.next().unwrap_or_default();
        let params = segments
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((k, v)) => (k.to_ascii_lowercase(), Some(v.to_string())),
                None => (s.to_ascii_lowercase(), None),
            })
            .collect();

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return Err(DomainError::ValidationError(format!("empty host in '{}'", uri)));
        }

        Ok(Self {
            scheme,
            user: user.filter(|u| !u.is_empty()),
            host,
            port,
            params,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "sips"
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(if self.is_secure() {
            DEFAULT_SIPS_PORT
        } else {
            DEFAULT_SIP_PORT
        })
    }

    /// Value of a URI parameter; flag parameters such as `lr` yield `Some("")`
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.param(name).is_some()
    }

    pub fn transport(&self) -> Option<&str> {
        self.param("transport")
    }

    pub fn set_param(&mut self, name: &str, value: Option<String>) {
        self.params.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.params.push((name.to_ascii_lowercase(), value));
    }

    pub fn with_host_port(&self, host: &str, port: Option<u16>) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..self.clone()
        }
    }

    /// A user part made only of digits, optionally prefixed by '+'
    pub fn is_phone_number(&self) -> bool {
        match self.user() {
            Some(user) => {
                let digits = user.strip_prefix('+').unwrap_or(user);
                !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
            }
            None => false,
        }
    }

    /// True when host and effective port designate the given address
    pub fn points_to(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port_or_default() == port
    }
}

fn split_host_port(host_port: &str) -> Result<(String, Option<u16>), DomainError> {
    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        let end = stripped
            .find(']')
            .ok_or_else(|| DomainError::ValidationError(format!("bad IPv6 host '{}'", host_port)))?;
        let port = stripped[end + 1..].strip_prefix(':');
        (format!("[{}]", &stripped[..end]), port)
    } else {
        match host_port.split_once(':') {
            Some((h, p)) => (h.to_string(), Some(p)),
            None => (host_port.to_string(), None),
        }
    };

    let port = match port {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| DomainError::ValidationError(format!("bad port '{}'", p)))?,
        ),
        None => None,
    };

    Ok((host.to_ascii_lowercase(), port))
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}
