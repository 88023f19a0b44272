//! Session timers (RFC 4028)
//!
//! Negotiation only: the dialog arms the resulting refresh/expiry timers.

use std::fmt;
use std::time::Duration;

use tracing::warn;

use super::DialogConfig;
use crate::infrastructure::protocols::sip::message::{header_param, SipHeaders, SipRequest, SipResponse};

pub const SESSION_EXPIRES: &str = "Session-Expires";
pub const MIN_SE: &str = "Min-SE";
pub const TIMER_OPTION_TAG: &str = "timer";

/// Which end of the refreshing transaction sends refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

impl Refresher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Refresher::Uac => "uac",
            Refresher::Uas => "uas",
        }
    }
}

/// `Session-Expires: 1800;refresher=uac`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Option<Refresher>,
}

impl SessionExpires {
    pub fn parse(value: &str) -> Option<Self> {
        let interval = value.split(';').next()?.trim().parse().ok()?;
        let refresher = header_param(value, "refresher").and_then(|r| {
            match r.to_ascii_lowercase().as_str() {
                "uac" => Some(Refresher::Uac),
                "uas" => Some(Refresher::Uas),
                _ => None,
            }
        });
        Some(Self { interval, refresher })
    }

    pub fn from_message<M: SipHeaders>(message: &M) -> Option<Self> {
        message
            .header(SESSION_EXPIRES)
            .or_else(|| message.header("x"))
            .and_then(|v| Self::parse(&v))
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.interval)?;
        if let Some(refresher) = self.refresher {
            write!(f, ";refresher={}", refresher.as_str())?;
        }
        Ok(())
    }
}

/// Outcome of a negotiation, seen from this side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedSession {
    /// Seconds
    pub interval: u32,
    /// This side sends the refreshes
    pub local_refresher: bool,
}

impl NegotiatedSession {
    /// Refresh at half the interval, never sooner than a second
    pub fn refresh_after(&self) -> Duration {
        Duration::from_secs(u64::from((self.interval / 2).max(1)))
    }

    /// The non-refresher gives up shortly before the session expires
    pub fn expire_after(&self) -> Duration {
        let margin = std::cmp::min(32, self.interval / 3);
        Duration::from_secs(u64::from((self.interval - margin).max(1)))
    }
}

fn supports_timer<M: SipHeaders>(message: &M) -> bool {
    message.has_option_tag("Supported", TIMER_OPTION_TAG)
        || message.has_option_tag("Require", TIMER_OPTION_TAG)
}

/// Interval the request asks for when it is below our Min-SE; such a
/// request gets a 422
pub fn interval_too_small(request: &SipRequest, config: &DialogConfig) -> Option<u32> {
    if !config.session_timer {
        return None;
    }
    SessionExpires::from_message(request)
        .map(|se| se.interval)
        .filter(|interval| *interval < config.min_se)
}

/// Headers proposing a session timer on an INVITE or UPDATE we send
pub fn request_headers(config: &DialogConfig, refresher: Option<Refresher>) -> Vec<(&'static str, String)> {
    if !config.session_timer {
        return Vec::new();
    }
    let proposal = SessionExpires {
        interval: config.session_interval,
        refresher,
    };
    vec![
        ("Supported", TIMER_OPTION_TAG.to_string()),
        (SESSION_EXPIRES, proposal.to_string()),
        (MIN_SE, config.min_se.to_string()),
    ]
}

/// Answer side: negotiate from the request and return the headers for
/// the 2xx. A peer without timer support gets our interval imposed with
/// us refreshing.
pub fn answer(request: &SipRequest, config: &DialogConfig) -> Option<(NegotiatedSession, Vec<(&'static str, String)>)> {
    if !config.session_timer {
        return None;
    }
    let peer_supports = supports_timer(request);
    let requested = SessionExpires::from_message(request);

    let interval = match requested {
        Some(se) => std::cmp::min(se.interval, config.session_interval).max(config.min_se),
        None => config.session_interval,
    };
    let refresher = if peer_supports {
        requested.and_then(|se| se.refresher).unwrap_or(Refresher::Uas)
    } else {
        Refresher::Uas
    };

    let mut headers = vec![(
        SESSION_EXPIRES,
        SessionExpires {
            interval,
            refresher: Some(refresher),
        }
        .to_string(),
    )];
    if peer_supports {
        headers.push(("Require", TIMER_OPTION_TAG.to_string()));
    }

    Some((
        NegotiatedSession {
            interval,
            local_refresher: refresher == Refresher::Uas,
        },
        headers,
    ))
}

/// Offer side: read the outcome from the 2xx
pub fn from_response(response: &SipResponse, config: &DialogConfig) -> Option<NegotiatedSession> {
    if !config.session_timer {
        return None;
    }
    match SessionExpires::from_message(response) {
        Some(se) => {
            // The answerer may not shorten the interval below our Min-SE
            let interval = if se.interval < config.min_se {
                warn!(
                    "Session-Expires {} in response is below Min-SE {}, using {}",
                    se.interval, config.min_se, config.min_se
                );
                config.min_se
            } else {
                se.interval
            };
            Some(NegotiatedSession {
                interval,
                local_refresher: se.refresher.unwrap_or(Refresher::Uas) == Refresher::Uac,
            })
        }
        None => Some(NegotiatedSession {
            interval: config.session_interval,
            local_refresher: true,
        }),
    }
}
