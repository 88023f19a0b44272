//! Reliable provisional responses (RFC 3262)
//!
//! The UAS keeps one reliable provisional response outstanding and queues
//! the rest; the UAC remembers the highest RSeq it has acknowledged.

use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::infrastructure::protocols::sip::message::{SipHeaders, SipMethod, SipResponse};

pub const OPTION_TAG: &str = "100rel";
pub const RSEQ: &str = "RSeq";
pub const RACK: &str = "RAck";

/// `RAck: <rseq> <cseq> <method>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: SipMethod,
}

impl RAck {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let rseq = parts.next()?.parse().ok()?;
        let cseq = parts.next()?.parse().ok()?;
        let method = SipMethod::parse(parts.next()?)?;
        Some(Self { rseq, cseq, method })
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

/// RSeq of a provisional response sent reliably
pub fn reliable_rseq(response: &SipResponse) -> Option<u32> {
    if !response.is_provisional() || !response.has_option_tag("Require", OPTION_TAG) {
        return None;
    }
    response.header(RSEQ).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone)]
pub struct Outstanding {
    pub rseq: u32,
    pub response: SipResponse,
    /// Current retransmission interval
    pub interval: Duration,
}

/// UAS side
#[derive(Debug)]
pub struct ReliableSender {
    next_rseq: u32,
    outstanding: Option<Outstanding>,
    queue: VecDeque<SipResponse>,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSender {
    pub fn new() -> Self {
        Self {
            next_rseq: rand::thread_rng().gen_range(1..=(1 << 16)),
            outstanding: None,
            queue: VecDeque::new(),
        }
    }

    /// Number the response and return it if it can go out now. Otherwise
    /// it waits for the outstanding one to be acknowledged.
    pub fn submit(&mut self, mut response: SipResponse, t1: Duration) -> Option<SipResponse> {
        let rseq = self.next_rseq;
        self.next_rseq += 1;
        response.push_header("Require", OPTION_TAG);
        response.push_header(RSEQ, rseq.to_string());

        if self.outstanding.is_some() {
            self.queue.push_back(response);
            return None;
        }
        self.outstanding = Some(Outstanding {
            rseq,
            response: response.clone(),
            interval: t1,
        });
        Some(response)
    }

    pub fn outstanding(&self) -> Option<&Outstanding> {
        self.outstanding.as_ref()
    }

    /// Response to resend and the delay before the next retransmission
    pub fn retransmit(&mut self) -> Option<(SipResponse, Duration)> {
        let outstanding = self.outstanding.as_mut()?;
        outstanding.interval *= 2;
        Some((outstanding.response.clone(), outstanding.interval))
    }

    /// PRACK for the outstanding response
    pub fn acknowledge(&mut self, rack: &RAck, invite_cseq: u32) -> bool {
        let matches = self
            .outstanding
            .as_ref()
            .map(|o| o.rseq == rack.rseq && rack.cseq == invite_cseq && rack.method == SipMethod::Invite)
            .unwrap_or(false);
        if matches {
            self.outstanding = None;
        }
        matches
    }

    /// Promote the next queued response, if any
    pub fn next(&mut self, t1: Duration) -> Option<SipResponse> {
        let response = self.queue.pop_front()?;
        let rseq = response.header(RSEQ).and_then(|v| v.trim().parse().ok())?;
        self.outstanding = Some(Outstanding {
            rseq,
            response: response.clone(),
            interval: t1,
        });
        Some(response)
    }

    pub fn clear(&mut self) {
        self.outstanding = None;
        self.queue.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none() && self.queue.is_empty()
    }
}

/// UAC side: RSeq values already acknowledged
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    last_rseq: Option<u32>,
}

impl ReliableReceiver {
    /// Whether this RSeq is new and must be PRACKed
    pub fn accept(&mut self, rseq: u32) -> bool {
        match self.last_rseq {
            Some(last) if rseq <= last => false,
            _ => {
                self.last_rseq = Some(rseq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;
    use crate::infrastructure::protocols::sip::message::SipRequest;

    const T1: Duration = Duration::from_millis(500);

    fn ringing() -> SipResponse {
        let data = b"INVITE sip:bob@example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKrel\r\n\
                     From: <sip:alice@example.com>;tag=a1\r\n\
                     To: <sip:bob@example.com>\r\n\
                     Call-ID: rel-1\r\n\
                     CSeq: 7 INVITE\r\n\
                     Supported: 100rel\r\n\
                     Content-Length: 0\r\n\r\n";
        let invite = SipRequest::parse(data).unwrap();
        ResponseBuilder::new(180).to_tag("b1").build_for_request(&invite).unwrap()
    }

    #[test]
    fn test_rack_parse() {
        let rack = RAck::parse("776656 1 INVITE").unwrap();
        assert_eq!(rack.rseq, 776656);
        assert_eq!(rack.cseq, 1);
        assert_eq!(rack.method, SipMethod::Invite);
        assert_eq!(rack.to_string(), "776656 1 INVITE");
        assert!(RAck::parse("1 INVITE").is_none());
    }

    #[test]
    fn test_one_outstanding_at_a_time() {
        let mut sender = ReliableSender::new();
        let first = sender.submit(ringing(), T1).unwrap();
        let rseq = reliable_rseq(&first).unwrap();
        assert!(sender.submit(ringing(), T1).is_none());

        let (_, interval) = sender.retransmit().unwrap();
        assert_eq!(interval, T1 * 2);

        let wrong = RAck {
            rseq: rseq + 1,
            cseq: 7,
            method: SipMethod::Invite,
        };
        assert!(!sender.acknowledge(&wrong, 7));

        let right = RAck {
            rseq,
            cseq: 7,
            method: SipMethod::Invite,
        };
        assert!(sender.acknowledge(&right, 7));
        let second = sender.next(T1).unwrap();
        assert_eq!(reliable_rseq(&second), Some(rseq + 1));
        assert!(!sender.is_idle());
    }

    #[test]
    fn test_receiver_ignores_duplicates() {
        let mut receiver = ReliableReceiver::default();
        assert!(receiver.accept(10));
        assert!(!receiver.accept(10));
        assert!(receiver.accept(11));
        assert!(!receiver.accept(9));
    }

    #[test]
    fn test_unreliable_provisional_has_no_rseq() {
        assert_eq!(reliable_rseq(&ringing()), None);
    }
}
