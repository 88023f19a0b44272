//! Forking proxy and dispatch integration tests
//!
//! The server runs on an in-process transport: every test plays the
//! upstream UA and the downstream contacts by feeding messages to
//! `SipServer::handle_incoming` and reading what it puts on the wire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sipflow::domain::location::LocationStore;
use sipflow::infrastructure::persistence::InMemoryLocationStore;
use sipflow::infrastructure::protocols::sip::builder::ResponseBuilder;
use sipflow::infrastructure::protocols::sip::{
    ChannelTransport, IncomingMessage, OptionsHandler, OutgoingMessage, Registrar, RegistrarSettings, ServerProfile,
    SipHeaders, SipMessage, SipMethod, SipRequest, SipResponse, SipServer, SipTimers, TransactionKey,
    TransactionLayer, TransactionRole, TransportProtocol,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const UPSTREAM: &str = "10.0.0.1";
const CONTACT_A: &str = "sip:bob@10.0.0.21:5060";
const CONTACT_B: &str = "sip:bob@10.0.0.22:5060";

struct Harness {
    server: SipServer,
    location: Arc<InMemoryLocationStore>,
    wire: UnboundedReceiver<OutgoingMessage>,
}

#[tokio::test]
async fn test_fork_success_cancels_proceeding_branch() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], None).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();

    let trying = next(&mut h.wire).await;
    assert_eq!(status(&trying), Some(100));
    let (branch_a, branch_b) = branches(&mut h.wire).await;

    // Forwarding mutations
    for branch in [&branch_a, &branch_b] {
        assert_eq!(branch.vias().len(), 2);
        assert_eq!(branch.max_forwards(), Some(69));
        assert_eq!(branch.header("Record-Route"), Some("<sip:10.0.0.10:5060;lr>".to_string()));
    }
    assert_eq!(branch_a.uri_string(), CONTACT_A);

    // A rings, the ringing is relayed with one Via less
    feed_response(&h, "10.0.0.21", response(&branch_a, 180, "ta")).await;
    let ringing = next(&mut h.wire).await;
    assert_eq!(ringing.target.host, UPSTREAM);
    let ringing = ringing.message.as_response().cloned().unwrap();
    assert_eq!(ringing.status_code(), 180);
    assert_eq!(ringing.vias().len(), 1);

    // B answers first: 200 upstream, CANCEL to the ringing branch
    feed_response(&h, "10.0.0.22", response(&branch_b, 200, "tb")).await;
    let ok = next(&mut h.wire).await;
    assert_eq!(ok.target.host, UPSTREAM);
    assert_eq!(status(&ok), Some(200));
    let cancel = next(&mut h.wire).await;
    assert_eq!(cancel.target.host, "10.0.0.21");
    assert_eq!(
        cancel.message.as_request().and_then(|r| r.method()),
        Some(SipMethod::Cancel)
    );

    // A's late 487 is absorbed by its transaction, never relayed
    feed_response(&h, "10.0.0.21", response(&branch_a, 487, "ta")).await;
    let ack = next(&mut h.wire).await;
    assert_eq!(ack.target.host, "10.0.0.21");
    assert_eq!(ack.message.as_request().and_then(|r| r.method()), Some(SipMethod::Ack));
    quiet(&mut h.wire).await;
    assert_eq!(h.server.proxy().context_count().await, 0);

    // The ACK for the 200 is forwarded statelessly along the recorded route
    let upstream_ack = request(&format!(
        "ACK {} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKack1\r\n\
         Route: <sip:10.0.0.10:5060;lr>\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>;tag=tb\r\n\
         Call-ID: fork-1\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        CONTACT_B
    ));
    h.server.handle_incoming(from_upstream(upstream_ack)).await.unwrap();
    let forwarded = next(&mut h.wire).await;
    assert_eq!(forwarded.target.host, "10.0.0.22");
    let forwarded = forwarded.message.as_request().cloned().unwrap();
    assert!(forwarded.routes().is_empty());
    assert_eq!(forwarded.vias().len(), 2);
}

#[tokio::test]
async fn test_fork_success_drops_silent_branch_without_cancel() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], None).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    next(&mut h.wire).await;
    let (_branch_a, branch_b) = branches(&mut h.wire).await;

    feed_response(&h, "10.0.0.22", response(&branch_b, 200, "tb")).await;
    let ok = next(&mut h.wire).await;
    assert_eq!(status(&ok), Some(200));

    // A never answered: no CANCEL goes out
    quiet(&mut h.wire).await;
    assert_eq!(h.server.proxy().context_count().await, 0);
}

#[tokio::test]
async fn test_last_failure_is_relayed() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], None).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    next(&mut h.wire).await;
    let (branch_a, branch_b) = branches(&mut h.wire).await;

    feed_response(&h, "10.0.0.21", response(&branch_a, 486, "ta")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    feed_response(&h, "10.0.0.22", response(&branch_b, 408, "tb")).await;

    let finals = upstream_finals(&mut h.wire).await;
    assert_eq!(finals, vec![408]);
}

#[tokio::test(start_paused = true)]
async fn test_branch_timeout_becomes_408() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], Some(Duration::from_secs(1))).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    next(&mut h.wire).await;
    let (branch_a, _branch_b) = branches(&mut h.wire).await;

    feed_response(&h, "10.0.0.21", response(&branch_a, 486, "ta")).await;

    // B stays silent until Timer C fires
    let finals = upstream_finals(&mut h.wire).await;
    assert_eq!(finals, vec![408]);
}

#[tokio::test]
async fn test_upstream_cancel_ends_fork_with_487() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], None).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    next(&mut h.wire).await;
    let (branch_a, _branch_b) = branches(&mut h.wire).await;

    feed_response(&h, "10.0.0.21", response(&branch_a, 180, "ta")).await;
    assert_eq!(status(&next(&mut h.wire).await), Some(180));

    let cancel = request(
        "CANCEL sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKup1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: fork-1\r\n\
         CSeq: 1 CANCEL\r\n\
         Content-Length: 0\r\n\r\n",
    );
    h.server.handle_incoming(from_upstream(cancel)).await.unwrap();

    let cancel_ok = next(&mut h.wire).await;
    let cancel_ok = cancel_ok.message.as_response().cloned().unwrap();
    assert_eq!(cancel_ok.status_code(), 200);
    assert_eq!(cancel_ok.cseq_method(), Some(SipMethod::Cancel));

    // Only the ringing branch gets a CANCEL on the wire
    let downstream_cancel = next(&mut h.wire).await;
    assert_eq!(downstream_cancel.target.host, "10.0.0.21");
    quiet(&mut h.wire).await;

    feed_response(&h, "10.0.0.21", response(&branch_a, 487, "ta")).await;
    let finals = upstream_finals(&mut h.wire).await;
    assert_eq!(finals, vec![487]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_c_cancels_ringing_branch() {
    let mut h = harness(&[CONTACT_A], Some(Duration::from_secs(1))).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    assert_eq!(status(&next(&mut h.wire).await), Some(100));
    let forwarded = next(&mut h.wire).await;
    assert_eq!(forwarded.target.host, "10.0.0.21");
    let branch_a = forwarded.message.as_request().cloned().unwrap();

    feed_response(&h, "10.0.0.21", response(&branch_a, 180, "ta")).await;
    assert_eq!(status(&next(&mut h.wire).await), Some(180));

    // A keeps ringing past Timer C
    let cancel = next(&mut h.wire).await;
    assert_eq!(cancel.target.host, "10.0.0.21");
    let cancel = cancel.message.as_request().cloned().unwrap();
    assert_eq!(cancel.method(), Some(SipMethod::Cancel));
    assert_eq!(
        cancel.top_via().map(|v| v.branch().map(str::to_string)),
        branch_a.top_via().map(|v| v.branch().map(str::to_string))
    );

    assert_eq!(upstream_finals(&mut h.wire).await, vec![408]);
    assert_eq!(h.server.proxy().context_count().await, 0);
}

#[tokio::test]
async fn test_repeated_cancel_sends_one_downstream_cancel() {
    let mut h = harness(&[CONTACT_A, CONTACT_B], None).await;
    h.server.handle_incoming(from_upstream(invite(70))).await.unwrap();
    next(&mut h.wire).await;
    let (branch_a, _branch_b) = branches(&mut h.wire).await;

    feed_response(&h, "10.0.0.21", response(&branch_a, 180, "ta")).await;
    assert_eq!(status(&next(&mut h.wire).await), Some(180));

    let cancel = request(
        "CANCEL sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKup1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: fork-1\r\n\
         CSeq: 1 CANCEL\r\n\
         Content-Length: 0\r\n\r\n",
    );
    h.server.handle_incoming(from_upstream(cancel.clone())).await.unwrap();
    let mut downstream_cancels = 0;
    let mut cancel_oks = 0;
    for message in [next(&mut h.wire).await, next(&mut h.wire).await] {
        match message.target.host.as_str() {
            "10.0.0.21" => downstream_cancels += 1,
            UPSTREAM => cancel_oks += 1,
            other => panic!("unexpected message to {}", other),
        }
    }

    // Retransmitted CANCEL only gets its 200 again
    h.server.handle_incoming(from_upstream(cancel)).await.unwrap();
    let again = next(&mut h.wire).await;
    assert_eq!(again.target.host, UPSTREAM);
    assert_eq!(status(&again), Some(200));

    // Local cancellation on top of it changes nothing
    let server_key = TransactionKey::from_request(&invite(70), TransactionRole::Server).unwrap();
    h.server.proxy().cancel(&server_key).await;
    quiet(&mut h.wire).await;
    assert_eq!((downstream_cancels, cancel_oks), (1, 1));

    feed_response(&h, "10.0.0.21", response(&branch_a, 487, "ta")).await;
    assert_eq!(upstream_finals(&mut h.wire).await, vec![487]);
}

#[tokio::test]
async fn test_max_forwards_zero_rejected_without_forwarding() {
    let mut h = harness(&[CONTACT_A], None).await;
    h.server.handle_incoming(from_upstream(invite(0))).await.unwrap();

    let rejected = next(&mut h.wire).await;
    assert_eq!(rejected.target.host, UPSTREAM);
    assert_eq!(status(&rejected), Some(483));
    quiet(&mut h.wire).await;
}

#[tokio::test]
async fn test_dispatch_rejections() {
    let mut h = harness(&[], None).await;
    h.server
        .register_handler(SipMethod::Options, Arc::new(OptionsHandler))
        .await;

    let options = request(
        "OPTIONS sip:example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKopt\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:example.com>\r\n\
         Call-ID: opt-1\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
    );
    h.server.handle_incoming(from_upstream(options)).await.unwrap();
    let ok = next(&mut h.wire).await;
    let ok = ok.message.as_response().cloned().unwrap();
    assert_eq!(ok.status_code(), 200);
    assert!(ok.has_header("Allow"));

    // bob is known but has no contacts
    let cases = [("sip:bob@example.com", 480), ("sip:carol@example.com", 404), ("sip:dave@elsewhere.org", 403)];
    for (i, (uri, code)) in cases.iter().enumerate() {
        let req = request(&format!(
            "INVITE {} SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKrej{}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:alice@example.com>;tag=a1\r\n\
             To: <{}>\r\n\
             Call-ID: rej-{}\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
            uri, i, uri, i
        ));
        h.server.handle_incoming(from_upstream(req)).await.unwrap();
        assert_eq!(upstream_finals(&mut h.wire).await, vec![*code], "for {}", uri);
    }
}

#[tokio::test]
async fn test_wildcard_register_keeps_static_contacts() {
    let mut h = harness(&[], None).await;
    h.location
        .add_static_user("alice", &["sip:alice@desk.example.com".to_string()])
        .await;
    h.location
        .add_contact("alice", "sip:alice@10.0.0.1:5060", Utc::now() + chrono::Duration::seconds(600))
        .await
        .unwrap();
    let registrar = Registrar::new(h.location.clone(), RegistrarSettings::default());
    h.server
        .register_handler(SipMethod::Register, Arc::new(registrar))
        .await;

    let register = request(
        "REGISTER sip:example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKreg1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=r1\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: reg-1\r\n\
         CSeq: 2 REGISTER\r\n\
         Contact: *\r\n\
         Expires: 0\r\n\
         Content-Length: 0\r\n\r\n",
    );
    h.server.handle_incoming(from_upstream(register)).await.unwrap();
    assert_eq!(status(&next(&mut h.wire).await), Some(200));

    let left = h.location.contacts_of("alice").await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].uri, "sip:alice@desk.example.com");
    assert!(left[0].is_static());
}

// ----- helpers ---------------------------------------------------------------

fn profile() -> ServerProfile {
    ServerProfile {
        host: "10.0.0.10".to_string(),
        port: 5060,
        domains: vec!["example.com".to_string()],
        record_route: true,
        ..ServerProfile::default()
    }
}

/// Long T1 so nothing is retransmitted while a test runs
fn slow_timers() -> SipTimers {
    SipTimers {
        t1: Duration::from_secs(10),
        t2: Duration::from_secs(40),
        t4: Duration::from_secs(50),
    }
}

async fn harness(contacts: &[&str], timer_c: Option<Duration>) -> Harness {
    let (transport, wire) = ChannelTransport::new();
    let transactions = Arc::new(TransactionLayer::new(Arc::new(transport), slow_timers()).with_timer_c(timer_c));
    transactions.start();

    let location = Arc::new(InMemoryLocationStore::new());
    location.add_user("bob").await.unwrap();
    for contact in contacts {
        location
            .add_contact("bob", contact, Utc::now() + chrono::Duration::seconds(3600))
            .await
            .unwrap();
    }

    let server = SipServer::new(profile(), transactions, location.clone());
    Harness { server, location, wire }
}

fn request(data: &str) -> SipRequest {
    SipRequest::parse(data.as_bytes()).unwrap()
}

fn invite(max_forwards: u32) -> SipRequest {
    request(&format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKup1\r\n\
         Max-Forwards: {}\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: fork-1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@10.0.0.1:5060>\r\n\
         Content-Length: 0\r\n\r\n",
        max_forwards
    ))
}

fn response(branch: &SipRequest, code: u16, tag: &str) -> SipResponse {
    ResponseBuilder::new(code)
        .to_tag(tag)
        .with("Contact", format!("<{}>", branch.uri_string()))
        .build_for_request(branch)
        .unwrap()
}

fn from_upstream(request: SipRequest) -> IncomingMessage {
    IncomingMessage::new(request.into(), "10.0.0.1:5060".parse().unwrap(), TransportProtocol::Udp)
}

async fn feed_response(h: &Harness, host: &str, response: SipResponse) {
    let source = format!("{}:5060", host).parse().unwrap();
    h.server
        .handle_incoming(IncomingMessage::new(response.into(), source, TransportProtocol::Udp))
        .await
        .unwrap();
}

async fn next(wire: &mut UnboundedReceiver<OutgoingMessage>) -> OutgoingMessage {
    timeout(Duration::from_secs(2), wire.recv())
        .await
        .expect("nothing sent")
        .expect("transport closed")
}

async fn quiet(wire: &mut UnboundedReceiver<OutgoingMessage>) {
    if let Ok(Some(message)) = timeout(Duration::from_millis(200), wire.recv()).await {
        panic!("unexpected message to {}: {:?}", message.target, message.message);
    }
}

fn status(message: &OutgoingMessage) -> Option<u16> {
    match &message.message {
        SipMessage::Response(response) => Some(response.status_code()),
        SipMessage::Request(_) => None,
    }
}

/// The two forked INVITEs, as (contact A, contact B)
async fn branches(wire: &mut UnboundedReceiver<OutgoingMessage>) -> (SipRequest, SipRequest) {
    let first = next(wire).await;
    let second = next(wire).await;
    let mut a = None;
    let mut b = None;
    for message in [first, second] {
        let request = message.message.as_request().cloned().unwrap();
        match message.target.host.as_str() {
            "10.0.0.21" => a = Some(request),
            "10.0.0.22" => b = Some(request),
            other => panic!("branch sent to {}", other),
        }
    }
    (a.unwrap(), b.unwrap())
}

/// Final responses relayed upstream until the wire goes quiet
async fn upstream_finals(wire: &mut UnboundedReceiver<OutgoingMessage>) -> Vec<u16> {
    let mut finals = Vec::new();
    while let Ok(Some(message)) = timeout(Duration::from_secs(2), wire.recv()).await {
        if message.target.host != UPSTREAM {
            continue;
        }
        if let Some(code) = status(&message).filter(|code| *code >= 200) {
            finals.push(code);
            // Anything after the first final would break the invariant
            if let Ok(Some(extra)) = timeout(Duration::from_millis(200), wire.recv()).await {
                if extra.target.host == UPSTREAM {
                    if let Some(code) = status(&extra).filter(|code| *code >= 200) {
                        finals.push(code);
                    }
                }
            }
            break;
        }
    }
    finals
}
