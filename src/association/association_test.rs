use super::*;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsnStream;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::chunk::chunk_shutdown::{ChunkShutdown, ChunkShutdownComplete};
use crate::chunk::chunk_type::ChunkType;
use crate::cookie::StateCookie;

use assert_matches::assert_matches;
use ring::hmac;
use std::iter;

const CLIENT_TAG: u32 = 0x1111_1111;
const SERVER_TAG: u32 = 0x2222_2222;
const SERVER_TSN: u32 = 5000;

fn addr(i: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, i], 5000))
}

fn authenticator(epoch: Instant) -> Authenticator {
    Authenticator::new(
        hmac::Key::new(hmac::HMAC_SHA256, b"association test secret"),
        epoch,
    )
}

fn client(config: TransportConfig, destinations: &[SocketAddr], now: Instant) -> Association {
    let mut a = Association::new(
        Side::Client,
        Arc::new(config),
        authenticator(now),
        CLIENT_TAG,
        destinations,
    );
    a.associate(now);
    a
}

fn transmits(a: &mut Association, now: Instant) -> Vec<Transmit> {
    iter::from_fn(|| a.poll_transmit(now)).collect()
}

fn events(a: &mut Association) -> Vec<Event> {
    iter::from_fn(|| a.poll()).collect()
}

fn receive(a: &mut Association, now: Instant, from: SocketAddr, vtag: u32, chunks: Vec<Chunk>) {
    a.handle_event(AssociationEvent(AssociationEventInner::Datagram(Transmit {
        now,
        remote: from,
        payload: Packet {
            verification_tag: vtag,
            chunks,
        },
    })));
}

fn init_ack() -> ChunkInit {
    ChunkInit {
        initiate_tag: SERVER_TAG,
        advertised_receiver_window_credit: 65535,
        num_outbound_streams: 4,
        num_inbound_streams: 4,
        initial_tsn: SERVER_TSN,
        addresses: vec![],
        cookie_preservative: None,
        state_cookie: Some(Bytes::from_static(b"opaque state cookie")),
        forward_tsn_supported: true,
    }
}

fn established(config: TransportConfig, destinations: &[SocketAddr], now: Instant) -> Association {
    let mut a = client(config, destinations, now);
    receive(&mut a, now, destinations[0], CLIENT_TAG, vec![Chunk::InitAck(init_ack())]);
    receive(&mut a, now, destinations[0], CLIENT_TAG, vec![Chunk::CookieAck]);
    assert_eq!(a.state(), AssociationState::Established);
    transmits(&mut a, now);
    events(&mut a);
    a
}

fn sack(cumulative_tsn_ack: u32, arwnd: u32, gaps: &[(u16, u16)]) -> Chunk {
    Chunk::SelectiveAck(ChunkSelectiveAck {
        cumulative_tsn_ack,
        advertised_receiver_window_credit: arwnd,
        gap_ack_blocks: gaps
            .iter()
            .map(|&(start, end)| GapAckBlock { start, end })
            .collect(),
        duplicate_tsn: vec![],
    })
}

fn data(tsn: u32, stream_identifier: u16, stream_sequence_number: u16, payload: &'static [u8]) -> Chunk {
    Chunk::PayloadData(ChunkPayloadData {
        tsn,
        stream_identifier,
        stream_sequence_number,
        user_data: Bytes::from_static(payload),
        ..Default::default()
    })
}

/// TSNs of every DATA chunk in `transmits`, in order
fn data_tsns(transmits: &[Transmit]) -> Vec<u32> {
    transmits
        .iter()
        .flat_map(|t| t.payload.chunks.iter())
        .filter_map(|c| match c {
            Chunk::PayloadData(d) => Some(d.tsn),
            _ => None,
        })
        .collect()
}

fn send(a: &mut Association, now: Instant, len: usize) -> Result<()> {
    a.send(now, 0, Bytes::from(vec![0xab; len]), SendOptions::default())
}

#[test]
fn test_handshake_over_two_destinations() {
    let now = Instant::now();
    let destinations = [addr(1), addr(2)];
    let mut a = client(TransportConfig::default(), &destinations, now);
    assert_eq!(a.state(), AssociationState::CookieWait);

    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].remote, addr(1));
    assert_eq!(t[0].payload.verification_tag, 0, "INIT goes out with a zero tag");
    assert_matches!(&t[0].payload.chunks[..], [Chunk::Init(init)] if init.initiate_tag == CLIENT_TAG);
    assert_eq!(a.poll_timeout(), Some(now + Duration::from_millis(3000)));

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::InitAck(init_ack())]);
    assert_eq!(a.state(), AssociationState::CookieEchoed);
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].remote, addr(1));
    assert_eq!(t[0].payload.verification_tag, SERVER_TAG);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::CookieEcho(c)] if Some(c.cookie.clone()) == init_ack().state_cookie
    );
    assert!(!a.timers.is_running(Timer::T1Init));
    assert!(a.timers.is_running(Timer::T1Cookie));

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::CookieAck]);
    assert_eq!(a.state(), AssociationState::Established);
    assert!(!a.timers.is_running(Timer::T1Cookie));
    assert_eq!(
        events(&mut a),
        vec![Event::CommunicationUp {
            paths: 2,
            inbound_streams: 4,
            outbound_streams: 4,
        }]
    );
    assert!(a.use_forward_tsn());
    assert_eq!(a.path_state(PathId(1)), Some(PathState::Unconfirmed));

    // a late duplicate COOKIE ACK changes nothing
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::CookieAck]);
    assert!(events(&mut a).is_empty());
}

#[test]
fn test_init_retransmissions_exhausted() {
    let now = Instant::now();
    let config = TransportConfig::default().with_max_init_retransmissions(2);
    let mut a = client(config, &[addr(1)], now);

    let mut inits = transmits(&mut a, now).len();
    let mut t = now;
    let mut expected_rto = 3000;
    while a.state() == AssociationState::CookieWait {
        let next = a.poll_timeout().expect("T1-init running");
        assert_eq!(next, t + Duration::from_millis(expected_rto));
        t = next;
        a.handle_timeout(t);
        inits += transmits(&mut a, t).len();
        expected_rto *= 2;
    }

    assert_eq!(inits, 3, "the first INIT and two retransmissions");
    assert_eq!(a.state(), AssociationState::Closed);
    assert_eq!(
        events(&mut a),
        vec![Event::CommunicationLost {
            reason: CommunicationLostReason::ExceededRetransmissions
        }]
    );
    assert_eq!(a.poll_timeout(), None);
    assert_matches!(a.poll_endpoint_event(), Some(e) if e.is_drained());
}

#[test]
fn test_send_errors() {
    let now = Instant::now();
    let mut a = client(TransportConfig::default(), &[addr(1)], now);
    assert_eq!(send(&mut a, now, 10), Err(Error::ErrAssociationNotEstablished));

    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    assert_eq!(
        a.send(now, 0, Bytes::new(), SendOptions::default()),
        Err(Error::ErrNoUserData)
    );
    assert_eq!(
        send(&mut a, now, 1473),
        Err(Error::ErrPayloadTooLarge {
            size: 1473,
            max: 1472
        })
    );
    assert_eq!(
        a.send(now, 4, Bytes::from_static(b"x"), SendOptions::default()),
        Err(Error::ErrInvalidStreamIdentifier(4))
    );
    let options = SendOptions {
        destination: Some(PathId(3)),
        ..Default::default()
    };
    assert_eq!(
        a.send(now, 0, Bytes::from_static(b"x"), options),
        Err(Error::ErrUnknownPath(3))
    );
    assert_eq!(send(&mut a, now, 1472), Ok(()));
}

#[test]
fn test_graceful_shutdown_waits_for_outstanding_data() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    let itsn = a.my_initial_tsn;

    send(&mut a, now, 5).unwrap();
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn]);

    a.shutdown(now).unwrap();
    assert_eq!(a.state(), AssociationState::ShutdownPending);
    assert!(transmits(&mut a, now).is_empty(), "SHUTDOWN waits for the SACK");
    assert_eq!(send(&mut a, now, 5), Err(Error::ErrShutdownInProgress));

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn, 65535, &[])]);
    assert_eq!(a.state(), AssociationState::ShutdownSent);
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Shutdown(ChunkShutdown { cumulative_tsn_ack })] if *cumulative_tsn_ack == SERVER_TSN - 1
    );
    assert!(a.timers.is_running(Timer::T2Shutdown));

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::ShutdownAck]);
    assert!(a.is_closed());
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, SERVER_TAG);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::ShutdownComplete(ChunkShutdownComplete { tag_reflected: false })]
    );
    assert!(events(&mut a).contains(&Event::ShutdownComplete));
    assert_matches!(a.poll_endpoint_event(), Some(e) if e.is_drained());
    assert_eq!(a.poll_timeout(), None);
}

#[test]
fn test_shutdown_received() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    let ctsna = a.my_initial_tsn.wrapping_sub(1);

    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Shutdown(ChunkShutdown {
            cumulative_tsn_ack: ctsna,
        })],
    );
    assert_eq!(a.state(), AssociationState::ShutdownAckSent);
    assert_eq!(send(&mut a, now, 5), Err(Error::ErrShutdownInProgress));
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_matches!(&t[0].payload.chunks[..], [Chunk::ShutdownAck]);

    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::ShutdownComplete(ChunkShutdownComplete {
            tag_reflected: false,
        })],
    );
    assert!(a.is_closed());
    assert_eq!(
        events(&mut a),
        vec![Event::ShutdownReceived, Event::ShutdownComplete]
    );
}

#[test]
fn test_shutdown_ack_retransmitted_on_t2() {
    let now = Instant::now();
    let config = TransportConfig::default().with_max_association_retransmissions(1);
    let mut a = established(config, &[addr(1)], now);
    a.shutdown(now).unwrap();
    assert_eq!(a.state(), AssociationState::ShutdownSent);
    transmits(&mut a, now);

    let t1 = now + Duration::from_millis(3000);
    a.handle_timeout(t1);
    let t = transmits(&mut a, t1);
    assert_matches!(&t[0].payload.chunks[..], [Chunk::Shutdown(_)]);
    assert_eq!(a.poll_timeout(), Some(t1 + Duration::from_millis(6000)));

    a.handle_timeout(t1 + Duration::from_millis(6000));
    assert!(a.is_closed());
    assert_eq!(
        events(&mut a),
        vec![Event::CommunicationLost {
            reason: CommunicationLostReason::ExceededRetransmissions
        }]
    );
}

#[test]
fn test_slow_start_and_idle_reset() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;
    assert_eq!(a.cwnd(PathId(0)), Some(3000));
    assert_eq!(a.ssthresh(PathId(0)), Some(65535));

    for _ in 0..3 {
        send(&mut a, now, 750).unwrap();
    }
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn, itsn + 1, itsn + 2]);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 1, 65535, &[])]);
    assert_eq!(a.cwnd(PathId(0)), Some(4500), "cwnd grows by at most one MTU");
    assert_eq!(a.buffered_amount(), 750);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 2, 65535, &[])]);
    assert_eq!(a.cwnd(PathId(0)), Some(5250));

    // nothing sent for longer than an RTO
    let later = now + Duration::from_secs(61);
    send(&mut a, later, 100).unwrap();
    assert_eq!(a.cwnd(PathId(0)), Some(3000));
    assert_eq!(data_tsns(&transmits(&mut a, later)), vec![itsn + 3]);
}

#[test]
fn test_idle_for_one_rto_resets_cwnd() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;
    for _ in 0..3 {
        send(&mut a, now, 750).unwrap();
    }
    transmits(&mut a, now);
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 2, 65535, &[])]);
    assert_eq!(a.cwnd(PathId(0)), Some(4500));

    let rto = Duration::from_millis(a.rto(PathId(0)).unwrap());
    let busy = now + rto - Duration::from_millis(1);
    send(&mut a, busy, 100).unwrap();
    assert_eq!(a.cwnd(PathId(0)), Some(4500));
    assert_eq!(data_tsns(&transmits(&mut a, busy)), vec![itsn + 3]);

    let idle = busy + rto;
    send(&mut a, idle, 100).unwrap();
    assert_eq!(a.cwnd(PathId(0)), Some(3000));
}

#[test]
fn test_congestion_avoidance_uses_flight_size_at_sack() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;
    a.flow.cparams[0].ssthresh = 1000;
    assert_eq!(a.cwnd(PathId(0)), Some(3000));

    for _ in 0..3 {
        send(&mut a, now, 1000).unwrap();
    }
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn, itsn + 1, itsn + 2]);

    let acked = now + Duration::from_millis(100);
    receive(&mut a, acked, addr(1), CLIENT_TAG, vec![sack(itsn + 2, 65535, &[])]);
    assert_eq!(a.cwnd(PathId(0)), Some(4500), "a full window was acked");
    assert_eq!(a.buffered_amount(), 0);

    // the window is not fully used, so it does not grow
    let next = acked + Duration::from_millis(100);
    send(&mut a, next, 1000).unwrap();
    assert_eq!(data_tsns(&transmits(&mut a, next)), vec![itsn + 3]);
    let later = next + Duration::from_millis(200);
    receive(&mut a, later, addr(1), CLIENT_TAG, vec![sack(itsn + 3, 65535, &[])]);
    assert_eq!(a.cwnd(PathId(0)), Some(4500));
    assert_eq!(a.flow.cparams[0].partial_bytes_acked, 0);
}

#[test]
fn test_fast_retransmit_once_then_recovery_exit() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;

    for _ in 0..5 {
        send(&mut a, now, 100).unwrap();
    }
    assert_eq!(data_tsns(&transmits(&mut a, now)).len(), 5);

    // the first TSN is missing, later ones arrive one by one
    let ctsna = itsn.wrapping_sub(1);
    for end in 2..=4 {
        receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(ctsna, 65535, &[(2, end)])]);
        assert!(transmits(&mut a, now).is_empty());
    }
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(ctsna, 65535, &[(2, 5)])]);
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn]);
    assert_eq!(a.stats().get_num_fast_retrans(), 1);
    assert!(a.reliable.is_in_fast_recovery());
    assert_eq!(a.cwnd(PathId(0)), Some(3000));

    // further miss indications never trigger a second fast retransmit
    for i in 1..=4 {
        receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(ctsna, 65535 - i, &[(2, 5)])]);
        assert!(transmits(&mut a, now).is_empty());
    }
    assert_eq!(a.stats().get_num_fast_retrans(), 1);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 3, 65535, &[(2, 2)])]);
    assert!(a.reliable.is_in_fast_recovery(), "exit point not reached yet");
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 4, 65535, &[])]);
    assert!(!a.reliable.is_in_fast_recovery());
    assert_eq!(a.buffered_amount(), 0);
}

#[test]
fn test_duplicate_sack_is_ignored() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;
    send(&mut a, now, 100).unwrap();
    send(&mut a, now, 100).unwrap();
    transmits(&mut a, now);

    let s = sack(itsn.wrapping_sub(1), 65535, &[(2, 2)]);
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![s.clone()]);
    let reports = a.reliable.queue.get(itsn).map(|c| c.gap_reports);
    let cwnd = a.cwnd(PathId(0));
    let rwnd = a.peer_rwnd();

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![s]);
    assert_eq!(a.reliable.queue.get(itsn).map(|c| c.gap_reports), reports);
    assert_eq!(a.cwnd(PathId(0)), cwnd);
    assert_eq!(a.peer_rwnd(), rwnd);
    assert_eq!(a.stats().get_num_sacks_received(), 2);
}

#[test]
fn test_expired_message_is_abandoned_with_forward_tsn() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    let itsn = a.my_initial_tsn;

    let options = SendOptions {
        lifetime: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    a.send(now, 1, Bytes::from_static(b"hello"), options).unwrap();
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn]);

    let t3 = now + Duration::from_millis(3000);
    a.handle_timeout(t3);
    let t = transmits(&mut a, t3);
    assert_eq!(t.len(), 1);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::ForwardTsn(f)] if f.new_cumulative_tsn == itsn
            && f.streams.len() == 1
            && f.streams[0].identifier == 1
            && f.streams[0].sequence == 0
    );
    assert_eq!(
        events(&mut a),
        vec![Event::SendFailure {
            stream_identifier: 1,
            data: Bytes::from_static(b"hello"),
            reason: SendFailureReason::Abandoned,
        }]
    );
    assert_eq!(a.stats().get_num_forward_tsns(), 1);
}

#[test]
fn test_unsent_message_expires_in_queue() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);

    // fill the congestion window so the next message stays queued
    send(&mut a, now, 1400).unwrap();
    send(&mut a, now, 1400).unwrap();
    send(&mut a, now, 1400).unwrap();
    let options = SendOptions {
        lifetime: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    a.send(now, 0, Bytes::from_static(b"late"), options).unwrap();
    assert_eq!(a.send_queue_len(), 1);
    transmits(&mut a, now);

    let later = now + Duration::from_millis(20);
    let itsn = a.my_initial_tsn;
    receive(&mut a, later, addr(1), CLIENT_TAG, vec![sack(itsn + 2, 65535, &[])]);
    assert_eq!(a.send_queue_len(), 0);
    assert!(data_tsns(&transmits(&mut a, later)).is_empty());
    assert!(events(&mut a).contains(&Event::SendFailure {
        stream_identifier: 0,
        data: Bytes::from_static(b"late"),
        reason: SendFailureReason::Abandoned,
    }));
}

#[test]
fn test_peer_restart() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    send(&mut a, now, 5).unwrap();
    transmits(&mut a, now);

    let cookie = StateCookie {
        local_tag: 0x3333_3333,
        peer_tag: 0x4444_4444,
        local_initial_tsn: 700,
        peer_initial_tsn: 900,
        num_outbound_streams: 2,
        num_inbound_streams: 2,
        peer_receiver_window: 65535,
        local_tie_tag: CLIENT_TAG,
        peer_tie_tag: SERVER_TAG,
        created: a.authenticator.now_ms(now),
        lifetime: 60000,
        forward_tsn: true,
        peer_addresses: vec![],
    };
    let sealed = a.authenticator.seal(&cookie);
    receive(
        &mut a,
        now,
        addr(1),
        0x3333_3333,
        vec![Chunk::CookieEcho(ChunkCookieEcho { cookie: sealed })],
    );

    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.my_verification_tag(), 0x3333_3333);
    assert_eq!(a.peer_verification_tag(), 0x4444_4444);
    assert_eq!(a.num_outbound_streams(), 2);
    assert_eq!(
        events(&mut a),
        vec![
            Event::SendFailure {
                stream_identifier: 0,
                data: Bytes::from(vec![0xab; 5]),
                reason: SendFailureReason::Unacknowledged,
            },
            Event::Restart,
        ]
    );
    assert_matches!(
        a.poll_endpoint_event(),
        Some(EndpointEvent(EndpointEventInner::LocalTagChanged(0x3333_3333)))
    );

    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, 0x4444_4444);
    assert_matches!(&t[0].payload.chunks[..], [Chunk::CookieAck]);

    send(&mut a, now, 5).unwrap();
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![700]);
}

const PEER_TAG: u32 = 0x5555_5555;

fn peer_init(initiate_tag: u32) -> Chunk {
    Chunk::Init(ChunkInit {
        initiate_tag,
        state_cookie: None,
        ..init_ack()
    })
}

/// The INIT-ACK `a` answered with, and the cookie inside it
fn answered_init_ack(a: &mut Association, now: Instant, vtag: u32) -> (ChunkInit, StateCookie) {
    let t = transmits(a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].remote, addr(1));
    assert_eq!(t[0].payload.verification_tag, vtag);
    let init_ack = match &t[0].payload.chunks[..] {
        [Chunk::InitAck(c)] => c.clone(),
        other => panic!("expected INIT-ACK, got {:?}", other),
    };
    let cookie = a
        .authenticator
        .open(init_ack.state_cookie.as_ref().expect("state cookie"))
        .unwrap();
    (init_ack, cookie)
}

#[test]
fn test_init_in_cookie_echoed_carries_tie_tags() {
    let now = Instant::now();
    let mut a = client(TransportConfig::default(), &[addr(1)], now);
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::InitAck(init_ack())]);
    transmits(&mut a, now);
    assert_eq!(a.state(), AssociationState::CookieEchoed);

    receive(&mut a, now, addr(1), 0, vec![peer_init(PEER_TAG)]);
    let (init_ack, cookie) = answered_init_ack(&mut a, now, PEER_TAG);
    assert_eq!(init_ack.initiate_tag, CLIENT_TAG);
    assert_eq!(init_ack.initial_tsn, a.my_initial_tsn);
    assert_eq!(cookie.local_tag, CLIENT_TAG);
    assert_eq!(cookie.peer_tag, PEER_TAG);
    assert_eq!((cookie.local_tie_tag, cookie.peer_tie_tag), (CLIENT_TAG, SERVER_TAG));
    assert_eq!(a.state(), AssociationState::CookieEchoed);
}

#[test]
fn test_init_in_established_answered_with_new_tag() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), 0, vec![peer_init(PEER_TAG)]);
    let (init_ack, cookie) = answered_init_ack(&mut a, now, PEER_TAG);
    assert_ne!(init_ack.initiate_tag, CLIENT_TAG);
    assert_eq!(cookie.local_tag, init_ack.initiate_tag);
    assert_eq!(cookie.peer_tag, PEER_TAG);
    assert_eq!((cookie.local_tie_tag, cookie.peer_tie_tag), (CLIENT_TAG, SERVER_TAG));

    // nothing changes until the COOKIE-ECHO
    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.my_verification_tag(), CLIENT_TAG);
    assert_eq!(a.peer_verification_tag(), SERVER_TAG);
    assert!(events(&mut a).is_empty());
}

#[test]
fn test_init_in_shutdown_ack_sent_resends_shutdown_ack() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    let cumulative_tsn_ack = a.my_initial_tsn.wrapping_sub(1);
    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Shutdown(ChunkShutdown {
            cumulative_tsn_ack,
        })],
    );
    assert_eq!(a.state(), AssociationState::ShutdownAckSent);
    transmits(&mut a, now);

    receive(&mut a, now, addr(1), 0, vec![peer_init(PEER_TAG)]);
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, SERVER_TAG);
    assert_matches!(&t[0].payload.chunks[..], [Chunk::ShutdownAck]);
    assert_eq!(a.state(), AssociationState::ShutdownAckSent);
}

#[test]
fn test_invalid_init_aborted_without_teardown() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    let zero_streams = Chunk::Init(ChunkInit {
        initiate_tag: PEER_TAG,
        num_inbound_streams: 0,
        state_cookie: None,
        ..init_ack()
    });
    for (init, vtag) in [(peer_init(0), 0), (zero_streams, PEER_TAG)] {
        receive(&mut a, now, addr(1), 0, vec![init]);
        let t = transmits(&mut a, now);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].payload.verification_tag, vtag);
        assert_matches!(
            &t[0].payload.chunks[..],
            [Chunk::Abort(c)] if !c.tag_reflected
                && c.error_causes[0].code == INVALID_MANDATORY_PARAMETER
        );
    }
    assert_eq!(a.state(), AssociationState::Established);
    assert!(events(&mut a).is_empty());
}

#[test]
fn test_cookie_echo_with_new_peer_tag_establishes() {
    let now = Instant::now();
    let mut a = client(TransportConfig::default(), &[addr(1)], now);
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::InitAck(init_ack())]);
    transmits(&mut a, now);
    assert_eq!(a.state(), AssociationState::CookieEchoed);

    // the peer's own INIT crossed ours and it answered our INIT-ACK
    let cookie = StateCookie {
        local_tag: CLIENT_TAG,
        peer_tag: PEER_TAG,
        local_initial_tsn: a.my_initial_tsn,
        peer_initial_tsn: 900,
        num_outbound_streams: 2,
        num_inbound_streams: 2,
        peer_receiver_window: 65535,
        local_tie_tag: CLIENT_TAG,
        peer_tie_tag: SERVER_TAG,
        created: a.authenticator.now_ms(now),
        lifetime: 60000,
        forward_tsn: true,
        peer_addresses: vec![],
    };
    let sealed = a.authenticator.seal(&cookie);
    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::CookieEcho(ChunkCookieEcho { cookie: sealed })],
    );

    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.my_verification_tag(), CLIENT_TAG);
    assert_eq!(a.peer_verification_tag(), PEER_TAG);
    assert_eq!(a.receive.cumulative_tsn(), 899);
    assert!(events(&mut a)
        .iter()
        .any(|e| matches!(e, Event::CommunicationUp { .. })));
    assert!(transmits(&mut a, now).iter().any(|t| {
        t.payload.verification_tag == PEER_TAG
            && matches!(&t.payload.chunks[..], [Chunk::CookieAck])
    }));
    assert!(!a.timers.is_running(Timer::T1Cookie));
}

#[test]
fn test_cookie_echo_of_earlier_init_discarded() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    // a cookie for an INIT the peer sent before this association existed
    let cookie = StateCookie {
        local_tag: 0x7777_7777,
        peer_tag: SERVER_TAG,
        local_initial_tsn: 700,
        peer_initial_tsn: 900,
        num_outbound_streams: 2,
        num_inbound_streams: 2,
        peer_receiver_window: 65535,
        local_tie_tag: 0,
        peer_tie_tag: 0,
        created: a.authenticator.now_ms(now),
        lifetime: 60000,
        forward_tsn: true,
        peer_addresses: vec![],
    };
    let sealed = a.authenticator.seal(&cookie);
    receive(
        &mut a,
        now,
        addr(1),
        0x7777_7777,
        vec![Chunk::CookieEcho(ChunkCookieEcho { cookie: sealed })],
    );

    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.my_verification_tag(), CLIENT_TAG);
    assert_eq!(a.peer_verification_tag(), SERVER_TAG);
    assert!(transmits(&mut a, now).is_empty());
    assert!(events(&mut a).is_empty());
}

#[test]
fn test_stale_cookie_error_restarts_handshake() {
    let now = Instant::now();
    let mut a = client(TransportConfig::default(), &[addr(1)], now);
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::InitAck(init_ack())]);
    transmits(&mut a, now);
    assert_eq!(a.state(), AssociationState::CookieEchoed);

    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Error(ChunkError {
            error_causes: vec![ErrorCause::stale_cookie(2_000_000)],
        })],
    );
    assert_eq!(a.state(), AssociationState::CookieWait);
    assert_eq!(a.peer_verification_tag(), 0);
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, 0);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Init(init)] if init.cookie_preservative == Some(4000)
    );
    assert_eq!(a.poll_timeout(), Some(now + Duration::from_millis(6000)));
    assert!(events(&mut a).is_empty());
}

#[test]
fn test_stale_cookie_echo_answered_with_error() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    let cookie = StateCookie {
        local_tag: 0x3333_3333,
        peer_tag: 0x4444_4444,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        peer_receiver_window: 65535,
        created: 0,
        lifetime: 60000,
        ..Default::default()
    };
    let sealed = a.authenticator.seal(&cookie);
    let later = now + Duration::from_secs(120);
    receive(
        &mut a,
        later,
        addr(1),
        0x3333_3333,
        vec![Chunk::CookieEcho(ChunkCookieEcho { cookie: sealed })],
    );

    let t = transmits(&mut a, later);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, 0x4444_4444);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Error(e)] if e.error_causes[0].staleness() == Some(60_000_000)
    );
    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.my_verification_tag(), CLIENT_TAG);
}

#[test]
fn test_user_abort() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    send(&mut a, now, 5).unwrap();

    a.abort(Bytes::from_static(b"bye")).unwrap();
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].payload.verification_tag, SERVER_TAG);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Abort(c)] if !c.tag_reflected && c.error_causes[0].code == USER_INITIATED_ABORT
    );
    assert_eq!(
        events(&mut a),
        vec![
            Event::SendFailure {
                stream_identifier: 0,
                data: Bytes::from(vec![0xab; 5]),
                reason: SendFailureReason::Unacknowledged,
            },
            Event::CommunicationLost {
                reason: CommunicationLostReason::Aborted
            },
        ],
        "communication lost is the last event"
    );
    assert!(a.is_closed());
    assert_eq!(a.abort(Bytes::new()), Err(Error::ErrAssociationClosed));
    assert_eq!(a.shutdown(now), Err(Error::ErrAssociationClosed));
}

#[test]
fn test_abort_received() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    // a reflected tag must be the peer's
    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Abort(ChunkAbort {
            tag_reflected: true,
            error_causes: vec![],
        })],
    );
    assert_eq!(a.state(), AssociationState::Established);

    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Abort(ChunkAbort {
            tag_reflected: false,
            error_causes: vec![],
        })],
    );
    assert!(a.is_closed());
    assert_eq!(
        events(&mut a),
        vec![Event::CommunicationLost {
            reason: CommunicationLostReason::Aborted
        }]
    );
    assert!(transmits(&mut a, now).is_empty());
}

#[test]
fn test_unexpected_chunks_are_ignored() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::CookieAck]);
    let mut other = init_ack();
    other.initiate_tag = 0x5555_5555;
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::InitAck(other)]);
    // wrong verification tag
    receive(&mut a, now, addr(1), SERVER_TAG, vec![sack(0, 1, &[])]);

    assert_eq!(a.state(), AssociationState::Established);
    assert_eq!(a.peer_verification_tag(), SERVER_TAG);
    assert!(transmits(&mut a, now).is_empty());
    assert!(events(&mut a).is_empty());
    assert_eq!(a.stats().get_num_sacks_received(), 0);
}

#[test]
fn test_unrecognized_chunk_reported() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    // upper bits 11: skip and report
    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::Unknown {
            typ: ChunkType(0xc5),
            flags: 0,
        }],
    );
    let t = transmits(&mut a, now);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Error(e)] if e.error_causes[0].code == UNRECOGNIZED_CHUNK_TYPE
    );

    // upper bits 00: stop silently, the rest of the packet is dropped
    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![
            Chunk::Unknown {
                typ: ChunkType(0x3f),
                flags: 0,
            },
            Chunk::Abort(ChunkAbort::default()),
        ],
    );
    assert_eq!(a.state(), AssociationState::Established);
    assert!(transmits(&mut a, now).is_empty());
}

#[test]
fn test_send_queue_limit() {
    let now = Instant::now();
    let config = TransportConfig::default()
        .with_mtu(1500)
        .with_max_send_queue_len(2);
    let mut a = established(config, &[addr(1)], now);
    let itsn = a.my_initial_tsn;

    // three messages fill the congestion window, two more wait
    for _ in 0..5 {
        send(&mut a, now, 1400).unwrap();
    }
    assert_eq!(a.send_queue_len(), 2);
    assert_eq!(send(&mut a, now, 1400), Err(Error::ErrSendQueueFull));
    assert_eq!(
        events(&mut a),
        vec![Event::QueueStatusChange {
            queue: QueueKind::Send,
            len: 2
        }]
    );
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 3, "one DATA chunk per packet at this MTU");
    assert_eq!(data_tsns(&t), vec![itsn, itsn + 1, itsn + 2]);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![sack(itsn + 2, 65535, &[])]);
    assert_eq!(a.send_queue_len(), 0);
    assert_eq!(data_tsns(&transmits(&mut a, now)), vec![itsn + 3, itsn + 4]);
    assert_eq!(
        events(&mut a),
        vec![Event::QueueStatusChange {
            queue: QueueKind::Send,
            len: 0
        }]
    );
}

#[test]
fn test_heartbeat_confirms_destination() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1), addr(2)], now);

    let probe = now + Duration::from_millis(1);
    assert_eq!(a.poll_timeout(), Some(probe));
    a.handle_timeout(probe);
    let t = transmits(&mut a, probe);
    assert_eq!(t.len(), 1);
    assert_eq!(t[0].remote, addr(2));
    assert_eq!(t[0].payload.verification_tag, SERVER_TAG);
    let heartbeat = match &t[0].payload.chunks[..] {
        [Chunk::Heartbeat(hb)] => hb.clone(),
        other => panic!("expected HEARTBEAT, got {:?}", other),
    };

    let forged = ChunkHeartbeat {
        heartbeat_info: Bytes::from_static(&[0u8; 48]),
    };
    receive(&mut a, probe, addr(2), CLIENT_TAG, vec![Chunk::HeartbeatAck(forged)]);
    assert_eq!(a.path_state(PathId(1)), Some(PathState::Unconfirmed));

    let answered = probe + Duration::from_millis(40);
    receive(&mut a, answered, addr(2), CLIENT_TAG, vec![Chunk::HeartbeatAck(heartbeat)]);
    assert_eq!(a.path_state(PathId(1)), Some(PathState::Active));
    assert_eq!(
        events(&mut a),
        vec![Event::NetworkStatusChange {
            path: PathId(1),
            state: PathState::Active
        }]
    );
    a.set_primary_path(PathId(1)).unwrap();
    assert_eq!(a.primary_path(), PathId(1));
}

#[test]
fn test_heartbeat_answered() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);
    let hb = ChunkHeartbeat {
        heartbeat_info: Bytes::from_static(b"peer info"),
    };
    receive(&mut a, now, addr(1), CLIENT_TAG, vec![Chunk::Heartbeat(hb.clone())]);
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_matches!(&t[0].payload.chunks[..], [Chunk::HeartbeatAck(ack)] if *ack == hb);
}

#[test]
fn test_data_delivery_and_delayed_sack() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![data(SERVER_TSN, 0, 0, b"hi")]);
    assert_eq!(
        events(&mut a),
        vec![Event::DataArrive {
            stream_identifier: 0,
            stream_sequence_number: 0,
            unordered: false,
            payload_protocol_identifier: 0,
            data: Bytes::from_static(b"hi"),
        }]
    );
    assert!(transmits(&mut a, now).is_empty(), "SACK is delayed");
    let ack = now + Duration::from_millis(200);
    assert_eq!(a.poll_timeout(), Some(ack));

    a.handle_timeout(ack);
    let t = transmits(&mut a, ack);
    assert_eq!(t.len(), 1);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::SelectiveAck(s)] if s.cumulative_tsn_ack == SERVER_TSN && s.gap_ack_blocks.is_empty()
    );
    assert_eq!(a.stats().get_num_ack_timeouts(), 1);
    assert_eq!(a.stats().get_num_sacks_sent(), 1);

    // out of order: SSN 2 waits for SSN 1, the gap is acked at once
    receive(&mut a, ack, addr(1), CLIENT_TAG, vec![data(SERVER_TSN + 2, 0, 2, b"c")]);
    assert!(events(&mut a).is_empty());
    let t = transmits(&mut a, ack);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::SelectiveAck(s)] if s.gap_ack_blocks == vec![GapAckBlock { start: 2, end: 2 }]
    );
    receive(&mut a, ack, addr(1), CLIENT_TAG, vec![data(SERVER_TSN + 1, 0, 1, b"b")]);
    let delivered: Vec<u16> = events(&mut a)
        .into_iter()
        .filter_map(|e| match e {
            Event::DataArrive {
                stream_sequence_number,
                ..
            } => Some(stream_sequence_number),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![1, 2]);
}

#[test]
fn test_data_on_invalid_stream() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![data(SERVER_TSN, 9, 0, b"x")]);
    assert!(events(&mut a).is_empty());
    let t = transmits(&mut a, now);
    assert_eq!(t.len(), 1);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Error(e)] if e.error_causes[0].code == INVALID_STREAM_IDENTIFIER
    );
}

#[test]
fn test_empty_data_aborts() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![data(SERVER_TSN, 0, 0, b"")]);
    assert!(a.is_closed());
    let t = transmits(&mut a, now);
    assert_matches!(
        &t[0].payload.chunks[..],
        [Chunk::Abort(c)] if c.error_causes[0].code == NO_USER_DATA
    );
    assert_eq!(
        events(&mut a),
        vec![Event::CommunicationLost {
            reason: CommunicationLostReason::InvalidParameter
        }]
    );
}

#[test]
fn test_forward_tsn_releases_blocked_messages() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    receive(&mut a, now, addr(1), CLIENT_TAG, vec![data(SERVER_TSN + 1, 0, 1, b"b")]);
    assert!(events(&mut a).is_empty());

    receive(
        &mut a,
        now,
        addr(1),
        CLIENT_TAG,
        vec![Chunk::ForwardTsn(ChunkForwardTsn {
            new_cumulative_tsn: SERVER_TSN,
            streams: vec![ChunkForwardTsnStream {
                identifier: 0,
                sequence: 0,
            }],
        })],
    );
    assert_matches!(
        &events(&mut a)[..],
        [Event::DataArrive { stream_sequence_number: 1, .. }]
    );
    assert_eq!(a.receive.cumulative_tsn(), SERVER_TSN + 1);
}

#[test]
fn test_t3_timeout_collapses_cwnd() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default().with_mtu(1500), &[addr(1)], now);
    let itsn = a.my_initial_tsn;
    send(&mut a, now, 100).unwrap();
    transmits(&mut a, now);

    let t3 = now + Duration::from_millis(3000);
    assert_eq!(a.poll_timeout(), Some(t3));
    a.handle_timeout(t3);

    assert_eq!(a.cwnd(PathId(0)), Some(1500));
    assert_eq!(a.ssthresh(PathId(0)), Some(3000));
    assert_eq!(a.rto(PathId(0)), Some(6000));
    assert_eq!(a.stats().get_num_t3timeouts(), 1);
    assert_eq!(data_tsns(&transmits(&mut a, t3)), vec![itsn]);
    assert_eq!(a.poll_timeout(), Some(t3 + Duration::from_millis(6000)));
}

#[test]
fn test_add_and_remove_path() {
    let now = Instant::now();
    let mut a = established(TransportConfig::default(), &[addr(1)], now);

    let path = a.add_path(addr(3), now).unwrap();
    assert_eq!(path, PathId(1));
    assert_eq!(
        a.add_path(addr(3), now),
        Err(Error::ErrDuplicateDestination(addr(3)))
    );
    assert_matches!(
        a.poll_endpoint_event(),
        Some(EndpointEvent(EndpointEventInner::PathAdded(added))) if added == addr(3)
    );
    assert_eq!(
        events(&mut a),
        vec![Event::NetworkStatusChange {
            path,
            state: PathState::Added
        }]
    );

    assert_eq!(a.remove_path(PathId(0), now), Err(Error::ErrRemovePrimaryPath));
    a.remove_path(path, now).unwrap();
    assert_eq!(a.remote_addrs(), vec![addr(1)]);
    assert_eq!(a.find_path(addr(3)), None);
    assert_matches!(
        a.poll_endpoint_event(),
        Some(EndpointEvent(EndpointEventInner::PathRemoved(removed))) if removed == addr(3)
    );
    assert_eq!(a.remove_path(path, now), Err(Error::ErrUnknownPath(1)));
}
