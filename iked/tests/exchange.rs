//! Two engines wired back to back through an in-memory transport with a
//! recording kernel: the full exchange scenarios

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use ikewire::defs::params::{
    EncryptionAlgorithm, ExtendedSequenceNumbers, IntegrityAlgorithm, KeyExchangeMethod,
    PseudorandomFunction,
};

use iked::config::Config;
use iked::engine::{Engine, Output};
use iked::kernel::mock::MockSadb;
use iked::policy::{AddrPrefix, AuthConfig, FlowConfig, Lifetime, PolicyMode, PolicyTemplate};
use iked::proposal::{EspTransforms, IkeTransforms};
use iked::sa::SaState;

const ADDR_A: &str = "192.0.2.1:500";
const ADDR_B: &str = "198.51.100.2:500";
const SECRET: &[u8] = b"correct horse battery staple";

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn prefix_of(endpoint: &str) -> AddrPrefix {
    AddrPrefix {
        addr: addr(endpoint).ip(),
        prefix_len: 32,
    }
}

struct Setup {
    ike_ke: Vec<KeyExchangeMethod>,
    flows: usize,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            ike_ke: vec![KeyExchangeMethod::Modp2048],
            flows: 1,
        }
    }
}

fn policy(name: &str, mode: PolicyMode, peer: &str, setup: &Setup) -> PolicyTemplate {
    let any = FlowConfig {
        src: AddrPrefix::any4(),
        dst: AddrPrefix::any4(),
        proto: 0,
    };
    let mut flows = vec![any];
    for i in 1..setup.flows {
        // distinct selectors so large policies inflate the TS payloads
        flows.push(FlowConfig {
            src: AddrPrefix {
                addr: format!("10.{}.{}.0", i / 250, i % 250).parse().unwrap(),
                prefix_len: 24,
            },
            dst: AddrPrefix {
                addr: format!("172.16.{}.0", i % 250).parse().unwrap(),
                prefix_len: 24,
            },
            proto: 0,
        });
    }
    PolicyTemplate {
        name: name.into(),
        mode,
        peer: Some(prefix_of(peer)),
        local: None,
        peer_id: None,
        local_id: None,
        auth: AuthConfig::PreSharedKey(SECRET.to_vec()),
        ike_transforms: Some(IkeTransforms {
            encr: vec![(EncryptionAlgorithm::AesCbc, Some(256))],
            prf: vec![PseudorandomFunction::HmacSha2_256],
            integ: vec![IntegrityAlgorithm::HmacSha2_256_128],
            ke: setup.ike_ke.clone(),
        }),
        esp_transforms: Some(EspTransforms {
            encr: vec![(EncryptionAlgorithm::TripleDes, None)],
            integ: vec![IntegrityAlgorithm::HmacSha1_96],
            esn: vec![ExtendedSequenceNumbers::Esn],
        }),
        flows,
        pool: None,
        request_address: false,
        lifetime: Lifetime::default(),
        pfs: false,
    }
}

fn engine(policy: PolicyTemplate, now: Instant) -> Engine {
    let config = Config {
        policies: vec![policy],
        ..Config::default()
    };
    Engine::new(config, Box::<MockSadb>::default(), now).unwrap()
}

fn mock(engine: &Engine) -> &MockSadb {
    engine.kernel().as_any().downcast_ref().unwrap()
}

fn pair(setup: &Setup, now: Instant) -> (Engine, Engine) {
    let a = engine(
        policy("a-to-b", PolicyMode::Active, ADDR_B, setup),
        now,
    );
    let b = engine(
        policy("b-from-a", PolicyMode::Passive, ADDR_A, setup),
        now,
    );
    (a, b)
}

/// Feed datagram outputs into the receiving engine, returning whatever
/// it produces in turn
fn deliver(to: &mut Engine, outputs: Vec<Output>, now: Instant) -> Vec<Output> {
    let mut produced = vec![];
    for output in outputs {
        match output {
            Output::Datagram {
                local,
                peer,
                natt,
                bytes,
            } => {
                produced.extend(to.handle_datagram(now, peer, local, natt, &bytes));
            }
            other => panic!("unexpected non-datagram output: {other:?}"),
        }
    }
    produced
}

/// Bounce messages between the two engines until both fall silent
fn pump(a: &mut Engine, b: &mut Engine, mut from_a: Vec<Output>, now: Instant) {
    for _ in 0..16 {
        if from_a.is_empty() {
            return;
        }
        let from_b = deliver(b, from_a, now);
        if from_b.is_empty() {
            return;
        }
        from_a = deliver(a, from_b, now);
    }
    panic!("the exchange did not converge");
}

fn establish(setup: &Setup, now: Instant) -> (Engine, Engine) {
    let (mut a, mut b) = pair(setup, now);
    let outputs = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    pump(&mut a, &mut b, outputs, now);
    assert_eq!(a.count_in_state(SaState::Established), 1);
    assert_eq!(b.count_in_state(SaState::Established), 1);
    (a, b)
}

#[test]
fn happy_path_psk() {
    let now = Instant::now();
    let (a, b) = establish(&Setup::default(), now);

    for engine in [&a, &b] {
        let sa = engine.sa_for_peer(&addr(if std::ptr::eq(engine, &a) {
            ADDR_B
        } else {
            ADDR_A
        }))
        .unwrap();
        assert_eq!(sa.state, SaState::Established);
        assert_ne!(sa.spi_i, 0);
        assert_ne!(sa.spi_r, 0);
        assert!(sa.keys.is_some());
        assert_eq!(sa.children.len(), 1);
        assert!(sa.children[0].loaded);
        // the negotiated legacy suite
        assert_eq!(
            sa.children[0].suite.encr,
            (EncryptionAlgorithm::TripleDes, None)
        );
        assert_eq!(
            sa.children[0].suite.integ,
            Some(IntegrityAlgorithm::HmacSha1_96)
        );
        assert_eq!(sa.children[0].suite.esn, ExtendedSequenceNumbers::Esn);
    }
    // one child SA pair and the any-to-any flow pair in each kernel
    assert_eq!(mock(&a).sa_count(), 2);
    assert_eq!(mock(&b).sa_count(), 2);
    assert_eq!(mock(&a).flow_count(), 2);
    let flows = mock(&a).flows();
    assert!(flows
        .iter()
        .any(|f| f.src.prefix_len == 0 && f.dst.prefix_len == 0));
}

#[test]
fn wrong_dh_group_costs_one_retry() {
    let now = Instant::now();
    // the initiator prefers group 2, the responder only takes group 14
    let mut a = engine(
        policy(
            "a-to-b",
            PolicyMode::Active,
            ADDR_B,
            &Setup {
                ike_ke: vec![KeyExchangeMethod::Modp1024, KeyExchangeMethod::Modp2048],
                flows: 1,
            },
        ),
        now,
    );
    let mut b = engine(
        policy("b-from-a", PolicyMode::Passive, ADDR_A, &Setup::default()),
        now,
    );

    let first = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    assert_eq!(first.len(), 1);
    // the responder answers INVALID_KE_PAYLOAD without creating state
    let correction = deliver(&mut b, first, now);
    assert_eq!(correction.len(), 1);
    assert_eq!(b.count_in_state(SaState::SaInitDone), 0);

    // exactly one retry, then the handshake completes
    let retry = deliver(&mut a, correction, now);
    assert_eq!(retry.len(), 1);
    pump(&mut a, &mut b, retry, now);
    assert_eq!(a.count_in_state(SaState::Established), 1);
    assert_eq!(b.count_in_state(SaState::Established), 1);
}

#[test]
fn cookie_challenge_defers_state() {
    let now = Instant::now();
    let mut a = engine(
        policy("a-to-b", PolicyMode::Active, ADDR_B, &Setup::default()),
        now,
    );
    // the responder serves roaming peers: no peer restriction
    let mut open_policy = policy("b-from-a", PolicyMode::Passive, ADDR_A, &Setup::default());
    open_policy.peer = None;
    let mut b = engine(open_policy, now);

    // a herd of half-open peers pushes the responder over the threshold
    let mut herd = engine(
        policy("a-to-b", PolicyMode::Active, ADDR_B, &Setup::default()),
        now,
    );
    for i in 0..16 {
        let source = addr(&format!("203.0.113.{}:500", i + 1));
        let outputs = herd.initiate(now, "a-to-b", source, addr(ADDR_B)).unwrap();
        // the responder's answers are never delivered back
        let _ = deliver(&mut b, outputs, now);
    }
    assert!(b.under_load());
    let half_open_before = b.count_in_state(SaState::SaInitDone);

    let first = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    let challenge = deliver(&mut b, first, now);
    assert_eq!(challenge.len(), 1);
    // no state for us was allocated by the challenge
    assert_eq!(b.count_in_state(SaState::SaInitDone), half_open_before);

    // the retry carries the cookie and is admitted
    let retry = deliver(&mut a, challenge, now);
    assert_eq!(retry.len(), 1);
    pump(&mut a, &mut b, retry, now);
    assert_eq!(a.count_in_state(SaState::Established), 1);
}

#[test]
fn fragmented_ike_auth_survives_a_drop() {
    let now = Instant::now();
    // enough selectors to push IKE_AUTH far beyond the MTU
    let setup = Setup {
        ike_ke: vec![KeyExchangeMethod::Modp2048],
        flows: 120,
    };
    let (mut a, mut b) = pair(&setup, now);

    let sa_init = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    let sa_init_resp = deliver(&mut b, sa_init, now);
    let mut auth_fragments = deliver(&mut a, sa_init_resp, now);
    assert!(
        auth_fragments.len() >= 3,
        "IKE_AUTH should fragment, got {} datagrams",
        auth_fragments.len()
    );

    // one fragment gets lost on the way
    auth_fragments.remove(1);
    let nothing = deliver(&mut b, auth_fragments, now);
    assert!(nothing.is_empty());
    assert_eq!(b.count_in_state(SaState::Established), 0);

    // the retransmission timer resends all fragments
    let later = now + Duration::from_secs(3);
    let retransmitted = a.handle_timer(later);
    assert!(retransmitted.len() >= 3);
    let response = deliver(&mut b, retransmitted, later);
    assert!(!response.is_empty());
    assert_eq!(b.count_in_state(SaState::Established), 1);

    let done = deliver(&mut a, response, later);
    assert!(done.is_empty());
    assert_eq!(a.count_in_state(SaState::Established), 1);
    assert_eq!(mock(&a).sa_count(), 2);
}

#[test]
fn simultaneous_rekey_lowest_nonce_wins() {
    let now = Instant::now();
    let (mut a, mut b) = establish(&Setup::default(), now);

    // both sides decide to rekey the same child at the same moment
    let from_a = a.rekey_child_now(now, addr(ADDR_B));
    let from_b = b.rekey_child_now(now, addr(ADDR_A));
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_b.len(), 1);

    // the requests cross on the wire
    let resp_to_a = deliver(&mut b, from_a, now);
    let resp_to_b = deliver(&mut a, from_b, now);

    // each completion runs the tie-break and emits the delete exchanges
    let deletes_from_a = deliver(&mut a, resp_to_a, now);
    let deletes_from_b = deliver(&mut b, resp_to_b, now);
    let tail_a = deliver(&mut a, deletes_from_b, now);
    let tail_b = deliver(&mut b, deletes_from_a, now);
    let _ = deliver(&mut a, tail_b, now);
    let _ = deliver(&mut b, tail_a, now);

    // exactly one child survives on both sides and they agree on it
    let sa_a = a.sa_for_peer(&addr(ADDR_B)).unwrap();
    let sa_b = b.sa_for_peer(&addr(ADDR_A)).unwrap();
    assert_eq!(sa_a.children.len(), 1, "a kept {:?}", sa_a.children);
    assert_eq!(sa_b.children.len(), 1, "b kept {:?}", sa_b.children);
    assert_eq!(sa_a.children[0].spi_local, sa_b.children[0].spi_peer);
    assert_eq!(sa_a.children[0].spi_peer, sa_b.children[0].spi_local);
    assert_eq!(mock(&a).sa_count(), 2);
    assert_eq!(mock(&b).sa_count(), 2);
}

#[test]
fn mobike_address_update_without_rekey() {
    let now = Instant::now();
    let (mut a, mut b) = establish(&Setup::default(), now);
    let old_children: Vec<u32> = a
        .sa_for_peer(&addr(ADDR_B))
        .unwrap()
        .children
        .iter()
        .map(|c| c.spi_local)
        .collect();

    // the initiator's address changes under it
    let new_ip = "192.0.2.99".parse().unwrap();
    let update = a.handle_address_change(now, new_ip);
    assert_eq!(update.len(), 1, "a single INFORMATIONAL is expected");

    let response = deliver(&mut b, update, now);
    let done = deliver(&mut a, response, now);
    assert!(done.is_empty());

    // the peer rebound the kernel SAs to the new endpoint, no rekey
    let sa_b = b.sa_for_peer(&SocketAddr::new(new_ip, addr(ADDR_A).port())).unwrap();
    assert_eq!(sa_b.state, SaState::Established);
    assert!(mock(&b).sas().any(|k| k.dst == new_ip));
    let sa_a = a.sa_for_peer(&addr(ADDR_B)).unwrap();
    let new_children: Vec<u32> = sa_a.children.iter().map(|c| c.spi_local).collect();
    assert_eq!(old_children, new_children);
}

#[test]
fn address_lease_reaches_the_initiator() {
    let now = Instant::now();
    let mut a_policy = policy("a-to-b", PolicyMode::Active, ADDR_B, &Setup::default());
    a_policy.request_address = true;
    let mut b_policy = policy("b-from-a", PolicyMode::Passive, ADDR_A, &Setup::default());
    b_policy.pool = Some(AddrPrefix {
        addr: "10.99.0.0".parse().unwrap(),
        prefix_len: 24,
    });
    let mut a = engine(a_policy, now);
    let mut b = engine(b_policy, now);

    let sa_init = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    let sa_init_resp = deliver(&mut b, sa_init, now);
    let auth_req = deliver(&mut a, sa_init_resp, now);
    let auth_resp = deliver(&mut b, auth_req, now);

    // completing IKE_AUTH surfaces the lease for the route programmer
    let mut lease = None;
    for output in auth_resp {
        let Output::Datagram {
            local,
            peer,
            natt,
            bytes,
        } = output
        else {
            panic!("expected the IKE_AUTH response");
        };
        for action in a.handle_datagram(now, peer, local, natt, &bytes) {
            if let Output::Lease { address, .. } = action {
                lease = Some(address);
            }
        }
    }
    let leased = lease.expect("initiator got no lease");
    assert_eq!(leased.to_string(), "10.99.0.1");
    assert_eq!(
        a.sa_for_peer(&addr(ADDR_B)).unwrap().pool_lease,
        Some(leased)
    );
    assert_eq!(a.count_in_state(SaState::Established), 1);
    assert_eq!(b.count_in_state(SaState::Established), 1);
}

#[test]
fn dpd_timeout_closes_the_sa() {
    let now = Instant::now();
    let (mut a, _b) = establish(&Setup::default(), now);

    // the peer goes dark; every DPD interval sends a probe that is never
    // answered, until the tolerated misses run out
    let mut at = now;
    for _ in 0..16 {
        at += Duration::from_secs(61);
        let _ = a.handle_timer(at);
        if a.count_in_state(SaState::Established) == 0 {
            break;
        }
    }
    assert_eq!(a.count_in_state(SaState::Established), 0);
}

#[test]
fn duplicate_request_is_answered_from_cache() {
    let now = Instant::now();
    let (mut a, mut b) = pair(&Setup::default(), now);
    let sa_init = a.initiate(now, "a-to-b", addr(ADDR_A), addr(ADDR_B)).unwrap();
    let bytes = match &sa_init[0] {
        Output::Datagram { bytes, .. } => bytes.clone(),
        _ => unreachable!(),
    };
    let first = deliver(&mut b, sa_init, now);
    // the same datagram again yields the identical cached answer
    let second = b.handle_datagram(now, addr(ADDR_B), addr(ADDR_A), false, &bytes);
    let (Output::Datagram { bytes: r1, .. }, Output::Datagram { bytes: r2, .. }) =
        (&first[0], &second[0])
    else {
        unreachable!()
    };
    assert_eq!(r1, r2);
    assert_eq!(b.count_in_state(SaState::SaInitDone), 1);
}
