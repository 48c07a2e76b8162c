//! End-to-end session loop tests over scripted transport and codec doubles.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pcu_mqtt::testing::{ScriptHandle, ScriptedConnector, ScriptedDecoder, ScriptedEncoder};
use pcu_mqtt::{
    LinkState, MqttSession, ProtocolEvent, ProtocolRequest, QoS, RetryPolicy, SessionError,
    SessionOptions, TopicRegistry,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tiny_retry() -> RetryPolicy {
    RetryPolicy {
        connect_attempts: 5,
        retry_pause: Duration::from_millis(5),
        cooldown: Duration::from_millis(20),
        connack_timeout: Duration::from_millis(200),
        input_timeout: Duration::from_millis(30),
    }
}

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("timed out waiting for {what}");
}

struct Harness {
    session: MqttSession,
    script: ScriptHandle,
    requests: Arc<Mutex<Vec<ProtocolRequest>>>,
    undrained: Arc<AtomicUsize>,
    connects: Arc<AtomicU32>,
    shutdowns: Arc<AtomicU32>,
}

impl Harness {
    fn start_with(
        refusals: u32,
        registry: TopicRegistry,
        tune: impl FnOnce(SessionOptions) -> SessionOptions,
    ) -> Self {
        init_tracing();
        let script = ScriptHandle::default();
        let encoder = ScriptedEncoder::new(script.clone(), 0);
        let requests = encoder.requests();
        let connector = ScriptedConnector::flaky(script.clone(), refusals);
        let connects = connector.connects();
        let shutdowns = connector.shutdowns();
        let decoder = ScriptedDecoder::new(script.clone());
        let undrained = decoder.undrained();

        let options = tune(SessionOptions::new("pcu-test", "scripted", 0).with_retry(tiny_retry()));
        let mut session = MqttSession::new(options, Box::new(encoder)).expect("session");
        session
            .start(Box::new(connector), Box::new(decoder), registry)
            .expect("start");
        Self {
            session,
            script,
            requests,
            undrained,
            connects,
            shutdowns,
        }
    }

    fn start(refusals: u32, registry: TopicRegistry) -> Self {
        Self::start_with(refusals, registry, |options| options)
    }

    fn wait_connected(&self) {
        wait_for("connection", || self.session.state() == LinkState::Connected);
    }

    fn requests(&self) -> Vec<ProtocolRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn wait_for_request(&self, what: &str, matcher: impl Fn(&ProtocolRequest) -> bool) {
        wait_for(what, || self.requests().iter().any(&matcher));
    }
}

#[test]
fn connects_after_transient_failures() {
    let harness = Harness::start(4, TopicRegistry::new());
    harness.wait_connected();
    assert_eq!(harness.connects.load(Ordering::SeqCst), 5);
}

#[test]
fn unknown_topic_publication_is_drained_and_acknowledged() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .script
        .push_publish("mystery/topic", QoS::AtLeastOnce, Some(7), &[0u8; 10]);
    harness.wait_for_request("PUBACK", |request| {
        matches!(request, ProtocolRequest::PubAck { message_id: 7 })
    });

    let acks = harness
        .requests()
        .into_iter()
        .filter(|request| matches!(request, ProtocolRequest::PubAck { .. }))
        .count();
    assert_eq!(acks, 1);
    assert_eq!(harness.undrained.load(Ordering::SeqCst), 0);
    assert_eq!(harness.session.state(), LinkState::Connected);
}

#[test]
fn inbound_qos2_handshake_completes() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .script
        .push_publish("mystery/topic", QoS::ExactlyOnce, Some(9), b"state");
    harness.wait_for_request("PUBREC", |request| {
        matches!(request, ProtocolRequest::PubRec { message_id: 9 })
    });

    harness.script.push_event(ProtocolEvent::PubRel {
        message_id: 9,
        result: Ok(()),
    });
    harness.wait_for_request("PUBCOMP", |request| {
        matches!(request, ProtocolRequest::PubComp { message_id: 9 })
    });
    assert_eq!(harness.undrained.load(Ordering::SeqCst), 0);
}

#[test]
fn outbound_qos2_publish_is_released() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .session
        .publish("dev/pcu-test/state", QoS::ExactlyOnce, false, b"on")
        .expect("publish");
    harness.script.push_event(ProtocolEvent::PubRec {
        message_id: 1,
        result: Ok(()),
    });
    harness.wait_for_request("PUBREL", |request| {
        matches!(request, ProtocolRequest::PubRel { message_id: 1 })
    });
}

#[test]
fn repeated_publishes_are_independent_operations() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    for _ in 0..2 {
        harness
            .session
            .publish("dev/pcu-test/state", QoS::AtLeastOnce, false, b"on")
            .expect("publish");
    }

    // No deduplication: two wire publishes, each with its own message id.
    let ids: Vec<u16> = harness
        .requests()
        .iter()
        .filter_map(|request| match request {
            ProtocolRequest::Publish {
                topic,
                qos: QoS::AtLeastOnce,
                message_id: Some(id),
                ..
            } if topic == "dev/pcu-test/state" => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    // Each operation is acknowledged on its own.
    for id in &ids {
        harness.script.push_event(ProtocolEvent::PubAck {
            message_id: *id,
            result: Ok(()),
        });
    }
    wait_for("acknowledgments consumed", || harness.script.is_empty());
    assert_eq!(harness.session.state(), LinkState::Connected);
}

#[test]
fn broker_disconnect_triggers_a_reconnect() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .script
        .push_event(ProtocolEvent::Disconnect { reason: Some(0) });
    wait_for("reconnect", || {
        harness.connects.load(Ordering::SeqCst) >= 2
            && harness.session.state() == LinkState::Connected
    });
    assert!(harness.shutdowns.load(Ordering::SeqCst) >= 1);
}

#[test]
fn subscribe_seed_precedes_the_subscription() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .session
        .subscribe("dev/pcu-test/out/5", QoS::AtLeastOnce, Some(b"0"))
        .expect("subscribe");

    let requests = harness.requests();
    let seed = requests
        .iter()
        .position(|request| {
            matches!(
                request,
                ProtocolRequest::Publish {
                    topic,
                    qos: QoS::AtMostOnce,
                    retain: true,
                    message_id: None,
                    payload,
                } if topic == "dev/pcu-test/out/5" && payload == b"0"
            )
        })
        .expect("seed publish missing");
    let subscribe = requests
        .iter()
        .position(|request| {
            matches!(
                request,
                ProtocolRequest::Subscribe { topic, .. } if topic == "dev/pcu-test/out/5"
            )
        })
        .expect("subscribe missing");
    assert!(seed < subscribe);
}

#[test]
fn seedless_subscribe_issues_no_publish() {
    let harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness
        .session
        .subscribe("dev/pcu-test/out/5", QoS::AtMostOnce, None)
        .expect("subscribe");

    let requests = harness.requests();
    assert!(requests
        .iter()
        .any(|request| matches!(request, ProtocolRequest::Subscribe { .. })));
    assert!(!requests
        .iter()
        .any(|request| matches!(request, ProtocolRequest::Publish { .. })));
}

#[test]
fn registered_handler_receives_the_publication() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let mut registry = TopicRegistry::new();
    registry.on("dev/pcu-test/out/5", move |ctx| {
        let mut payload = vec![0u8; ctx.payload_len()];
        ctx.read_payload(&mut payload)
            .map_err(|_| pcu_mqtt::Rejection("read"))?;
        seen_in.lock().unwrap().push(payload);
        Ok(())
    });

    let harness = Harness::start(0, registry);
    harness.wait_connected();

    harness
        .script
        .push_publish("dev/pcu-test/out/5", QoS::AtLeastOnce, Some(3), b"1");
    harness.wait_for_request("PUBACK", |request| {
        matches!(request, ProtocolRequest::PubAck { message_id: 3 })
    });
    assert_eq!(*seen.lock().unwrap(), vec![b"1".to_vec()]);
}

#[test]
fn keep_alive_ping_fires_when_idle() {
    let harness = Harness::start_with(0, TopicRegistry::new(), |options| {
        options.with_keep_alive(Duration::from_millis(50))
    });
    harness.wait_connected();

    harness.wait_for_request("PINGREQ", |request| {
        matches!(request, ProtocolRequest::PingReq)
    });
}

#[test]
fn keep_alive_is_not_delayed_by_a_long_input_poll() {
    // Input timeout far beyond the wait_for deadline: the ping arrives in
    // time only if the poll is clamped to the keep-alive deadline.
    let harness = Harness::start_with(0, TopicRegistry::new(), |options| {
        let mut retry = tiny_retry();
        retry.input_timeout = Duration::from_secs(30);
        options
            .with_keep_alive(Duration::from_millis(40))
            .with_retry(retry)
    });
    harness.wait_connected();

    harness.wait_for_request("PINGREQ", |request| {
        matches!(request, ProtocolRequest::PingReq)
    });
}

#[test]
fn stop_terminates_the_session() {
    let mut harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    harness.session.stop();
    assert_eq!(harness.session.state(), LinkState::Disconnected);
    assert!(harness.shutdowns.load(Ordering::SeqCst) >= 1);
    assert!(matches!(
        harness
            .session
            .publish("dev/pcu-test/state", QoS::AtMostOnce, false, b"x"),
        Err(SessionError::NotConnected)
    ));

    // Idempotent.
    harness.session.stop();
}

#[test]
fn second_start_is_rejected() {
    let mut harness = Harness::start(0, TopicRegistry::new());
    harness.wait_connected();

    let script = ScriptHandle::default();
    let result = harness.session.start(
        Box::new(ScriptedConnector::accepting(script.clone())),
        Box::new(ScriptedDecoder::new(script)),
        TopicRegistry::new(),
    );
    assert!(matches!(result, Err(SessionError::AlreadyStarted)));
    assert_eq!(harness.session.state(), LinkState::Connected);
}
