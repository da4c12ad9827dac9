//! Cross-router scenarios: two transport-backed routers joined by a
//! loopback transport, typed payloads through the JSON codec, and callback
//! delivery into a component loop.

use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use courier::{
    ActionError, Address, Availability, Component, FrameTransport, InProcessRouter, JsonCodec,
    OpId, PayloadCodec, RequestKeeper, ResponseStatus, ServiceId, StopMessage, TransportError,
    TransportEvent,
};
use courier::{TransportClientRouter, TransportServerRouter};
use serde::{Deserialize, Serialize};

type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// One half of an in-memory link: frames sent here surface as events at the
/// other half's router.
struct Loopback {
    local: Address,
    sink: Mutex<Option<EventSink>>,
}

impl Loopback {
    fn new(local: Address) -> Arc<Self> {
        Arc::new(Self {
            local,
            sink: Mutex::new(None),
        })
    }

    fn connect(&self, sink: EventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn disconnect(&self) {
        *self.sink.lock().unwrap() = None;
    }
}

impl FrameTransport for Loopback {
    fn send_frame(&self, _to: &Address, frame: &[u8]) -> Result<(), TransportError> {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => {
                sink(TransportEvent::FrameReceived {
                    from: self.local.clone(),
                    frame: frame.to_vec(),
                });
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }
}

struct Fixture {
    client_wire: Arc<Loopback>,
    client_router: Arc<TransportClientRouter>,
    server_router: Arc<TransportServerRouter>,
}

fn client_addr() -> Address {
    Address::new("panel", 40)
}

fn server_addr() -> Address {
    Address::new("hub", 41)
}

/// Build a client router and a server router joined by a loopback pair, with
/// the client already connected.
fn connected_pair() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("COURIER_LOG"))
        .with_test_writer()
        .try_init();

    let client_wire = Loopback::new(client_addr());
    let server_wire = Loopback::new(server_addr());

    let client_router = TransportClientRouter::new(client_wire.clone(), server_addr());
    let server_router = TransportServerRouter::new(server_wire.clone());

    {
        let server_router = Arc::clone(&server_router);
        client_wire.connect(Arc::new(move |event| server_router.handle_event(event)));
    }
    {
        let client_router = Arc::clone(&client_router);
        server_wire.connect(Arc::new(move |event| client_router.handle_event(event)));
    }
    server_router.handle_event(TransportEvent::PeerConnected {
        addr: client_addr(),
    });

    Fixture {
        client_wire,
        client_router,
        server_router,
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
struct DimCommand {
    level: u8,
    room: String,
}

#[test]
fn typed_request_roundtrip_across_the_wire() {
    let fixture = connected_pair();
    let codec = JsonCodec;

    let provider = fixture.server_router.provider(ServiceId::from("lights"));
    provider.register_request_handler(&OpId::from("dim"), move |keeper| {
        let command: DimCommand = codec
            .decode(keeper.request_payload().as_ref())
            .expect("well-formed request");
        let ack = codec.encode(&format!("dimmed {} to {}", command.room, command.level));
        keeper.respond(ack.ok(), ResponseStatus::Complete).unwrap();
    });

    // the requester exists before the provider announces itself, so the
    // availability update finds it
    let requester = fixture.client_router.requester(ServiceId::from("lights"));
    provider.start_serving();
    assert_eq!(requester.availability(), Availability::Available);

    let payload = codec
        .encode(&DimCommand {
            level: 30,
            room: "kitchen".into(),
        })
        .unwrap();
    let reply = requester
        .send_request(&OpId::from("dim"), Some(payload), Duration::from_secs(1))
        .unwrap();
    let ack: String = codec.decode(reply.as_ref()).unwrap();
    assert_eq!(ack, "dimmed kitchen to 30");
}

#[test]
fn status_updates_cross_the_wire_and_land_in_the_cache() {
    let fixture = connected_pair();
    let codec = JsonCodec;

    let provider = fixture.server_router.provider(ServiceId::from("climate"));
    let requester = fixture.client_router.requester(ServiceId::from("climate"));
    provider.start_serving();
    provider
        .set_status(&OpId::from("temperature"), codec.encode(&21.5f64).unwrap())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    requester
        .register_status(&OpId::from("temperature"), move |payload| {
            tx.send(payload).unwrap();
        })
        .unwrap();

    // the stored value was replayed over the wire at subscription time
    let first: f64 = codec.decode(rx.try_recv().unwrap().as_ref()).unwrap();
    assert!((first - 21.5).abs() < f64::EPSILON);

    provider
        .set_status(&OpId::from("temperature"), codec.encode(&23.0f64).unwrap())
        .unwrap();
    let second: f64 = codec.decode(rx.try_recv().unwrap().as_ref()).unwrap();
    assert!((second - 23.0).abs() < f64::EPSILON);

    // cached now: no further wire traffic needed for a get
    let cached = requester
        .get_status(&OpId::from("temperature"), Duration::from_secs(1))
        .unwrap();
    let value: f64 = codec.decode(cached.as_ref()).unwrap();
    assert!((value - 23.0).abs() < f64::EPSILON);
}

#[test]
fn sync_timeout_reaches_the_provider_as_an_abort() {
    let fixture = connected_pair();

    let provider = fixture.server_router.provider(ServiceId::from("jobs"));
    let parked: Arc<Mutex<Vec<Arc<RequestKeeper>>>> = Arc::default();
    let (aborted_tx, aborted_rx) = mpsc::channel();
    {
        let parked = Arc::clone(&parked);
        provider.register_request_handler(&OpId::from("crunch"), move |keeper| {
            let aborted_tx = aborted_tx.clone();
            keeper.aborted_by(move || {
                aborted_tx.send(()).unwrap();
            });
            parked.lock().unwrap().push(keeper);
        });
    }
    let requester = fixture.client_router.requester(ServiceId::from("jobs"));
    provider.start_serving();

    let result = requester.send_request(&OpId::from("crunch"), None, Duration::from_millis(50));
    assert_eq!(result.unwrap_err(), ActionError::Timeout);

    // the abort crossed the wire during the timeout handling
    aborted_rx
        .recv_timeout(Duration::from_millis(50))
        .expect("abort observed at the provider");
    let keeper = parked.lock().unwrap().pop().unwrap();
    assert!(!keeper.valid());
}

#[test]
fn losing_the_wire_makes_the_service_unavailable() {
    let fixture = connected_pair();

    let provider = fixture.server_router.provider(ServiceId::from("feed"));
    let requester = fixture.client_router.requester(ServiceId::from("feed"));
    provider.start_serving();
    assert_eq!(requester.availability(), Availability::Available);

    // the wire drops: the transport reports the server gone on the client
    // side and the client gone on the server side
    fixture.client_wire.disconnect();
    fixture.client_router.handle_event(TransportEvent::PeerDisconnected {
        addr: server_addr(),
    });
    fixture.server_router.handle_event(TransportEvent::PeerDisconnected {
        addr: client_addr(),
    });

    assert_eq!(requester.availability(), Availability::Unavailable);
    let result = requester.send_request(&OpId::from("poll"), None, Duration::from_millis(10));
    assert_eq!(result.unwrap_err(), ActionError::ServiceUnavailable);
}

#[test]
fn response_callback_can_feed_a_component_loop() {
    struct ReplyArrived(Option<Vec<u8>>);

    let router = InProcessRouter::new();
    let provider = router.provider(ServiceId::from("echo"));
    provider.register_request_handler(&OpId::from("ping"), |keeper| {
        let payload = keeper.request_payload();
        keeper.respond(payload, ResponseStatus::Complete).unwrap();
    });
    provider.start_serving();
    let requester = router.requester(ServiceId::from("echo"));

    let component = Component::new("reply-consumer");
    let (tx, rx) = mpsc::channel();
    component.handle::<ReplyArrived, _>(move |ReplyArrived(payload)| {
        tx.send(payload).unwrap();
    });
    let handle = component.spawn().unwrap();

    // the requester callback hops the response onto the component thread
    {
        let component = component.clone();
        requester
            .send_request_async(&OpId::from("ping"), Some(vec![0xAB]), move |payload| {
                let _ = component.post(ReplyArrived(payload));
            })
            .unwrap();
    }

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Some(vec![0xAB])
    );
    component.post(StopMessage).unwrap();
    handle.join().unwrap();
}
