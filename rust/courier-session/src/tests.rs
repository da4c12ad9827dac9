use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex as StdMutex};
use std::thread;
use std::time::Duration;

use courier_wire::{Availability, OpId, Payload, RegId, ServiceId};

use crate::{
    ActionError, InProcessRouter, ObserverHealth, RequestKeeper, ResponseStatus, ServiceProvider,
    ServiceRequester, ServiceStatusObserver,
};

/// `COURIER_LOG=debug cargo test` shows the routing decisions under test.
fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("COURIER_LOG"))
        .with_test_writer()
        .try_init();
}

fn sid() -> ServiceId {
    ServiceId::from("lighting")
}

fn op(name: &str) -> OpId {
    OpId::from(name)
}

/// Router + serving provider + requester, with an echo handler installed.
fn echo_setup() -> (
    Arc<InProcessRouter>,
    Arc<ServiceProvider>,
    Arc<ServiceRequester>,
) {
    init_logging();
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.register_request_handler(&op("echo"), |keeper| {
        let payload = keeper.request_payload();
        keeper.respond(payload, ResponseStatus::Complete).unwrap();
    });
    provider.start_serving();
    let requester = router.requester(sid());
    (router, provider, requester)
}

/// Provider whose handler parks every request, handing the keepers out.
fn parking_setup() -> (
    Arc<InProcessRouter>,
    Arc<ServiceProvider>,
    Arc<ServiceRequester>,
    Arc<StdMutex<Vec<Arc<RequestKeeper>>>>,
) {
    init_logging();
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    let parked: Arc<StdMutex<Vec<Arc<RequestKeeper>>>> = Arc::default();
    {
        let parked = Arc::clone(&parked);
        provider.register_request_handler(&op("slow"), move |keeper| {
            parked.lock().unwrap().push(keeper);
        });
    }
    provider.start_serving();
    let requester = router.requester(sid());
    (router, provider, requester, parked)
}

// ============================================================================
// Requests
// ============================================================================

#[test]
fn async_request_echoes_payload_bytes() {
    let (_router, _provider, requester) = echo_setup();
    let (tx, rx) = mpsc::channel();
    requester
        .send_request_async(&op("echo"), Some(vec![0x01, 0x02]), move |payload| {
            tx.send(payload).unwrap();
        })
        .unwrap();
    let payload = rx.recv_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(payload, Some(vec![0x01, 0x02]));
}

#[test]
fn sync_request_returns_the_response() {
    let (_router, _provider, requester) = echo_setup();
    let payload = requester
        .send_request(&op("echo"), Some(vec![9, 9]), Duration::from_secs(1))
        .unwrap();
    assert_eq!(payload, Some(vec![9, 9]));
}

#[test]
fn request_while_unknown_fails_fast() {
    let router = InProcessRouter::new();
    let requester = router.requester(sid());
    assert_eq!(requester.availability(), Availability::Unknown);
    let result = requester.send_request_async(&op("echo"), None, |_| {});
    assert_eq!(result.unwrap_err(), ActionError::ServiceUnavailable);
    let result = requester.send_request(&op("echo"), None, Duration::from_millis(10));
    assert_eq!(result.unwrap_err(), ActionError::ServiceUnavailable);
}

#[test]
fn request_without_handler_gets_an_empty_answer() {
    let (_router, _provider, requester) = echo_setup();
    let payload = requester
        .send_request(&op("unknown-op"), Some(vec![1]), Duration::from_secs(1))
        .unwrap();
    assert_eq!(payload, None);
}

#[test]
fn sync_timeout_aborts_upstream() {
    let (_router, _provider, requester, parked) = parking_setup();
    let aborted = Arc::new(AtomicUsize::new(0));

    // watch the parked request for the abort that must follow the timeout
    let result = requester.send_request(&op("slow"), Some(vec![5]), Duration::from_millis(50));
    assert_eq!(result.unwrap_err(), ActionError::Timeout);

    let keeper = parked.lock().unwrap().pop().expect("handler saw the request");
    // the abort arrived before send_request returned, inline on this thread
    assert!(!keeper.valid());
    {
        let aborted = Arc::clone(&aborted);
        keeper.aborted_by(move || {
            aborted.fetch_add(1, Ordering::SeqCst);
        });
    }
    // a late response on the aborted keeper goes nowhere
    assert_eq!(
        keeper.respond(Some(vec![1]), ResponseStatus::Complete),
        Err(ActionError::InvalidParam)
    );
    assert_eq!(aborted.load(Ordering::SeqCst), 0);
}

#[test]
fn abort_fires_provider_callback_exactly_once() {
    let (_router, _provider, requester, parked) = parking_setup();
    let aborted = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let reg_id = requester
        .send_request_async(&op("slow"), None, move |payload| {
            tx.send(payload).unwrap();
        })
        .unwrap();

    {
        let keeper = parked.lock().unwrap()[0].clone();
        let aborted = Arc::clone(&aborted);
        keeper.aborted_by(move || {
            aborted.fetch_add(1, Ordering::SeqCst);
        });
    }

    requester.abort_request(&reg_id).unwrap();
    assert_eq!(aborted.load(Ordering::SeqCst), 1);

    // aborting again is a no-op; the callback stays at one firing
    requester.abort_request(&reg_id).unwrap();
    assert_eq!(aborted.load(Ordering::SeqCst), 1);

    // respond after abort returns an error and the requester callback never fires
    let keeper = parked.lock().unwrap()[0].clone();
    assert!(!keeper.valid());
    assert_eq!(
        keeper.respond(Some(vec![1]), ResponseStatus::Complete),
        Err(ActionError::InvalidParam)
    );
    assert!(rx.try_recv().is_err());
}

#[test]
fn abort_with_invalid_reg_id_is_a_caller_error() {
    let (_router, _provider, requester) = echo_setup();
    assert_eq!(
        requester.abort_request(&RegId::invalid()),
        Err(ActionError::InvalidParam)
    );
}

#[test]
fn response_callback_fires_exactly_once() {
    let (_router, _provider, requester) = echo_setup();
    let fired = Arc::new(AtomicUsize::new(0));
    let reg_id = {
        let fired = Arc::clone(&fired);
        requester
            .send_request_async(&op("echo"), Some(vec![3]), move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    // the pending entry is gone; an abort after completion changes nothing
    requester.abort_request(&reg_id).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn outstanding_request_ids_are_unique_and_reclaimed() {
    let (_router, _provider, requester, parked) = parking_setup();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let reg_id = requester
            .send_request_async(&op("slow"), None, |_| {})
            .unwrap();
        ids.push(reg_id.request_id.raw());
    }
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 3);

    // answering everything recycles the ids for the next round
    let keepers: Vec<_> = parked.lock().unwrap().drain(..).collect();
    for keeper in keepers {
        keeper.respond(None, ResponseStatus::Complete).unwrap();
    }
    let reg_id = requester
        .send_request_async(&op("slow"), None, |_| {})
        .unwrap();
    assert_eq!(reg_id.request_id.raw(), *ids.iter().min().unwrap());
}

#[test]
fn incomplete_responses_keep_the_request_live() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.register_request_handler(&op("progress"), |keeper| {
        keeper.update(Some(vec![10])).unwrap();
        assert!(keeper.valid());
        keeper.respond(Some(vec![100]), ResponseStatus::Complete).unwrap();
        assert!(!keeper.valid());
    });
    provider.start_serving();
    let requester = router.requester(sid());

    let deliveries = Arc::new(StdMutex::new(Vec::new()));
    {
        let deliveries = Arc::clone(&deliveries);
        requester
            .send_request_async(&op("progress"), None, move |payload| {
                deliveries.lock().unwrap().push(payload);
            })
            .unwrap();
    }
    // only the completing response lands in the pending table; the
    // intermediate update matched the same entry first
    let seen = deliveries.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&Some(vec![10])));
}

// ============================================================================
// Status & signals
// ============================================================================

#[test]
fn status_subscription_replays_and_tracks_updates() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    provider.set_status(&op("x"), vec![0x01]).unwrap();
    let requester = router.requester(sid());

    let seen = Arc::new(StdMutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        requester
            .register_status(&op("x"), move |payload| {
                seen.lock().unwrap().push(payload);
            })
            .unwrap();
    }
    // the stored value arrives with the subscription itself
    assert_eq!(seen.lock().unwrap().as_slice(), &[Some(vec![0x01])]);

    provider.set_status(&op("x"), vec![0x02]).unwrap();
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[Some(vec![0x01]), Some(vec![0x02])]
    );

    // cache answers without a round trip while the registration lives
    let cached = requester.get_status(&op("x"), Duration::from_secs(1)).unwrap();
    assert_eq!(cached, Some(vec![0x02]));
}

#[test]
fn unchanged_status_is_not_rebroadcast() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());

    let deliveries = Arc::new(AtomicUsize::new(0));
    {
        let deliveries = Arc::clone(&deliveries);
        requester
            .register_status(&op("x"), move |_| {
                deliveries.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    provider.set_status(&op("x"), vec![7]).unwrap();
    provider.set_status(&op("x"), vec![7]).unwrap();
    provider.set_status(&op("x"), vec![8]).unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
}

#[test]
fn second_status_registration_replays_the_cache_only() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    provider.set_status(&op("x"), vec![1]).unwrap();
    let requester = router.requester(sid());

    requester.register_status(&op("x"), |_| {}).unwrap();

    let (tx, rx) = mpsc::channel();
    requester
        .register_status(&op("x"), move |payload| {
            tx.send(payload).unwrap();
        })
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), Some(vec![1]));
}

#[test]
fn signals_fan_out_to_every_registration_without_caching() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    {
        let first = Arc::clone(&first);
        requester
            .register_signal(&op("alarm"), move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    {
        let second = Arc::clone(&second);
        requester
            .register_signal(&op("alarm"), move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    provider.broadcast_signal(&op("alarm"), vec![1]).unwrap();
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    // signals leave no cached value behind: getting the "status" of the
    // signal op goes to the wire and comes back empty
    requester.unregister_all(&op("alarm")).unwrap();
    let fetched = requester
        .get_status(&op("alarm"), Duration::from_secs(1))
        .unwrap();
    assert_eq!(fetched, None);
}

#[test]
fn unregistering_the_last_entry_stops_deliveries_and_drops_the_cache() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());

    let deliveries = Arc::new(AtomicUsize::new(0));
    let reg_id = {
        let deliveries = Arc::clone(&deliveries);
        requester
            .register_status(&op("x"), move |_| {
                deliveries.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    provider.set_status(&op("x"), vec![1]).unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    requester.unregister(&reg_id).unwrap();
    provider.set_status(&op("x"), vec![2]).unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    // the cache is gone with the registration: this get goes to the wire
    // and sees the provider's newest value
    let fetched = requester.get_status(&op("x"), Duration::from_secs(1)).unwrap();
    assert_eq!(fetched, Some(vec![2]));
}

#[test]
fn unregister_rejects_an_invalid_reg_id() {
    let (_router, _provider, requester) = echo_setup();
    assert_eq!(
        requester.unregister(&RegId::invalid()),
        Err(ActionError::InvalidParam)
    );
}

#[test]
fn get_status_async_uses_the_cache_when_up_to_date() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    provider.set_status(&op("x"), vec![4]).unwrap();
    let requester = router.requester(sid());
    requester.register_status(&op("x"), |_| {}).unwrap();

    let (tx, rx) = mpsc::channel();
    requester
        .get_status_async(&op("x"), move |payload| {
            tx.send(payload).unwrap();
        })
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), Some(vec![4]));
}

#[test]
fn get_status_without_a_stored_value_is_empty() {
    let (_router, _provider, requester) = echo_setup();
    let fetched = requester
        .get_status(&op("nothing-here"), Duration::from_secs(1))
        .unwrap();
    assert_eq!(fetched, None);
}

// ============================================================================
// Availability
// ============================================================================

struct CountingObserver {
    transitions: StdMutex<Vec<(Availability, Availability)>>,
    health: ObserverHealth,
}

impl CountingObserver {
    fn alive() -> Arc<Self> {
        Arc::new(Self {
            transitions: StdMutex::new(Vec::new()),
            health: ObserverHealth::Alive,
        })
    }

    fn defunct() -> Arc<Self> {
        Arc::new(Self {
            transitions: StdMutex::new(Vec::new()),
            health: ObserverHealth::Defunct,
        })
    }

    fn seen(&self) -> Vec<(Availability, Availability)> {
        self.transitions.lock().unwrap().clone()
    }
}

impl ServiceStatusObserver for CountingObserver {
    fn on_service_status_changed(
        &self,
        _service_id: &ServiceId,
        old: Availability,
        new: Availability,
    ) -> ObserverHealth {
        self.transitions.lock().unwrap().push((old, new));
        self.health
    }
}

#[test]
fn availability_loss_clears_state_and_unblocks_waiters() {
    let (_router, provider, requester, _parked) = parking_setup();

    let observer = CountingObserver::alive();
    requester.register_service_status_observer(observer.clone());
    // registered while available: the catch-up notification comes first
    assert_eq!(
        observer.seen(),
        vec![(Availability::Unknown, Availability::Available)]
    );

    // two async requests and one registration outstanding
    let async_fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let async_fired = Arc::clone(&async_fired);
        requester
            .send_request_async(&op("slow"), None, move |_| {
                async_fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    requester.register_status(&op("x"), |_| {}).unwrap();

    // a sync waiter parked on another thread
    let waiter = {
        let requester = Arc::clone(&requester);
        thread::spawn(move || requester.send_request(&op("slow"), None, Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(50));

    provider.stop_serving();

    // the sync waiter is unblocked with the availability error, quickly
    assert_eq!(
        waiter.join().unwrap().unwrap_err(),
        ActionError::ServiceUnavailable
    );
    // async entries were dropped silently
    assert_eq!(async_fired.load(Ordering::SeqCst), 0);
    // the observer saw the transition
    assert_eq!(
        observer.seen().last(),
        Some(&(Availability::Available, Availability::Unavailable))
    );
    // new work fails fast
    assert_eq!(
        requester
            .send_request(&op("slow"), None, Duration::from_millis(10))
            .unwrap_err(),
        ActionError::ServiceUnavailable
    );
    assert_eq!(
        requester
            .get_status(&op("x"), Duration::from_millis(10))
            .unwrap_err(),
        ActionError::ServiceUnavailable
    );
}

#[test]
fn registrations_are_not_replayed_when_the_service_returns() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());

    let deliveries = Arc::new(AtomicUsize::new(0));
    {
        let deliveries = Arc::clone(&deliveries);
        requester
            .register_status(&op("x"), move |_| {
                deliveries.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    provider.stop_serving();
    provider.start_serving();

    // the old registration is gone; the new value is not delivered
    provider.set_status(&op("x"), vec![1]).unwrap();
    assert_eq!(deliveries.load(Ordering::SeqCst), 0);
}

#[test]
fn defunct_observers_are_removed_by_the_notifier() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    let requester = router.requester(sid());

    let defunct = CountingObserver::defunct();
    let alive = CountingObserver::alive();
    requester.register_service_status_observer(defunct.clone());
    requester.register_service_status_observer(alive.clone());

    provider.start_serving();
    assert_eq!(defunct.seen().len(), 1);
    assert_eq!(alive.seen().len(), 1);

    provider.stop_serving();
    // the defunct observer was dropped after its first notification
    assert_eq!(defunct.seen().len(), 1);
    assert_eq!(alive.seen().len(), 2);
}

#[test]
fn unregistered_observers_stop_seeing_transitions() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    let requester = router.requester(sid());

    let observer = CountingObserver::alive();
    requester.register_service_status_observer(observer.clone());
    provider.start_serving();
    assert_eq!(observer.seen().len(), 1);

    let as_dyn: Arc<dyn ServiceStatusObserver> = observer.clone();
    requester.unregister_service_status_observer(&as_dyn);
    provider.stop_serving();
    assert_eq!(observer.seen().len(), 1);
}

#[test]
fn provider_registering_while_serving_wakes_waiting_requesters() {
    let router = InProcessRouter::new();
    let requester = router.requester(sid());
    assert_eq!(requester.availability(), Availability::Unknown);

    // the provider started serving before it met the router; registration
    // itself must surface the transition to the waiting requester
    let provider = ServiceProvider::new(sid());
    provider.start_serving();
    assert!(router.register_provider(&provider));
    assert_eq!(requester.availability(), Availability::Available);
}

#[test]
fn requester_registered_while_provider_serves_sees_available() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());
    assert_eq!(requester.availability(), Availability::Available);
}

// ============================================================================
// Provider surface
// ============================================================================

#[test]
fn duplicate_request_handlers_are_rejected() {
    let provider = ServiceProvider::new(sid());
    assert!(provider.register_request_handler(&op("a"), |_| {}));
    assert!(!provider.register_request_handler(&op("a"), |_| {}));
    assert!(provider.unregister_request_handler(&op("a")));
    assert!(!provider.unregister_request_handler(&op("a")));
    assert!(provider.register_request_handler(&op("a"), |_| {}));
}

#[test]
fn stop_serving_invalidates_parked_keepers() {
    let (_router, provider, requester, parked) = parking_setup();
    requester
        .send_request_async(&op("slow"), None, |_| {})
        .unwrap();
    let keeper = parked.lock().unwrap()[0].clone();
    assert!(keeper.valid());
    provider.stop_serving();
    assert!(!keeper.valid());
    assert_eq!(
        keeper.respond(None, ResponseStatus::Complete),
        Err(ActionError::InvalidParam)
    );
    assert_eq!(provider.get_status(&op("anything")), None);
}

#[test]
fn dropped_router_surfaces_receiver_unavailable() {
    let router = InProcessRouter::new();
    let provider = router.provider(sid());
    provider.start_serving();
    let requester = router.requester(sid());
    drop(router);

    let result = requester.send_request_async(&op("echo"), None, |_| {});
    assert_eq!(result.unwrap_err(), ActionError::ReceiverUnavailable);
}

#[test]
fn deinit_detaches_both_sides() {
    let (router, provider, requester) = echo_setup();
    router.deinit();
    // the router itself is alive but owns no endpoints anymore
    let result = requester.send_request_async(&op("echo"), None, |_| {});
    assert_eq!(result.unwrap_err(), ActionError::ReceiverUnavailable);
    let result = provider.set_status(&op("x"), vec![1]);
    assert!(result.is_ok(), "no subscribers, nothing to deliver");
}

#[test]
fn in_process_roundtrip_preserves_payload_bytes() {
    let (_router, _provider, requester) = echo_setup();
    let blob: Payload = (0..=255).collect();
    let echoed = requester
        .send_request(&op("echo"), Some(blob.clone()), Duration::from_secs(1))
        .unwrap();
    assert_eq!(echoed, Some(blob));
}
