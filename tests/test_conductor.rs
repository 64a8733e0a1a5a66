// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Conductor behaviour against a mock driver: command/response matching,
// log buffer sharing and lingering, liveness failures, reentrancy and
// shutdown.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use common::*;
use libipc_conductor::agent::AgentInvoker;
use libipc_conductor::command::{DriverCommand, DriverEvent};
use libipc_conductor::clock::{EpochClock, NanoClock};
use libipc_conductor::counters::{channel_status, CountersReader, CLIENT_HEARTBEAT_TYPE_ID};
use libipc_conductor::{ClientConductor, Error, ErrorCode, Image};

fn weak_slot() -> Arc<OnceLock<Weak<ClientConductor>>> {
    Arc::new(OnceLock::new())
}

fn upgrade(slot: &OnceLock<Weak<ClientConductor>>) -> Arc<ClientConductor> {
    slot.get().and_then(Weak::upgrade).expect("conductor alive")
}

fn available_image(correlation_id: i64, session_id: i32, subscription_registration_id: i64, file: &str) -> DriverEvent {
    DriverEvent::AvailableImage {
        correlation_id,
        session_id,
        subscription_registration_id,
        subscriber_position_id: 0,
        log_file_name: file.to_owned(),
        source_identity: "127.0.0.1:40123".to_owned(),
    }
}

// ========== Publications ==========

#[test]
fn add_publication_registers_and_maps_log_buffer() {
    let h = Harness::new("pub_add");
    let conductor = h.conductor();

    let publication = conductor.add_publication("aeron:ipc", 10).expect("add publication");
    assert_eq!(publication.registration_id(), FIRST_CORRELATION_ID);
    assert_eq!(publication.original_registration_id(), FIRST_CORRELATION_ID);
    assert_eq!(publication.channel(), "aeron:ipc");
    assert_eq!(publication.stream_id(), 10);
    assert!(!publication.is_exclusive());
    assert_eq!(publication.log_buffers().ref_count(), 1);
    assert!(publication.log_buffers().is_mapped());
    assert_eq!(publication.channel_status(), channel_status::ACTIVE);
    let mut limit_id = None;
    h.counters.reader().for_each(|id, _, _, label| {
        if label == "pub-lmt" {
            limit_id = Some(id);
        }
    });
    h.counters.set_value(limit_id.expect("pub-lmt counter"), 4096);
    assert_eq!(publication.position_limit(), 4096);
    assert!(conductor.is_registered(FIRST_CORRELATION_ID));
    assert_eq!(conductor.resource_count(), 1);

    let sent = h.driver.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].client_id, CLIENT_ID);
    assert_eq!(sent[0].correlation_id, FIRST_CORRELATION_ID);
    assert_eq!(
        sent[0].command,
        DriverCommand::AddPublication {
            channel: "aeron:ipc".into(),
            stream_id: 10
        }
    );
    assert!(h.errors.is_empty(), "{:?}", h.errors.entries());
}

#[test]
fn publications_on_same_stream_share_one_mapping() {
    let h = Harness::new("pub_shared");
    let conductor = h.conductor();

    let first = conductor.add_publication("aeron:ipc", 3).expect("first");
    let second = conductor.add_publication("aeron:ipc", 3).expect("second");
    assert_ne!(first.registration_id(), second.registration_id());
    assert_eq!(second.original_registration_id(), first.registration_id());
    assert!(Arc::ptr_eq(first.log_buffers(), second.log_buffers()));
    assert_eq!(first.log_buffers().ref_count(), 2);

    first.close().expect("close first");
    assert_eq!(second.log_buffers().ref_count(), 1);
    assert!(conductor.lingering_log_buffers().is_empty());

    second.close().expect("close second");
    assert_eq!(second.log_buffers().ref_count(), 0);
    assert_eq!(conductor.lingering_log_buffers().len(), 1);
    assert_eq!(conductor.resource_count(), 0);
}

#[test]
fn exclusive_publications_get_their_own_mapping() {
    let h = Harness::new("pub_excl");
    let conductor = h.conductor();

    let a = conductor.add_exclusive_publication("aeron:ipc", 3).expect("a");
    let b = conductor.add_exclusive_publication("aeron:ipc", 3).expect("b");
    assert!(a.is_exclusive());
    assert_eq!(a.original_registration_id(), a.registration_id());
    assert!(!Arc::ptr_eq(a.log_buffers(), b.log_buffers()));
    assert_eq!(a.log_buffers().ref_count(), 1);
    assert_eq!(b.log_buffers().ref_count(), 1);
}

#[test]
fn closing_a_publication_twice_sends_one_remove() {
    let h = Harness::new("pub_close_twice");
    let conductor = h.conductor();

    let publication = conductor.add_publication("aeron:ipc", 1).expect("add");
    publication.close().expect("first close");
    publication.close().expect("second close");
    assert!(publication.is_closed());
    assert_eq!(publication.channel_status(), channel_status::NO_ID_ALLOCATED as i64);
    assert_eq!(
        h.driver
            .count_sent(|c| matches!(c, DriverCommand::RemovePublication { .. })),
        1
    );
    assert!(!conductor.is_registered(publication.registration_id()));
}

// ========== Subscriptions, images and lingering ==========

#[test]
fn add_subscription_records_channel_status() {
    let h = Harness::new("sub_add");
    let conductor = h.conductor();

    let subscription = conductor.add_subscription("aeron:ipc", 5).expect("add");
    assert_eq!(subscription.registration_id(), FIRST_CORRELATION_ID);
    assert_eq!(subscription.stream_id(), 5);
    assert_ne!(subscription.channel_status_id(), channel_status::NO_ID_ALLOCATED);
    assert_eq!(subscription.channel_status(), channel_status::ACTIVE);
    assert!(!subscription.is_connected());
    assert!(conductor.is_registered(subscription.registration_id()));
}

#[test]
fn images_share_log_buffer_and_linger_after_close() {
    let h = Harness::new("img_linger");
    let conductor = h.conductor();
    let file = h.log_file("buf-7");

    let subscription = conductor.add_subscription("aeron:ipc", 1).expect("add");
    let sub_id = subscription.registration_id();
    h.driver.push_event(available_image(100, 1, sub_id, &file));
    h.driver.push_event(available_image(100, 2, sub_id, &file));
    conductor.do_work().expect("do_work");

    assert_eq!(subscription.image_count(), 2);
    let a = subscription.image_by_session_id(1).expect("image 1");
    let b = subscription.image_by_session_id(2).expect("image 2");
    assert!(Arc::ptr_eq(a.log_buffers(), b.log_buffers()));
    assert_eq!(a.log_buffers().ref_count(), 2);
    assert_eq!(a.source_identity(), "127.0.0.1:40123");
    assert!(subscription.is_connected());

    let released_at = h.clock.nano_time();
    subscription.close().expect("close");
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(a.log_buffers().ref_count(), 0);

    let lingering = conductor.lingering_log_buffers();
    assert_eq!(lingering.len(), 1);
    assert_eq!(lingering[0].file_name(), file);
    assert_eq!(lingering[0].time_of_last_state_change(), released_at);
    assert!(lingering[0].is_mapped());

    // Half the linger duration: still mapped.
    h.tick(&conductor, 50).expect("tick");
    assert_eq!(conductor.lingering_log_buffers().len(), 1);
    assert!(a.log_buffers().is_mapped());

    h.tick(&conductor, 60).expect("tick");
    assert!(conductor.lingering_log_buffers().is_empty());
    assert!(!a.log_buffers().is_mapped());
}

#[test]
fn unbounded_linger_keeps_released_buffers_mapped() {
    let h = Harness::new("max_linger");
    let conductor = h.conductor_from(h.context().resource_linger_duration(Duration::MAX));

    let publication = conductor.add_publication("aeron:ipc", 1).expect("publication");
    publication.close().expect("close");
    for _ in 0..50 {
        h.tick(&conductor, 20).expect("do_work");
    }
    let lingering = conductor.lingering_log_buffers();
    assert_eq!(lingering.len(), 1);
    assert!(lingering[0].is_mapped());

    conductor.close().expect("close");
    assert!(!publication.log_buffers().is_mapped(), "close still deletes lingering buffers");
}

#[test]
fn unavailable_image_releases_and_notifies() {
    let h = Harness::new("img_gone");
    let conductor = h.conductor();
    let file = h.log_file("img");

    let gone = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&gone);
    let subscription = conductor
        .add_subscription_with_handlers(
            "aeron:ipc",
            1,
            None,
            Some(Arc::new(move |image: &Image| seen.lock().push(image.correlation_id()))),
        )
        .expect("add");

    h.driver.push_event(available_image(200, 9, subscription.registration_id(), &file));
    conductor.do_work().expect("do_work");
    let image = subscription.image_by_session_id(9).expect("image");

    h.driver.push_event(DriverEvent::UnavailableImage {
        correlation_id: 200,
        subscription_registration_id: subscription.registration_id(),
        stream_id: 1,
    });
    conductor.do_work().expect("do_work");

    assert_eq!(*gone.lock(), vec![200]);
    assert_eq!(subscription.image_count(), 0);
    assert!(image.is_closed());
    assert_eq!(image.log_buffers().ref_count(), 0);
    assert_eq!(conductor.lingering_log_buffers().len(), 1);
}

#[test]
fn image_for_unknown_subscription_is_ignored() {
    let h = Harness::new("img_unknown");
    let conductor = h.conductor();
    let file = h.log_file("img");

    h.driver.push_event(available_image(300, 1, 9999, &file));
    conductor.do_work().expect("do_work");
    assert!(conductor.lingering_log_buffers().is_empty());
    assert!(h.errors.is_empty());
}

#[test]
fn panicking_image_handler_is_reported_and_image_kept() {
    let h = Harness::new("img_panic");
    let conductor = h.conductor();
    let file = h.log_file("img");

    let subscription = conductor
        .add_subscription_with_handlers(
            "aeron:ipc",
            1,
            Some(Arc::new(|_: &Image| panic!("handler blew up"))),
            None,
        )
        .expect("add");
    h.driver.push_event(available_image(400, 1, subscription.registration_id(), &file));
    conductor.do_work().expect("do_work");

    assert_eq!(h.errors.count("Callback"), 1);
    assert_eq!(subscription.image_count(), 1);
    assert!(!conductor.is_terminating());
}

// ========== Driver responses ==========

#[test]
fn driver_error_fails_the_call_and_drops_placeholder() {
    let h = Harness::new("sub_error");
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddSubscription { .. } => Some(vec![DriverEvent::Error {
            correlation_id: msg.correlation_id,
            code: ErrorCode::InvalidChannel.code(),
            message: "invalid channel".into(),
        }]),
        _ => None,
    });
    let conductor = h.conductor();

    match conductor.add_subscription("bogus", 1) {
        Err(Error::Registration {
            correlation_id,
            error_code,
            message,
            ..
        }) => {
            assert_eq!(correlation_id, FIRST_CORRELATION_ID);
            assert_eq!(error_code, ErrorCode::InvalidChannel);
            assert_eq!(message, "invalid channel");
        }
        other => panic!("expected registration error, got {other:?}"),
    }
    assert_eq!(conductor.resource_count(), 0);
    assert!(!conductor.is_terminating());
    // Only async errors reach the error handler; this one went to the caller.
    assert!(h.errors.is_empty());
}

#[test]
fn driver_timeout_fires_at_the_deadline_not_before() {
    let h = Harness::new("drv_timeout");
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddPublication { .. } => Some(Vec::new()),
        _ => None,
    });
    let conductor = h.conductor();

    let start = h.clock.nano_time();
    let result = conductor.add_publication("aeron:ipc", 1);
    let elapsed = Duration::from_nanos((h.clock.nano_time() - start) as u64);

    assert!(matches!(result, Err(Error::DriverTimeout(_))), "{result:?}");
    assert!(elapsed >= DRIVER_TIMEOUT, "gave up after {elapsed:?}");
    assert!(elapsed <= DRIVER_TIMEOUT + Duration::from_millis(1));
    assert!(!conductor.is_terminating());
    assert_eq!(conductor.resource_count(), 0);

    // A late reply is ignored rather than registered.
    h.driver.push_event(DriverEvent::PublicationReady {
        correlation_id: FIRST_CORRELATION_ID,
        registration_id: FIRST_CORRELATION_ID,
        stream_id: 1,
        session_id: 1,
        publication_limit_id: 0,
        channel_status_id: 0,
        log_file_name: "never-mapped".into(),
        exclusive: false,
    });
    conductor.do_work().expect("do_work");
    assert_eq!(conductor.resource_count(), 0);
}

#[test]
fn unbounded_timeouts_neither_overflow_nor_fire() {
    let h = Harness::new("max_timeouts");
    let conductor = h.conductor_from(
        h.context()
            .driver_timeout(Duration::MAX)
            .inter_service_timeout(Duration::MAX),
    );

    let publication = conductor.add_publication("aeron:ipc", 1).expect("publication");
    h.clock.advance_ms(3_600_000);
    conductor.do_work().expect("do_work after an hour");
    assert!(!conductor.is_terminating());
    assert!(!publication.is_closed());

    // Nothing answers; only the interrupt ends the wait.
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddSubscription { .. } => Some(Vec::new()),
        _ => None,
    });
    conductor.interrupt();
    assert!(matches!(conductor.add_subscription("aeron:ipc", 2), Err(Error::Interrupted)));
    assert!(h.errors.is_empty(), "{:?}", h.errors.entries());
}

#[test]
fn responses_for_other_commands_do_not_complete_a_call() {
    let h = Harness::new("wrong_id");
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddDestination { .. } => Some(vec![DriverEvent::OperationSuccess {
            correlation_id: msg.correlation_id + 1000,
        }]),
        _ => None,
    });
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:udp?control=localhost:40456", 1).expect("add");

    let result = publication.add_destination("aeron:udp?endpoint=localhost:40457");
    assert!(matches!(result, Err(Error::DriverTimeout(_))), "{result:?}");
}

// ========== Destinations and async commands ==========

#[test]
fn sync_destination_commands_round_trip() {
    let h = Harness::new("dest_sync");
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:udp?control-mode=manual", 1).expect("pub");
    let subscription = conductor.add_subscription("aeron:udp?control-mode=manual", 1).expect("sub");

    publication.add_destination("aeron:udp?endpoint=a:1").expect("add dest");
    publication.remove_destination("aeron:udp?endpoint=a:1").expect("remove dest");
    subscription.add_rcv_destination("aeron:udp?endpoint=b:2").expect("add rcv");
    subscription.remove_rcv_destination("aeron:udp?endpoint=b:2").expect("remove rcv");

    let sent = h.driver.sent();
    assert!(sent.iter().any(|m| m.command
        == DriverCommand::AddDestination {
            registration_id: publication.registration_id(),
            channel: "aeron:udp?endpoint=a:1".into()
        }));
    assert!(sent.iter().any(|m| m.command
        == DriverCommand::RemoveRcvDestination {
            registration_id: subscription.registration_id(),
            channel: "aeron:udp?endpoint=b:2".into()
        }));
}

#[test]
fn async_command_stays_active_until_answered() {
    let h = Harness::new("dest_async");
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddDestination { .. } | DriverCommand::AddRcvDestination { .. } => Some(Vec::new()),
        _ => None,
    });
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:udp?control-mode=manual", 1).expect("pub");
    let subscription = conductor.add_subscription("aeron:udp?control-mode=manual", 1).expect("sub");

    let ok_id = publication.async_add_destination("aeron:udp?endpoint=a:1").expect("async add");
    let err_id = subscription.async_add_rcv_destination("aeron:udp?endpoint=b:2").expect("async rcv");
    assert!(conductor.is_command_active(ok_id).expect("query"));
    assert!(conductor.is_command_active(err_id).expect("query"));

    conductor.do_work().expect("do_work");
    assert!(conductor.is_command_active(ok_id).expect("query"), "no answer yet");

    h.driver.push_event(DriverEvent::OperationSuccess { correlation_id: ok_id });
    h.driver.push_event(DriverEvent::Error {
        correlation_id: err_id,
        code: ErrorCode::UnknownSubscription.code(),
        message: "no such subscription".into(),
    });
    // Errors for commands nobody is waiting on are dropped.
    h.driver.push_event(DriverEvent::Error {
        correlation_id: 9_999,
        code: 0,
        message: "stray".into(),
    });
    conductor.do_work().expect("do_work");

    assert!(!conductor.is_command_active(ok_id).expect("query"));
    assert!(!conductor.is_command_active(err_id).expect("query"));
    let errors = h.errors.entries();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].starts_with("Registration"));
    assert!(errors[0].contains("no such subscription"));
}

// ========== Counters ==========

#[test]
fn add_counter_notifies_handlers_and_release_reports_unavailable() {
    let h = Harness::new("ctr_add");
    let available = Arc::new(Mutex::new(Vec::new()));
    let unavailable = Arc::new(Mutex::new(Vec::new()));
    let (a, u) = (Arc::clone(&available), Arc::clone(&unavailable));
    let ctx = h
        .context()
        .available_counter_handler(Arc::new(move |_: &CountersReader, reg: i64, id: i32| a.lock().push((reg, id))))
        .unavailable_counter_handler(Arc::new(move |_: &CountersReader, reg: i64, id: i32| u.lock().push((reg, id))));
    let conductor = h.conductor_from(ctx);

    let counter = conductor.add_counter(1001, b"key", "requests served").expect("add counter");
    assert_eq!(counter.registration_id(), FIRST_CORRELATION_ID);
    assert_eq!(*available.lock(), vec![(counter.registration_id(), counter.id())]);
    let reader = conductor.counters_reader();
    assert_eq!(reader.counter_label(counter.id()), "requests served");
    assert_eq!(reader.counter_type_id(counter.id()), 1001);

    counter.set(5);
    assert_eq!(counter.increment(), 5);
    assert_eq!(reader.counter_value(counter.id()), 6);

    counter.close().expect("close");
    assert!(counter.is_closed());
    assert!(!conductor.is_registered(counter.registration_id()));
    assert_eq!(*unavailable.lock(), vec![(counter.registration_id(), counter.id())]);
    counter.close().expect("second close");
}

#[test]
fn counter_key_and_label_are_bounded() {
    let h = Harness::new("ctr_bounds");
    let conductor = h.conductor();

    let long_key = [0u8; 113];
    assert!(matches!(
        conductor.add_counter(1, &long_key, "x"),
        Err(Error::InvalidArgument(_))
    ));
    let long_label = "l".repeat(381);
    assert!(matches!(
        conductor.add_counter_with_label(1, &long_label),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(h.driver.sent_count(), 0);

    conductor.add_counter(1, &[0u8; 112], &"l".repeat(380)).expect("at the limit");
}

#[test]
fn counters_of_other_clients_reach_handlers_only() {
    let h = Harness::new("ctr_other");
    let conductor = h.conductor();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let id = conductor
        .add_available_counter_handler(Arc::new(move |_: &CountersReader, reg: i64, counter_id: i32| s.lock().push((reg, counter_id))))
        .expect("add handler");

    h.driver.push_event(DriverEvent::CounterReady {
        correlation_id: 555,
        counter_id: 3,
    });
    conductor.do_work().expect("do_work");
    assert_eq!(*seen.lock(), vec![(555, 3)]);
    assert!(!conductor.is_registered(555));

    assert!(conductor.remove_available_counter_handler(id).expect("remove"));
    assert!(!conductor.remove_available_counter_handler(id).expect("remove again"));
    h.driver.push_event(DriverEvent::CounterReady {
        correlation_id: 556,
        counter_id: 4,
    });
    conductor.do_work().expect("do_work");
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn unavailable_counter_handlers_can_be_removed() {
    let h = Harness::new("ctr_unavail");
    let conductor = h.conductor();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&calls);
    let id = conductor
        .add_unavailable_counter_handler(Arc::new(move |_: &CountersReader, _: i64, _: i32| {
            c.fetch_add(1, Ordering::Relaxed);
        }))
        .expect("add");

    h.driver.push_event(DriverEvent::UnavailableCounter {
        registration_id: 77,
        counter_id: 2,
    });
    conductor.do_work().expect("do_work");
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    conductor.remove_unavailable_counter_handler(id).expect("remove");
    h.driver.push_event(DriverEvent::UnavailableCounter {
        registration_id: 77,
        counter_id: 2,
    });
    conductor.do_work().expect("do_work");
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

// ========== Channel endpoint errors ==========

#[test]
fn channel_endpoint_error_closes_only_matching_resources() {
    let h = Harness::new("endpoint_err");
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:udp?endpoint=localhost:1", 1).expect("pub");
    let subscription = conductor.add_subscription("aeron:udp?endpoint=localhost:2", 1).expect("sub");
    assert_ne!(publication.channel_status_id(), subscription.channel_status_id());

    h.driver.push_event(DriverEvent::ChannelEndpointError {
        status_indicator_id: publication.channel_status_id(),
        message: "address already in use".into(),
    });
    conductor.do_work().expect("do_work");

    assert!(publication.is_closed());
    assert!(!conductor.is_registered(publication.registration_id()));
    assert_eq!(publication.log_buffers().ref_count(), 0);
    assert!(!subscription.is_closed());
    assert!(conductor.is_registered(subscription.registration_id()));
    assert_eq!(h.errors.count("ChannelEndpoint"), 1);
    assert!(!conductor.is_terminating());

    // Already closed: no remove is sent.
    publication.close().expect("close");
    assert_eq!(
        h.driver
            .count_sent(|c| matches!(c, DriverCommand::RemovePublication { .. })),
        0
    );
}

// ========== Liveness ==========

#[test]
fn missed_service_interval_is_fatal() {
    let h = Harness::new("svc_timeout");
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:ipc", 1).expect("pub");

    let overdue = INTER_SERVICE_TIMEOUT.as_millis() as i64 + 100;
    assert_eq!(h.tick(&conductor, overdue).expect("do_work"), 0);

    assert_eq!(h.errors.count("ServiceTimeout"), 1);
    assert!(conductor.is_terminating());
    assert_eq!(conductor.resource_count(), 0);
    assert!(publication.is_closed());
    assert_eq!(conductor.lingering_log_buffers().len(), 1);

    assert!(matches!(conductor.do_work(), Err(Error::AgentTermination)));
    assert!(matches!(
        conductor.add_publication("aeron:ipc", 2),
        Err(Error::ClientTerminating)
    ));
}

#[test]
fn client_timeout_closes_every_resource() {
    let h = Harness::new("client_timeout");
    let gone_counters = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&gone_counters);
    let ctx = h.context().unavailable_counter_handler(Arc::new(move |_: &CountersReader, _: i64, _: i32| {
        g.fetch_add(1, Ordering::Relaxed);
    }));
    let conductor = h.conductor_from(ctx);
    let file = h.log_file("img");

    let publication = conductor.add_publication("aeron:ipc", 1).expect("pub");
    let subscription = conductor.add_subscription("aeron:ipc", 1).expect("sub");
    let counter = conductor.add_counter_with_label(1001, "work").expect("counter");
    h.driver.push_event(available_image(500, 1, subscription.registration_id(), &file));
    conductor.do_work().expect("do_work");

    // Timeouts for other clients are not ours.
    h.driver.push_event(DriverEvent::ClientTimeout { client_id: CLIENT_ID + 1 });
    conductor.do_work().expect("do_work");
    assert!(!conductor.is_terminating());

    h.driver.push_event(DriverEvent::ClientTimeout { client_id: CLIENT_ID });
    conductor.do_work().expect("do_work");

    assert!(conductor.is_terminating());
    assert_eq!(h.errors.count("ClientTimeout"), 1);
    assert_eq!(conductor.resource_count(), 0);
    assert!(publication.is_closed());
    assert!(subscription.is_closed());
    assert_eq!(subscription.image_count(), 0);
    assert!(counter.is_closed());
    assert_eq!(gone_counters.load(Ordering::Relaxed), 1);
    assert!(matches!(
        conductor.add_subscription("aeron:ipc", 2),
        Err(Error::ClientTerminating)
    ));
}

#[test]
fn heartbeat_counter_is_refreshed_and_its_loss_is_fatal() {
    let h = Harness::new("heartbeat");
    let conductor = h.conductor();
    let heartbeat = h
        .counters
        .allocate_keyed(CLIENT_HEARTBEAT_TYPE_ID, CLIENT_ID, "client-heartbeat")
        .expect("heartbeat");
    let reader = conductor.counters_reader();

    h.tick(&conductor, 150).expect("tick");
    assert_eq!(reader.counter_value(heartbeat), h.clock.time());

    h.tick(&conductor, 150).expect("tick");
    assert_eq!(reader.counter_value(heartbeat), h.clock.time());
    assert!(!conductor.is_terminating());

    h.counters.free(heartbeat);
    h.tick(&conductor, 150).expect("tick");
    assert_eq!(h.errors.count("HeartbeatCounterClosed"), 1);
    assert!(conductor.is_terminating());
}

#[test]
fn stale_driver_keepalive_is_fatal() {
    let h = Harness::new("keepalive");
    let conductor = h.conductor();
    let publication = conductor.add_publication("aeron:ipc", 1).expect("pub");

    h.driver.freeze_keepalive(h.clock.time());
    h.tick(&conductor, 300).expect("tick");
    assert!(!conductor.is_terminating(), "keepalive only 300ms old");

    h.tick(&conductor, 300).expect("tick");
    assert_eq!(h.errors.count("DriverTimeout"), 1);
    assert!(conductor.is_terminating());
    assert!(publication.is_closed());
}

#[test]
fn broken_event_channel_closes_the_client() {
    let h = Harness::new("broken");
    let conductor = h.conductor();
    conductor.add_publication("aeron:ipc", 1).expect("pub");

    h.driver.break_channel();
    assert_eq!(conductor.do_work().expect("do_work"), 0);
    assert_eq!(h.errors.count("Io"), 1);
    assert!(conductor.is_closed());
    assert_eq!(conductor.resource_count(), 0);
    assert_eq!(
        h.driver.count_sent(|c| matches!(c, DriverCommand::ClientClose)),
        1
    );
}

// ========== Interrupt ==========

#[test]
fn interrupt_aborts_the_waiting_call() {
    let h = Harness::new("interrupt");
    h.driver.override_replies(|msg| match msg.command {
        DriverCommand::AddSubscription { .. } => Some(Vec::new()),
        _ => None,
    });
    let conductor = h.conductor();

    conductor.interrupt();
    let result = conductor.add_subscription("aeron:ipc", 1);
    assert!(matches!(result, Err(Error::Interrupted)), "{result:?}");
    assert!(conductor.is_terminating());
    assert_eq!(conductor.resource_count(), 0);
    assert!(matches!(conductor.do_work(), Err(Error::AgentTermination)));
}

// ========== Reentrancy ==========

#[test]
fn calls_from_image_handler_are_rejected() {
    let h = Harness::new("reentrant_image");
    let conductor = h.conductor();
    let file = h.log_file("img");
    let slot = weak_slot();
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let (s, o) = (Arc::clone(&slot), Arc::clone(&outcomes));
    let subscription = conductor
        .add_subscription_with_handlers(
            "aeron:ipc",
            1,
            Some(Arc::new(move |_: &Image| {
                let c = upgrade(&s);
                let mut o = o.lock();
                o.push(matches!(c.add_publication("aeron:ipc", 9), Err(Error::ReentrantCall)));
                o.push(matches!(c.add_subscription("aeron:ipc", 9), Err(Error::ReentrantCall)));
                o.push(matches!(c.is_command_active(1), Err(Error::ReentrantCall)));
                o.push(matches!(c.close(), Err(Error::ReentrantCall)));
                o.push(matches!(c.do_work(), Ok(0)));
            })),
            None,
        )
        .expect("add");
    slot.set(Arc::downgrade(&conductor)).expect("slot");

    let before = h.driver.sent_count();
    h.driver.push_event(available_image(600, 1, subscription.registration_id(), &file));
    conductor.do_work().expect("do_work");

    assert_eq!(*outcomes.lock(), vec![true; 5]);
    assert_eq!(h.driver.sent_count(), before);
    assert!(!conductor.is_closed());

    // Outside the callback the same calls work again.
    conductor.add_publication("aeron:ipc", 9).expect("after callback");
}

#[test]
fn calls_from_counter_and_error_handlers_are_rejected() {
    let h = Harness::new("reentrant_counter");
    let slot = weak_slot();
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let (s, o) = (Arc::clone(&slot), Arc::clone(&outcomes));
    let ctx = h
        .context()
        .available_counter_handler(Arc::new(move |_: &CountersReader, _: i64, _: i32| {
            let c = upgrade(&s);
            o.lock()
                .push(matches!(c.add_counter_with_label(1, "nested"), Err(Error::ReentrantCall)));
        }));
    let (s, o) = (Arc::clone(&slot), Arc::clone(&outcomes));
    let ctx = ctx.error_handler(Arc::new(move |_: &Error| {
        let c = upgrade(&s);
        o.lock()
            .push(matches!(c.add_publication("aeron:ipc", 1), Err(Error::ReentrantCall)));
    }));
    let conductor = h.conductor_from(ctx);
    slot.set(Arc::downgrade(&conductor)).expect("slot");

    let before = h.driver.sent_count();
    h.driver.push_event(DriverEvent::CounterReady {
        correlation_id: 700,
        counter_id: 1,
    });
    h.driver.push_event(DriverEvent::ChannelEndpointError {
        status_indicator_id: 12345,
        message: "unmatched".into(),
    });
    let subscription = conductor.add_subscription("aeron:ipc", 1).expect("sub");
    h.driver.push_event(DriverEvent::ChannelEndpointError {
        status_indicator_id: subscription.channel_status_id(),
        message: "bind failed".into(),
    });
    conductor.do_work().expect("do_work");

    assert_eq!(*outcomes.lock(), vec![true, true]);
    assert_eq!(h.driver.sent_count(), before + 1, "only the subscription was sent");
}

// ========== Close ==========

#[test]
fn close_runs_handlers_in_reverse_and_tells_driver_once() {
    let h = Harness::new("close_order");
    let conductor = h.conductor();
    let order = Arc::new(Mutex::new(Vec::new()));
    for n in 1..=3 {
        let o = Arc::clone(&order);
        conductor
            .add_close_handler(Arc::new(move || o.lock().push(n)))
            .expect("add close handler");
    }
    let removed = conductor.add_close_handler(Arc::new(|| panic!("removed handler ran"))).expect("add");
    assert!(conductor.remove_close_handler(removed).expect("remove"));

    let publication = conductor.add_publication("aeron:ipc", 1).expect("pub");
    conductor.close().expect("close");

    assert_eq!(*order.lock(), vec![3, 2, 1]);
    assert!(conductor.is_closed());
    assert!(publication.is_closed());
    assert!(!publication.log_buffers().is_mapped(), "lingering buffers deleted on close");
    assert!(conductor.lingering_log_buffers().is_empty());
    let last = h.driver.sent().pop().expect("commands");
    assert_eq!(last.command, DriverCommand::ClientClose);

    conductor.close().expect("second close");
    assert_eq!(order.lock().len(), 3);
    assert_eq!(h.driver.count_sent(|c| matches!(c, DriverCommand::ClientClose)), 1);

    assert!(matches!(conductor.add_publication("aeron:ipc", 1), Err(Error::ClientClosed)));
    assert!(matches!(conductor.do_work(), Err(Error::AgentTermination)));
    publication.close().expect("release after close is a no-op");
}

#[test]
fn close_handler_panic_does_not_stop_the_others() {
    let h = Harness::new("close_panic");
    let conductor = h.conductor();
    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    conductor
        .add_close_handler(Arc::new(move || {
            r.fetch_add(1, Ordering::Relaxed);
        }))
        .expect("add");
    conductor.add_close_handler(Arc::new(|| panic!("close handler failed"))).expect("add");

    conductor.close().expect("close");
    assert_eq!(ran.load(Ordering::Relaxed), 1);
    assert_eq!(h.errors.count("Callback"), 1);
}

#[test]
fn close_handler_cannot_reenter() {
    let h = Harness::new("close_reenter");
    let conductor = h.conductor();
    let slot = weak_slot();
    slot.set(Arc::downgrade(&conductor)).expect("slot");
    let outcome = Arc::new(Mutex::new(None));
    let (s, o) = (Arc::clone(&slot), Arc::clone(&outcome));
    conductor
        .add_close_handler(Arc::new(move || {
            let c = upgrade(&s);
            *o.lock() = Some(matches!(c.add_counter_with_label(1, "late"), Err(Error::ReentrantCall)));
        }))
        .expect("add");

    conductor.close().expect("close");
    assert_eq!(*outcome.lock(), Some(true));
}

// ========== Embedded driver ==========

#[test]
fn embedded_driver_is_invoked_while_awaiting() {
    let h = Harness::new("embedded");
    h.driver.respond_on_receive(false);
    let invoker = AgentInvoker::new(h.driver.agent(), h.errors.handler());
    let conductor = h.conductor_from(h.context().driver_agent_invoker(invoker));

    let publication = conductor.add_publication("aeron:ipc", 1).expect("pub");
    assert_eq!(publication.log_buffers().ref_count(), 1);

    conductor.close().expect("close");
    assert!(h.driver.agent_closed());
}

// ========== Concurrency ==========

#[test]
fn concurrent_callers_are_serialised() {
    let h = Harness::new("concurrent");
    let conductor = h.conductor();

    let ids: Vec<i64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let c = Arc::clone(&conductor);
                scope.spawn(move || {
                    (0..5)
                        .map(|i| c.add_publication("aeron:ipc", t * 10 + i).expect("pub").registration_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|handle| handle.join().expect("join")).collect()
    });

    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 20);
    assert_eq!(conductor.resource_count(), 20);
}

#[test]
fn unknown_events_are_ignored() {
    let h = Harness::new("unknown_evt");
    let conductor = h.conductor();
    h.driver.push_event(DriverEvent::Unknown { type_id: 0x7777 });
    assert_eq!(conductor.do_work().expect("do_work"), 1);
    assert!(h.errors.is_empty());
}
