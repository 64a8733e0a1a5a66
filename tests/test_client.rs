// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Client lifecycle in both threading modes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use libipc_conductor::command::{DriverCommand, DriverEvent};
use libipc_conductor::{Client, Error};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn invoker_mode_runs_only_when_driven() {
    let h = Harness::new("client_invoker");
    let client = Client::connect(h.context().use_conductor_agent_invoker(true)).expect("connect");
    assert_eq!(client.client_id(), CLIENT_ID);

    let publication = client.add_publication("aeron:ipc", 1).expect("pub");
    let file = h.log_file("img");
    let subscription = client.add_subscription("aeron:ipc", 1).expect("sub");
    h.driver.push_event(DriverEvent::AvailableImage {
        correlation_id: 900,
        session_id: 4,
        subscription_registration_id: subscription.registration_id(),
        subscriber_position_id: 0,
        log_file_name: file,
        source_identity: "ipc".into(),
    });
    assert_eq!(subscription.image_count(), 0, "nothing services events until do_work");
    assert!(client.do_work() > 0);
    assert_eq!(subscription.image_count(), 1);

    client.close().expect("close");
    assert!(client.is_closed());
    assert!(publication.is_closed());
    assert!(matches!(client.add_publication("aeron:ipc", 2), Err(Error::ClientClosed)));
    assert_eq!(client.do_work(), 0);
    assert_eq!(h.driver.count_sent(|c| matches!(c, DriverCommand::ClientClose)), 1);
}

#[test]
fn runner_mode_services_in_the_background() {
    let h = Harness::new("client_runner");
    let client = Client::connect(h.context()).expect("connect");
    let counter = client.add_counter_with_label(1001, "jobs").expect("counter");

    let seen = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&seen);
    client
        .add_available_counter_handler(Arc::new(move |_: &libipc_conductor::counters::CountersReader, _: i64, _: i32| {
            s.fetch_add(1, Ordering::Relaxed);
        }))
        .expect("handler");
    h.driver.push_event(DriverEvent::CounterReady {
        correlation_id: 12_345,
        counter_id: counter.id(),
    });
    assert!(wait_until(Duration::from_secs(5), || seen.load(Ordering::Relaxed) == 1));

    client.close().expect("close");
    assert!(counter.is_closed());
    client.close().expect("second close");
}

#[test]
fn client_timeout_shuts_the_runner_down() {
    let h = Harness::new("client_gone");
    let client = Client::connect(h.context()).expect("connect");
    let publication = client.add_publication("aeron:ipc", 1).expect("pub");

    h.driver.push_event(DriverEvent::ClientTimeout { client_id: CLIENT_ID });
    assert!(wait_until(Duration::from_secs(5), || client.is_closed()));
    assert!(publication.is_closed());
    assert_eq!(h.errors.count("ClientTimeout"), 1);
    assert!(matches!(client.add_subscription("aeron:ipc", 1), Err(Error::ClientClosed)));
}

#[test]
fn close_handlers_run_on_drop() {
    let h = Harness::new("client_drop");
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let client = Client::connect(h.context().use_conductor_agent_invoker(true)).expect("connect");
        let r = Arc::clone(&ran);
        client
            .add_close_handler(Arc::new(move || {
                r.fetch_add(1, Ordering::Relaxed);
            }))
            .expect("close handler");
    }
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}
