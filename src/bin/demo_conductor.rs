// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage:
//   demo_conductor driver [dir]
//   demo_conductor client [dir]
//
// The driver process creates the CnC file, rings and counters under <dir>
// (default: $IPCC_DIR or "ipcc-default") and answers commands until SIGINT.
// The client process connects, adds a publication, a subscription and a
// counter, prints what it got back, then closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use libipc_conductor::clock::{EpochClock, SystemEpochClock};
use libipc_conductor::command::{DriverCommand, DriverEvent};
use libipc_conductor::counters::{channel_status, CountersManager};
use libipc_conductor::ipc::DriverEndpoint;
use libipc_conductor::{Client, Context, Image, ShmHandle, ShmOpenMode};

const LOG_LENGTH: usize = 64 * 1024;
const CHANNEL_STATUS_TYPE_ID: i32 = 7;

fn run_driver(dir: &str, quit: Arc<AtomicBool>) {
    let endpoint = DriverEndpoint::create(dir, 10_000_000_000).expect("create driver endpoint");
    let counters = CountersManager::create(dir, 256).expect("create counters");
    counters.allocate(0, &[], "reserved").expect("reserve counter 0");
    println!("driver: listening on {dir} (pid {})", endpoint.cnc().driver_pid());

    let mut log_files: Vec<ShmHandle> = Vec::new();
    let mut counter_ids = HashMap::new();
    let mut batch = Vec::new();
    let send = |event: DriverEvent| {
        if let Err(e) = endpoint.send_event(&event) {
            eprintln!("driver: dropped event: {e}");
        }
    };
    while !quit.load(Ordering::Acquire) {
        endpoint.heartbeat(SystemEpochClock.time());
        batch.clear();
        endpoint.poll_commands(&mut batch);
        for msg in batch.drain(..) {
            let id = msg.correlation_id;
            println!("driver: client {} -> {:?}", msg.client_id, msg.command);
            match msg.command {
                DriverCommand::AddPublication { stream_id, .. }
                | DriverCommand::AddExclusivePublication { stream_id, .. } => {
                    let file = format!("{dir}-log-{id}");
                    match ShmHandle::acquire(&file, LOG_LENGTH, ShmOpenMode::CreateOrOpen) {
                        Ok(shm) => log_files.push(shm),
                        Err(e) => {
                            send(DriverEvent::Error {
                                correlation_id: id,
                                code: 0,
                                message: e.to_string(),
                            });
                            continue;
                        }
                    }
                    let status = counters
                        .allocate(CHANNEL_STATUS_TYPE_ID, &[], "snd-channel")
                        .expect("allocate status counter");
                    counters.set_value(status, channel_status::ACTIVE);
                    send(DriverEvent::PublicationReady {
                        correlation_id: id,
                        registration_id: id,
                        stream_id,
                        session_id: (id & 0x7fff_ffff) as i32,
                        publication_limit_id: status,
                        channel_status_id: status,
                        log_file_name: file,
                        exclusive: matches!(msg.command, DriverCommand::AddExclusivePublication { .. }),
                    });
                }
                DriverCommand::AddSubscription { .. } => send(DriverEvent::SubscriptionReady {
                    correlation_id: id,
                    channel_status_id: channel_status::NO_ID_ALLOCATED,
                }),
                DriverCommand::AddCounter { type_id, key, label } => {
                    match counters.allocate(type_id, &key, &label) {
                        Ok(counter_id) => {
                            counter_ids.insert(id, counter_id);
                            send(DriverEvent::CounterReady {
                                correlation_id: id,
                                counter_id,
                            });
                        }
                        Err(e) => send(DriverEvent::Error {
                            correlation_id: id,
                            code: 0,
                            message: e.to_string(),
                        }),
                    }
                }
                DriverCommand::RemoveCounter { registration_id } => {
                    send(DriverEvent::OperationSuccess { correlation_id: id });
                    if let Some(counter_id) = counter_ids.remove(&registration_id) {
                        counters.free(counter_id);
                        send(DriverEvent::UnavailableCounter {
                            registration_id,
                            counter_id,
                        });
                    }
                }
                DriverCommand::ClientKeepalive | DriverCommand::ClientClose => {}
                _ => send(DriverEvent::OperationSuccess { correlation_id: id }),
            }
        }
        thread::sleep(Duration::from_millis(1));
    }
    println!("driver: shutting down");
}

fn run_client(dir: &str) {
    let ctx = Context::from_env()
        .dir(dir)
        .client_name("demo-client")
        .available_image_handler(Arc::new(|image: &Image| {
            println!("client: image {} from {}", image.session_id(), image.source_identity());
        }));
    let client = Client::connect(ctx).expect("connect to driver");
    println!("client: connected as {}", client.client_id());

    let publication = client.add_publication("aeron:ipc", 1001).expect("add publication");
    println!(
        "client: publication {} session {} log {} ({} bytes)",
        publication.registration_id(),
        publication.session_id(),
        publication.log_buffers().file_name(),
        publication.log_buffers().length()
    );

    let subscription = client.add_subscription("aeron:ipc", 1001).expect("add subscription");
    println!(
        "client: subscription {} status {}",
        subscription.registration_id(),
        subscription.channel_status()
    );

    let counter = client.add_counter_with_label(1001, "demo counter").expect("add counter");
    counter.increment();
    println!(
        "client: counter {} = {}",
        counter.id(),
        client.counters_reader().counter_value(counter.id())
    );

    client.close().expect("close");
    println!("client: closed");
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: demo_conductor driver [dir]");
        eprintln!("       demo_conductor client [dir]");
        std::process::exit(1);
    }
    let dir = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| Context::from_env().dir);

    let quit = Arc::new(AtomicBool::new(false));
    let q = Arc::clone(&quit);
    on_signal(move || q.store(true, Ordering::Release));

    match args[1].as_str() {
        "driver" => run_driver(&dir, quit),
        "client" => run_client(&dir),
        other => {
            eprintln!("unknown mode: {other}");
            std::process::exit(1);
        }
    }
}

/// Raise the quit flag on SIGINT, SIGTERM or SIGHUP.
fn on_signal(f: impl Fn() + Send + Sync + 'static) {
    #[cfg(unix)]
    {
        static QUIT: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>> = std::sync::OnceLock::new();
        let _ = QUIT.set(Box::new(f));
        extern "C" fn handler(_: libc::c_int) {
            if let Some(quit) = QUIT.get() {
                quit();
            }
        }
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            unsafe { libc::signal(sig, handler as *const () as libc::sighandler_t) };
        }
    }
    #[cfg(not(unix))]
    {
        let _ = f;
    }
}
