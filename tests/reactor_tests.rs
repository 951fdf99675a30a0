//! Integration tests driving a real ring: timers, cross-thread dispatch,
//! TCP and Unix-domain socket round trips, file I/O.

use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rivulet::{net, Buffer, Flow, PeerAddr, Reactor, StopSignal};

fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rivulet-{tag}-{}", std::process::id()))
}

#[test]
fn timer_fires_and_reports_elapsed() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let elapsed = Rc::new(Cell::new(-1.0));
    let seen = Rc::clone(&elapsed);
    reactor
        .timer(
            Duration::from_millis(10),
            move |ctx, response| {
                seen.set(response.elapsed);
                ctx.stop.request_stop();
                Flow::Stop
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    assert!(elapsed.get() >= 0.010, "elapsed was {}", elapsed.get());
}

#[test]
fn zero_duration_timer_fires_promptly() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let started = Instant::now();
    reactor
        .timer(
            Duration::ZERO,
            |ctx, _response| {
                ctx.stop.request_stop();
                Flow::Stop
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    // Must not wait for the 500 ms completion timeout.
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn timer_repeats_until_stopped() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let fires: Rc<RefCell<Vec<f64>>> = Rc::default();
    let seen = Rc::clone(&fires);
    reactor
        .timer(
            Duration::from_millis(20),
            move |ctx, response| {
                seen.borrow_mut().push(response.elapsed);
                if seen.borrow().len() == 2 {
                    ctx.stop.request_stop();
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    let fires = fires.borrow();
    assert_eq!(fires.len(), 2);
    assert!(fires.iter().all(|&e| e >= 0.020), "fires: {fires:?}");
}

#[test]
fn dispatch_from_foreign_thread_wakes_the_loop() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let dispatcher = reactor.dispatcher();
    let stop_from_thread = stop.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        dispatcher.dispatch(move |_reactor| {
            stop_from_thread.request_stop();
        });
    });

    let started = Instant::now();
    reactor.run(&stop).unwrap();
    // One 500 ms wait at most, plus the 50 ms thread delay.
    assert!(started.elapsed() < Duration::from_secs(1));
    handle.join().unwrap();
}

#[test]
fn submit_guard_batches_and_flushes_on_drop() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let fired = Rc::new(Cell::new(0));
    {
        let mut guard = reactor.submit_guard();
        assert_eq!(guard.pending(), 0);
        for _ in 0..3 {
            let fired = Rc::clone(&fired);
            reactor
                .timer(
                    Duration::ZERO,
                    move |ctx, _response| {
                        fired.set(fired.get() + 1);
                        if fired.get() == 3 {
                            ctx.stop.request_stop();
                        }
                        Flow::Stop
                    },
                    Some(&mut guard),
                )
                .unwrap();
        }
        assert_eq!(guard.pending(), 3);
        // Nothing submitted yet; the drop below flushes all three at once.
    }

    reactor.run(&stop).unwrap();
    assert_eq!(fired.get(), 3);
}

#[test]
fn tcp_accept_connect_send_receive() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let listener = net::tcp_listen(Ipv4Addr::LOCALHOST, 0, net::DEFAULT_BACKLOG).unwrap();
    let port = listener.address().port();
    assert_ne!(port, 0);

    let received: Rc<RefCell<Vec<u8>>> = Rc::default();
    let seen = Rc::clone(&received);
    reactor
        .accept(
            &listener,
            move |ctx, response| {
                assert!(response.client.is_open());
                match &response.peer {
                    PeerAddr::Inet(addr) => assert_eq!(addr.ip(), &Ipv4Addr::LOCALHOST),
                    PeerAddr::Unix(path) => panic!("unexpected unix peer {path:?}"),
                }

                let seen = Rc::clone(&seen);
                ctx.reactor
                    .receive(
                        response.client,
                        Buffer::new(64),
                        move |ctx, response| {
                            seen.borrow_mut().extend_from_slice(response.data);
                            ctx.stop.request_stop();
                            Flow::Stop
                        },
                        None,
                    )
                    .unwrap();
                Flow::Stop
            },
            None,
        )
        .unwrap();

    reactor
        .connect(
            Ipv4Addr::LOCALHOST,
            port,
            move |ctx, response| {
                assert!(response.error.is_none(), "connect: {:?}", response.error);
                ctx.reactor
                    .send(
                        response.client,
                        Buffer::from_bytes("hi\n"),
                        |_ctx, response| assert_eq!(response.size, 3),
                        None,
                    )
                    .unwrap();
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    assert_eq!(received.borrow().as_slice(), b"hi\n");
}

#[test]
fn receive_zero_bytes_disarms_after_one_callback() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let listener = net::tcp_listen(Ipv4Addr::LOCALHOST, 0, net::DEFAULT_BACKLOG).unwrap();
    let port = listener.address().port();

    let calls: Rc<RefCell<Vec<usize>>> = Rc::default();
    let seen = Rc::clone(&calls);
    reactor
        .accept(
            &listener,
            move |ctx, response| {
                let seen = Rc::clone(&seen);
                ctx.reactor
                    .receive(
                        response.client,
                        Buffer::new(64),
                        move |ctx, response| {
                            seen.borrow_mut().push(response.data.len());
                            ctx.stop.request_stop();
                            // Deliberately ask to continue; the zero-sized
                            // result must still disarm the operation.
                            Flow::Continue
                        },
                        None,
                    )
                    .unwrap();
                Flow::Stop
            },
            None,
        )
        .unwrap();

    reactor
        .connect(
            Ipv4Addr::LOCALHOST,
            port,
            move |ctx, response| {
                assert!(response.error.is_none());
                // Close immediately so the server sees EOF.
                ctx.reactor
                    .close(response.client, |_, _| {}, None)
                    .unwrap();
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    assert_eq!(calls.borrow().as_slice(), &[0]);
}

#[test]
fn unix_socket_round_trip() {
    let path = temp_path("uds");
    let _ = std::fs::remove_file(&path);

    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let listener = net::unix_listen(&path, net::DEFAULT_BACKLOG).unwrap();

    let received: Rc<RefCell<Vec<u8>>> = Rc::default();
    let seen = Rc::clone(&received);
    reactor
        .accept_unix(
            &listener,
            move |ctx, response| {
                let seen = Rc::clone(&seen);
                ctx.reactor
                    .receive(
                        response.client,
                        Buffer::new(64),
                        move |ctx, response| {
                            seen.borrow_mut().extend_from_slice(response.data);
                            ctx.stop.request_stop();
                            Flow::Stop
                        },
                        None,
                    )
                    .unwrap();
                Flow::Stop
            },
            None,
        )
        .unwrap();

    let connect_path = path.clone();
    reactor
        .connect_unix(
            &connect_path,
            move |ctx, response| {
                assert!(response.error.is_none(), "connect: {:?}", response.error);
                ctx.reactor
                    .send(
                        response.client,
                        Buffer::from_bytes("ping\n"),
                        |_, _| {},
                        None,
                    )
                    .unwrap();
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    assert_eq!(received.borrow().as_slice(), b"ping\n");
    let _ = std::fs::remove_file(&path);
}

#[test]
fn connect_failure_surfaces_error_in_response() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    // Grab an ephemeral port, then close the listener so nothing accepts
    // on it; the connect completion carries the refusal.
    let listener = net::tcp_listen(Ipv4Addr::LOCALHOST, 0, net::DEFAULT_BACKLOG).unwrap();
    let port = listener.address().port();
    unsafe { libc::close(listener.socket().raw()) };

    let failed = Rc::new(Cell::new(false));
    let seen = Rc::clone(&failed);
    reactor
        .connect(
            Ipv4Addr::LOCALHOST,
            port,
            move |ctx, response| {
                seen.set(response.error.is_some());
                ctx.stop.request_stop();
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    assert!(failed.get());
}

#[test]
fn file_round_trip_reads_payload_exactly_once() {
    let path = temp_path("roundtrip");
    let _ = std::fs::remove_file(&path);

    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    let chunks: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
    let seen = Rc::clone(&chunks);

    let reopen_path = path.clone();
    reactor
        .open_file_with(
            &path,
            libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
            0o600,
            move |ctx, response| {
                assert!(response.file.is_open(), "open failed: {}", ctx.result);
                let seen = Rc::clone(&seen);
                let reopen_path = reopen_path.clone();
                ctx.reactor
                    .write_file(
                        response.file,
                        Buffer::from_bytes("Hello, World!"),
                        move |ctx, response| {
                            assert_eq!(response.size, 13);
                            let seen = Rc::clone(&seen);
                            let reopen_path = reopen_path.clone();
                            ctx.reactor
                                .close(
                                    response.file,
                                    move |ctx, _response| {
                                        let seen = Rc::clone(&seen);
                                        ctx.reactor
                                            .open_file(
                                                &reopen_path,
                                                move |ctx, response| {
                                                    assert!(response.file.is_open());
                                                    let seen = Rc::clone(&seen);
                                                    ctx.reactor
                                                        .read_file(
                                                            response.file,
                                                            Buffer::new(32),
                                                            0,
                                                            move |ctx, response| {
                                                                seen.borrow_mut()
                                                                    .push(response.data.to_vec());
                                                                if response.data.is_empty() {
                                                                    ctx.stop.request_stop();
                                                                    Flow::Stop
                                                                } else {
                                                                    Flow::Continue
                                                                }
                                                            },
                                                            None,
                                                        )
                                                        .unwrap();
                                                },
                                                None,
                                            )
                                            .unwrap();
                                    },
                                    None,
                                )
                                .unwrap();
                        },
                        None,
                    )
                    .unwrap();
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();

    let chunks = chunks.borrow();
    assert_eq!(chunks.len(), 2, "chunks: {chunks:?}");
    assert_eq!(chunks[0], b"Hello, World!");
    assert!(chunks[1].is_empty());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn stat_file_reports_size_and_missing_paths() {
    let path = temp_path("stat");
    std::fs::write(&path, b"12345").unwrap();

    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    // Completion order between the two stats is not guaranteed; collect
    // both before stopping.
    let outcomes: Rc<RefCell<Vec<Option<u64>>>> = Rc::default();

    let seen = Rc::clone(&outcomes);
    reactor
        .stat_file(
            &path,
            move |ctx, response| {
                seen.borrow_mut()
                    .push(response.stats.as_ref().map(|s| s.stx_size));
                if seen.borrow().len() == 2 {
                    ctx.stop.request_stop();
                }
            },
            None,
        )
        .unwrap();

    let seen = Rc::clone(&outcomes);
    reactor
        .stat_file(
            temp_path("stat-missing"),
            move |ctx, response| {
                assert!(ctx.result < 0);
                seen.borrow_mut()
                    .push(response.stats.as_ref().map(|s| s.stx_size));
                if seen.borrow().len() == 2 {
                    ctx.stop.request_stop();
                }
            },
            None,
        )
        .unwrap();

    reactor.run(&stop).unwrap();
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.contains(&Some(5)));
    assert!(outcomes.contains(&None));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn print_stdout_reports_written_size() {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new().unwrap();

    reactor
        .print_stdout("reactor says hi\n", |ctx, response| {
            assert_eq!(response.size, 16);
            ctx.stop.request_stop();
        }, None)
        .unwrap();

    reactor.run(&stop).unwrap();
}
