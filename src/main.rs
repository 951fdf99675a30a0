//! Demo programs exercising the reactor: a TCP/Unix-domain chat server and
//! client, a UDP receiver and a file pipeline. Select with the first
//! argument: `server`, `client`, `udp_server`, `uds_server`, `uds_client`,
//! `file`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rivulet::{net, try_extract_error, Buffer, Flow, PeerAddr, Reactor, Socket, StopSignal};

type Clients = Rc<RefCell<BTreeMap<Socket, PeerAddr>>>;

fn remove_client(clients: &Clients, client: Socket) {
    if clients.borrow_mut().remove(&client).is_some() {
        println!("Client: {client} disconnected");
    }
}

/// Arm the per-client receive loop: print messages, broadcast them to the
/// other clients under a single batched submit, drop the client on EOF or
/// an `exit` line.
fn install_chat_session(reactor: &mut Reactor, clients: &Clients, client: Socket) {
    let clients = Rc::clone(clients);
    let result = reactor.receive(
        client,
        Buffer::new(1024),
        move |ctx, response| {
            if response.data.is_empty() {
                remove_client(&clients, client);
                return Flow::Stop;
            }

            let text = String::from_utf8_lossy(response.data).into_owned();
            print!("Message: {text}");

            if text == "exit\n" {
                remove_client(&clients, client);
                if let Err(err) = ctx.reactor.close(client, |_, _| {}, None) {
                    tracing::warn!(error = %err, "close failed");
                }
                return Flow::Stop;
            }

            let output = Buffer::from_bytes(format!("Other: {text}"));
            let peers: Vec<Socket> = clients.borrow().keys().copied().collect();
            let mut guard = ctx.reactor.submit_guard();
            for peer in peers {
                if peer == client {
                    continue;
                }
                let clients = Rc::clone(&clients);
                let sent = ctx.reactor.send(
                    peer,
                    output.clone(),
                    move |_ctx, response| {
                        if response.size == 0 {
                            remove_client(&clients, response.client);
                        }
                    },
                    Some(&mut guard),
                );
                if let Err(err) = sent {
                    tracing::warn!(error = %err, %peer, "broadcast send failed");
                }
            }

            Flow::Continue
        },
        None,
    );
    if let Err(err) = result {
        tracing::warn!(error = %err, %client, "could not arm receive");
    }
}

/// Periodic "Hello, All!" broadcast to every connected client.
fn install_broadcast_timer(reactor: &mut Reactor, clients: &Clients) -> rivulet::Result<()> {
    let clients = Rc::clone(clients);
    reactor.timer(
        Duration::from_secs_f64(7.5),
        move |ctx, response| {
            println!("Broadcasting message (elapsed: {})", response.elapsed);

            let output = Buffer::from_bytes("Hello, All!\n");
            let peers: Vec<Socket> = clients.borrow().keys().copied().collect();
            let mut guard = ctx.reactor.submit_guard();
            for peer in peers {
                let clients = Rc::clone(&clients);
                let sent = ctx.reactor.send(
                    peer,
                    output.clone(),
                    move |_ctx, response| {
                        if response.size == 0 {
                            remove_client(&clients, response.client);
                        }
                    },
                    Some(&mut guard),
                );
                if let Err(err) = sent {
                    tracing::warn!(error = %err, %peer, "broadcast send failed");
                }
            }

            Flow::Continue
        },
        None,
    )
}

fn run_chat_server() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    let listener = net::tcp_listen_any(9000, net::DEFAULT_BACKLOG)?;
    println!(
        "Server socket: {} = {}",
        listener.socket(),
        listener.address()
    );

    let clients: Clients = Rc::new(RefCell::new(BTreeMap::new()));

    let accept_clients = Rc::clone(&clients);
    reactor.accept(
        &listener,
        move |ctx, response| {
            println!("Accepted client: {} = {}", response.client, response.peer);
            accept_clients
                .borrow_mut()
                .insert(response.client, response.peer.clone());
            install_chat_session(ctx.reactor, &accept_clients, response.client);
            Flow::Continue
        },
        None,
    )?;

    install_broadcast_timer(&mut reactor, &clients)?;

    reactor.dispatch(|_| {
        println!("Dispatched callback...");
    });

    reactor.run(&stop)
}

fn run_uds_server() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    let listener = net::unix_listen("test.sock", net::DEFAULT_BACKLOG)?;
    println!("Server socket: {}", listener.socket());

    let clients: Clients = Rc::new(RefCell::new(BTreeMap::new()));

    let accept_clients = Rc::clone(&clients);
    reactor.accept_unix(
        &listener,
        move |ctx, response| {
            println!("Accepted client: {} = {}", response.client, response.peer);
            accept_clients
                .borrow_mut()
                .insert(response.client, response.peer.clone());
            install_chat_session(ctx.reactor, &accept_clients, response.client);
            Flow::Continue
        },
        None,
    )?;

    install_broadcast_timer(&mut reactor, &clients)?;

    reactor.run(&stop)
}

/// Shared tail of both chat clients: echo everything received, forward each
/// typed line to the server.
fn start_chat_session(ctx: &mut rivulet::EventContext<'_>, client: Socket) {
    let receiving = ctx.reactor.receive(
        client,
        Buffer::new(1024),
        |_ctx, response| {
            print!("{}", String::from_utf8_lossy(response.data));
            Flow::Continue
        },
        None,
    );

    let typing = ctx.reactor.read_line(
        Buffer::new(256),
        move |ctx, response| {
            let sent = ctx.reactor.send(
                client,
                Buffer::from_bytes(response.line),
                |_, _| {},
                None,
            );
            if let Err(err) = sent {
                tracing::warn!(error = %err, "send failed");
            }
            Flow::Continue
        },
        None,
    );

    if let Err(err) = receiving.and(typing) {
        tracing::error!(error = %err, "chat session setup failed");
        ctx.stop.request_stop();
    }
}

fn run_chat_client() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    reactor.connect(
        Ipv4Addr::LOCALHOST,
        9000,
        |ctx, response| {
            if let Some(error) = &response.error {
                println!("Failed to connect due to: {error}");
                ctx.stop.request_stop();
                return;
            }

            println!(
                "Connected to server: {} = {}",
                response.client, response.server
            );
            start_chat_session(ctx, response.client);
        },
        None,
    )?;

    reactor.run(&stop)
}

fn run_uds_client() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    reactor.connect_unix(
        "test.sock",
        |ctx, response| {
            if let Some(error) = &response.error {
                println!("Failed to connect due to: {error}");
                ctx.stop.request_stop();
                return;
            }

            println!(
                "Connected to server: {} - {}",
                response.client, response.server
            );
            start_chat_session(ctx, response.client);
        },
        None,
    )?;

    reactor.run(&stop)
}

fn run_udp_server() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    let socket = net::udp_receiver(Ipv4Addr::UNSPECIFIED, 9000)?;
    reactor.receive(
        socket,
        Buffer::new(1024),
        |_ctx, response| {
            if response.data.is_empty() {
                return Flow::Stop;
            }
            print!("Message: {}", String::from_utf8_lossy(response.data));
            Flow::Continue
        },
        None,
    )?;

    reactor.run(&stop)
}

fn run_file_demo() -> rivulet::Result<()> {
    let stop = StopSignal::new();
    let mut reactor = Reactor::new()?;

    reactor.open_file(
        "/tmp/lorem.txt",
        |ctx, response| {
            println!("Opened file: {}", response.file);
            if !response.file.is_open() {
                return;
            }

            let mut text = String::new();
            let reading = ctx.reactor.read_file(
                response.file,
                Buffer::new(256),
                0,
                move |_ctx, response| {
                    text.push_str(&String::from_utf8_lossy(response.data));
                    if response.data.is_empty() {
                        print!("{text}");
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                },
                None,
            );
            if let Err(err) = reading {
                tracing::warn!(error = %err, "read failed");
            }
        },
        None,
    )?;

    reactor.stat_file(
        "/tmp/lorem.txt",
        |ctx, response| match &response.stats {
            Some(stats) => println!("{}", stats.stx_size),
            None => println!(
                "Failed to stat file due to: {}",
                try_extract_error(ctx.result).unwrap_or_default()
            ),
        },
        None,
    )?;

    reactor.open_file_with(
        "/tmp/output.txt",
        libc::O_CREAT | libc::O_RDWR,
        0o600,
        |ctx, response| {
            println!("Opened file: {}", response.file);
            if !response.file.is_open() {
                return;
            }

            let output = Buffer::from_bytes("Hello, World, all my friends!");
            let writing = ctx.reactor.write_file(
                response.file,
                output,
                |ctx, response| {
                    if let Err(err) = ctx.reactor.close(response.file, |_, _| {}, None) {
                        tracing::warn!(error = %err, "close failed");
                    }
                },
                None,
            );
            if let Err(err) = writing {
                tracing::warn!(error = %err, "write failed");
            }
        },
        None,
    )?;

    reactor.run(&stop)
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(true))
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "server".into());
    let result = match command.as_str() {
        "server" => run_chat_server(),
        "client" => run_chat_client(),
        "udp_server" => run_udp_server(),
        "uds_server" => run_uds_server(),
        "uds_client" => run_uds_client(),
        "file" => run_file_demo(),
        other => {
            eprintln!("unknown command: {other}");
            std::process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
