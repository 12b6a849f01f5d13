use evsock::prelude::*;
use std::io::Write;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn test_config() -> config::Config {
    config::Config::builder().build().unwrap()
}

/// Accepts one connection, echoes newline-framed lines until the peer
/// disconnects.
fn run_echo_server(config: config::Config, addr_tx: mpsc::Sender<std::net::SocketAddr>) {
    let mut server = TcpSocket::new(&config).expect("Failed to create server");
    let addrs = server.accept("127.0.0.1", 0).expect("Failed to listen");
    addr_tx.send(addrs[0]).expect("Failed to publish address");

    loop {
        let events = server.fetch_events().expect("Failed to fetch events");
        for event in events {
            if let TcpEvent::Accepted { socket } = event {
                run_echo_child(socket);
                return;
            }
        }
    }
}

fn run_echo_child(mut child: TcpSocket) {
    loop {
        let events = child.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    child
                        .read_to_terminator(b"\n".to_vec(), None, None, 0)
                        .expect("Failed to queue read");
                }
                TcpEvent::ReadCompleted { data, .. } => {
                    child.write(data, None, 0).expect("Failed to queue write");
                    child
                        .read_to_terminator(b"\n".to_vec(), None, None, 0)
                        .expect("Failed to queue read");
                }
                TcpEvent::Disconnected { error } => {
                    assert!(
                        error.map_or(true, |e| e.is_peer_close()),
                        "Echo child closed with an unexpected error"
                    );
                    return;
                }
                _ => {}
            }
        }
    }
}

#[test]
fn ping_pong_loopback() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let config = test_config();
    let server = thread::spawn(move || run_echo_server(test_config(), addr_tx));
    let addr = addr_rx.recv().expect("Server never published its address");

    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    let mut wrote_ping = false;
    let mut got_pong = false;
    let mut got_length_read = false;

    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { peer, .. } => {
                    assert!(peer.is_some());
                    client
                        .write(b"PING\n".to_vec(), None, 1)
                        .expect("Failed to queue write");
                    client
                        .read_to_terminator(b"\n".to_vec(), None, None, 2)
                        .expect("Failed to queue read");
                }
                TcpEvent::WriteCompleted { tag: 1 } => wrote_ping = true,
                TcpEvent::ReadCompleted { tag: 2, data } => {
                    assert_eq!(data, b"PING\n");
                    got_pong = true;
                    // Same conversation, length-framed this time.
                    client
                        .write(b"ABCD\n".to_vec(), None, 3)
                        .expect("Failed to queue write");
                    client
                        .read_to_length(5, None, 3)
                        .expect("Failed to queue read");
                }
                TcpEvent::ReadCompleted { tag: 3, data } => {
                    assert_eq!(data, b"ABCD\n");
                    got_length_read = true;
                    client.close();
                }
                TcpEvent::Disconnected { error } => {
                    assert!(error.is_none(), "Client closed with an error");
                    break 'outer;
                }
                _ => {}
            }
        }
    }

    assert!(wrote_ping && got_pong && got_length_read);
    server.join().expect("Server thread failed");
}

#[test]
fn writes_and_reads_complete_in_fifo_order() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let config = test_config();
    let server = thread::spawn(move || run_echo_server(test_config(), addr_tx));
    let addr = addr_rx.recv().expect("Server never published its address");

    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    let mut write_order = Vec::new();
    let mut read_order = Vec::new();

    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    // Queue everything up front; completions must stay FIFO
                    // even when replies coalesce into one segment.
                    for i in 1..=5i64 {
                        let line = format!("msg-{i}\n").into_bytes();
                        client.write(line, None, i).expect("Failed to queue write");
                        client
                            .read_to_terminator(b"\n".to_vec(), None, None, 10 + i)
                            .expect("Failed to queue read");
                    }
                }
                TcpEvent::WriteCompleted { tag } => write_order.push(tag),
                TcpEvent::ReadCompleted { tag, data } => {
                    let i = tag - 10;
                    assert_eq!(data, format!("msg-{i}\n").into_bytes());
                    read_order.push(tag);
                    if read_order.len() == 5 {
                        client.close();
                    }
                }
                TcpEvent::Disconnected { error } => {
                    assert!(error.is_none());
                    break 'outer;
                }
                _ => {}
            }
        }
    }

    assert_eq!(write_order, vec![1, 2, 3, 4, 5]);
    assert_eq!(read_order, vec![11, 12, 13, 14, 15]);
    server.join().expect("Server thread failed");
}

#[test]
fn unsolicited_data_survives_pre_buffer_wraparound() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();

    // Reads arrive via the handle so the reader sits in fetch_events while
    // unsolicited bursts land in a deliberately tiny pre-buffer.
    let reader = thread::spawn(move || {
        let config = config::Config::builder()
            .set_default("pre_buffer_capacity", 16)
            .unwrap()
            .build()
            .unwrap();
        let mut server = TcpSocket::new(&config).expect("Failed to create server");
        let addrs = server.accept("127.0.0.1", 0).expect("Failed to listen");
        addr_tx.send(addrs[0]).expect("Failed to publish address");

        let mut child = loop {
            let events = server.fetch_events().expect("Failed to fetch events");
            if let Some(TcpEvent::Accepted { socket }) = events
                .into_iter()
                .find(|e| matches!(e, TcpEvent::Accepted { .. }))
            {
                break socket;
            }
        };
        handle_tx
            .send(child.handle())
            .expect("Failed to publish handle");

        let mut reads = Vec::new();
        loop {
            let events = child.fetch_events().expect("Failed to fetch events");
            for event in events {
                match event {
                    TcpEvent::ReadCompleted { tag, data } => reads.push((tag, data)),
                    TcpEvent::Disconnected { error } => {
                        assert!(error.is_none(), "Reader closed with {error:?}");
                        return reads;
                    }
                    _ => {}
                }
            }
        }
    });

    let addr = addr_rx.recv().expect("Reader never published its address");
    let mut peer = std::net::TcpStream::connect(addr).expect("Failed to connect");
    let handle = handle_rx.recv().expect("Reader never published its handle");

    // First burst is buffered with no read queued; the read then consumes
    // only part of it, leaving a dead zone at the front of the pre-buffer.
    peer.write_all(b"ABCDEFGH").expect("Failed to write");
    thread::sleep(Duration::from_millis(200));
    handle.read_to_length(4, None, 1);
    thread::sleep(Duration::from_millis(200));

    // Second burst fills the tail exactly and overflows it; every byte must
    // survive and the connection must stay open.
    peer.write_all(b"IJKLMNOPQRSTUVWXYZ01").expect("Failed to write");
    thread::sleep(Duration::from_millis(200));
    handle.read_to_length(12, None, 2);
    handle.read_to_length(12, None, 3);
    thread::sleep(Duration::from_millis(200));
    handle.close();

    let reads = reader.join().expect("Reader thread failed");
    assert_eq!(
        reads,
        vec![
            (1, b"ABCD".to_vec()),
            (2, b"EFGHIJKLMNOP".to_vec()),
            (3, b"QRSTUVWXYZ01".to_vec()),
        ]
    );
}

#[test]
fn terminator_read_maxes_out() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let config = test_config();

    // A server that sends ten bytes with no terminator and then idles.
    let server = thread::spawn(move || {
        let mut server = TcpSocket::new(&test_config()).expect("Failed to create server");
        let addrs = server.accept("127.0.0.1", 0).expect("Failed to listen");
        addr_tx.send(addrs[0]).expect("Failed to publish address");
        loop {
            let events = server.fetch_events().expect("Failed to fetch events");
            for event in events {
                if let TcpEvent::Accepted { socket } = event {
                    let mut child = socket;
                    child
                        .write(b"XXXXXXXXXX".to_vec(), None, 0)
                        .expect("Failed to queue write");
                    loop {
                        let events = child.fetch_events().expect("Failed to fetch events");
                        for event in events {
                            if let TcpEvent::Disconnected { .. } = event {
                                return;
                            }
                        }
                    }
                }
            }
        }
    });
    let addr = addr_rx.recv().expect("Server never published its address");

    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    client
                        .read_to_terminator(b"\n".to_vec(), Some(8), None, 1)
                        .expect("Failed to queue read");
                }
                TcpEvent::Disconnected { error } => {
                    assert!(
                        matches!(error, Some(Error::ReadMaxedOut(8))),
                        "Expected ReadMaxedOut(8), got {error:?}"
                    );
                    break 'outer;
                }
                TcpEvent::ReadCompleted { .. } => panic!("Read must not complete"),
                _ => {}
            }
        }
    }
    server.join().expect("Server thread failed");
}
