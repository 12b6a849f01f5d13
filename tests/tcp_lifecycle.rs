use evsock::prelude::*;
use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn close_discards_in_flight_resolution() {
    let config = config::Config::builder().build().unwrap();
    let mut socket = TcpSocket::new(&config).expect("Failed to create socket");
    socket
        .connect("host.invalid", 80, None)
        .expect("Failed to start connect");
    socket.close();

    let events = socket.fetch_events().expect("Failed to fetch events");
    assert!(
        matches!(events.as_slice(), [TcpEvent::Disconnected { error: None }]),
        "Expected a clean local close, got {events:?}"
    );

    // The resolver thread will fail eventually; its result belongs to a
    // closed generation and must never surface.
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(100));
        let events = socket.fetch_events().expect("Failed to fetch events");
        for event in events {
            assert!(
                matches!(event, TcpEvent::Inactive),
                "Stale resolution leaked an event: {event:?}"
            );
        }
    }
}

#[test]
fn read_timeout_pauses_then_extends_or_closes() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let peer = thread::spawn(move || {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        addr_tx
            .send(listener.local_addr().expect("Failed to get address"))
            .expect("Failed to publish address");
        let (mut stream, _) = listener.accept().expect("Failed to accept");
        // Stay silent until the consumer grants the first read more time.
        go_rx.recv().expect("Never signaled");
        stream.write_all(b"LATE\n").expect("Failed to write");
        // Hold the connection open so the declined read times out instead
        // of seeing EOF.
        let _ = done_rx.recv();
    });

    let addr = addr_rx.recv().expect("Peer never published its address");
    let config = config::Config::builder().build().unwrap();
    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    let mut timed_out_once = false;
    let mut got_late_read = false;
    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    client
                        .read_to_terminator(
                            b"\n".to_vec(),
                            None,
                            Some(Duration::from_millis(150)),
                            1,
                        )
                        .expect("Failed to queue read");
                }
                TcpEvent::ReadTimedOut { tag: 1 } => {
                    timed_out_once = true;
                    client.extend_read_timeout(Some(Duration::from_secs(5)));
                    go_tx.send(()).expect("Failed to signal peer");
                }
                TcpEvent::ReadCompleted { tag: 1, data } => {
                    assert!(timed_out_once, "Read completed without timing out first");
                    assert_eq!(data, b"LATE\n");
                    got_late_read = true;
                    client
                        .read_to_terminator(
                            b"\n".to_vec(),
                            None,
                            Some(Duration::from_millis(150)),
                            2,
                        )
                        .expect("Failed to queue read");
                }
                TcpEvent::ReadTimedOut { tag: 2 } => {
                    client.extend_read_timeout(None);
                }
                TcpEvent::Disconnected { error } => {
                    assert!(
                        matches!(error, Some(Error::ReadTimeout)),
                        "Expected ReadTimeout, got {error:?}"
                    );
                    break 'outer;
                }
                _ => {}
            }
        }
    }
    assert!(got_late_read);
    drop(done_tx);
    peer.join().expect("Peer thread failed");
}

#[test]
fn close_after_reads_and_writes_waits_for_both_queues() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let peer = thread::spawn(move || {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        addr_tx
            .send(listener.local_addr().expect("Failed to get address"))
            .expect("Failed to publish address");
        let (mut stream, _) = listener.accept().expect("Failed to accept");
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).expect("Failed to read");
        assert_eq!(&buf, b"HELLO\n");
        stream.write_all(b"WORLD\n").expect("Failed to write");
        let _ = done_rx.recv();
    });

    let addr = addr_rx.recv().expect("Peer never published its address");
    let config = config::Config::builder().build().unwrap();
    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    let mut wrote = false;
    let mut read = false;
    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    client
                        .write(b"HELLO\n".to_vec(), None, 1)
                        .expect("Failed to queue write");
                    client
                        .read_to_terminator(b"\n".to_vec(), None, None, 2)
                        .expect("Failed to queue read");
                    client.close_after_reads_and_writes();
                    assert!(client.read_data(None, 3).is_err());
                }
                TcpEvent::WriteCompleted { tag: 1 } => wrote = true,
                TcpEvent::ReadCompleted { tag: 2, data } => {
                    assert_eq!(data, b"WORLD\n");
                    read = true;
                }
                TcpEvent::Disconnected { error } => {
                    assert!(error.is_none(), "Expected a clean close, got {error:?}");
                    break 'outer;
                }
                _ => {}
            }
        }
    }
    assert!(wrote && read, "Close landed before both queues drained");
    drop(done_tx);
    peer.join().expect("Peer thread failed");
}

#[test]
fn half_duplex_survives_peer_write_shutdown() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        let config = config::Config::builder()
            .set_default("half_duplex", true)
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

        let mut read_stream_closures = 0;
        let mut disconnects = 0;
        loop {
            let events = child.fetch_events().expect("Failed to fetch events");
            for event in events {
                match event {
                    TcpEvent::Connected { .. } => {
                        child
                            .read_to_terminator(b"\n".to_vec(), None, None, 1)
                            .expect("Failed to queue read");
                    }
                    TcpEvent::ReadCompleted { tag: 1, data } => {
                        assert_eq!(data, b"HELLO\n");
                    }
                    TcpEvent::ReadStreamClosed => {
                        read_stream_closures += 1;
                        // The read side is gone; the write side must still
                        // deliver.
                        child
                            .write(b"WORLD\n".to_vec(), None, 2)
                            .expect("Failed to queue write");
                    }
                    TcpEvent::WriteCompleted { tag: 2 } => child.close(),
                    TcpEvent::Disconnected { error } => {
                        assert!(error.is_none());
                        disconnects += 1;
                        assert_eq!(read_stream_closures, 1);
                        assert_eq!(disconnects, 1);
                        return;
                    }
                    _ => {}
                }
            }
        }
    });

    let addr = addr_rx.recv().expect("Server never published its address");
    let mut peer = std::net::TcpStream::connect(addr).expect("Failed to connect");
    peer.write_all(b"HELLO\n").expect("Failed to write");
    peer.shutdown(Shutdown::Write).expect("Failed to shutdown");

    let mut reply = Vec::new();
    peer.read_to_end(&mut reply).expect("Failed to read reply");
    assert_eq!(reply, b"WORLD\n");

    server.join().expect("Server thread failed");
}
