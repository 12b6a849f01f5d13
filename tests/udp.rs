use evsock::prelude::*;
use evsock::SendFilter;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn test_config() -> config::Config {
    config::Config::builder().build().unwrap()
}

#[test]
fn loopback_echo() {
    let (addr_tx, addr_rx) = mpsc::channel();

    // The echoer binds, receives continuously, and sends every datagram
    // straight back where it came from.
    let echoer = thread::spawn(move || {
        let mut socket = UdpSocket::new(&test_config()).expect("Failed to create socket");
        let addrs = socket.bind("127.0.0.1", 0).expect("Failed to bind");
        addr_tx.send(addrs[0]).expect("Failed to publish address");
        socket.receive_always();

        let mut echoed = false;
        loop {
            let events = socket.fetch_events().expect("Failed to fetch events");
            for event in events {
                match event {
                    UdpEvent::Received { data, from, .. } => {
                        socket
                            .send_to_address(data, from, None, 2)
                            .expect("Failed to queue send");
                    }
                    UdpEvent::SendCompleted { tag: 2 } => echoed = true,
                    UdpEvent::Closed { .. } => return,
                    _ => {}
                }
            }
            if echoed {
                return;
            }
        }
    });

    let addr = addr_rx.recv().expect("Echoer never published its address");
    let mut socket = UdpSocket::new(&test_config()).expect("Failed to create socket");
    socket.bind("127.0.0.1", 0).expect("Failed to bind");
    socket.receive_always();
    socket
        .send_to_address(b"marco".to_vec(), addr, Some(Duration::from_secs(5)), 1)
        .expect("Failed to queue send");

    let mut sent = false;
    'outer: loop {
        let events = socket.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                UdpEvent::SendCompleted { tag: 1 } => sent = true,
                UdpEvent::SendFailed { tag, error } => {
                    panic!("Send {tag} failed: {error}");
                }
                UdpEvent::Received { data, from, .. } => {
                    assert_eq!(data, b"marco");
                    assert_eq!(from, addr);
                    break 'outer;
                }
                _ => {}
            }
        }
    }

    assert!(sent);
    echoer.join().expect("Echoer thread failed");
}

#[test]
fn send_filter_veto_completes_without_io() {
    // Plain victim socket; it must only ever see the approved datagram.
    let victim = std::net::UdpSocket::bind("127.0.0.1:0").expect("Failed to bind victim");
    victim
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set timeout");
    let victim_addr = victim.local_addr().expect("Failed to get address");

    let mut socket = UdpSocket::new(&test_config()).expect("Failed to create socket");
    socket.bind("127.0.0.1", 0).expect("Failed to bind");

    let filter: SendFilter = Arc::new(|_data, _dest, tag| tag != 7);
    socket.set_send_filter(Some(filter), false);

    socket
        .send_to_address(b"vetoed".to_vec(), victim_addr, None, 7)
        .expect("Failed to queue send");
    socket
        .send_to_address(b"allowed".to_vec(), victim_addr, None, 8)
        .expect("Failed to queue send");

    let mut completions = Vec::new();
    while completions.len() < 2 {
        let events = socket.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                UdpEvent::SendCompleted { tag } => completions.push(tag),
                UdpEvent::SendFailed { tag, error } => {
                    panic!("Send {tag} failed: {error}");
                }
                _ => {}
            }
        }
    }
    // The veto still completes the send, in queue order.
    assert_eq!(completions, vec![7, 8]);

    // Only the approved payload reaches the wire.
    let mut buf = [0u8; 64];
    let (n, _) = victim.recv_from(&mut buf).expect("Failed to receive");
    assert_eq!(&buf[..n], b"allowed");
}

#[test]
fn deferred_connect_orders_behind_queued_sends() {
    let peer = std::net::UdpSocket::bind("127.0.0.1:0").expect("Failed to bind peer");
    peer.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("Failed to set timeout");
    let peer_addr = peer.local_addr().expect("Failed to get address");

    let mut socket = UdpSocket::new(&test_config()).expect("Failed to create socket");

    // Queued before the connect marker, so it goes out unconnected.
    socket
        .send_to_address(b"before".to_vec(), peer_addr, None, 1)
        .expect("Failed to queue send");
    socket
        .connect_to_address(peer_addr)
        .expect("Failed to queue connect");
    // Queued after the marker; completes through the connected socket.
    socket
        .send(b"after".to_vec(), None, 2)
        .expect("Failed to queue send");
    socket.close_after_sends();

    let mut log = Vec::new();
    'outer: loop {
        let events = socket.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                UdpEvent::SendCompleted { tag } => log.push(format!("send:{tag}")),
                UdpEvent::DidConnect { addr } => {
                    assert_eq!(addr, peer_addr);
                    log.push("connect".to_string());
                }
                UdpEvent::SendFailed { tag, error } => {
                    panic!("Send {tag} failed: {error}");
                }
                UdpEvent::Closed { error } => {
                    assert!(error.is_none());
                    break 'outer;
                }
                _ => {}
            }
        }
    }
    assert_eq!(log, vec!["send:1", "connect", "send:2"]);

    let mut buf = [0u8; 64];
    let (n, _) = peer.recv_from(&mut buf).expect("Failed to receive");
    assert_eq!(&buf[..n], b"before");
    let (n, _) = peer.recv_from(&mut buf).expect("Failed to receive");
    assert_eq!(&buf[..n], b"after");
}

#[test]
fn send_requires_connect_and_bind_is_exclusive() {
    let mut socket = UdpSocket::new(&test_config()).expect("Failed to create socket");
    assert!(matches!(
        socket.send(b"x".to_vec(), None, 1),
        Err(Error::NotConnected)
    ));

    socket.bind("127.0.0.1", 0).expect("Failed to bind");
    assert!(matches!(
        socket.bind("127.0.0.1", 0),
        Err(Error::AlreadyStarted)
    ));
    assert!(matches!(
        socket.join_multicast_group("not-multicast", None),
        Err(Error::InvalidMulticastGroup(_))
    ));
}
