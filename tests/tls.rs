use evsock::prelude::*;
use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Self-signed certificate for "localhost", written to temp files that
/// auto-delete on drop. The same certificate doubles as the client's CA.
fn create_temp_cert_files() -> (NamedTempFile, NamedTempFile) {
    let certified_key = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_pem = certified_key.cert.pem();
    let key_pem = certified_key.key_pair.serialize_pem();

    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    cert_file.write_all(cert_pem.as_bytes()).unwrap();
    key_file.write_all(key_pem.as_bytes()).unwrap();
    cert_file.flush().unwrap();
    key_file.flush().unwrap();

    (cert_file, key_file)
}

#[test]
fn tls_upgrade_and_secured_echo() {
    let (cert_file, key_file) = create_temp_cert_files();
    let server_options = Arc::new(TlsOptions::server(cert_file.path(), key_file.path()));
    let client_options = Arc::new(TlsOptions::client("localhost", cert_file.path()));

    let (addr_tx, addr_rx) = mpsc::channel();
    let config = config::Config::builder().build().unwrap();

    let server_config = config.clone();
    let server = thread::spawn(move || {
        let mut server = TcpSocket::new(&server_config).expect("Failed to create server");
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

        child
            .start_tls(server_options)
            .expect("Failed to queue TLS upgrade");
        loop {
            let events = child.fetch_events().expect("Failed to fetch events");
            for event in events {
                match event {
                    TcpEvent::Secured => {
                        assert!(child.is_secure());
                        child
                            .read_to_terminator(b"\n".to_vec(), None, None, 1)
                            .expect("Failed to queue read");
                    }
                    TcpEvent::ReadCompleted { tag: 1, data } => {
                        child.write(data, None, 2).expect("Failed to queue write");
                        child
                            .read_to_terminator(b"\n".to_vec(), None, None, 1)
                            .expect("Failed to queue read");
                    }
                    TcpEvent::Disconnected { error } => {
                        assert!(error.map_or(true, |e| e.is_peer_close()));
                        return;
                    }
                    _ => {}
                }
            }
        }
    });

    let addr = addr_rx.recv().expect("Server never published its address");
    let mut client = TcpSocket::new(&config).expect("Failed to create client");
    client
        .connect_to_address(addr, Some(Duration::from_secs(5)))
        .expect("Failed to start connect");

    let mut secured = false;
    let mut echoed = false;
    'outer: loop {
        let events = client.fetch_events().expect("Failed to fetch events");
        for event in events {
            match event {
                TcpEvent::Connected { .. } => {
                    client
                        .start_tls(client_options.clone())
                        .expect("Failed to queue TLS upgrade");
                    // Queued behind the upgrade marker, so it travels secured.
                    client
                        .write(b"SECRET\n".to_vec(), None, 1)
                        .expect("Failed to queue write");
                    client
                        .read_to_terminator(b"\n".to_vec(), None, None, 2)
                        .expect("Failed to queue read");
                }
                TcpEvent::Secured => {
                    secured = true;
                    assert!(client.is_secure());
                }
                TcpEvent::ReadCompleted { tag: 2, data } => {
                    assert!(secured, "Echo arrived before the handshake finished");
                    assert_eq!(data, b"SECRET\n");
                    echoed = true;
                    client.close();
                }
                TcpEvent::Disconnected { error } => {
                    assert!(error.is_none(), "Client closed with {error:?}");
                    break 'outer;
                }
                _ => {}
            }
        }
    }

    assert!(echoed);
    server.join().expect("Server thread failed");
}
