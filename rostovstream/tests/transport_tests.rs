//! End-to-end loopback tests for both reliability variants.
//!
//! Every test runs a real listener on 127.0.0.1 with its own port and a
//! client thread, mirroring how the sockets are used in practice. Timers
//! are shrunk so teardown lingering does not dominate the suite.

use std::net::SocketAddr;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rostovstream::{Config, ConnectionState, RdtError, RdtListener, RdtMethod, SrSocket};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn test_config() -> Config {
    Config {
        finack_wait_timeout: Duration::from_millis(500),
        fin_wait_timeout: Duration::from_millis(500),
        fin_retries: 5,
        closed_check_interval: Duration::from_millis(100),
        ..Config::default()
    }
}

fn lossy_config(loss_factor: f64) -> Config {
    Config {
        ack_timeout: Duration::from_millis(300),
        connack_wait_timeout: Duration::from_millis(300),
        loss_factor,
        ..test_config()
    }
}

fn listener(method: RdtMethod, port: u16, cfg: Config) -> RdtListener {
    let mut l = RdtListener::with_config(method, cfg);
    l.bind(addr(port)).unwrap();
    l.listen(1).unwrap();
    l
}

#[test]
fn sr_single_small_message() {
    let port = 57121;
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());

    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.send(b"hola").unwrap();
        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    });

    let mut sock = l.accept().unwrap();
    let out = sock.recv_exact(4).unwrap();
    assert_eq!(&out[..], b"hola");

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn sr_bulk_transfer() {
    let port = 57122;
    let data: Vec<u8> = b"pls_work".repeat(10_000);
    assert_eq!(data.len(), 80_000);
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());

    let sent = data.clone();
    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.send(&sent).unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    let out = sock.recv_exact(80_000).unwrap();
    assert_eq!(&out[..], &data[..]);

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn sr_lossy_bulk_transfer() {
    let port = 57123;
    let data: Vec<u8> = (0..40_000u16).flat_map(|x| x.to_le_bytes()).collect();
    assert_eq!(data.len(), 80_000);
    let mut l = listener(RdtMethod::SelectiveRepeat, port, lossy_config(0.25));

    let sent = data.clone();
    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), lossy_config(0.25)).unwrap();
        client.send(&sent).unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    let out = sock.recv_exact(80_000).unwrap();
    assert_eq!(&out[..], &data[..]);

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn sr_bidirectional_exchange() {
    let port = 57124;
    let msg_1 = b"Client: Hello";
    let msg_2 = b"Server: Hello";
    let msg_3 = b"Client: Bye";
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());

    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.send(msg_1).unwrap();
        assert_eq!(&client.recv_exact(msg_2.len()).unwrap()[..], msg_2);
        client.send(msg_3).unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    assert_eq!(&sock.recv_exact(msg_1.len()).unwrap()[..], msg_1);
    sock.send(msg_2).unwrap();
    assert_eq!(&sock.recv_exact(msg_3.len()).unwrap()[..], msg_3);

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn sr_two_clients_multiplexed() {
    let port = 57125;
    let mut l = RdtListener::with_config(RdtMethod::SelectiveRepeat, test_config());
    l.bind(addr(port)).unwrap();
    l.listen(2).unwrap();

    let spawn_client = |payload: &'static [u8]| {
        thread::spawn(move || {
            let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
            client.send(payload).unwrap();
            client.close().unwrap();
        })
    };
    let c1 = spawn_client(b"Client 1");
    let c2 = spawn_client(b"Client 2");

    let mut first = l.accept().unwrap();
    let mut second = l.accept().unwrap();
    assert_ne!(first.peer_addr(), second.peer_addr());

    // Each accepted socket observes only its own peer's bytes.
    let a = first.recv_exact(8).unwrap();
    let b = second.recv_exact(8).unwrap();
    assert_ne!(a, b);
    for out in [&a, &b] {
        assert!(&out[..] == b"Client 1" || &out[..] == b"Client 2");
    }

    first.close().unwrap();
    second.close().unwrap();
    c1.join().unwrap();
    c2.join().unwrap();
    l.close();
}

#[test]
fn sr_simultaneous_close() {
    let port = 57126;
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());
    let barrier = Arc::new(Barrier::new(2));

    let client_barrier = Arc::clone(&barrier);
    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.send(b"x").unwrap();
        client_barrier.wait();
        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    });

    let mut sock = l.accept().unwrap();
    assert_eq!(&sock.recv_exact(1).unwrap()[..], b"x");
    barrier.wait();
    sock.close().unwrap();
    assert_eq!(sock.state(), ConnectionState::Disconnected);

    client.join().unwrap();
    l.close();
}

#[test]
fn sr_recv_times_out_without_data() {
    let port = 57127;
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());

    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.set_timeout(Some(Duration::from_millis(300)));
        match client.recv(16) {
            Err(RdtError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    client.join().unwrap();
    sock.close().unwrap();
    l.close();
}

#[test]
fn sr_end_of_stream_after_peer_close() {
    let port = 57128;
    let mut l = listener(RdtMethod::SelectiveRepeat, port, test_config());

    let client = thread::spawn(move || {
        let mut client = SrSocket::connect(addr(port), test_config()).unwrap();
        client.send(b"final words").unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    assert_eq!(&sock.recv_exact(11).unwrap()[..], b"final words");
    // The peer has FIN'd; once the buffer is drained the reader learns it.
    match sock.recv(1) {
        Err(RdtError::EndOfStream) => {}
        other => panic!("expected EndOfStream, got {other:?}"),
    }

    client.join().unwrap();
    sock.close().unwrap();
    l.close();
}

#[test]
fn saw_single_small_message() {
    let port = 57129;
    let mut l = listener(RdtMethod::StopAndWait, port, test_config());

    let client = thread::spawn(move || {
        let mut client =
            rostovstream::SawSocket::connect(addr(port), test_config()).unwrap();
        client.send(b"hola").unwrap();
        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    });

    let mut sock = l.accept().unwrap();
    let out = sock.recv_exact(4).unwrap();
    assert_eq!(&out[..], b"hola");

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn saw_bidirectional_exchange() {
    let port = 57130;
    let msg_1 = b"Client: Hello";
    let msg_2 = b"Server: Hello";
    let msg_3 = b"Client: Bye";
    let mut l = listener(RdtMethod::StopAndWait, port, test_config());

    let client = thread::spawn(move || {
        let mut client =
            rostovstream::SawSocket::connect(addr(port), test_config()).unwrap();
        client.send(msg_1).unwrap();
        assert_eq!(&client.recv_exact(msg_2.len()).unwrap()[..], msg_2);
        client.send(msg_3).unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    assert_eq!(&sock.recv_exact(msg_1.len()).unwrap()[..], msg_1);
    sock.send(msg_2).unwrap();
    assert_eq!(&sock.recv_exact(msg_3.len()).unwrap()[..], msg_3);

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn saw_multi_fragment_transfer() {
    let port = 57131;
    // Small mss forces the one-in-flight loop through many fragments.
    let cfg = Config {
        mss: 1000,
        ..test_config()
    };
    let data: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
    let mut l = listener(RdtMethod::StopAndWait, port, cfg.clone());

    let sent = data.clone();
    let client_cfg = cfg.clone();
    let client = thread::spawn(move || {
        let mut client = rostovstream::SawSocket::connect(addr(port), client_cfg).unwrap();
        client.send(&sent).unwrap();
        client.close().unwrap();
    });

    let mut sock = l.accept().unwrap();
    let out = sock.recv_exact(5_000).unwrap();
    assert_eq!(&out[..], &data[..]);

    sock.close().unwrap();
    client.join().unwrap();
    l.close();
}

#[test]
fn connect_to_silent_port_times_out() {
    // Nothing listens here; CONNECT retries must exhaust and fail.
    let cfg = Config {
        connack_wait_timeout: Duration::from_millis(50),
        connect_retries: 3,
        ..test_config()
    };
    match SrSocket::connect(addr(57132), cfg) {
        Err(RdtError::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }
}
