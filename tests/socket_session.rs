//! Socket transport against local TCP peers

use labwire::{Builder, CapabilityRegistry, HandleError, Registry, SessionSettings, TransportError};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Echo every byte back on each accepted connection
fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Accept connections and never answer
fn silent_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || drain(&mut stream));
        }
    });
    port
}

fn drain(stream: &mut TcpStream) {
    let mut buf = [0u8; 256];
    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
}

fn builder() -> Builder {
    Builder::new(
        Arc::new(Registry::new()),
        Arc::new(CapabilityRegistry::with_builtins()),
        SessionSettings::default(),
    )
}

fn model(port: u16) -> String {
    format!(
        "Device:\n  name: echo-box\n  interfaces:\n    Socket:\n      name: ECHO\n      host: 127.0.0.1\n      port: {port}\n"
    )
}

#[test]
fn echo_round_trip() {
    let builder = builder();
    let device = builder.load_str(&model(echo_server())).unwrap();
    let echo = device.transport("ECHO").unwrap();

    echo.connect().unwrap();
    assert!(echo.is_connected().unwrap());
    assert_eq!(echo.write(b"PING\n").unwrap(), 5);
    assert_eq!(&echo.read_timeout(Some(Duration::from_secs(1))).unwrap()[..], b"PING\n");

    echo.disconnect().unwrap();
    assert!(matches!(
        echo.write(b"late\n"),
        Err(HandleError::Transport(TransportError::NotConnected))
    ));
}

#[test]
fn messages_arrive_in_order() {
    let builder = builder();
    let device = builder.load_str(&model(echo_server())).unwrap();
    let echo = device.transport("ECHO").unwrap();
    echo.connect().unwrap();

    for msg in [&b"A\n"[..], b"B\n", b"C\n"] {
        echo.write(msg).unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(echo.read_timeout(Some(Duration::from_secs(1))).unwrap());
    }
    assert_eq!(received, vec![&b"A\n"[..], b"B\n", b"C\n"]);
}

#[test]
fn expired_read_returns_empty() {
    let builder = builder();
    let device = builder.load_str(&model(silent_server())).unwrap();
    let quiet = device.transport("ECHO").unwrap();
    quiet.connect().unwrap();

    let started = Instant::now();
    let data = quiet.read_timeout(Some(Duration::from_millis(200))).unwrap();
    let waited = started.elapsed();
    assert!(data.is_empty());
    assert!(waited >= Duration::from_millis(150), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(1500), "returned after {waited:?}");

    let started = Instant::now();
    assert!(quiet.read_timeout(Some(Duration::ZERO)).unwrap().is_empty());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn blocked_reader_does_not_hold_back_writes() {
    let builder = builder();
    let device = builder.load_str(&model(silent_server())).unwrap();
    let quiet = device.transport("ECHO").unwrap();
    quiet.connect().unwrap();

    let reader = {
        let quiet = quiet.clone();
        thread::spawn(move || quiet.read_timeout(Some(Duration::from_secs(2))))
    };
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    assert_eq!(quiet.write(b"PING\n").unwrap(), 5);
    let waited = started.elapsed();
    assert!(waited < Duration::from_millis(200), "write blocked for {waited:?}");

    assert!(reader.join().unwrap().unwrap().is_empty());
}

#[test]
fn unbounded_read_receives_reply_to_later_write() {
    let builder = builder();
    let device = builder.load_str(&model(echo_server())).unwrap();
    let echo = device.transport("ECHO").unwrap();
    echo.connect().unwrap();

    let reader = {
        let echo = echo.clone();
        thread::spawn(move || echo.read_timeout(None))
    };
    thread::sleep(Duration::from_millis(50));

    echo.write(b"*IDN?\n").unwrap();
    assert_eq!(&reader.join().unwrap().unwrap()[..], b"*IDN?\n");
}

#[test]
fn reconnect_starts_a_fresh_session() {
    let builder = builder();
    let device = builder.load_str(&model(echo_server())).unwrap();
    let echo = device.transport("ECHO").unwrap();

    for round in 0..3 {
        echo.connect().unwrap();
        assert!(echo.is_connected().unwrap());
        let msg = format!("ROUND {round}\n");
        echo.write(msg.as_bytes()).unwrap();
        assert_eq!(&echo.read_timeout(Some(Duration::from_secs(1))).unwrap()[..], msg.as_bytes());

        echo.disconnect().unwrap();
        assert!(!echo.is_connected().unwrap());
    }
}

#[test]
fn connect_refused_is_reported() {
    // Bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let builder = builder();
    let device = builder.load_str(&model(port)).unwrap();
    let echo = device.transport("ECHO").unwrap();

    assert!(echo.connect().is_err());
    assert!(!echo.is_connected().unwrap());
}

#[test]
fn removing_the_device_stops_the_session() {
    let builder = builder();
    let device = builder.load_str(&model(echo_server())).unwrap();
    let node = device.device().transport("ECHO").unwrap();
    node.connect().unwrap();
    assert!(node.is_connected());

    assert_eq!(device.remove().unwrap(), 2);
    assert!(!node.is_connected());
    assert!(builder.registry().is_empty());
}
