//! End-to-end server scenarios over real sockets.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use netpump::buffer::ByteBuffer;
use netpump::codec::{FieldLenCodec, Frame, FrameInfo, FramingCodec, HEADER_LEN};
use netpump::{LoopPool, TcpServer};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn frame(seq: u16, payload: Vec<u8>) -> Frame {
    Frame::new(FrameInfo::new(0x10, 1, seq, 0x0001_0001), payload)
}

fn encode(f: Frame) -> Vec<u8> {
    let mut bufs = Vec::new();
    FieldLenCodec::write_frame(f, &mut bufs);
    let mut wire = Vec::new();
    for b in &bufs {
        wire.extend_from_slice(b.readable());
    }
    wire
}

/// Blocking client-side frame read.
fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header)?;
    let total = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut rest = vec![0u8; total - HEADER_LEN];
    stream.read_exact(&mut rest)?;

    let mut buf = ByteBuffer::from_slice(&header);
    buf.put_slice(&rest);
    Ok(FieldLenCodec::read_frame(&mut buf).expect("complete frame"))
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream.set_write_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream
}

/// Echo server on an ephemeral port; every frame is sent straight
/// back on the connection it arrived on.
fn start_echo_server(loops: usize) -> (Arc<LoopPool>, TcpServer<FieldLenCodec>, SocketAddr) {
    let pool = Arc::new(LoopPool::new(loops).unwrap());
    pool.start();

    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    server.on_message(|conn, f| conn.send_frame::<FieldLenCodec>(f));
    let addr = server.start().unwrap();
    (pool, server, addr)
}

#[test]
fn test_echo_many_clients_many_frames() {
    const CLIENTS: usize = 10;
    const FRAMES: usize = 100;

    let (pool, mut server, addr) = start_echo_server(2);

    let mut joins = Vec::new();
    for client_id in 0..CLIENTS {
        joins.push(thread::spawn(move || {
            let mut stream = connect(addr);

            // pipeline all frames out, then collect the echoes in order
            let mut sent = Vec::with_capacity(FRAMES);
            for i in 0..FRAMES {
                let payload = format!("client {client_id} frame {i}").into_bytes();
                let f = frame(i as u16, payload);
                stream.write_all(&encode(f.clone())).unwrap();
                sent.push(f);
            }

            for expected in &sent {
                let got = read_frame(&mut stream).unwrap();
                assert_eq!(&got, expected);
            }
        }));
    }

    for join in joins {
        join.join().unwrap();
    }

    server.stop();
    pool.stop();
}

#[test]
fn test_partial_frame_delivered_once_complete() {
    let pool = Arc::new(LoopPool::new(1).unwrap());
    pool.start();

    let messages = Arc::new(AtomicUsize::new(0));
    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    let counting = Arc::clone(&messages);
    server.on_message(move |conn, f| {
        counting.fetch_add(1, Ordering::SeqCst);
        conn.send_frame::<FieldLenCodec>(f);
    });
    let addr = server.start().unwrap();

    let sent = frame(3, b"ten bytes!".to_vec());
    let wire = encode(sent.clone());

    // one byte at a time with gaps: the parser must sit on the
    // partial frame and deliver exactly once
    let mut stream = connect(addr);
    for byte in &wire {
        stream.write_all(std::slice::from_ref(byte)).unwrap();
        thread::sleep(Duration::from_millis(10));
    }

    let got = read_frame(&mut stream).unwrap();
    assert_eq!(got, sent);
    assert_eq!(messages.load(Ordering::SeqCst), 1);

    server.stop();
    pool.stop();
}

#[test]
fn test_backpressure_blocked_reader_gets_everything_in_order() {
    const FRAMES: usize = 128;
    const PAYLOAD: usize = 32 * 1024;

    let pool = Arc::new(LoopPool::new(1).unwrap());
    pool.start();

    // the server floods each new connection immediately
    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    server.on_connect(|conn| {
        for i in 0..FRAMES {
            conn.send_frame::<FieldLenCodec>(frame(i as u16, vec![i as u8; PAYLOAD]));
        }
    });
    let addr = server.start().unwrap();

    let mut stream = connect(addr);
    // let the outbound queue build while we refuse to read
    thread::sleep(Duration::from_millis(300));

    for i in 0..FRAMES {
        let got = read_frame(&mut stream).unwrap();
        assert_eq!(got.info.seq, i as u16, "frame order");
        assert_eq!(got.payload.len(), PAYLOAD);
        assert!(got.payload.iter().all(|&b| b == i as u8), "frame content");
    }

    server.stop();
    pool.stop();
}

#[test]
fn test_peer_close_reports_clean_close_once() {
    let pool = Arc::new(LoopPool::new(1).unwrap());
    pool.start();

    let (connect_tx, connect_rx) = channel();
    let (close_tx, close_rx) = channel::<bool>();
    let connect_tx: Arc<Mutex<Sender<()>>> = Arc::new(Mutex::new(connect_tx));
    let close_tx = Arc::new(Mutex::new(close_tx));
    let close_count = Arc::new(AtomicUsize::new(0));

    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    {
        let tx = Arc::clone(&connect_tx);
        server.on_connect(move |_conn| {
            tx.lock().unwrap().send(()).unwrap();
        });
    }
    {
        let tx = Arc::clone(&close_tx);
        let count = Arc::clone(&close_count);
        server.on_close(move |_conn, err| {
            count.fetch_add(1, Ordering::SeqCst);
            tx.lock().unwrap().send(err.is_none()).unwrap();
        });
    }
    let addr = server.start().unwrap();

    let stream = connect(addr);
    connect_rx.recv_timeout(CLIENT_TIMEOUT).unwrap();
    drop(stream); // sends no data, just closes

    let clean = close_rx.recv_timeout(CLIENT_TIMEOUT).unwrap();
    assert!(clean, "expected a clean peer close");

    // no second close notification
    assert!(close_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(close_count.load(Ordering::SeqCst), 1);

    server.stop();
    pool.stop();
}

#[test]
fn test_stale_send_races_token_reuse_without_corruption() {
    const ROUNDS: usize = 32;

    // single reactor: a freed slab token goes to the very next
    // accepted connection, so a send racing a close addresses a token
    // that is about to belong to someone else
    let pool = Arc::new(LoopPool::new(1).unwrap());
    pool.start();

    let handles: Arc<Mutex<Vec<netpump::ConnHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let (close_tx, close_rx) = channel::<()>();
    let close_tx = Arc::new(Mutex::new(close_tx));

    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    {
        let handles = Arc::clone(&handles);
        server.on_connect(move |conn| handles.lock().unwrap().push(conn.clone()));
    }
    server.on_message(|conn, f| conn.send_frame::<FieldLenCodec>(f));
    {
        let tx = Arc::clone(&close_tx);
        server.on_close(move |_conn, _err| {
            let _ = tx.lock().unwrap().send(());
        });
    }
    let addr = server.start().unwrap();

    let wait_for_handle = |index: usize| -> netpump::ConnHandle {
        let deadline = Instant::now() + CLIENT_TIMEOUT;
        loop {
            if let Some(handle) = handles.lock().unwrap().get(index) {
                return handle.clone();
            }
            assert!(Instant::now() < deadline, "connection {index} never registered");
            thread::sleep(Duration::from_millis(1));
        }
    };

    for round in 0..ROUNDS {
        let first = connect(addr);
        let doomed = wait_for_handle(2 * round);

        // hammer sends on the doomed handle while its socket dies:
        // some of the posted drain tasks land after the close has
        // freed the token for the next accept
        let hammer = {
            let doomed = doomed.clone();
            thread::spawn(move || {
                for i in 0..64u16 {
                    doomed.send_frame::<FieldLenCodec>(frame(i, b"stale payload".to_vec()));
                }
            })
        };
        drop(first);

        let mut second = connect(addr);
        let _reused = wait_for_handle(2 * round + 1);
        hammer.join().unwrap();

        let sent = frame(7, format!("round {round}").into_bytes());
        second.write_all(&encode(sent.clone())).unwrap();
        let got = read_frame(&mut second).unwrap();
        assert_eq!(got, sent, "echo corrupted in round {round}");

        // nothing beyond the one echo may arrive: a stale send or
        // close that reached this connection would surface here
        second
            .set_read_timeout(Some(Duration::from_millis(80)))
            .unwrap();
        let mut probe = [0u8; 1];
        match second.read(&mut probe) {
            Ok(0) => panic!("connection closed under a stale task in round {round}"),
            Ok(_) => panic!("unexpected bytes after echo in round {round}"),
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ),
                "unexpected read error in round {round}: {e}"
            ),
        }

        drop(second);
        close_rx.recv_timeout(CLIENT_TIMEOUT).unwrap();
        close_rx.recv_timeout(CLIENT_TIMEOUT).unwrap();
    }

    server.stop();
    pool.stop();
}

#[test]
fn test_sends_after_close_are_dropped_silently() {
    let pool = Arc::new(LoopPool::new(1).unwrap());
    pool.start();

    let handles = Arc::new(Mutex::new(Vec::new()));
    let (close_tx, close_rx) = channel::<()>();
    let close_tx = Arc::new(Mutex::new(close_tx));

    let mut server = TcpServer::<FieldLenCodec>::new("127.0.0.1:0".parse().unwrap(), Arc::clone(&pool));
    {
        let handles = Arc::clone(&handles);
        server.on_connect(move |conn| handles.lock().unwrap().push(conn.clone()));
    }
    {
        let tx = Arc::clone(&close_tx);
        server.on_close(move |_conn, _err| {
            tx.lock().unwrap().send(()).unwrap();
        });
    }
    let addr = server.start().unwrap();

    let stream = connect(addr);
    thread::sleep(Duration::from_millis(100));
    drop(stream);
    close_rx.recv_timeout(CLIENT_TIMEOUT).unwrap();

    let conn = handles.lock().unwrap().pop().expect("connection handle");
    assert!(conn.is_closed());
    // must not panic or resurrect anything
    conn.send_frame::<FieldLenCodec>(frame(0, b"into the void".to_vec()));

    server.stop();
    pool.stop();
}
