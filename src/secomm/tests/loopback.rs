use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;

use secomm::{ChannelError, ChannelListener, ChannelMux, SecAssociation, SecureChannel};

const KEY: [u8; 16] = *b"0123456789abcdef";

fn sa() -> SecAssociation {
    SecAssociation::new("client", "server", &KEY).unwrap()
}

#[test]
fn round_trip_both_directions() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let server = thread::spawn(move || {
        let chan = listener.accept(sa()).unwrap();
        let msg = chan.recv().unwrap();
        assert_eq!(msg, b"ping");
        chan.send(b"pong").unwrap();
        // several more frames to exercise the counters
        for i in 0u32..8 {
            let msg = chan.recv().unwrap();
            assert_eq!(msg, i.to_le_bytes());
            chan.send(&(i + 1).to_le_bytes()).unwrap();
        }
    });

    let chan = SecureChannel::connect("127.0.0.1", port, sa()).unwrap();
    chan.send(b"ping").unwrap();
    assert_eq!(chan.recv().unwrap(), b"pong");
    for i in 0u32..8 {
        chan.send(&i.to_le_bytes()).unwrap();
        assert_eq!(chan.recv().unwrap(), (i + 1).to_le_bytes());
    }
    server.join().unwrap();
}

#[test]
fn tampered_frame_is_session_fatal() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let server = thread::spawn(move || {
        let chan = listener.accept(sa()).unwrap();
        chan.recv()
    });

    // Speak the wire format by hand so one ciphertext byte can be flipped.
    let mut sa_tx = sa();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let mut frame = sa_tx.seal(b"legitimate request").unwrap();
    frame[20] ^= 0xff;
    stream
        .write_all(&(frame.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&frame).unwrap();

    let got = server.join().unwrap();
    assert!(matches!(got, Err(ChannelError::Crypto(_))));
}

#[test]
fn oversized_length_prefix_is_protocol_error() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let server = thread::spawn(move || {
        let chan = listener.accept(sa()).unwrap();
        chan.recv_bounded(4096)
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(&u32::MAX.to_be_bytes()).unwrap();

    let got = server.join().unwrap();
    assert!(matches!(got, Err(ChannelError::Protocol(_))));
}

#[test]
fn truncated_frame_is_io_error() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let server = thread::spawn(move || {
        let chan = listener.accept(sa()).unwrap();
        chan.recv()
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    // announce 64 bytes, deliver half, then hang up
    stream.write_all(&64u32.to_be_bytes()).unwrap();
    stream.write_all(&[0u8; 32]).unwrap();
    drop(stream);

    let got = server.join().unwrap();
    assert!(matches!(got, Err(ChannelError::Io(_))));
}

#[test]
fn reordered_frames_fail_on_recv() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let server = thread::spawn(move || {
        let chan = listener.accept(sa()).unwrap();
        chan.recv()
    });

    let mut sa_tx = sa();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let _first = sa_tx.seal(b"first").unwrap();
    let second = sa_tx.seal(b"second").unwrap();
    stream
        .write_all(&(second.len() as u32).to_be_bytes())
        .unwrap();
    stream.write_all(&second).unwrap();

    let got = server.join().unwrap();
    assert!(matches!(got, Err(ChannelError::Crypto(_))));
}

#[test]
fn mux_reports_readable_channel() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let client = thread::spawn(move || {
        let chan = SecureChannel::connect("127.0.0.1", port, sa()).unwrap();
        chan.send(b"wake up").unwrap();
        // hold the connection open until the other side is done
        let _ = chan.recv();
    });

    let chan = listener.accept(sa()).unwrap();
    let mut mux = ChannelMux::new();
    mux.register(3, &chan);

    // data is in flight; poll until it lands
    let mut ready = Vec::new();
    for _ in 0..50 {
        ready = mux.wait(100).unwrap();
        if !ready.is_empty() {
            break;
        }
    }
    assert_eq!(ready, vec![3]);
    assert_eq!(chan.recv().unwrap(), b"wake up");
    chan.send(b"done").unwrap();
    client.join().unwrap();
}

#[test]
fn queued_frames_arrive_in_order() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    let client = thread::spawn(move || {
        let chan = SecureChannel::connect("127.0.0.1", port, sa()).unwrap();
        for i in 0u32..32 {
            chan.send(&i.to_le_bytes()).unwrap();
        }
    });

    let chan = listener.accept(sa()).unwrap();
    for i in 0u32..32 {
        assert_eq!(chan.recv().unwrap(), i.to_le_bytes());
    }
    client.join().unwrap();
}

#[test]
fn concurrent_senders_interleave_whole_frames() {
    let listener = ChannelListener::bind(0).unwrap();
    let port = listener.local_port().unwrap();

    const PER_THREAD: usize = 16;

    let client = thread::spawn(move || {
        let chan = std::sync::Arc::new(
            SecureChannel::connect("127.0.0.1", port, sa()).unwrap(),
        );
        let senders: Vec<_> = (0u8..4)
            .map(|tag| {
                let chan = chan.clone();
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        chan.send(&[tag; 100]).unwrap();
                    }
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }
    });

    // every frame must decrypt cleanly (counters serialized by the send
    // mutex) and carry exactly one sender's payload
    let chan = listener.accept(sa()).unwrap();
    let mut counts = [0usize; 4];
    for _ in 0..4 * PER_THREAD {
        let msg = chan.recv().unwrap();
        assert_eq!(msg.len(), 100);
        let tag = msg[0];
        assert!(msg.iter().all(|&b| b == tag), "interleaved frame");
        counts[tag as usize] += 1;
    }
    assert_eq!(counts, [PER_THREAD; 4]);
    client.join().unwrap();
}

#[test]
fn wire_overhead_is_length_plus_frame() {
    // len:u32be || iv(12) || ct || tag(16); ct is the padded plaintext
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = thread::spawn(move || {
        let chan = SecureChannel::connect("127.0.0.1", port, sa()).unwrap();
        chan.send(&[0xAA; 100]).unwrap();
    });

    let (mut stream, _) = listener.accept().unwrap();
    let mut lenb = [0u8; 4];
    stream.read_exact(&mut lenb).unwrap();
    let len = u32::from_be_bytes(lenb) as usize;
    // 100 bytes pad to 112, plus 12-byte IV and 16-byte tag
    assert_eq!(len, 112 + 28);
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).unwrap();
    client.join().unwrap();
}
