//! End-to-end coverage of a TCP echo round trip and a fragmented-frame
//! reassembly through the public `channel::tcp` facade rather than the
//! lower-level `TcpProcessor` the unit tests in `processor/tcp.rs` exercise
//! directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchyard_io::channel::{tcp, AcceptListener, ChannelHandle};
use switchyard_io::config::ChannelBuilder;
use switchyard_io::pool::SelectorPool;

struct Echo;

impl AcceptListener for Echo {
    fn connection_accepted(&self, _remote: SocketAddr, channel: ChannelHandle) {
        std::thread::spawn(move || loop {
            let msg = {
                let input = channel.input_buffer();
                let received = input.next();
                let body = received.clone();
                received.release();
                body
            };
            if msg.is_empty() {
                return;
            }
            let output = channel.output_buffer();
            let mut slot = output.claim();
            slot.clear();
            slot.extend_from_slice(&msg);
            slot.publish();
        });
    }
}

#[test]
fn echoes_hello_world() {
    let pool = SelectorPool::open("tcp-echo-test", 2).unwrap();
    let config = Arc::new(ChannelBuilder::new(pool.clone()).message_length(1024).build());

    // Reserve a free loopback port via the std listener, then release it
    // before handing the same address to `tcp::bind`, which wants to own
    // the accept loop itself.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let server = tcp::bind(config.clone(), addr, Arc::new(Echo)).unwrap();

    let client = tcp::connect(&config, addr).unwrap();
    client.connect_future().wait().unwrap();

    {
        let output = client.output_buffer();
        let mut slot = output.claim();
        slot.clear();
        slot.extend_from_slice(b"hello world");
        slot.publish();
    }

    let input = client.input_buffer();
    let reply = input.next();
    assert_eq!(&reply[..], b"hello world");
    reply.release();

    client.close();
    assert!(client.close_future().wait().is_ok());

    server.close();
    std::thread::sleep(Duration::from_millis(20));
    pool.close();
}

#[test]
fn delivers_fragmented_frames_whole() {
    let pool = SelectorPool::open("tcp-fragmentation-test", 2).unwrap();
    let config = ChannelBuilder::new(pool.clone()).message_length(1024).build();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = tcp::bind(Arc::new(ChannelBuilder::new(pool.clone()).message_length(1024).build()), addr, Arc::new(Echo)).unwrap();

    let client = tcp::connect(&config, addr).unwrap();
    client.connect_future().wait().unwrap();

    let frames: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8; 300]).collect();
    for frame in &frames {
        let output = client.output_buffer();
        let mut slot = output.claim();
        slot.clear();
        slot.extend_from_slice(frame);
        slot.publish();
    }

    let input = client.input_buffer();
    for frame in &frames {
        let reply = input.next();
        assert_eq!(&reply[..], frame.as_slice());
        reply.release();
    }

    client.close();
    server.close();
    std::thread::sleep(Duration::from_millis(20));
    pool.close();
}
