//! Under simulated datagram loss, the receiver sees most (but not
//! necessarily all) of what was sent, and never reports a decode error for
//! what does arrive. Loss is simulated with a
//! small relay that drops every tenth datagram deterministically rather
//! than pulling in a randomness dependency for a one-off test.

use std::net::UdpSocket as StdUdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard_io::channel::udp;
use switchyard_io::config::ChannelBuilder;
use switchyard_io::pool::SelectorPool;

#[test]
fn receiver_tolerates_dropped_datagrams() {
    const TOTAL: usize = 200;

    let pool = SelectorPool::open("udp-loss-test", 2).unwrap();
    let config = ChannelBuilder::new(pool.clone()).message_length(64).build();

    let relay = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let relay_addr = relay.local_addr().unwrap();

    let receiver_probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let receiver_addr = receiver_probe.local_addr().unwrap();
    drop(receiver_probe);

    let receiver = udp::connect(&config, receiver_addr, relay_addr).unwrap();

    let forwarded = Arc::new(AtomicUsize::new(0));
    {
        let relay = relay.try_clone().unwrap();
        let forwarded = forwarded.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let mut seen = 0usize;
            loop {
                let (n, _from) = match relay.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(_) => return,
                };
                seen += 1;
                if seen % 10 == 0 {
                    continue; // simulate a dropped datagram
                }
                if relay.send_to(&buf[..n], receiver_addr).is_err() {
                    return;
                }
                forwarded.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    let sender_probe = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    let sender_addr = sender_probe.local_addr().unwrap();
    drop(sender_probe);
    let sender = udp::connect(&config, sender_addr, relay_addr).unwrap();

    for i in 0..TOTAL {
        let output = sender.output_buffer();
        let mut slot = output.claim();
        slot.clear();
        slot.extend_from_slice(&(i as u32).to_be_bytes());
        slot.publish();
    }

    std::thread::sleep(Duration::from_millis(500));

    let input = receiver.input_buffer();
    let mut received = 0usize;
    while let Some(slot) = input.try_next() {
        assert_eq!(slot.len(), 4, "every delivered datagram decodes to a whole 4-byte body");
        slot.release();
        received += 1;
    }

    // ~10% loss by design; allow slack for the relay/receiver racing the
    // sleep above.
    assert!(received >= (TOTAL * 8) / 10, "received too few: {received}/{TOTAL}");
    assert!(received <= TOTAL, "received more than sent: {received}/{TOTAL}");

    sender.close();
    receiver.close();
    std::thread::sleep(Duration::from_millis(20));
    pool.close();
}
