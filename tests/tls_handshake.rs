//! Covers a full TLS handshake, exchange, and clean close end-to-end through
//! the public `channel::tls` facade: the handshake is driven entirely by the
//! selector pool's own epoll dispatch (unlike `processor::tls`'s unit test,
//! which steps the handshake by hand), then one frame is exchanged and both
//! sides close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, ServerConfig};

use switchyard_io::channel::{tls, AcceptListener, ChannelHandle};
use switchyard_io::config::ChannelBuilder;
use switchyard_io::pool::SelectorPool;
use switchyard_io::processor::tls::TlsContext;

struct Echo;

impl AcceptListener for Echo {
    fn connection_accepted(&self, _remote: SocketAddr, channel: ChannelHandle) {
        std::thread::spawn(move || {
            let input = channel.input_buffer();
            let received = input.next();
            let body = received.to_vec();
            received.release();

            let output = channel.output_buffer();
            let mut slot = output.claim();
            slot.clear();
            slot.extend_from_slice(&body);
            slot.publish();
        });
    }
}

fn test_contexts() -> (Arc<TlsContext>, Arc<TlsContext>) {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der)
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();

    let server_ctx = Arc::new(TlsContext::server(Arc::new(server_config)));
    let client_ctx = Arc::new(TlsContext::client(Arc::new(client_config), "localhost").unwrap());
    (server_ctx, client_ctx)
}

#[test]
fn handshakes_exchanges_and_closes_cleanly() {
    let (server_ctx, client_ctx) = test_contexts();
    let pool = SelectorPool::open("tls-channel-test", 2).unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server_config = Arc::new(
        ChannelBuilder::new(pool.clone())
            .message_length(1024)
            .tls_context(server_ctx)
            .build(),
    );
    let server = tls::bind(server_config, addr, Arc::new(Echo)).unwrap();

    let client_config = ChannelBuilder::new(pool.clone())
        .message_length(1024)
        .tls_context(client_ctx)
        .build();
    let client = tls::connect(&client_config, addr).unwrap();
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
