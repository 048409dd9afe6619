//! Hermetic TLS and QUIC servers for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use sni_probe::{DialerConfig, ExperimentSession, MockableSession};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub struct TestCert {
    pub cert: Certificate,
    pub key: PrivateKey,
}

pub fn self_signed(name: &str) -> TestCert {
    let generated = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    TestCert {
        cert: Certificate(generated.serialize_der().unwrap()),
        key: PrivateKey(generated.serialize_private_key_der()),
    }
}

pub fn roots_for(cert: &TestCert) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(&cert.cert).unwrap();
    roots
}

pub fn session_with(config: DialerConfig) -> Arc<dyn ExperimentSession> {
    Arc::new(MockableSession::new("sni-probe-tests", "0.0.0", config))
}

pub fn session_trusting(cert: &TestCert) -> Arc<dyn ExperimentSession> {
    session_with(DialerConfig::default().with_root_store(roots_for(cert)))
}

/// Aborts the accept loop when dropped.
pub struct Server {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Server {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// What a plain TCP server does after reading the ClientHello.
#[derive(Debug, Clone, Copy)]
pub enum Misbehavior {
    /// Sends a RST.
    Reset,
    /// Closes the connection cleanly.
    Close,
    /// Never answers.
    Stall,
}

pub async fn spawn_tls_server(cert: &TestCert) -> Server {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.clone()], cert.key.clone())
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let task = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(stream).await {
                    let mut buf = [0u8; 1];
                    let _ = tls.read(&mut buf).await;
                }
            });
        }
    });
    Server {
        addr,
        accepted,
        task,
    }
}

pub async fn spawn_misbehaving_server(behavior: Misbehavior) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                match behavior {
                    Misbehavior::Reset => {
                        let _ = stream.set_linger(Some(Duration::ZERO));
                        drop(stream);
                    }
                    Misbehavior::Close => drop(stream),
                    Misbehavior::Stall => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        drop(stream);
                    }
                }
            });
        }
    });
    Server {
        addr,
        accepted,
        task,
    }
}

/// QUIC server speaking TLS 1.3 with ALPN `h3`; keeps every connection
/// open until the client closes it.
pub fn spawn_quic_server(cert: &TestCert) -> Server {
    let mut crypto = ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.clone()], cert.key.clone())
        .unwrap();
    crypto.alpn_protocols = vec![b"h3".to_vec()];
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let task = tokio::spawn(async move {
        while let Some(connecting) = endpoint.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if let Ok(connection) = connecting.await {
                    let _ = connection.closed().await;
                }
            });
        }
    });
    Server {
        addr,
        accepted,
        task,
    }
}

/// A local port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
