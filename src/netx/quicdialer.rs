use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, Runtime, TokioRuntime, VarInt};
use quinn_udp::{RecvMeta, Transmit, UdpState};
use scopeguard::ScopeGuard;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::resolver::Resolver;
use super::{join_host_port, lookup_host, reduce_errors, split_host_port};
use crate::context::ProbeContext;
use crate::errorx::{classify, BoxError, Failure, MeasurementError, Operation};
use crate::trace::{next_id, Event, Saver, TlsState};

/// Established QUIC connection together with the endpoint driving it.
/// Dropping the session closes both.
#[derive(Debug)]
pub struct QuicSession {
    connection: quinn::Connection,
    endpoint: Endpoint,
}

impl QuicSession {
    pub fn connection(&self) -> &quinn::Connection {
        &self.connection
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"");
        self.endpoint.close(VarInt::from_u32(0), b"");
    }
}

impl Drop for QuicSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait QuicDialer: Send + Sync {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, BoxError>;
}

/// QUIC handshake against a single `ip:port` from a fresh UDP socket.
#[derive(Clone)]
pub struct SystemQuicDialer {
    crypto: Arc<rustls::ClientConfig>,
    timeout: Duration,
    saver: Option<Saver>,
}

impl SystemQuicDialer {
    /// With a `saver`, every datagram sent or received is recorded.
    pub fn new(crypto: Arc<rustls::ClientConfig>, timeout: Duration, saver: Option<Saver>) -> Self {
        Self {
            crypto,
            timeout,
            saver,
        }
    }
}

fn bind_udp_socket(remote: &SocketAddr) -> io::Result<std::net::UdpSocket> {
    let (domain, local) = match remote {
        SocketAddr::V4(_) => (Domain::IPV4, SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
        SocketAddr::V6(_) => (Domain::IPV6, SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))),
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[async_trait]
impl QuicDialer for SystemQuicDialer {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, BoxError> {
        let remote: SocketAddr = address
            .parse()
            .map_err(|_| format!("quic: invalid IP representation: {address}"))?;
        let socket = bind_udp_socket(&remote)?;
        let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
        let endpoint = match &self.saver {
            Some(saver) => {
                let inner = runtime.wrap_udp_socket(socket)?;
                let socket = SaverUdpSocket::new(inner, saver.clone(), ctx.dial_id());
                Endpoint::new_with_abstract_socket(EndpointConfig::default(), None, socket, runtime)?
            }
            None => Endpoint::new(EndpointConfig::default(), None, socket, runtime)?,
        };
        // Release the socket on every failure path, including cancellation.
        let endpoint = scopeguard::guard(endpoint, |endpoint| {
            endpoint.close(VarInt::from_u32(0), b"");
        });

        let connecting = endpoint.connect_with(
            quinn::ClientConfig::new(self.crypto.clone()),
            remote,
            server_name,
        )?;
        let connection = ctx.with_timeout(self.timeout).run(connecting).await?;
        Ok(QuicSession {
            connection,
            endpoint: ScopeGuard::into_inner(endpoint),
        })
    }
}

/// Classifies failures as `quic_handshake` errors.
#[derive(Clone)]
pub struct ErrorWrapperQuicDialer<D> {
    dialer: D,
}

impl<D: QuicDialer> ErrorWrapperQuicDialer<D> {
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl<D: QuicDialer> QuicDialer for ErrorWrapperQuicDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, BoxError> {
        self.dialer
            .dial_context(ctx, address, server_name)
            .await
            .map_err(|err| {
                let err = MeasurementError::wrap(err, Operation::QuicHandshake)
                    .with_dial_id(ctx.dial_id());
                Box::new(err) as BoxError
            })
    }
}

/// Records one `quic_handshake` event per attempt.
#[derive(Clone)]
pub struct SaverQuicDialer<D> {
    dialer: D,
    saver: Saver,
}

impl<D: QuicDialer> SaverQuicDialer<D> {
    pub fn new(dialer: D, saver: Saver) -> Self {
        Self { dialer, saver }
    }
}

#[async_trait]
impl<D: QuicDialer> QuicDialer for SaverQuicDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, BoxError> {
        let started = Instant::now();
        let result = self.dialer.dial_context(ctx, address, server_name).await;
        let mut event = Event::new(Operation::QuicHandshake, started);
        event.dial_id = ctx.dial_id();
        event.proto = Some("quic");
        event.address = Some(address.to_string());
        event.tls = Some(match &result {
            Ok(session) => handshake_state(server_name, session.connection()),
            Err(_) => TlsState {
                server_name: server_name.to_string(),
                ..TlsState::default()
            },
        });
        event.failure = result.as_ref().err().map(|err| classify(err.as_ref()));
        debug!(address, server_name, failure = ?event.failure, "quic_handshake");
        self.saver.write(event);
        result
    }
}

fn handshake_state(server_name: &str, connection: &quinn::Connection) -> TlsState {
    let mut state = TlsState {
        server_name: server_name.to_string(),
        version: "TLSv1.3".to_string(),
        ..TlsState::default()
    };
    if let Some(data) = connection.handshake_data() {
        if let Ok(data) = data.downcast::<quinn::crypto::rustls::HandshakeData>() {
            if let Some(protocol) = data.protocol {
                state.negotiated_protocol = String::from_utf8_lossy(&protocol).into_owned();
            }
        }
    }
    if let Some(identity) = connection.peer_identity() {
        if let Ok(certs) = identity.downcast::<Vec<rustls::Certificate>>() {
            state.peer_certificates = certs.iter().map(|cert| cert.0.clone()).collect();
        }
    }
    state
}

/// Resolves the host part of `address` and attempts a handshake with each IP
/// in order. When every attempt fails the errors are reduced to one: the
/// first classified failure in attempt order, else the first error.
pub struct DnsQuicDialer<D> {
    resolver: Arc<dyn Resolver>,
    dialer: D,
}

impl<D: QuicDialer> DnsQuicDialer<D> {
    pub fn new(resolver: Arc<dyn Resolver>, dialer: D) -> Self {
        Self { resolver, dialer }
    }
}

#[async_trait]
impl<D: QuicDialer> QuicDialer for DnsQuicDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        address: &str,
        server_name: &str,
    ) -> Result<QuicSession, BoxError> {
        let (host, port) = split_host_port(address)?;
        let ctx = match ctx.dial_id() {
            Some(_) => ctx.clone(),
            None => ctx.with_dial_id(next_id()),
        };
        let addrs = lookup_host(self.resolver.as_ref(), &ctx, host).await?;
        let mut errors = Vec::with_capacity(addrs.len());
        for ip in addrs {
            let target = join_host_port(&ip.to_string(), port);
            match self.dialer.dial_context(&ctx, &target, server_name).await {
                Ok(session) => return Ok(session),
                Err(err) => errors.push(err),
            }
        }
        Err(reduce_errors(errors))
    }
}

/// UDP socket recording every datagram as a `write` or `read` event.
pub struct SaverUdpSocket {
    inner: Box<dyn AsyncUdpSocket>,
    saver: Saver,
    dial_id: Option<u64>,
    conn_id: u64,
}

impl SaverUdpSocket {
    pub fn new(inner: Box<dyn AsyncUdpSocket>, saver: Saver, dial_id: Option<u64>) -> Self {
        Self {
            inner,
            saver,
            dial_id,
            conn_id: next_id(),
        }
    }

    fn record(
        &self,
        operation: Operation,
        started: Instant,
        address: Option<SocketAddr>,
        data: &[u8],
        failure: Option<Failure>,
    ) {
        let mut event = Event::new(operation, started);
        event.dial_id = self.dial_id;
        event.conn_id = Some(self.conn_id);
        event.proto = Some("udp");
        event.address = address.map(|addr| addr.to_string());
        event.num_bytes = data.len();
        event.data = Some(data.to_vec());
        event.failure = failure;
        self.saver.write(event);
    }
}

impl fmt::Debug for SaverUdpSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaverUdpSocket")
            .field("inner", &self.inner)
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

impl AsyncUdpSocket for SaverUdpSocket {
    fn poll_send(
        &self,
        state: &UdpState,
        cx: &mut Context<'_>,
        transmits: &[Transmit],
    ) -> Poll<io::Result<usize>> {
        let started = Instant::now();
        let poll = self.inner.poll_send(state, cx, transmits);
        match &poll {
            Poll::Ready(Ok(sent)) => {
                for transmit in transmits.iter().take(*sent) {
                    self.record(
                        Operation::Write,
                        started,
                        Some(transmit.destination),
                        &transmit.contents,
                        None,
                    );
                }
            }
            Poll::Ready(Err(err)) => {
                let destination = transmits.first().map(|transmit| transmit.destination);
                self.record(Operation::Write, started, destination, &[], Some(classify(err)));
            }
            Poll::Pending => {}
        }
        poll
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let started = Instant::now();
        let poll = self.inner.poll_recv(cx, bufs, meta);
        match &poll {
            Poll::Ready(Ok(count)) => {
                for (buf, meta) in bufs.iter().zip(meta.iter()).take(*count) {
                    self.record(Operation::Read, started, Some(meta.addr), &buf[..meta.len], None);
                }
            }
            Poll::Ready(Err(err)) => {
                self.record(Operation::Read, started, None, &[], Some(classify(err)));
            }
            Poll::Pending => {}
        }
        poll
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}
