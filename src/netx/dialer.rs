use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use super::resolver::Resolver;
use super::{join_host_port, lookup_host, reduce_errors, split_host_port, NetConn};
use crate::context::ProbeContext;
use crate::errorx::{classify, BoxError, Failure, MeasurementError, Operation};
use crate::trace::{next_id, Event, Saver};

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError>;
}

/// Plain TCP connect bounded by a connect timeout.
#[derive(Debug, Clone)]
pub struct SystemDialer {
    timeout: Duration,
}

impl SystemDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError> {
        if network != "tcp" {
            return Err(format!("unsupported network: {network}").into());
        }
        let stream = ctx
            .with_timeout(self.timeout)
            .run(TcpStream::connect(address))
            .await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Classifies dial failures as `connect` errors.
#[derive(Debug, Clone)]
pub struct ErrorWrapperDialer<D> {
    dialer: D,
}

impl<D: Dialer> ErrorWrapperDialer<D> {
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for ErrorWrapperDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError> {
        self.dialer
            .dial_context(ctx, network, address)
            .await
            .map_err(|err| {
                let err = MeasurementError::wrap(err, Operation::Connect).with_dial_id(ctx.dial_id());
                Box::new(err) as BoxError
            })
    }
}

/// Records one `connect` event per dial.
#[derive(Debug, Clone)]
pub struct SaverDialer<D> {
    dialer: D,
    saver: Saver,
}

impl<D: Dialer> SaverDialer<D> {
    pub fn new(dialer: D, saver: Saver) -> Self {
        Self { dialer, saver }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for SaverDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError> {
        let started = Instant::now();
        let result = self.dialer.dial_context(ctx, network, address).await;
        let mut event = Event::new(Operation::Connect, started);
        event.dial_id = ctx.dial_id();
        event.proto = Some("tcp");
        event.address = Some(address.to_string());
        event.failure = result.as_ref().err().map(|err| classify(err.as_ref()));
        debug!(address, failure = ?event.failure, "connect");
        self.saver.write(event);
        result
    }
}

/// Wraps successful connections so reads and writes are recorded.
#[derive(Debug, Clone)]
pub struct SaverConnDialer<D> {
    dialer: D,
    saver: Saver,
}

impl<D: Dialer> SaverConnDialer<D> {
    pub fn new(dialer: D, saver: Saver) -> Self {
        Self { dialer, saver }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for SaverConnDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError> {
        let conn = self.dialer.dial_context(ctx, network, address).await?;
        Ok(Box::new(SaverConn::new(
            conn,
            self.saver.clone(),
            address,
            ctx.dial_id(),
        )))
    }
}

/// Connection recording one event per completed read or write.
pub struct SaverConn {
    inner: NetConn,
    saver: Saver,
    address: String,
    dial_id: Option<u64>,
    conn_id: u64,
    read_started: Option<Instant>,
    write_started: Option<Instant>,
}

impl SaverConn {
    pub fn new(inner: NetConn, saver: Saver, address: &str, dial_id: Option<u64>) -> Self {
        Self {
            inner,
            saver,
            address: address.to_string(),
            dial_id,
            conn_id: next_id(),
            read_started: None,
            write_started: None,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn record(&self, operation: Operation, started: Instant, data: &[u8], failure: Option<Failure>) {
        let mut event = Event::new(operation, started);
        event.dial_id = self.dial_id;
        event.conn_id = Some(self.conn_id);
        event.proto = Some("tcp");
        event.address = Some(self.address.clone());
        event.num_bytes = data.len();
        event.data = Some(data.to_vec());
        event.failure = failure;
        self.saver.write(event);
    }
}

impl AsyncRead for SaverConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let started = *this.read_started.get_or_insert_with(Instant::now);
        let wanted = buf.remaining();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(result) = &poll {
            this.read_started = None;
            let data = &buf.filled()[before..];
            let failure = match result {
                Err(err) => Some(classify(err)),
                Ok(()) if data.is_empty() && wanted > 0 => Some(Failure::EOF_ERROR),
                Ok(()) => None,
            };
            this.record(Operation::Read, started, data, failure);
        }
        poll
    }
}

impl AsyncWrite for SaverConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let started = *this.write_started.get_or_insert_with(Instant::now);
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(result) = &poll {
            this.write_started = None;
            match result {
                Ok(written) => this.record(Operation::Write, started, &buf[..*written], None),
                Err(err) => this.record(Operation::Write, started, &[], Some(classify(err))),
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Resolves the host part of `address` and dials each IP in order until one
/// connects. Tags every operation of the dial with one dial id.
pub struct DnsDialer<D> {
    resolver: Arc<dyn Resolver>,
    dialer: D,
}

impl<D: Dialer> DnsDialer<D> {
    pub fn new(resolver: Arc<dyn Resolver>, dialer: D) -> Self {
        Self { resolver, dialer }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for DnsDialer<D> {
    async fn dial_context(
        &self,
        ctx: &ProbeContext,
        network: &str,
        address: &str,
    ) -> Result<NetConn, BoxError> {
        let (host, port) = split_host_port(address)?;
        let ctx = match ctx.dial_id() {
            Some(_) => ctx.clone(),
            None => ctx.with_dial_id(next_id()),
        };
        let addrs = lookup_host(self.resolver.as_ref(), &ctx, host).await?;
        let mut errors = Vec::with_capacity(addrs.len());
        for ip in addrs {
            let target = join_host_port(&ip.to_string(), port);
            match self.dialer.dial_context(&ctx, network, &target).await {
                Ok(conn) => return Ok(conn),
                Err(err) => errors.push(err),
            }
        }
        Err(reduce_errors(errors))
    }
}
