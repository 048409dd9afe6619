use std::io;
use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use crate::context::ProbeContext;
use crate::errorx::{classify, BoxError, MeasurementError, Operation};
use crate::trace::{Event, Saver};

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(&self, ctx: &ProbeContext, hostname: &str) -> Result<Vec<IpAddr>, BoxError>;

    /// Resolver engine as reported in the archival `queries` list.
    fn network(&self) -> &'static str {
        "system"
    }

    fn address(&self) -> &str {
        ""
    }
}

/// getaddrinfo through tokio's blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, ctx: &ProbeContext, hostname: &str) -> Result<Vec<IpAddr>, BoxError> {
        let addrs = ctx.run(tokio::net::lookup_host((hostname, 0))).await?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            if !ips.contains(&addr.ip()) {
                ips.push(addr.ip());
            }
        }
        if ips.is_empty() {
            return Err(Box::new(io::Error::new(io::ErrorKind::NotFound, "no such host")));
        }
        Ok(ips)
    }
}

/// Classifies resolver failures as `resolve` errors.
#[derive(Debug, Clone)]
pub struct ErrorWrapperResolver<R> {
    resolver: R,
}

impl<R: Resolver> ErrorWrapperResolver<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<R: Resolver> Resolver for ErrorWrapperResolver<R> {
    async fn lookup_host(&self, ctx: &ProbeContext, hostname: &str) -> Result<Vec<IpAddr>, BoxError> {
        self.resolver.lookup_host(ctx, hostname).await.map_err(|err| {
            let err = MeasurementError::wrap(err, Operation::Resolve).with_dial_id(ctx.dial_id());
            Box::new(err) as BoxError
        })
    }

    fn network(&self) -> &'static str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}

/// Records one `resolve` event per lookup.
#[derive(Debug, Clone)]
pub struct SaverResolver<R> {
    resolver: R,
    saver: Saver,
}

impl<R: Resolver> SaverResolver<R> {
    pub fn new(resolver: R, saver: Saver) -> Self {
        Self { resolver, saver }
    }
}

#[async_trait]
impl<R: Resolver> Resolver for SaverResolver<R> {
    async fn lookup_host(&self, ctx: &ProbeContext, hostname: &str) -> Result<Vec<IpAddr>, BoxError> {
        let started = Instant::now();
        let result = self.resolver.lookup_host(ctx, hostname).await;
        let mut event = Event::new(Operation::Resolve, started);
        event.dial_id = ctx.dial_id();
        event.hostname = Some(hostname.to_string());
        event.proto = Some(self.resolver.network());
        event.address = Some(self.resolver.address().to_string());
        match &result {
            Ok(addrs) => event.addresses = addrs.iter().map(IpAddr::to_string).collect(),
            Err(err) => event.failure = Some(classify(err.as_ref())),
        }
        debug!(hostname, addresses = ?event.addresses, failure = ?event.failure, "resolve");
        self.saver.write(event);
        result
    }

    fn network(&self) -> &'static str {
        self.resolver.network()
    }

    fn address(&self) -> &str {
        self.resolver.address()
    }
}
