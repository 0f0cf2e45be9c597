//! Per-endpoint channel pools.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::oneshot;

use super::{channel::Channel, pipeline::Connector};
use crate::{
    config::{ChannelPoolOptions, ChannelPoolOptionsProvider},
    error::{Error, Result},
};

/// A `(scheme, host, port)` triple identifying one pool.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Endpoint {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Endpoint {
    pub(crate) fn from_uri(uri: &http::Uri) -> Result<Endpoint> {
        let scheme = match uri.scheme_str() {
            Some("https") => Scheme::Https,
            Some("http") | None => Scheme::Http,
            Some(other) => {
                return Err(Error::builder(format!("unsupported scheme: {other}")));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::unresolved_host(uri.clone()))?
            .trim_matches(['[', ']'])
            .to_string();
        let port = uri.port_u16().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        Ok(Endpoint { scheme, host, port })
    }

    /// Hostname of the endpoint.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the endpoint.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the endpoint uses TLS.
    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// The shared map of per-endpoint pools. This is the only structure touched
/// from outside the connection tasks; the map lock is held only for lookup,
/// each pool has its own lock.
pub(crate) struct ChannelPools {
    pools: Mutex<HashMap<Endpoint, Arc<ChannelPool>>>,
    connector: Arc<Connector>,
    defaults: ChannelPoolOptions,
    provider: Option<ChannelPoolOptionsProvider>,
    h2_mode: bool,
}

impl ChannelPools {
    pub(crate) fn new(
        connector: Arc<Connector>,
        defaults: ChannelPoolOptions,
        provider: Option<ChannelPoolOptionsProvider>,
        h2_mode: bool,
    ) -> ChannelPools {
        ChannelPools {
            pools: Mutex::new(HashMap::new()),
            connector,
            defaults,
            provider,
            h2_mode,
        }
    }

    pub(crate) fn pool_for(&self, endpoint: &Endpoint) -> Arc<ChannelPool> {
        let mut pools = self.pools.lock().unwrap();
        if let Some(pool) = pools.get(endpoint) {
            return pool.clone();
        }
        let options = self
            .provider
            .as_ref()
            .and_then(|p| p(endpoint))
            .unwrap_or(self.defaults);
        let pool = ChannelPool::new(
            endpoint.clone(),
            options,
            self.connector.clone(),
            self.h2_mode,
        );
        pools.insert(endpoint.clone(), pool.clone());
        pool
    }
}

struct PoolInner {
    channels: Vec<Arc<Channel>>,
    waiters: VecDeque<oneshot::Sender<Arc<Channel>>>,
}

/// Pool of channels to one endpoint with a bounded queue of waiting
/// acquirers.
pub(crate) struct ChannelPool {
    endpoint: Endpoint,
    options: ChannelPoolOptions,
    connector: Arc<Connector>,
    inner: Mutex<PoolInner>,
    h2_mode: bool,
    weak: Weak<ChannelPool>,
}

enum Acquired {
    Ready(Arc<Channel>),
    Wait(oneshot::Receiver<Arc<Channel>>),
}

impl ChannelPool {
    fn new(
        endpoint: Endpoint,
        options: ChannelPoolOptions,
        connector: Arc<Connector>,
        h2_mode: bool,
    ) -> Arc<ChannelPool> {
        Arc::new_cyclic(|weak| ChannelPool {
            endpoint,
            options,
            connector,
            inner: Mutex::new(PoolInner {
                channels: Vec::new(),
                waiters: VecDeque::new(),
            }),
            h2_mode,
            weak: weak.clone(),
        })
    }

    /// Acquire a channel to `addr`.
    ///
    /// HTTP/2 mode shares a single channel between all acquirers and only
    /// resolves once the handshake has settled (success or failure — the
    /// caller observes the outcome through the channel itself). HTTP/1
    /// binds a free channel, creates one while below the size cap, or
    /// queues the acquirer.
    pub(crate) async fn acquire(&self, addr: SocketAddr) -> Result<Arc<Channel>> {
        if self.h2_mode {
            return self.acquire_shared(addr).await;
        }

        let acquired = {
            let mut inner = self.inner.lock().unwrap();
            self.sweep(&mut inner);

            if let Some(channel) = inner
                .channels
                .iter()
                .find(|ch| ch.is_active() && !ch.is_bound())
                .cloned()
            {
                channel.bind();
                Acquired::Ready(channel)
            } else if inner.channels.len() < self.options.pool_size {
                let channel = self.connect(addr);
                channel.bind();
                inner.channels.push(channel.clone());
                log::trace!(
                    "pool {}: created channel {} ({} total)",
                    self.endpoint,
                    channel.id(),
                    inner.channels.len()
                );
                Acquired::Ready(channel)
            } else if inner.waiters.len() >= self.options.waiting_queue_length {
                return Err(Error::pool_exhausted());
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                log::trace!("pool {}: queued waiter", self.endpoint);
                Acquired::Wait(rx)
            }
        };

        match acquired {
            Acquired::Ready(channel) => Ok(channel),
            // sender dropped means the pool itself went away
            Acquired::Wait(rx) => rx.await.map_err(|_| Error::connection_inactive()),
        }
    }

    async fn acquire_shared(&self, addr: SocketAddr) -> Result<Arc<Channel>> {
        let channel = {
            let mut inner = self.inner.lock().unwrap();
            inner.channels.retain(|ch| ch.is_active());
            match inner.channels.first() {
                Some(ch) => ch.clone(),
                None => {
                    let ch = self.connect(addr);
                    inner.channels.push(ch.clone());
                    ch
                }
            }
        };

        // resolve only after the handshake future fired, either way
        if channel.handshake().await.is_err() {
            let mut inner = self.inner.lock().unwrap();
            inner.channels.retain(|ch| ch.id() != channel.id());
        }
        Ok(channel)
    }

    /// Return `channel` to the pool.
    ///
    /// HTTP/2 release is accounting only. For HTTP/1 a closed channel is
    /// dropped from the pool and a queued waiter is woken with a fresh
    /// connect; an open one is handed to a waiter or marked free.
    pub(crate) fn release(&self, channel: &Arc<Channel>) {
        let mut inner = self.inner.lock().unwrap();

        if !channel.is_active() {
            inner.channels.retain(|ch| ch.id() != channel.id());
            if self.h2_mode {
                return;
            }
            while let Some(waiter) = inner.waiters.pop_front() {
                let fresh = self.connect(channel.remote_addr());
                fresh.bind();
                inner.channels.push(fresh.clone());
                if waiter.send(fresh.clone()).is_ok() {
                    break;
                }
                // acquirer gave up; leave the fresh channel free
                fresh.unbind();
            }
            return;
        }

        if self.h2_mode {
            return;
        }

        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.send(channel.clone()).is_ok() {
                return;
            }
        }
        channel.unbind();
    }

    /// A connection task observed the channel dying; drop it and complete
    /// any waiter that would otherwise starve.
    pub(crate) fn on_channel_closed(&self, channel: &Arc<Channel>) {
        channel.close();
        self.release(channel);
    }

    /// Drop closed channels and close idle ones past their idle timeout.
    fn sweep(&self, inner: &mut PoolInner) {
        let idle_timeout = self.options.idle_timeout;
        inner.channels.retain(|ch| {
            if !ch.is_active() {
                return false;
            }
            if let Some(limit) = idle_timeout {
                if !ch.is_bound() && ch.idle_for() > limit {
                    log::trace!("pool {}: dropping idle channel {}", self.endpoint, ch.id());
                    ch.close();
                    return false;
                }
            }
            true
        });
    }

    fn connect(&self, addr: SocketAddr) -> Arc<Channel> {
        self.connector
            .connect(self.endpoint.clone(), addr, self.weak.clone())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().channels.len()
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self) -> usize {
        self.inner.lock().unwrap().waiters.len()
    }
}

impl fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ChannelPool")
            .field("endpoint", &self.endpoint)
            .field("channels", &inner.channels.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}
