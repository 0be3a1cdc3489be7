use crate::config::ClientConfig;
use crate::driver::Driver;
use crate::error::{Result, RpcError};
use crate::protocol::{FailureKind, LIST_SERVICES, REFLECTION_SERVICE, Request, Response, codec};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A typed client for one remote service, bound to a connection.
///
/// Implementors name the service they speak for; the connection refuses to
/// build a proxy for a service the remote says it does not expose.
pub trait ServiceProxy: Sized {
    const SERVICE: &'static str;

    fn bind(conn: ClientConnection) -> Self;
}

struct Outgoing {
    service: String,
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value>>,
}

struct Session {
    requests: mpsc::Sender<Outgoing>,
    closed: CancellationToken,
}

struct Inner {
    addr: SocketAddr,
    connect_timeout: Duration,
    session: Mutex<Option<Session>>,
    services: Mutex<Vec<String>>,
}

/// One live connection to a remote server. Clones share the connection.
#[derive(Clone)]
pub struct ClientConnection {
    inner: Arc<Inner>,
}

impl Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("addr", &self.inner.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientConnection {
    pub fn new(addr: SocketAddr, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                addr,
                connect_timeout: config.connect_timeout(),
                session: Mutex::new(None),
                services: Mutex::new(Vec::new()),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn services_lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.inner
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens the session and returns the services the remote exposes, or an
    /// empty list when the remote does not support introspection.
    /// Connecting an already connected client returns the known list.
    pub async fn connect(&self) -> Result<Vec<String>> {
        if self.is_connected() {
            return Ok(self.services());
        }

        let addr = self.inner.addr;
        let stream = tokio::time::timeout(self.inner.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::ConnectionError(format!("connect to {addr} timed out")))?
            .map_err(RpcError::connection)?;

        let (requests, outgoing) = mpsc::channel(32);
        let closed = CancellationToken::new();
        tokio::spawn(drive(stream, outgoing, closed.clone(), addr));
        if let Some(previous) = self.session().replace(Session { requests, closed }) {
            previous.closed.cancel();
        }

        let listing = tokio::time::timeout(
            self.inner.connect_timeout,
            self.call_value(REFLECTION_SERVICE, LIST_SERVICES, Value::Null),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RpcError::ConnectionError(format!(
                "{addr} did not answer the service listing"
            )))
        });
        let services = match listing {
            Ok(value) => match serde_json::from_value::<Vec<String>>(value) {
                Ok(services) => services,
                Err(e) => {
                    warn!(%addr, error = %e, "malformed service list, ignoring");
                    Vec::new()
                }
            },
            Err(RpcError::Remote { kind, .. }) if kind == FailureKind::Unsupported.as_str() => {
                debug!(%addr, "remote does not support introspection");
                Vec::new()
            }
            Err(e) => {
                self.disconnect().await?;
                return Err(e);
            }
        };
        info!(%addr, ?services, "connected");
        *self.services_lock() = services.clone();
        Ok(services)
    }

    /// Closes the session. Disconnecting twice is harmless.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(session) = self.session().take() {
            session.closed.cancel();
            debug!(addr = %self.inner.addr, "disconnected");
        }
        self.services_lock().clear();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|s| !s.closed.is_cancelled() && !s.requests.is_closed())
    }

    /// Services listed by the remote at connect time.
    pub fn services(&self) -> Vec<String> {
        self.services_lock().clone()
    }

    /// Builds a proxy for `P`. Fails with `UnsupportedService` when the
    /// remote listed its services and `P::SERVICE` was not among them.
    pub fn new_service<P: ServiceProxy>(&self) -> Result<P> {
        if !self.is_connected() {
            return Err(RpcError::InvalidState(format!(
                "not connected to {}",
                self.inner.addr
            )));
        }
        let services = self.services_lock();
        if !services.is_empty() && !services.iter().any(|s| s == P::SERVICE) {
            return Err(RpcError::UnsupportedService(P::SERVICE.to_string()));
        }
        drop(services);
        Ok(P::bind(self.clone()))
    }

    /// Calls `service.method` with `params` and decodes the reply.
    pub async fn call<Req, Resp>(&self, service: &str, method: &str, params: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let params = serde_json::to_value(params)
            .map_err(|e| RpcError::BadParameter(format!("encode {service}.{method}: {e}")))?;
        let value = self.call_value(service, method, params).await?;
        serde_json::from_value(value).map_err(|e| RpcError::Remote {
            kind: FailureKind::BadParams.to_string(),
            message: format!("decode reply of {service}.{method}: {e}"),
        })
    }

    async fn call_value(&self, service: &str, method: &str, params: Value) -> Result<Value> {
        let requests = self
            .session()
            .as_ref()
            .map(|s| s.requests.clone())
            .ok_or_else(|| {
                RpcError::InvalidState(format!("not connected to {}", self.inner.addr))
            })?;

        let (reply, response) = oneshot::channel();
        requests
            .send(Outgoing {
                service: service.to_string(),
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| RpcError::ConnectionError(format!("{} connection closed", self.inner.addr)))?;
        response
            .await
            .map_err(|_| RpcError::ConnectionError(format!("{} connection closed", self.inner.addr)))?
    }

    /// The remote's address.
    pub fn addr(&self) -> String {
        self.inner.addr.to_string()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.inner.addr
    }
}

#[async_trait]
impl Driver for ClientConnection {
    async fn close(&self) -> Result<()> {
        self.disconnect().await
    }
}

/// Owns the socket for one session: writes requests, matches replies back
/// to their callers, and fails every outstanding call when the session ends.
async fn drive(
    stream: TcpStream,
    mut requests: mpsc::Receiver<Outgoing>,
    closed: CancellationToken,
    addr: SocketAddr,
) {
    let mut framed = Framed::new(stream, codec());
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_id: u64 = 1;

    let reason = loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break "disconnected".to_string(),
            outgoing = requests.recv() => {
                let Some(Outgoing { service, method, params, reply }) = outgoing else {
                    break "disconnected".to_string();
                };
                let id = next_id;
                next_id += 1;
                let request = Request { id, service, method, params };
                let line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = reply.send(Err(RpcError::BadParameter(e.to_string())));
                        continue;
                    }
                };
                if let Err(e) = framed.send(line).await {
                    let _ = reply.send(Err(RpcError::connection(&e)));
                    break e.to_string();
                }
                pending.insert(id, reply);
            }
            frame = framed.next() => match frame {
                Some(Ok(line)) => match serde_json::from_str::<Response>(&line) {
                    Ok(response) => match pending.remove(&response.id) {
                        Some(reply) => {
                            let _ = reply.send(response.into_result());
                        }
                        None => warn!(%addr, id = response.id, "reply for unknown call"),
                    },
                    Err(e) => warn!(%addr, error = %e, "malformed reply dropped"),
                },
                Some(Err(e)) => break e.to_string(),
                None => break "connection closed by server".to_string(),
            },
        }
    };

    closed.cancel();
    if !pending.is_empty() {
        debug!(%addr, outstanding = pending.len(), %reason, "failing outstanding calls");
    }
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RpcError::ConnectionError(reason.clone())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to find a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let conn = ClientConnection::new(addr, &ClientConfig::default());
        assert!(matches!(
            conn.connect().await,
            Err(RpcError::ConnectionError(_))
        ));
        assert!(!conn.is_connected());
        assert_eq!(conn.addr(), addr.to_string());
    }

    #[tokio::test]
    async fn silent_peer_times_out_during_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = tokio::spawn(async move {
            // Accept and keep the socket open without ever answering.
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let config = ClientConfig {
            connect_timeout_ms: 200,
            ..ClientConfig::default()
        };
        let conn = ClientConnection::new(addr, &config);
        let outcome = tokio::time::timeout(Duration::from_secs(3), conn.connect())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(RpcError::ConnectionError(_))));
        assert!(!conn.is_connected());
        holder.abort();
    }

    struct Nothing;

    impl ServiceProxy for Nothing {
        const SERVICE: &'static str = "nothing";

        fn bind(_: ClientConnection) -> Self {
            Nothing
        }
    }

    #[tokio::test]
    async fn unconnected_client_refuses_work() {
        let conn = ClientConnection::new("127.0.0.1:1".parse().unwrap(), &ClientConfig::default());
        assert!(matches!(
            conn.new_service::<Nothing>(),
            Err(RpcError::InvalidState(_))
        ));
        let call: Result<Value> = conn.call("x", "y", &()).await;
        assert!(matches!(call, Err(RpcError::InvalidState(_))));
        conn.disconnect().await.unwrap();
        conn.close().await.unwrap();
    }
}
