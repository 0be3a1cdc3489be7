//! RPC server hosting [`Module`]s over the line-delimited JSON transport.
//!
//! Lifecycle: `Created -> Running -> Draining -> Stopped` for a graceful stop,
//! or `Running -> Stopped` when halted. A stopped server may be started again.

use crate::config::ServerConfig;
use crate::driver::Driver;
use crate::error::{Result, RpcError};
use crate::events::{EventBus, Publisher};
use crate::models::{Event, EventType, ServiceRecord, ServiceType, validate_service_name};
use crate::module::Module;
use crate::protocol::{
    Failure, FailureKind, LIST_SERVICES, REFLECTION_SERVICE, Request, Response, codec,
};
use crate::utils::{local_host_identity, mdns_host};

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Draining,
    Stopped,
}

type Modules = Arc<BTreeMap<String, Arc<Module>>>;

/// Cancellation for one run of the server. `drain` is a child of `halt`,
/// so halting also stops intake.
#[derive(Clone)]
struct Shutdown {
    halt: CancellationToken,
    drain: CancellationToken,
}

impl Shutdown {
    fn new() -> Self {
        let halt = CancellationToken::new();
        let drain = halt.child_token();
        Self { halt, drain }
    }
}

struct Lifecycle {
    state: ServerState,
    addr: Option<SocketAddr>,
    shutdown: Option<Shutdown>,
    modules: BTreeMap<String, Arc<Module>>,
}

pub struct Server {
    config: ServerConfig,
    instance: String,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<ServerState>,
    bus: EventBus,
    closed: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, bus_capacity: usize) -> Result<Self> {
        let instance = match &config.name {
            Some(name) => {
                validate_service_name(name)?;
                name.clone()
            }
            None => local_host_identity(),
        };
        let (state_tx, _) = watch::channel(ServerState::Created);
        Ok(Self {
            config,
            instance,
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Created,
                addr: None,
                shutdown: None,
                modules: BTreeMap::new(),
            }),
            state_tx,
            bus: EventBus::new(bus_capacity),
            closed: AtomicBool::new(false),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    /// Attaches a module. Only allowed while the server is not serving.
    pub fn register(&self, module: Module) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if matches!(lifecycle.state, ServerState::Running | ServerState::Draining) {
            return Err(RpcError::InvalidState(format!(
                "cannot register {:?} while the server is running",
                module.name()
            )));
        }
        if lifecycle.modules.contains_key(module.name()) {
            return Err(RpcError::BadParameter(format!(
                "module {:?} already registered",
                module.name()
            )));
        }
        debug!(module = module.name(), "registered module");
        lifecycle
            .modules
            .insert(module.name().to_string(), Arc::new(module));
        Ok(())
    }

    /// Serves calls until [`Server::stop`] is called from another task.
    ///
    /// Emits `ServerStarted` once listening and `ServerStopped` after the
    /// last connection has been wound down.
    pub async fn start(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::InvalidState("server is closed".into()));
        }
        self.check_startable()?;

        let listener = TcpListener::bind(self.config.bind)
            .await
            .map_err(RpcError::transport)?;
        let addr = listener.local_addr().map_err(RpcError::transport)?;
        let shutdown = Shutdown::new();

        let modules: Modules = {
            let mut lifecycle = self.lifecycle();
            self.check_startable_locked(&lifecycle)?;
            lifecycle.state = ServerState::Running;
            lifecycle.addr = Some(addr);
            lifecycle.shutdown = Some(shutdown.clone());
            Arc::new(lifecycle.modules.clone())
        };
        self.state_tx.send_replace(ServerState::Running);
        info!(%addr, modules = modules.len(), "server started");
        self.emit(Event::new(EventType::ServerStarted)).await;

        let tracker = TaskTracker::new();
        let result = loop {
            tokio::select! {
                _ = shutdown.drain.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tracker.spawn(serve_connection(
                            stream,
                            peer,
                            Arc::clone(&modules),
                            self.config.reflection,
                            shutdown.clone(),
                            tracker.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "accept failed, stopping server");
                        break Err(RpcError::transport(e));
                    }
                },
            }
        };
        drop(listener);

        if result.is_err() {
            shutdown.halt.cancel();
        }
        tracker.close();
        tracker.wait().await;

        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = ServerState::Stopped;
            lifecycle.addr = None;
            lifecycle.shutdown = None;
        }
        self.state_tx.send_replace(ServerState::Stopped);
        info!(%addr, "server stopped");
        self.emit(Event::new(EventType::ServerStopped)).await;
        result
    }

    fn check_startable(&self) -> Result<()> {
        self.check_startable_locked(&self.lifecycle())
    }

    fn check_startable_locked(&self, lifecycle: &Lifecycle) -> Result<()> {
        match lifecycle.state {
            ServerState::Created | ServerState::Stopped => Ok(()),
            state => Err(RpcError::InvalidState(format!(
                "server cannot start while {state:?}"
            ))),
        }
    }

    /// Stops a running server and waits until it has reached `Stopped`.
    ///
    /// With `halt == false` the server stops accepting, lets in-flight
    /// calls finish and delivers their replies. With `halt == true`
    /// in-flight calls are abandoned and their callers see the connection
    /// drop. Stopping a server that is already draining or stopped does
    /// nothing.
    pub async fn stop(&self, halt: bool) -> Result<()> {
        let mut state_rx = self.state_tx.subscribe();
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                ServerState::Created => {
                    return Err(RpcError::InvalidState("server was never started".into()));
                }
                ServerState::Stopped => return Ok(()),
                ServerState::Draining => {
                    debug!(halt, "stop requested while draining, ignored");
                    return Ok(());
                }
                ServerState::Running => {
                    let Some(shutdown) = lifecycle.shutdown.clone() else {
                        return Err(RpcError::InvalidState("server has no listener".into()));
                    };
                    if shutdown.halt.is_cancelled() {
                        debug!(halt, "stop requested while halting, waiting");
                    } else if halt {
                        info!("halting server");
                        shutdown.halt.cancel();
                    } else {
                        info!("draining server");
                        lifecycle.state = ServerState::Draining;
                        self.state_tx.send_replace(ServerState::Draining);
                        shutdown.drain.cancel();
                    }
                }
            }
        }

        state_rx
            .wait_for(|state| *state == ServerState::Stopped)
            .await
            .map_err(|_| RpcError::InvalidState("server dropped while stopping".into()))?;
        Ok(())
    }

    /// The bound address while running or draining.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.lifecycle().addr
    }

    /// A record describing this server under the host's name.
    pub fn service<I, S>(&self, service: &str, text: I) -> Result<ServiceRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_with_name(service, &self.instance, text)
    }

    /// A record describing this server under `name`.
    pub fn service_with_name<I, S>(&self, service: &str, name: &str, text: I) -> Result<ServiceRecord>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service_type = ServiceType::parse(service)?;
        validate_service_name(name)?;
        let addr = self
            .addr()
            .ok_or_else(|| RpcError::InvalidState("server is not running".into()))?;

        let record = ServiceRecord::new(name, service_type.as_str(), addr.port())
            .with_text(text)
            .with_host(mdns_host(&self.instance));
        if addr.ip().is_unspecified() {
            Ok(record)
        } else {
            Ok(record.with_addrs([addr.ip()]))
        }
    }
}

impl Publisher for Server {
    fn event_bus(&self) -> &EventBus {
        &self.bus
    }
}

#[async_trait]
impl Driver for Server {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if matches!(self.state(), ServerState::Running | ServerState::Draining) {
            self.stop(true).await?;
        }
        self.bus.close();
        Ok(())
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    modules: Modules,
    reflection: bool,
    shutdown: Shutdown,
    tracker: TaskTracker,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read, codec());
    let (reply_tx, mut reply_rx) = mpsc::channel::<Response>(32);

    let halt = shutdown.halt.clone();
    tracker.spawn(async move {
        let mut sink = FramedWrite::new(write, codec());
        loop {
            let response = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                response = reply_rx.recv() => match response {
                    Some(response) => response,
                    None => break,
                },
            };
            let line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    warn!(%peer, error = %e, "failed to encode response");
                    continue;
                }
            };
            // A peer that stops reading must not keep a halt waiting.
            tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                sent = sink.send(line) => {
                    if let Err(e) = sent {
                        debug!(%peer, error = %e, "write failed, closing connection");
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = if shutdown.drain.is_cancelled() {
            // Serve requests that already arrived, then stop reading.
            if shutdown.halt.is_cancelled() {
                break;
            }
            match frames.next().now_or_never() {
                Some(frame) => frame,
                None => break,
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown.drain.cancelled() => continue,
                frame = frames.next() => frame,
            }
        };
        let line = match frame {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "read failed, closing connection");
                break;
            }
            None => break,
        };
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(%peer, error = %e, "malformed request dropped");
                continue;
            }
        };

        let modules = Arc::clone(&modules);
        let reply_tx = reply_tx.clone();
        let halt = shutdown.halt.clone();
        tracker.spawn(async move {
            let id = request.id;
            let method = format!("{}.{}", request.service, request.method);
            tokio::select! {
                biased;
                _ = halt.cancelled() => debug!(%peer, %method, "call aborted by halt"),
                outcome = dispatch(request, &modules, reflection) => {
                    let _ = reply_tx.send(Response::new(id, outcome)).await;
                }
            }
        });
    }
    debug!(%peer, "connection intake closed");
}

async fn dispatch(request: Request, modules: &Modules, reflection: bool) -> Result<Value, Failure> {
    if request.service == REFLECTION_SERVICE {
        if !reflection {
            return Err(Failure::new(FailureKind::Unsupported, "reflection disabled"));
        }
        return match request.method.as_str() {
            LIST_SERVICES => Ok(Value::from(modules.keys().cloned().collect::<Vec<_>>())),
            other => Err(Failure::new(
                FailureKind::UnknownMethod,
                format!("{REFLECTION_SERVICE}.{other}"),
            )),
        };
    }
    match modules.get(&request.service) {
        Some(module) => module.dispatch(&request.method, request.params).await,
        None => Err(Failure::new(FailureKind::UnknownService, &request.service)),
    }
}
