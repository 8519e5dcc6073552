use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use simac_frame::Multipart;
use simac_socket::{Role, RouterListener, RouterWriter};
use simac_transport::{Endpoint, IpcStream, TransportError, UnixDomainSocket};
use tracing::{debug, error, info, trace, warn};

use crate::config::BrokerConfig;
use crate::envelope::{self, BACKEND_SHUTDOWN};
use crate::error::{MacError, Result};
use crate::registry::ServiceRegistry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Everything the loop thread reacts to, in arrival order.
#[derive(Debug)]
enum LoopEvent {
    Connected {
        role: Role,
        conn_id: u64,
        identity: Bytes,
        writer: RouterWriter,
    },
    Message {
        role: Role,
        conn_id: u64,
        parts: Multipart,
    },
    Disconnected {
        role: Role,
        conn_id: u64,
        identity: Bytes,
    },
    Ping(SyncSender<()>),
    DeliverShutdown(String),
    Stop,
}

/// Cloneable access to a broker: its registry, addresses and loop queue.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    registry: Arc<ServiceRegistry>,
    events: Sender<LoopEvent>,
    client_address: Endpoint,
    worker_address: Endpoint,
}

impl BrokerHandle {
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Endpoint request clients connect to.
    pub fn client_address(&self) -> &Endpoint {
        &self.client_address
    }

    /// Endpoint backends connect to.
    pub fn worker_address(&self) -> &Endpoint {
        &self.worker_address
    }

    /// Round-trip an event through the loop queue.
    pub fn ping(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.events
            .send(LoopEvent::Ping(tx))
            .map_err(|_| MacError::BrokerStopped)?;
        rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => MacError::StartupTimeout(timeout),
            RecvTimeoutError::Disconnected => MacError::BrokerStopped,
        })
    }

    /// Ask the loop to send the shutdown sentinel to a backend.
    pub fn deliver_shutdown(&self, id: &str) -> Result<()> {
        self.events
            .send(LoopEvent::DeliverShutdown(id.to_string()))
            .map_err(|_| MacError::BrokerStopped)
    }
}

/// Routes requests from the client endpoint to backends on the worker
/// endpoint and replies back, tracking backend readiness in a
/// [`ServiceRegistry`].
///
/// One thread owns every connection writer and makes all routing decisions.
/// Acceptor and per-connection reader threads only feed its queue.
pub struct Broker {
    handle: BrokerHandle,
    config: BrokerConfig,
    listeners: Option<[Arc<RouterListener>; 2]>,
    events: Option<Receiver<LoopEvent>>,
    stopping: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Broker {
    /// Bind both endpoints. Nothing is served until [`Broker::run`].
    pub fn bind(config: BrokerConfig) -> Result<Self> {
        if config.client_address == config.worker_address {
            return Err(TransportError::InvalidAddress {
                address: config.worker_address.to_string(),
                reason: "client and worker endpoints must differ".to_string(),
            }
            .into());
        }

        let frontend = RouterListener::bind(&config.client_address, Role::Client)?
            .with_handshake_config(config.handshake.clone())
            .with_frame_config(config.frames.clone());
        let backend = RouterListener::bind(&config.worker_address, Role::Worker)?
            .with_handshake_config(config.handshake.clone())
            .with_frame_config(config.frames.clone());

        let (tx, rx) = mpsc::channel();
        info!(
            client = %config.client_address,
            worker = %config.worker_address,
            "broker bound"
        );

        Ok(Self {
            handle: BrokerHandle {
                registry: Arc::new(ServiceRegistry::new()),
                events: tx,
                client_address: config.client_address.clone(),
                worker_address: config.worker_address.clone(),
            },
            config,
            listeners: Some([Arc::new(frontend), Arc::new(backend)]),
            events: Some(rx),
            stopping: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Start the loop and acceptor threads.
    ///
    /// Returns once the loop has answered a ping. Calling it again is a no-op.
    pub fn run(&mut self) -> Result<()> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(MacError::BrokerStopped);
        }
        let (Some(listeners), Some(events)) = (self.listeners.take(), self.events.take()) else {
            return Ok(());
        };

        let registry = Arc::clone(&self.handle.registry);
        self.threads.push(
            thread::Builder::new()
                .name("simac-broker".to_string())
                .spawn(move || event_loop(events, registry))?,
        );

        for listener in listeners {
            let events = self.handle.events.clone();
            let stopping = Arc::clone(&self.stopping);
            let name = format!("simac-accept-{}", listener.role());
            self.threads.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || accept_loop(listener, events, stopping))?,
            );
        }

        self.handle.ping(self.config.startup_timeout)?;
        info!("broker running");
        Ok(())
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.handle.registry
    }

    pub fn client_address(&self) -> &Endpoint {
        &self.handle.client_address
    }

    pub fn worker_address(&self) -> &Endpoint {
        &self.handle.worker_address
    }

    /// Stop accepting, close every connection and join the broker threads.
    pub fn shutdown(&mut self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.handle.events.send(LoopEvent::Stop);

        if self.listeners.is_none() {
            // Wake acceptors blocked in accept().
            for endpoint in [&self.config.client_address, &self.config.worker_address] {
                if let Ok(stream) = UnixDomainSocket::connect_endpoint(endpoint) {
                    let _ = stream.shutdown();
                }
            }
        }

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("broker thread panicked");
            }
        }
        self.listeners = None;
        info!("broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("client_address", &self.handle.client_address)
            .field("worker_address", &self.handle.worker_address)
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn accept_loop(listener: Arc<RouterListener>, events: Sender<LoopEvent>, stopping: Arc<AtomicBool>) {
    let role = listener.role();
    loop {
        let accepted = listener.accept_stream();
        if stopping.load(Ordering::Acquire) {
            break;
        }
        let stream = match accepted {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%role, error = %err, "accept failed");
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        let conn_listener = Arc::clone(&listener);
        let conn_events = events.clone();
        let spawned = thread::Builder::new()
            .name(format!("simac-conn-{role}"))
            .spawn(move || serve_connection(conn_listener, stream, conn_events));
        if let Err(err) = spawned {
            error!(%role, error = %err, "failed to spawn connection thread");
        }
    }
    debug!(%role, "acceptor stopped");
}

fn serve_connection(listener: Arc<RouterListener>, stream: IpcStream, events: Sender<LoopEvent>) {
    let role = listener.role();
    let handshake = listener.handshake(stream);
    // The socket file goes away with the last listener reference.
    drop(listener);
    let conn = match handshake {
        Ok(conn) => conn,
        Err(err) => {
            warn!(%role, error = %err, "handshake rejected");
            return;
        }
    };
    let conn_id = conn.id();
    let identity = conn.identity().clone();
    let (mut reader, writer) = conn.into_split();

    let connected = LoopEvent::Connected {
        role,
        conn_id,
        identity: identity.clone(),
        writer,
    };
    if let Err(mpsc::SendError(LoopEvent::Connected { writer, .. })) = events.send(connected) {
        let _ = writer.shutdown();
        return;
    }

    loop {
        match reader.recv() {
            Ok(parts) => {
                let message = LoopEvent::Message {
                    role,
                    conn_id,
                    parts,
                };
                if events.send(message).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(%role, conn_id, error = %err, "connection closed");
                break;
            }
        }
    }
    let _ = events.send(LoopEvent::Disconnected {
        role,
        conn_id,
        identity,
    });
}

fn event_loop(events: Receiver<LoopEvent>, registry: Arc<ServiceRegistry>) {
    let mut router = Router {
        registry,
        clients: HashMap::new(),
        workers: HashMap::new(),
    };

    while let Ok(event) = events.recv() {
        match event {
            LoopEvent::Connected {
                role,
                conn_id,
                identity,
                writer,
            } => router.connected(role, conn_id, identity, writer),
            LoopEvent::Message {
                role,
                conn_id,
                parts,
            } => router.message(role, conn_id, parts),
            LoopEvent::Disconnected {
                role,
                conn_id,
                identity,
            } => router.disconnected(role, conn_id, &identity),
            LoopEvent::Ping(ack) => {
                let _ = ack.send(());
            }
            LoopEvent::DeliverShutdown(id) => router.deliver_shutdown(&id),
            LoopEvent::Stop => break,
        }
    }

    router.close_all();
    for event in events.try_iter() {
        if let LoopEvent::Connected { writer, .. } = event {
            let _ = writer.shutdown();
        }
    }
    debug!("broker loop exited");
}

struct Route {
    conn_id: u64,
    writer: RouterWriter,
}

/// Loop-thread state: live connections per endpoint, keyed by identity.
struct Router {
    registry: Arc<ServiceRegistry>,
    clients: HashMap<Bytes, Route>,
    workers: HashMap<Bytes, Route>,
}

impl Router {
    fn table(&mut self, role: Role) -> &mut HashMap<Bytes, Route> {
        match role {
            Role::Client => &mut self.clients,
            Role::Worker => &mut self.workers,
        }
    }

    fn connected(&mut self, role: Role, conn_id: u64, identity: Bytes, writer: RouterWriter) {
        let table = self.table(role);
        if let Some(existing) = table.get(&identity) {
            warn!(
                %role,
                identity = %String::from_utf8_lossy(&identity),
                existing = existing.conn_id,
                conn_id,
                "identity already connected; refusing"
            );
            let _ = writer.shutdown();
            return;
        }
        debug!(%role, identity = %String::from_utf8_lossy(&identity), conn_id, "connected");
        table.insert(identity, Route { conn_id, writer });
    }

    fn disconnected(&mut self, role: Role, conn_id: u64, identity: &Bytes) {
        let table = self.table(role);
        if !table.get(identity).is_some_and(|r| r.conn_id == conn_id) {
            return;
        }
        table.remove(identity);
        let identity = String::from_utf8_lossy(identity);
        debug!(%role, %identity, conn_id, "disconnected");
        if role == Role::Worker {
            self.registry.mark_disconnected(&identity);
        }
    }

    fn message(&mut self, role: Role, conn_id: u64, parts: Multipart) {
        let table = match role {
            Role::Client => &self.clients,
            Role::Worker => &self.workers,
        };
        let current = parts
            .first()
            .and_then(|identity| table.get(identity))
            .is_some_and(|r| r.conn_id == conn_id);
        if !current {
            debug!(%role, conn_id, "message from refused connection dropped");
            return;
        }

        let result = match role {
            Role::Client => self.handle_frontend(parts),
            Role::Worker => self.handle_backend(parts),
        };
        if let Err(err) = result {
            warn!(%role, conn_id, error = %err, "malformed envelope dropped");
        }
    }

    /// `[client, "", service, "", body]` becomes `[service, "", client, "", body]`.
    fn handle_frontend(&mut self, parts: Multipart) -> Result<()> {
        let (client, rest) = envelope::unwrap(parts)?;
        let (service, body) = envelope::unwrap(rest)?;
        if body.is_empty() {
            return Err(MacError::EmptyEnvelope);
        }
        trace!(
            client = %String::from_utf8_lossy(&client),
            service = %String::from_utf8_lossy(&service),
            "request"
        );
        self.route(Role::Worker, envelope::wrap(service, envelope::wrap(client, body)));
        Ok(())
    }

    /// `[service, "", client, "", reply]` goes to `client` unchanged; a lone
    /// readiness sentinel marks `service` ready instead.
    fn handle_backend(&mut self, parts: Multipart) -> Result<()> {
        let (service, body) = envelope::unwrap(parts)?;
        if envelope::is_ready(&body) {
            self.registry
                .mark_ready(&String::from_utf8_lossy(&service));
            return Ok(());
        }
        if body.is_empty() {
            return Err(MacError::EmptyEnvelope);
        }
        trace!(service = %String::from_utf8_lossy(&service), "reply");
        self.route(Role::Client, body);
        Ok(())
    }

    fn deliver_shutdown(&mut self, id: &str) {
        debug!(deveui = id, "delivering shutdown");
        let message = envelope::wrap(
            Bytes::copy_from_slice(id.as_bytes()),
            vec![Bytes::from_static(BACKEND_SHUTDOWN)],
        );
        self.route(Role::Worker, message);
    }

    /// Send `parts[1..]` to the connection whose identity is `parts[0]`.
    fn route(&mut self, role: Role, mut parts: Multipart) {
        if parts.is_empty() {
            return;
        }
        let destination = parts.remove(0);
        let Some(route) = self.table(role).get_mut(&destination) else {
            warn!(
                %role,
                destination = %String::from_utf8_lossy(&destination),
                "no connection for destination; message dropped"
            );
            return;
        };
        if let Err(err) = route.writer.send(&parts) {
            warn!(
                %role,
                destination = %String::from_utf8_lossy(&destination),
                conn_id = route.conn_id,
                error = %err,
                "send failed; closing connection"
            );
            let _ = route.writer.shutdown();
        }
    }

    fn close_all(&mut self) {
        for route in self.clients.values().chain(self.workers.values()) {
            let _ = route.writer.shutdown();
        }
        self.clients.clear();
        self.workers.clear();
    }
}
