use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use simac_transport::Endpoint;
use tracing::{debug, info, warn};

use crate::broker::BrokerHandle;
use crate::client::{Interrupter, RequestClient};
use crate::config::{MacConfig, BACKEND_ADDRESS_ENV};
use crate::error::{MacError, Result};
use crate::registry::RegisteredService;

const STOP_POLL: Duration = Duration::from_millis(10);

/// Function run on its own thread as an in-process backend. It receives the
/// device identifier and the worker endpoint address.
pub type InProcFn = Arc<dyn Fn(&str, &Endpoint) + Send + Sync + 'static>;

/// How a device's backend runs.
pub enum Backend {
    /// A function on a thread named after the device.
    InProc {
        func: InProcFn,
        thread: Option<JoinHandle<()>>,
    },
    /// An external executable, started as
    /// `<program> <args..> --deveui <id>` with the worker address in
    /// `MAC_RPC_BACKEND_ADDRESS`.
    Process {
        program: PathBuf,
        args: Vec<OsString>,
        child: Option<Child>,
    },
}

impl Backend {
    pub fn in_process<F>(func: F) -> Self
    where
        F: Fn(&str, &Endpoint) + Send + Sync + 'static,
    {
        Self::InProc {
            func: Arc::new(func),
            thread: None,
        }
    }

    pub fn process(program: impl Into<PathBuf>) -> Self {
        Self::process_with_args(program, Vec::<OsString>::new())
    }

    /// Like [`Backend::process`], with arguments placed before `--deveui`.
    pub fn process_with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self::Process {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            child: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InProc { .. } => "inproc",
            Self::Process { .. } => "process",
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProc { thread, .. } => f
                .debug_struct("InProc")
                .field("running", &thread.is_some())
                .finish_non_exhaustive(),
            Self::Process {
                program,
                args,
                child,
            } => f
                .debug_struct("Process")
                .field("program", program)
                .field("args", args)
                .field("pid", &child.as_ref().map(Child::id))
                .finish(),
        }
    }
}

/// One managed device: its registry entry, request client and backend.
#[derive(Debug)]
pub struct Mac {
    deveui: String,
    broker: BrokerHandle,
    service: Mutex<Option<Arc<RegisteredService>>>,
    client: Mutex<RequestClient>,
    interrupter: Interrupter,
    backend: Mutex<Backend>,
    stop_grace: Duration,
}

impl Mac {
    pub fn new(deveui: &str, backend: Backend, broker: BrokerHandle, config: &MacConfig) -> Self {
        let client =
            RequestClient::with_config(broker.client_address().clone(), config.client.clone());
        Self {
            deveui: deveui.to_string(),
            broker,
            service: Mutex::new(None),
            interrupter: client.interrupter(),
            client: Mutex::new(client),
            backend: Mutex::new(backend),
            stop_grace: config.stop_grace,
        }
    }

    pub fn deveui(&self) -> &str {
        &self.deveui
    }

    /// `"inproc"` or `"process"`.
    pub fn kind(&self) -> &'static str {
        lock(&self.backend).kind()
    }

    /// Process id of a running spawned backend.
    pub fn pid(&self) -> Option<u32> {
        match &*lock(&self.backend) {
            Backend::Process { child, .. } => child.as_ref().map(Child::id),
            Backend::InProc { .. } => None,
        }
    }

    /// Whether the backend has signalled readiness and is still connected.
    pub fn is_ready(&self) -> bool {
        lock(&self.service)
            .as_ref()
            .is_some_and(|service| service.is_ready())
    }

    /// Register with the broker, then launch the backend.
    ///
    /// Does not wait for readiness. When the launch fails the registry entry
    /// stays behind, never ready, until [`Mac::stop`].
    pub fn start(&self) -> Result<()> {
        let service = self.broker.registry().register(&self.deveui)?;
        *lock(&self.service) = Some(service);

        let address = self.broker.worker_address().clone();
        let mut backend = lock(&self.backend);
        match &mut *backend {
            Backend::InProc { func, thread: slot } => {
                let func = Arc::clone(func);
                let deveui = self.deveui.clone();
                let handle = thread::Builder::new()
                    .name(format!("mac-{deveui}"))
                    .spawn(move || func(&deveui, &address))?;
                *slot = Some(handle);
                debug!(deveui = %self.deveui, "in-process backend started");
            }
            Backend::Process {
                program,
                args,
                child,
            } => {
                let spawned = Command::new(&*program)
                    .args(args.iter())
                    .arg("--deveui")
                    .arg(&self.deveui)
                    .env(BACKEND_ADDRESS_ENV, address.to_string())
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(|source| MacError::Spawn {
                        program: program.clone(),
                        source,
                    })?;
                info!(deveui = %self.deveui, pid = spawned.id(), program = %program.display(), "backend process spawned");
                *child = Some(spawned);
            }
        }
        Ok(())
    }

    /// Shut the backend down and forget the device in the registry.
    ///
    /// A ready backend is sent the shutdown sentinel and given the configured
    /// grace period to exit. A thread that outlives it is detached; a process
    /// is killed. A request still waiting for its reply is failed. Stopping a
    /// handle that was never started does nothing.
    pub fn stop(&self) {
        let Some(service) = lock(&self.service).take() else {
            return;
        };
        if service.is_ready() {
            if let Err(err) = self.broker.deliver_shutdown(&self.deveui) {
                warn!(deveui = %self.deveui, error = %err, "could not deliver shutdown");
            }
        }
        self.broker.registry().deregister(&self.deveui);

        let deadline = Instant::now() + self.stop_grace;
        self.disconnect_client(deadline);
        let mut backend = lock(&self.backend);
        match &mut *backend {
            Backend::InProc { thread, .. } => {
                if let Some(handle) = thread.take() {
                    join_by(handle, deadline, &self.deveui);
                }
            }
            Backend::Process { child, .. } => {
                if let Some(mut child) = child.take() {
                    reap_by(&mut child, deadline, &self.deveui);
                }
            }
        }
        info!(deveui = %self.deveui, "mac stopped");
    }

    /// Send a command to the backend and wait for its reply.
    ///
    /// Fails with [`MacError::NotConnected`] without contacting the broker
    /// unless the backend is ready.
    pub fn request(&self, command: &str) -> Result<String> {
        if !self.is_ready() {
            return Err(MacError::NotConnected(self.deveui.clone()));
        }
        lock(&self.client).send(&self.deveui, command)
    }

    /// Same as [`Mac::request`].
    pub fn command(&self, command: &str) -> Result<String> {
        self.request(command)
    }

    // `request` holds the client for a whole round trip.
    fn disconnect_client(&self, deadline: Instant) {
        loop {
            match self.client.try_lock() {
                Ok(mut client) => return client.disconnect(),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return poisoned.into_inner().disconnect()
                }
                Err(TryLockError::WouldBlock) => {
                    if self.interrupter.interrupt() {
                        debug!(deveui = %self.deveui, "in-flight request interrupted");
                    }
                    if Instant::now() >= deadline {
                        warn!(deveui = %self.deveui, "request client still busy; leaving it");
                        return;
                    }
                    thread::sleep(STOP_POLL);
                }
            }
        }
    }
}

impl Drop for Mac {
    fn drop(&mut self) {
        let backend = self
            .backend
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Backend::Process {
            child: Some(child), ..
        } = backend
        {
            warn!(deveui = %self.deveui, pid = child.id(), "killing backend left running");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_by(handle: JoinHandle<()>, deadline: Instant, deveui: &str) {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(deveui, "backend thread still running; detaching");
            return;
        }
        thread::sleep(STOP_POLL);
    }
    if handle.join().is_err() {
        warn!(deveui, "backend thread panicked");
    }
}

fn reap_by(child: &mut Child, deadline: Instant, deveui: &str) {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(deveui, %status, "backend process exited");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(STOP_POLL),
            Ok(None) => break,
            Err(err) => {
                warn!(deveui, error = %err, "could not poll backend process");
                break;
            }
        }
    }
    warn!(deveui, pid = child.id(), "backend process did not exit; killing");
    if let Err(err) = child.kill() {
        warn!(deveui, error = %err, "kill failed");
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;
    use crate::envelope::BACKEND_READY;
    use crate::worker::{echo_reply, Worker};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "simac-mac-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    fn running_broker(tag: &str) -> (PathBuf, Broker) {
        let dir = temp_dir(tag);
        let mut broker = Broker::bind(BrokerConfig::in_dir(&dir)).expect("bind");
        broker.run().expect("run");
        (dir, broker)
    }

    fn echo_backend() -> Backend {
        Backend::in_process(|deveui, address| {
            let worker = Worker::connect(deveui, address).expect("worker connect");
            let id = deveui.to_string();
            worker
                .serve(|command| echo_reply(&id, command))
                .expect("serve");
        })
    }

    fn config(grace: Duration) -> MacConfig {
        MacConfig {
            stop_grace: grace,
            ..MacConfig::default()
        }
    }

    fn wait_ready(mac: &Mac) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !mac.is_ready() {
            assert!(Instant::now() < deadline, "{} never became ready", mac.deveui());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn never_started_request_fails_fast() {
        let (dir, broker) = running_broker("fresh");
        let mac = Mac::new("d2", echo_backend(), broker.handle(), &MacConfig::default());

        let err = mac.request("PING").unwrap_err();
        assert!(matches!(err, MacError::NotConnected(ref id) if id == "d2"));
        assert_eq!(err.to_string(), "d2 is not connected");
        assert!(!lock(&mac.client).is_connected(), "no broker traffic");
        assert!(broker.registry().is_empty());

        mac.stop();
        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn inproc_lifecycle() {
        let (dir, broker) = running_broker("inproc");
        let mac = Mac::new(
            "0000000000000001",
            echo_backend(),
            broker.handle(),
            &config(Duration::from_secs(2)),
        );
        assert_eq!(mac.kind(), "inproc");
        assert!(mac.pid().is_none());

        mac.start().expect("start");
        wait_ready(&mac);
        assert_eq!(
            mac.request("Hello").expect("request"),
            "Hello from 0000000000000001"
        );
        assert_eq!(
            mac.command("status").expect("command"),
            "status from 0000000000000001"
        );

        mac.stop();
        assert!(!mac.is_ready());
        assert!(broker.registry().lookup("0000000000000001").is_none());
        assert!(matches!(
            &*lock(&mac.backend),
            Backend::InProc { thread: None, .. }
        ));
        assert!(matches!(mac.request("Hello"), Err(MacError::NotConnected(_))));

        // Stopping twice is harmless.
        mac.stop();
        assert!(broker.registry().is_empty());

        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_start_conflicts() {
        let (dir, broker) = running_broker("conflict");
        let first = Mac::new("d1", echo_backend(), broker.handle(), &MacConfig::default());
        let second = Mac::new("d1", echo_backend(), broker.handle(), &MacConfig::default());

        first.start().expect("start");
        assert!(matches!(
            second.start(),
            Err(MacError::AlreadyRegistered(ref id)) if id == "d1"
        ));
        wait_ready(&first);

        // The loser's stop must not tear down the winner.
        second.stop();
        assert!(first.is_ready());

        first.stop();
        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn spawn_failure_leaves_entry_not_ready() {
        let (dir, broker) = running_broker("spawnfail");
        let mac = Mac::new(
            "d3",
            Backend::process(dir.join("no-such-backend")),
            broker.handle(),
            &MacConfig::default(),
        );

        let err = mac.start().unwrap_err();
        assert!(matches!(err, MacError::Spawn { .. }));
        let entry = broker.registry().lookup("d3").expect("entry kept");
        assert!(!entry.is_ready());
        assert!(matches!(mac.request("PING"), Err(MacError::NotConnected(_))));

        mac.stop();
        assert!(broker.registry().is_empty());
        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    #[cfg(unix)]
    fn stop_kills_unresponsive_process() {
        let (dir, broker) = running_broker("kill");
        let mac = Mac::new(
            "d4",
            Backend::process_with_args("/bin/sh", ["-c", "exec sleep 30", "sh"]),
            broker.handle(),
            &config(Duration::from_millis(100)),
        );

        mac.start().expect("start");
        assert_eq!(mac.kind(), "process");
        assert!(mac.pid().is_some());
        assert!(!mac.is_ready());

        let started = Instant::now();
        mac.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(mac.pid().is_none());
        assert!(broker.registry().is_empty());

        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stop_fails_request_left_without_reply() {
        let (dir, broker) = running_broker("orphan");
        let (got_tx, got_rx) = std::sync::mpsc::channel::<()>();
        let got_tx = Mutex::new(got_tx);
        let mac = Arc::new(Mac::new(
            "d6",
            Backend::in_process(move |deveui, address| {
                let mut socket = simac_socket::ReqSocket::connect(
                    address,
                    simac_socket::Role::Worker,
                    Some(deveui),
                )
                .expect("worker connect");
                socket.send(&[BACKEND_READY]).expect("ready");
                socket.recv().expect("request");
                let _ = lock(&got_tx).send(());
                // Hang up without answering.
            }),
            broker.handle(),
            &config(Duration::from_secs(2)),
        ));

        mac.start().expect("start");
        wait_ready(&mac);
        let requester = {
            let mac = Arc::clone(&mac);
            thread::spawn(move || mac.request("x"))
        };
        got_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("request should reach the backend");

        let started = Instant::now();
        mac.stop();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop took {:?}",
            started.elapsed()
        );
        assert!(requester.join().expect("requester thread").is_err());
        assert!(!lock(&mac.client).is_connected());
        assert!(broker.registry().is_empty());

        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stuck_thread_is_detached() {
        let (dir, broker) = running_broker("detach");
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let mac = Mac::new(
            "d5",
            Backend::in_process(move |_, _| {
                let _ = lock(&release_rx).recv();
            }),
            broker.handle(),
            &config(Duration::from_millis(50)),
        );

        mac.start().expect("start");
        mac.stop();
        assert!(broker.registry().is_empty());
        let _ = release_tx.send(());

        drop(broker);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
