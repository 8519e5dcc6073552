use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use simac_transport::Endpoint;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerHandle};
use crate::config::{BrokerConfig, MacConfig};
use crate::error::{MacError, Result};
use crate::mac::{Backend, Mac};

const READY_POLL: Duration = Duration::from_millis(10);

static GLOBAL: OnceLock<MacDirectory> = OnceLock::new();
static GLOBAL_INIT: Mutex<()> = Mutex::new(());

/// Running broker plus every device handle started through it.
///
/// Handles stay in the directory after they are stopped so callers can still
/// inspect them. Starting an identifier again replaces the stopped handle.
pub struct MacDirectory {
    broker: Mutex<Broker>,
    handle: BrokerHandle,
    macs: Mutex<HashMap<String, Arc<Mac>>>,
    config: MacConfig,
}

impl MacDirectory {
    /// Bind and run a broker, returning an empty directory in front of it.
    pub fn start(broker_config: BrokerConfig, config: MacConfig) -> Result<Self> {
        let mut broker = Broker::bind(broker_config)?;
        broker.run()?;
        let handle = broker.handle();
        Ok(Self {
            broker: Mutex::new(broker),
            handle,
            macs: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Process-wide directory on the default endpoints.
    pub fn global() -> Result<&'static Self> {
        Self::global_with(BrokerConfig::default(), MacConfig::default())
    }

    /// Process-wide directory, created on first call.
    ///
    /// Only the first successful call's configuration is used. A failed
    /// initialization leaves the slot empty so a later call may retry.
    pub fn global_with(broker_config: BrokerConfig, config: MacConfig) -> Result<&'static Self> {
        if let Some(directory) = GLOBAL.get() {
            return Ok(directory);
        }
        let _init = GLOBAL_INIT.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(directory) = GLOBAL.get() {
            return Ok(directory);
        }
        let directory = Self::start(broker_config, config)?;
        Ok(GLOBAL.get_or_init(|| directory))
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.handle
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    fn macs(&self) -> MutexGuard<'_, HashMap<String, Arc<Mac>>> {
        self.macs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create and start a handle for `deveui`.
    ///
    /// Launch failures still record the handle, which stays not ready. A
    /// registration conflict leaves the directory untouched.
    pub fn start_mac(&self, deveui: &str, backend: Backend) -> Result<Arc<Mac>> {
        let mac = Arc::new(Mac::new(deveui, backend, self.handle.clone(), &self.config));
        match mac.start() {
            Ok(()) => {
                info!(deveui, kind = mac.kind(), "mac started");
                self.macs().insert(deveui.to_string(), Arc::clone(&mac));
                Ok(mac)
            }
            Err(err @ MacError::AlreadyRegistered(_)) => Err(err),
            Err(err) => {
                warn!(deveui, error = %err, "mac failed to start");
                self.macs().insert(deveui.to_string(), mac);
                Err(err)
            }
        }
    }

    /// Start a device whose backend is `func` on its own thread.
    pub fn start_inproc<F>(&self, deveui: &str, func: F) -> Result<Arc<Mac>>
    where
        F: Fn(&str, &Endpoint) + Send + Sync + 'static,
    {
        self.start_mac(deveui, Backend::in_process(func))
    }

    /// Start a device backed by `program`, run with `args` then `--deveui`.
    pub fn start_process<I, S>(&self, deveui: &str, program: impl Into<PathBuf>, args: I) -> Result<Arc<Mac>>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.start_mac(deveui, Backend::process_with_args(program, args))
    }

    /// Start a device backed by the configured LoRaMac-node executable.
    pub fn start_lora_mac(&self, deveui: &str) -> Result<Arc<Mac>> {
        self.start_mac(deveui, Backend::process(self.config.lora_mac_executable.clone()))
    }

    pub fn get(&self, deveui: &str) -> Option<Arc<Mac>> {
        self.macs().get(deveui).cloned()
    }

    /// Known identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.macs().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.macs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.macs().is_empty()
    }

    /// Poll until every handle is ready or `timeout` passes. Returns the
    /// identifiers still not ready, sorted.
    pub fn wait_ready(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.pending();
            if pending.is_empty() || Instant::now() >= deadline {
                return pending;
            }
            thread::sleep(READY_POLL);
        }
    }

    fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = self
            .macs()
            .values()
            .filter(|mac| !mac.is_ready())
            .map(|mac| mac.deveui().to_string())
            .collect();
        pending.sort();
        pending
    }

    /// Stop the handle for `deveui`, keeping it in the directory.
    pub fn stop(&self, deveui: &str) -> bool {
        match self.get(deveui) {
            Some(mac) => {
                mac.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every handle, in parallel.
    pub fn stop_all(&self) {
        let macs: Vec<Arc<Mac>> = self.macs().values().cloned().collect();
        thread::scope(|scope| {
            for mac in &macs {
                scope.spawn(move || mac.stop());
            }
        });
    }

    /// Stop every handle, then the broker.
    pub fn shutdown(&self) {
        self.stop_all();
        self.broker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
    }
}

impl std::fmt::Debug for MacDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacDirectory")
            .field("broker", &self.handle)
            .field("macs", &self.ids())
            .finish_non_exhaustive()
    }
}

impl Drop for MacDirectory {
    fn drop(&mut self) {
        self.shutdown();
    }
}
