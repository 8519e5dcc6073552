//! JSON fleet manifest read by `simac broker --fleet`.
//!
//! ```json
//! {
//!   "devices": [
//!     { "deveui": "0000000000000001", "backend": "echo" },
//!     { "deveui": "0000000000000002", "backend": "worker" },
//!     { "deveui": "0000000000000003", "backend": "process",
//!       "program": "/usr/local/bin/mac-sim", "args": ["--verbose"] },
//!     { "deveui": "0000000000000004", "backend": "lora-mac" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::exit::{io_error, CliError, CliResult, DATA_INVALID};

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Fleet {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub deveui: String,
    #[serde(flatten)]
    pub backend: BackendEntry,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendEntry {
    /// Echo worker on a thread inside the broker process.
    Echo,
    /// `simac worker` spawned as a child process.
    Worker,
    /// Any executable honouring `--deveui` and `MAC_RPC_BACKEND_ADDRESS`.
    Process {
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// The LoRaMac-node executable.
    LoraMac,
}

impl Fleet {
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        Self::parse(&text)
            .map_err(|err| CliError::new(err.code, format!("{}: {}", path.display(), err.message)))
    }

    pub fn parse(text: &str) -> CliResult<Self> {
        let fleet: Self = serde_json::from_str(text)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid fleet manifest: {err}")))?;
        fleet.validate()?;
        Ok(fleet)
    }

    fn validate(&self) -> CliResult<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.deveui.trim().is_empty() {
                return Err(CliError::new(DATA_INVALID, "device with empty deveui"));
            }
            if !seen.insert(device.deveui.as_str()) {
                return Err(CliError::new(
                    DATA_INVALID,
                    format!("duplicate deveui {}", device.deveui),
                ));
            }
        }
        Ok(())
    }
}
