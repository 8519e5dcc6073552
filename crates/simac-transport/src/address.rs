use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, TransportError};

const IPC_SCHEME: &str = "ipc://";

/// A parsed socket endpoint.
///
/// Accepts `ipc:///run/simac/mac.rpc` style URLs as well as bare filesystem
/// paths. Only the `ipc` scheme is supported; everything is a Unix domain socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    path: PathBuf,
}

impl Endpoint {
    /// Parse an endpoint address.
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        let path = match trimmed.strip_prefix(IPC_SCHEME) {
            Some(rest) => rest,
            None if trimmed.contains("://") => {
                return Err(TransportError::InvalidAddress {
                    address: address.to_string(),
                    reason: "only the ipc:// scheme is supported".to_string(),
                });
            }
            None => trimmed,
        };

        if path.is_empty() {
            return Err(TransportError::InvalidAddress {
                address: address.to_string(),
                reason: "missing socket path".to_string(),
            });
        }

        Ok(Self {
            path: PathBuf::from(path),
        })
    }

    /// Build an endpoint directly from a socket path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Filesystem path of the socket.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{IPC_SCHEME}{}", self.path.display())
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
