//! MAC device broker over local sockets.
//!
//! simac routes command/reply traffic between request clients and per-device
//! backends through a broker that tracks which backends are ready.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket endpoints
//! - [`frame`]: length-prefixed multipart framing
//! - [`socket`]: identity-routed router and request sockets
//! - [`broker`]: the broker, service registry, device handles and directory

/// Re-export transport types.
pub mod transport {
    pub use simac_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use simac_frame::*;
}

/// Re-export socket types.
pub mod socket {
    pub use simac_socket::*;
}

/// Re-export broker types.
pub mod broker {
    pub use simac_broker::*;
}

pub use simac_broker::{
    Backend, Broker, BrokerConfig, Mac, MacConfig, MacDirectory, MacError, RequestClient, Worker,
};
