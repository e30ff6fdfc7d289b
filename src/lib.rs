//! # AlloyDB Connector
//!
//! Client-side connector that maintains a refresh-ahead cache of mTLS credentials for
//! AlloyDB-style managed database instances and dials them directly, bypassing any need
//! for a local proxy process.

pub mod cache;
pub mod config;
pub mod connection_info;
pub mod connector;
pub mod control_plane;
pub mod driver;
pub mod error;
pub mod instance_uri;
pub mod ip_type;
pub mod keys;
pub mod refresh_policy;
pub mod refresher;
pub mod telemetry;
pub mod tls;

pub use config::{ConnectorOptions, ConnectorOptionsBuilder};
pub use connector::Connector;
pub use error::ConnectorError;
pub use ip_type::IpType;
