//! SnapTunnel - Host and path rewriting TLS tunnel
//!
//! Listens on local ports, optionally terminates TLS with certificates it
//! mints itself, and relays HTTP requests to remote services:
//! - Host header and path rewriting by byte-range splicing
//! - Static file overrides for exact paths
//! - Chunked and fixed-length request bodies, pipelined requests
//! - Root and domain certificate management
//! - Hosts file entries for the source domains

pub mod app;
pub mod buffer;
pub mod certificate;
pub mod config;
pub mod hosts;
pub mod http;
pub mod mime;
pub mod routing;
pub mod stream;
pub mod tunnel;

pub use app::Application;
pub use certificate::{CertificateManager, CertificateStore, FileCertificateStore};
pub use config::{Settings, TunnelConfig};
pub use routing::RoutingTable;
pub use tunnel::TunnelRelay;
