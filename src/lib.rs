//! Gorexy - a reverse proxy gateway for local development
//!
//! One JSON file describes the services to launch and the path prefixes
//! that front them. The gateway:
//! - Allocates ports for `{PORT<n>}` placeholders, starting at base port + 2
//! - Launches every service with those ports substituted in its arguments
//!   and environment, retrying failed launches
//! - Restarts services whose executable is rebuilt when `auto_reload` is set
//! - Routes HTTP and WebSocket traffic to the first mapping whose prefix
//!   matches the request path
//! - Listens for HTTP on the base port and HTTPS on base port + 1

pub mod config;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod listener;
pub mod paths;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod router;
pub mod supervisor;
pub mod tls;
pub mod watcher;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
