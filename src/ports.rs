//! Port placeholders and their allocation
//!
//! Service arguments, environments and mapping destinations may contain
//! `{PORT<n>}` tokens (`{PORT1}`, `{PORT2}`, ...) standing for ports that
//! are only chosen at startup. A bare `{PORT}` is accepted as one more
//! token of the same kind. Every distinct token gets its own port, handed
//! out in first-seen order starting two above the base port (the base and
//! base+1 belong to the HTTP and HTTPS listeners).

use crate::config::Service;
use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::info;

/// Offset from the base port of the first service port
pub const FIRST_SERVICE_PORT_OFFSET: u16 = 2;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{PORT[0-9]*\}").expect("valid placeholder regex"));

/// Placeholder token to allocated port. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    ports: HashMap<String, u16>,
}

impl PortTable {
    /// Allocate a port for every distinct placeholder found in the services'
    /// arguments and environments, in service order then left to right
    pub fn scan(base_port: u16, services: &[Service]) -> Result<Self> {
        let mut ports = HashMap::new();
        let mut next = u32::from(base_port) + u32::from(FIRST_SERVICE_PORT_OFFSET);

        for service in services {
            let source = service.placeholder_source();
            for token in PLACEHOLDER.find_iter(&source) {
                let token = token.as_str();
                if ports.contains_key(token) {
                    continue;
                }

                let port = u16::try_from(next).map_err(|_| {
                    GatewayError::config(format!(
                        "no port left for {} (base port {})",
                        token, base_port
                    ))
                })?;
                info!(placeholder = token, port, "Port allocated");
                ports.insert(token.to_string(), port);
                next += 1;
            }
        }

        Ok(Self { ports })
    }

    pub fn get(&self, placeholder: &str) -> Option<u16> {
        self.ports.get(placeholder).copied()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// All allocations ordered by port, which is also discovery order
    pub fn entries(&self) -> Vec<(&str, u16)> {
        let mut entries: Vec<(&str, u16)> = self
            .ports
            .iter()
            .map(|(token, port)| (token.as_str(), *port))
            .collect();
        entries.sort_by_key(|(_, port)| *port);
        entries
    }

    /// Replace every known placeholder in `input` with its port
    pub fn resolve(&self, input: &str) -> String {
        resolve(input, self)
    }
}

/// Single-pass substitution of known placeholders. Unknown placeholders
/// are left as they are.
pub fn resolve(input: &str, table: &PortTable) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| match table.get(&caps[0]) {
            Some(port) => port.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
