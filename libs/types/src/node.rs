// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Errno, Error, NodeId, NodeState, Result};

/// An `(ip, port)` endpoint.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// A cluster participant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub mgmt_addr: Address,
    pub storage_addr: Address,
    pub state: NodeState,
}

impl Node {
    /// Builds a node whose management and storage endpoints coincide.
    pub fn from_single_endpoint(id: NodeId, hostname: impl Into<String>, addr: Address) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            mgmt_addr: addr.clone(),
            storage_addr: addr,
            state: NodeState::Unknown,
        }
    }
}

/// Parses the configured seed-node list: comma-separated `<uuid>@<ip>:<port>`.
///
/// Malformed entries are skipped with a warning rather than failing the whole
/// list; an entirely empty result from a non-empty input is an error.
pub fn parse_seed_nodes(list: &str) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((uuid_part, addr_part)) = entry.split_once('@') else {
            warn!("seed node entry '{entry}' is missing '@', skipping");
            continue;
        };
        let Some((ip_part, port_part)) = addr_part.rsplit_once(':') else {
            warn!("seed node entry '{entry}' is missing a port, skipping");
            continue;
        };
        let Ok(id) = uuid_part.parse::<NodeId>() else {
            warn!("seed node entry '{entry}' has a malformed uuid, skipping");
            continue;
        };
        let Ok(port) = port_part.parse::<u16>() else {
            warn!("seed node entry '{entry}' has a malformed port, skipping");
            continue;
        };
        if port == 0 {
            warn!("seed node entry '{entry}' has port 0, skipping");
            continue;
        }
        nodes.push(Node::from_single_endpoint(
            id,
            ip_part,
            Address::new(ip_part, port),
        ));
    }
    if nodes.is_empty() && !list.trim().is_empty() {
        return Err(Error::with_msg(
            Errno::InvalidArgs,
            "no valid seed node entries",
        ));
    }
    Ok(nodes)
}
