//! Replica set registry
//!
//! Static list of peer servers holding copies of one log, loaded when the
//! log is opened. This server never appears in its own replica set.

use crate::name::GclName;
use rand::seq::SliceRandom;
use std::collections::HashSet;

/// One replica server of a log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaServer {
    /// Server identity
    pub name: GclName,
    /// Printable form, cached for logging
    pub pname: String,
}

impl ReplicaServer {
    /// Create a replica entry
    pub fn new(name: GclName) -> Self {
        Self {
            pname: name.printable(),
            name,
        }
    }
}

/// Peers of one log, in configuration order, without duplicates or self
#[derive(Debug, Clone, Default)]
pub struct ReplicaSet {
    servers: Vec<ReplicaServer>,
}

impl ReplicaSet {
    /// Build the set from configured peers, dropping `local` and repeats
    pub fn load(peers: &[GclName], local: &GclName) -> Self {
        let mut seen = HashSet::new();
        let servers = peers
            .iter()
            .filter(|name| *name != local)
            .filter(|name| seen.insert(**name))
            .map(|name| ReplicaServer::new(*name))
            .collect::<Vec<_>>();

        if servers.len() < peers.len() {
            tracing::debug!(
                configured = peers.len(),
                kept = servers.len(),
                "replica set dropped self or duplicate entries"
            );
        }

        Self { servers }
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True if the log is not replicated
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Iterate peers in configuration order
    pub fn iter(&self) -> impl Iterator<Item = &ReplicaServer> {
        self.servers.iter()
    }

    /// Peer identities in configuration order
    pub fn names(&self) -> Vec<GclName> {
        self.servers.iter().map(|s| s.name).collect()
    }

    /// True if `name` is a peer
    pub fn contains(&self, name: &GclName) -> bool {
        self.servers.iter().any(|s| s.name == *name)
    }

    /// Add a peer; returns false if it was already present
    pub fn add(&mut self, name: GclName) -> bool {
        if self.contains(&name) {
            return false;
        }
        self.servers.push(ReplicaServer::new(name));
        true
    }

    /// Remove a peer; returns false if it was not present
    pub fn remove(&mut self, name: &GclName) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.name != *name);
        self.servers.len() != before
    }

    /// Pick one peer uniformly at random
    pub fn choose_random(&self) -> Option<&ReplicaServer> {
        self.servers.choose(&mut rand::thread_rng())
    }
}
