//! Data structures describing observed outbound traffic.
//!
//! Capture collaborators produce [`Intent`] values, one per observed
//! connection or DNS resolution.  The holder collapses them into
//! [`TimestampedIntent`] envelopes keyed by [`ExternalTrafficKey`], so
//! that repeated observations of the same client talking to the same
//! destination are reported once per upload cycle.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Identity of an in-cluster workload that originated traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub namespace: String,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

/// Where the traffic went.  Exactly one of a DNS name or an IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    DnsName(String),
    Ip(IpAddr),
}

/// Map key for one logical (client, destination) stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalTrafficKey {
    pub client_name: String,
    pub client_namespace: String,
    pub destination: Destination,
}

impl ExternalTrafficKey {
    fn for_client(client: &ServiceIdentity, destination: Destination) -> Self {
        Self {
            client_name: client.name.clone(),
            client_namespace: client.namespace.clone(),
            destination,
        }
    }
}

/// Capabilities shared by every observation shape.
pub trait TrafficIntent {
    fn client(&self) -> &ServiceIdentity;
    fn key(&self) -> ExternalTrafficKey;
    fn last_seen(&self) -> SystemTime;
}

/// A DNS resolution performed by a client, with the addresses it got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsIntent {
    pub client: ServiceIdentity,
    pub last_seen: SystemTime,
    pub dns_name: String,
    pub ips: BTreeSet<IpAddr>,
    /// Record expiry as reported by the resolver.  Carried, never evaluated.
    pub ttl: Option<SystemTime>,
}

impl TrafficIntent for DnsIntent {
    fn client(&self) -> &ServiceIdentity {
        &self.client
    }

    fn key(&self) -> ExternalTrafficKey {
        ExternalTrafficKey::for_client(&self.client, Destination::DnsName(self.dns_name.clone()))
    }

    fn last_seen(&self) -> SystemTime {
        self.last_seen
    }
}

/// A connection from a client to a bare IP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpIntent {
    pub client: ServiceIdentity,
    pub last_seen: SystemTime,
    pub ip: IpAddr,
}

impl TrafficIntent for IpIntent {
    fn client(&self) -> &ServiceIdentity {
        &self.client
    }

    fn key(&self) -> ExternalTrafficKey {
        ExternalTrafficKey::for_client(&self.client, Destination::Ip(self.ip))
    }

    fn last_seen(&self) -> SystemTime {
        self.last_seen
    }
}

/// Every observation shape the holder knows how to merge.
///
/// Adding a variant here forces the merge logic in
/// [`IntentsHolder::add_intent`](crate::holder::IntentsHolder::add_intent)
/// to be extended before the crate compiles again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Dns(DnsIntent),
    Ip(IpIntent),
}

impl Intent {
    pub fn as_dns(&self) -> Option<&DnsIntent> {
        match self {
            Intent::Dns(dns) => Some(dns),
            Intent::Ip(_) => None,
        }
    }

    pub fn as_ip(&self) -> Option<&IpIntent> {
        match self {
            Intent::Ip(ip) => Some(ip),
            Intent::Dns(_) => None,
        }
    }
}

impl TrafficIntent for Intent {
    fn client(&self) -> &ServiceIdentity {
        match self {
            Intent::Dns(dns) => dns.client(),
            Intent::Ip(ip) => ip.client(),
        }
    }

    fn key(&self) -> ExternalTrafficKey {
        match self {
            Intent::Dns(dns) => dns.key(),
            Intent::Ip(ip) => ip.key(),
        }
    }

    fn last_seen(&self) -> SystemTime {
        match self {
            Intent::Dns(dns) => dns.last_seen(),
            Intent::Ip(ip) => ip.last_seen(),
        }
    }
}

impl From<DnsIntent> for Intent {
    fn from(intent: DnsIntent) -> Self {
        Intent::Dns(intent)
    }
}

impl From<IpIntent> for Intent {
    fn from(intent: IpIntent) -> Self {
        Intent::Ip(intent)
    }
}

/// Live connection counters attached to a delivered intent by an
/// enrichment stage.  The holder only carries this value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionsCount {
    pub current_counter: i64,
    pub added_connections: i64,
    pub removed_connections: i64,
}

/// A stored intent plus the freshest time any merged observation was seen.
///
/// `timestamp` moves forward on merge while the wrapped intent keeps the
/// `last_seen` of the observation that created the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedIntent {
    pub timestamp: SystemTime,
    pub intent: Intent,
    pub connections_count: Option<ConnectionsCount>,
}

impl TimestampedIntent {
    pub fn new(intent: Intent) -> Self {
        Self {
            timestamp: intent.last_seen(),
            intent,
            connections_count: None,
        }
    }

    /// Advances the timestamp if `seen` is later than it.
    pub(crate) fn observe(&mut self, seen: SystemTime) {
        if seen > self.timestamp {
            self.timestamp = seen;
        }
    }
}
