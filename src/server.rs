//! Virtual servers, and the real servers providing them.

use crate::arena::Handle;
use crate::checker::Checker;
use crate::link::TrackingLink;
use crate::MAX_WEIGHT;

use std::net::SocketAddr;

pub type VsId = Handle<VirtualServer>;
pub type RsId = Handle<RealServer>;

/// Transport protocol of a virtual server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::Tcp),
            "UDP" => Some(Protocol::Udp),
            "SCTP" => Some(Protocol::Sctp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// Identifies a virtual server across configuration loads.
#[derive(Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ServiceKey {
    Address {
        address: SocketAddr,
        protocol: Protocol,
    },
    Fwmark(u32),
    Group(String),
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceKey::Address { address, protocol } => {
                write!(f, "[{}]:{}:{}", address.ip(), protocol.as_str(), address.port())
            }
            ServiceKey::Fwmark(mark) => write!(f, "FWM {mark}"),
            ServiceKey::Group(name) => write!(f, "group {name}"),
        }
    }
}

/// Identifies a real server within its virtual server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServerKey {
    pub address: SocketAddr,
}

impl ServerKey {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

impl std::fmt::Display for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]:{}", self.address.ip(), self.address.port())
    }
}

/// A load-balanced service.
#[derive(Debug)]
pub struct VirtualServer {
    pub key: ServiceKey,
    pub(crate) real_servers: Vec<RsId>,
}

impl VirtualServer {
    pub(crate) fn new(key: ServiceKey) -> Self {
        Self {
            key,
            real_servers: Vec::new(),
        }
    }

    pub fn real_servers(&self) -> &[RsId] {
        &self.real_servers
    }
}

/// A backend destination behind a [VirtualServer].
#[derive(Debug)]
pub struct RealServer {
    pub key: ServerKey,
    pub vs: VsId,

    /// The configured weight, before any tracked file contributes to it.
    pub weight: i64,

    // Sum of the contributions applied by every weighted tracking link.
    //
    // Must be kept in lockstep with "TrackingLink::applied" for every link
    // in "Self::links".
    pub(crate) track_weight: i64,

    pub(crate) checkers: Vec<Handle<Checker>>,
    pub(crate) links: Vec<Handle<TrackingLink>>,
}

impl RealServer {
    pub(crate) fn new(key: ServerKey, vs: VsId) -> Self {
        Self {
            key,
            vs,
            weight: 1,
            track_weight: 0,
            checkers: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn checkers(&self) -> &[Handle<Checker>] {
        &self.checkers
    }

    pub fn links(&self) -> &[Handle<TrackingLink>] {
        &self.links
    }

    /// The weight which should be handed to the load-balancing table.
    pub fn effective_weight(&self) -> i64 {
        self.weight
            .saturating_add(self.track_weight)
            .clamp(0, MAX_WEIGHT)
    }
}

/// The state of a real server, as exposed to the load-balancing table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ServerState {
    pub weight: i64,
    pub alive: bool,
}
