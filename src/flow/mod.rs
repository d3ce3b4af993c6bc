//! Transport flows

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::str::FromStr;
use std::sync::Arc;

use mio::{Registry, Token};
use thiserror::Error;

use crate::error::{FlowError, FlowResult};

pub mod memory;
pub mod tcp;

const DEFAULT_SEND_BUFFER_SIZE: usize = 16 * 1024;

/// Readiness of a flow, also used as the interest mask of a flow handler.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b0001);
    pub const WRITABLE: Readiness = Readiness(0b0010);
    pub const ERROR: Readiness = Readiness(0b0100);
    /// Only meaningful as interest: deliver `on_all_written` callbacks.
    pub const ALL_WRITTEN: Readiness = Readiness(0b1000);

    const ALL: u8 = 0b1111;

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits(bits: u8) -> Self {
        Readiness(bits & Self::ALL)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Readiness) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Readiness) {
        self.0 &= !other.0;
    }

    pub const fn without(self, other: Readiness) -> Readiness {
        Readiness(self.0 & !other.0)
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Self) -> Self::Output {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Readiness {
    type Output = Readiness;

    fn bitand(self, rhs: Self) -> Self::Output {
        Readiness(self.0 & rhs.0)
    }
}

impl Debug for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names = [
            (Readiness::READABLE, "READABLE"),
            (Readiness::WRITABLE, "WRITABLE"),
            (Readiness::ERROR, "ERROR"),
            (Readiness::ALL_WRITTEN, "ALL_WRITTEN"),
        ];

        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }

        set.finish()
    }
}

/// Transport selection properties of a flow.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct FlowProperties(u32);

impl FlowProperties {
    pub const EMPTY: FlowProperties = FlowProperties(0);
    pub const OPTIONAL_SECURITY: FlowProperties = FlowProperties(1 << 0);
    pub const REQUIRED_SECURITY: FlowProperties = FlowProperties(1 << 1);
    pub const MESSAGE: FlowProperties = FlowProperties(1 << 2);
    pub const IPV4_REQUIRED: FlowProperties = FlowProperties(1 << 3);
    pub const IPV4_BANNED: FlowProperties = FlowProperties(1 << 4);
    pub const IPV6_REQUIRED: FlowProperties = FlowProperties(1 << 5);
    pub const IPV6_BANNED: FlowProperties = FlowProperties(1 << 6);
    pub const SCTP_REQUIRED: FlowProperties = FlowProperties(1 << 7);
    pub const SCTP_BANNED: FlowProperties = FlowProperties(1 << 8);
    pub const TCP_REQUIRED: FlowProperties = FlowProperties(1 << 9);
    pub const TCP_BANNED: FlowProperties = FlowProperties(1 << 10);
    pub const UDP_REQUIRED: FlowProperties = FlowProperties(1 << 11);
    pub const UDP_BANNED: FlowProperties = FlowProperties(1 << 12);
    pub const UDPLITE_REQUIRED: FlowProperties = FlowProperties(1 << 13);
    pub const UDPLITE_BANNED: FlowProperties = FlowProperties(1 << 14);
    pub const CONGESTION_CONTROL_REQUIRED: FlowProperties = FlowProperties(1 << 15);
    pub const CONGESTION_CONTROL_BANNED: FlowProperties = FlowProperties(1 << 16);
    pub const RETRANSMISSIONS_REQUIRED: FlowProperties = FlowProperties(1 << 17);
    pub const RETRANSMISSIONS_BANNED: FlowProperties = FlowProperties(1 << 18);

    const NAMES: [(&'static str, FlowProperties); 19] = [
        ("OPTIONAL_SECURITY", Self::OPTIONAL_SECURITY),
        ("REQUIRED_SECURITY", Self::REQUIRED_SECURITY),
        ("MESSAGE", Self::MESSAGE),
        ("IPV4_REQUIRED", Self::IPV4_REQUIRED),
        ("IPV4_BANNED", Self::IPV4_BANNED),
        ("IPV6_REQUIRED", Self::IPV6_REQUIRED),
        ("IPV6_BANNED", Self::IPV6_BANNED),
        ("SCTP_REQUIRED", Self::SCTP_REQUIRED),
        ("SCTP_BANNED", Self::SCTP_BANNED),
        ("TCP_REQUIRED", Self::TCP_REQUIRED),
        ("TCP_BANNED", Self::TCP_BANNED),
        ("UDP_REQUIRED", Self::UDP_REQUIRED),
        ("UDP_BANNED", Self::UDP_BANNED),
        ("UDPLITE_REQUIRED", Self::UDPLITE_REQUIRED),
        ("UDPLITE_BANNED", Self::UDPLITE_BANNED),
        ("CONGESTION_CONTROL_REQUIRED", Self::CONGESTION_CONTROL_REQUIRED),
        ("CONGESTION_CONTROL_BANNED", Self::CONGESTION_CONTROL_BANNED),
        ("RETRANSMISSIONS_REQUIRED", Self::RETRANSMISSIONS_REQUIRED),
        ("RETRANSMISSIONS_BANNED", Self::RETRANSMISSIONS_BANNED),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: FlowProperties) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: FlowProperties) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: FlowProperties) {
        self.0 |= other.0;
    }
}

impl BitOr for FlowProperties {
    type Output = FlowProperties;

    fn bitor(self, rhs: Self) -> Self::Output {
        FlowProperties(self.0 | rhs.0)
    }
}

impl Debug for FlowProperties {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut set = f.debug_set();
        for (name, flag) in Self::NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }

        set.finish()
    }
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[error("unknown flow property: {0}")]
pub struct UnknownProperty(pub String);

impl FromStr for FlowProperties {
    type Err = UnknownProperty;

    /// Parse a `,` or `;` separated list of property names, e.g. `TCP_REQUIRED,IPV4_REQUIRED`.
    ///
    /// Names may carry a `PROPERTY_` or `NEAT_PROPERTY_` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut properties = FlowProperties::EMPTY;

        for name in s.split([',', ';']).map(str::trim).filter(|name| !name.is_empty()) {
            let bare = name.strip_prefix("NEAT_").unwrap_or(name);
            let bare = bare.strip_prefix("PROPERTY_").unwrap_or(bare);
            let (_, flag) = Self::NAMES
                .iter()
                .find(|(known, _)| *known == bare)
                .ok_or_else(|| UnknownProperty(name.to_string()))?;

            properties.insert(*flag);
        }

        Ok(properties)
    }
}

/// Per flow settings
#[derive(Debug, Clone)]
pub struct FlowConfig {
    send_buffer_size: usize,
    properties: FlowProperties,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            properties: FlowProperties::TCP_REQUIRED,
        }
    }
}

impl FlowConfig {
    /// Set how many bytes a flow buffers before writes would block, default is 16384
    pub fn send_buffer_size(&mut self, size: usize) -> &mut Self {
        self.send_buffer_size = size.max(1);
        self
    }

    /// Set transport properties
    pub fn properties(&mut self, properties: FlowProperties) -> &mut Self {
        self.properties = properties;
        self
    }

    pub fn get_send_buffer_size(&self) -> usize {
        self.send_buffer_size
    }

    pub fn get_properties(&self) -> FlowProperties {
        self.properties
    }
}

/// Wakes the flow context that owns a flow, from any thread.
pub type LoopWaker = Arc<mio::Waker>;

/// A non-blocking transport flow.
///
/// Flows live inside a [`FlowContext`](crate::context::FlowContext) and every method is called
/// with the flow's lock held, either from the context thread or from a bridge caller thread.
/// No method may block.
pub trait Flow: Send {
    /// Attach the flow to the context poller, called once on the context thread.
    fn register(&mut self, registry: &Registry, token: Token, waker: &LoopWaker)
        -> FlowResult<()>;

    /// Detach the flow from the context poller.
    fn deregister(&mut self, registry: &Registry) -> FlowResult<()>;

    /// Feed a poller event that belongs to this flow.
    fn handle_event(&mut self, _event: &mio::event::Event) {}

    /// Push buffered output towards the transport, called by the context every iteration.
    fn flush_pending(&mut self) -> FlowResult<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool;

    /// Current [`Readiness::READABLE`], [`Readiness::WRITABLE`] and [`Readiness::ERROR`] state.
    fn readiness(&self) -> Readiness;

    /// Take the asynchronous error the flow ran into, reported once.
    fn take_error(&mut self) -> Option<FlowError>;

    /// Returns true once after all written data has been handed off downstream.
    fn take_all_written(&mut self) -> bool;

    /// Read into `buf`, `Ok(0)` means the peer shut down its sending side.
    fn read(&mut self, buf: &mut [u8]) -> FlowResult<usize>;

    /// Write the whole `buf` or nothing.
    fn write(&mut self, buf: &[u8]) -> FlowResult<()>;

    /// Shut down the sending side once pending data is written.
    fn shutdown(&mut self) -> FlowResult<()>;

    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn properties(&self) -> FlowProperties;

    fn set_properties(&mut self, properties: FlowProperties) -> FlowResult<()>;
}
