use std::{net::SocketAddr, sync::Arc};

use ashiato_macros::StrEnum;
use chrono::{DateTime, Utc};

use super::process::Process;

#[derive(StrEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[str_enum(serde)]
pub enum Direction {
    #[default]
    #[str("unknown")]
    Unknown,
    #[str("ingress")]
    Inbound,
    #[str("egress")]
    Outbound,
}

impl Direction {
    #[inline(always)]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(StrEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[str_enum(serde)]
pub enum InetType {
    #[default]
    #[str("unknown")]
    Unknown,
    #[str("ipv4")]
    V4,
    #[str("ipv6")]
    V6,
}

impl InetType {
    /// Maps a socket address family (`AF_INET`, `AF_INET6`)
    pub fn from_family(family: u16) -> Self {
        match i32::from(family) {
            libc::AF_INET => Self::V4,
            libc::AF_INET6 => Self::V6,
            _ => Self::Unknown,
        }
    }

    #[inline(always)]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl From<&SocketAddr> for InetType {
    fn from(value: &SocketAddr) -> Self {
        match value {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }
}

#[derive(StrEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[str_enum(serde)]
pub enum Protocol {
    #[default]
    #[str("unknown")]
    Unknown,
    #[str("tcp")]
    Tcp,
    #[str("udp")]
    Udp,
}

impl Protocol {
    /// Maps an IP protocol number
    pub fn from_number(proto: u16) -> Self {
        match i32::from(proto) {
            libc::IPPROTO_TCP => Self::Tcp,
            libc::IPPROTO_UDP => Self::Udp,
            _ => Self::Unknown,
        }
    }

    /// IP protocol number, 0 when unknown
    pub const fn number(&self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Unknown => 0,
        }
    }

    #[inline(always)]
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// One side of a flow. The address is set by the first event knowing it
/// and never changes afterwards, counters only grow.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Endpoint {
    addr: Option<SocketAddr>,
    packets: u64,
    bytes: u64,
}

impl Endpoint {
    /// Creates an endpoint, an unspecified address (0.0.0.0 or ::)
    /// means the address is not known yet.
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            addr: addr.filter(|a| !a.ip().is_unspecified()),
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn with_traffic(mut self, packets: u64, bytes: u64) -> Self {
        self.packets = packets;
        self.bytes = bytes;
        self
    }

    #[inline(always)]
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    #[inline(always)]
    pub fn packets(&self) -> u64 {
        self.packets
    }

    #[inline(always)]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    #[inline(always)]
    pub fn is_known(&self) -> bool {
        self.addr.is_some()
    }

    #[inline(always)]
    pub(crate) fn set_addr_if_unknown(&mut self, addr: SocketAddr) {
        if self.addr.is_none() && !addr.ip().is_unspecified() {
            self.addr = Some(addr);
        }
    }

    pub fn update_with(&mut self, other: &Endpoint) {
        if self.addr.is_none() {
            self.addr = other.addr;
        }
        self.packets = self.packets.saturating_add(other.packets);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }
}

/// Kernel timestamp along with its wall clock conversion
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub kernel: u64,
    pub wall: DateTime<Utc>,
}

impl Timestamp {
    /// Timestamp not converted to wall clock yet
    #[inline(always)]
    pub fn kernel(ns: u64) -> Self {
        Self {
            kernel: ns,
            wall: DateTime::<Utc>::default(),
        }
    }
}

/// Key of a flow tracked for expiration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FlowKey {
    pub sock: u64,
    pub remote: SocketAddr,
}

#[derive(Debug, Default, Clone)]
pub struct Flow {
    sock: u64,
    inet: InetType,
    proto: Protocol,
    dir: Direction,
    created: Timestamp,
    last_seen: Timestamp,
    pid: Option<u32>,
    process: Option<Arc<Process>>,
    local: Endpoint,
    remote: Endpoint,
    complete: bool,
    done: bool,
    dns_registered: bool,
}

impl Flow {
    pub fn new(sock: u64, kernel_ts: u64) -> Self {
        let ts = Timestamp::kernel(kernel_ts);
        Self {
            sock,
            created: ts,
            last_seen: ts,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn with_inet(mut self, inet: InetType) -> Self {
        self.inet = inet;
        self
    }

    #[inline(always)]
    pub fn with_proto(mut self, proto: Protocol) -> Self {
        self.proto = proto;
        self
    }

    #[inline(always)]
    pub fn with_dir(mut self, dir: Direction) -> Self {
        self.dir = dir;
        self
    }

    #[inline(always)]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_local(mut self, local: Endpoint) -> Self {
        self.local = local;
        self.infer_inet();
        self
    }

    pub fn with_remote(mut self, remote: Endpoint) -> Self {
        self.remote = remote;
        self.infer_inet();
        self
    }

    #[inline(always)]
    pub fn with_complete(mut self, complete: bool) -> Self {
        self.complete = complete;
        self
    }

    fn infer_inet(&mut self) {
        if !self.inet.is_known() {
            if let Some(a) = self.local.addr().or(self.remote.addr()) {
                self.inet = InetType::from(&a);
            }
        }
    }

    #[inline(always)]
    pub fn sock(&self) -> u64 {
        self.sock
    }

    #[inline(always)]
    pub fn inet(&self) -> InetType {
        self.inet
    }

    #[inline(always)]
    pub fn proto(&self) -> Protocol {
        self.proto
    }

    #[inline(always)]
    pub fn dir(&self) -> Direction {
        self.dir
    }

    #[inline(always)]
    pub fn created(&self) -> Timestamp {
        self.created
    }

    #[inline(always)]
    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }

    #[inline(always)]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[inline(always)]
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    #[inline(always)]
    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    #[inline(always)]
    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A flow is worth reporting once we know its family, its transport
    /// and both of its addresses.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.inet.is_known()
            && self.proto.is_known()
            && self.local.is_known()
            && self.remote.is_known()
    }

    #[inline(always)]
    pub(crate) fn key(&self) -> Option<FlowKey> {
        self.remote.addr().map(|remote| FlowKey {
            sock: self.sock,
            remote,
        })
    }

    #[inline(always)]
    pub(crate) fn set_wall_times(&mut self, created: DateTime<Utc>, last_seen: DateTime<Utc>) {
        self.created.wall = created;
        self.last_seen.wall = last_seen;
    }

    #[inline(always)]
    pub(crate) fn set_process(&mut self, pid: u32, process: Option<Arc<Process>>) {
        self.pid = Some(pid);
        self.process = process;
    }

    #[inline(always)]
    pub(crate) fn set_dir(&mut self, dir: Direction) {
        self.dir = dir;
    }

    #[inline(always)]
    pub(crate) fn set_inet(&mut self, inet: InetType) {
        self.inet = inet;
    }

    #[inline(always)]
    pub(crate) fn set_proto(&mut self, proto: Protocol) {
        self.proto = proto;
    }

    #[inline(always)]
    pub(crate) fn local_mut(&mut self) -> &mut Endpoint {
        &mut self.local
    }

    #[inline(always)]
    pub(crate) fn mark_done(&mut self) {
        self.done = true;
    }

    #[inline(always)]
    pub(crate) fn dns_registered(&self) -> bool {
        self.dns_registered
    }

    #[inline(always)]
    pub(crate) fn set_dns_registered(&mut self) {
        self.dns_registered = true;
    }

    /// Merges the information carried by `other` into this flow. Known
    /// attributes are never overwritten, endpoint counters are summed.
    pub fn update_with(&mut self, other: &Flow) {
        if !self.inet.is_known() {
            self.inet = other.inet;
        }
        if !self.proto.is_known() {
            self.proto = other.proto;
        }
        if !self.dir.is_known() {
            self.dir = other.dir;
        }

        if other.last_seen.kernel >= self.last_seen.kernel {
            self.last_seen = other.last_seen;
        }

        if self.process.is_none() && other.process.is_some() {
            self.pid = other.pid;
            self.process = other.process.clone();
        } else if self.pid.is_none() {
            self.pid = other.pid;
        }

        self.local.update_with(&other.local);
        self.remote.update_with(&other.remote);
        self.complete |= other.complete;
        self.infer_inet();
    }

    /// Takes over a flow belonging to a superseded socket (or one which
    /// did not know its remote address yet): its attributes and counters
    /// are merged and the earliest creation time is kept.
    pub(crate) fn absorb(&mut self, stale: Flow) {
        if stale.created.kernel < self.created.kernel {
            self.created = stale.created;
        }
        self.update_with(&stale);
        self.dns_registered |= stale.dns_registered;
    }

    /// Takes over the flow of a socket whose kernel pointer got reused for
    /// the same endpoints. What the stale flow knows about its direction
    /// and owner replaces what the new one knows, the rest is absorbed.
    pub(crate) fn supersede(&mut self, stale: Flow) {
        if stale.dir.is_known() {
            self.dir = stale.dir;
        }
        if stale.pid.is_some() {
            self.pid = stale.pid;
            self.process = stale.process.clone();
        }
        self.absorb(stale);
    }
}
