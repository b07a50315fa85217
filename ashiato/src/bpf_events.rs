//! Decoded kernel events and the way each of them updates the [State].
//!
//! Two phase syscalls come as a call event, stored per thread until the
//! matching result event shows up. Events may be dropped by the producer so
//! a result without call, or a call without result, is expected.

use std::fmt::Display;

use ashiato_macros::StrEnum;
use serde::{Deserialize, Serialize};

use crate::state::{self, State};

mod clock;
mod dns;
mod packet;
mod process;
mod socket;

pub use clock::*;
pub use dns::*;
pub use packet::*;
pub use process::*;
pub use socket::*;

#[derive(StrEnum, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Type {
    // process events
    #[str("execve_call")]
    ExecveCall,
    #[str("execve_result")]
    ExecveResult,
    #[str("commit_creds")]
    CommitCreds,
    #[str("fork_result")]
    ForkResult,
    #[str("process_exit")]
    ProcessExit,

    // socket events
    #[str("socket_create")]
    SocketCreate,
    #[str("socket_release")]
    SocketRelease,
    #[str("connect_call")]
    ConnectCall,
    #[str("connect_result")]
    ConnectResult,
    #[str("accept_result")]
    AcceptResult,

    // packet events
    #[str("ip_local_out")]
    IpLocalOut,
    #[str("tcp_recv")]
    TcpRecv,
    #[str("udp_send")]
    UdpSend,
    #[str("udp_recv")]
    UdpRecv,

    #[str("dns_transaction")]
    DnsTransaction,
    #[str("clock_sync")]
    ClockSync,
}

/// Information common to all events
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// kernel monotonic time in ns
    pub timestamp: u64,
    pub pid: u32,
    pub tid: u32,
}

/// Return value of a syscall whose arguments came with the call event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallResult {
    pub meta: Meta,
    pub retval: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ExecveCall(ExecveCall),
    ExecveResult(SyscallResult),
    CommitCreds(CommitCreds),
    ForkResult(ForkResult),
    ProcessExit(ProcessExit),
    SocketCreate(SocketCreate),
    SocketRelease(SocketRelease),
    ConnectCall(ConnectCall),
    ConnectResult(SyscallResult),
    AcceptResult(AcceptResult),
    IpLocalOut(IpPacket),
    TcpRecv(Packet),
    UdpSend(Packet),
    UdpRecv(Packet),
    DnsTransaction(DnsTransaction),
    ClockSync(ClockSync),
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.meta();
        write!(f, "{} pid={} tid={} ts={}", self.ty(), m.pid, m.tid, m.timestamp)
    }
}

impl Event {
    pub fn ty(&self) -> Type {
        match self {
            Self::ExecveCall(_) => Type::ExecveCall,
            Self::ExecveResult(_) => Type::ExecveResult,
            Self::CommitCreds(_) => Type::CommitCreds,
            Self::ForkResult(_) => Type::ForkResult,
            Self::ProcessExit(_) => Type::ProcessExit,
            Self::SocketCreate(_) => Type::SocketCreate,
            Self::SocketRelease(_) => Type::SocketRelease,
            Self::ConnectCall(_) => Type::ConnectCall,
            Self::ConnectResult(_) => Type::ConnectResult,
            Self::AcceptResult(_) => Type::AcceptResult,
            Self::IpLocalOut(_) => Type::IpLocalOut,
            Self::TcpRecv(_) => Type::TcpRecv,
            Self::UdpSend(_) => Type::UdpSend,
            Self::UdpRecv(_) => Type::UdpRecv,
            Self::DnsTransaction(_) => Type::DnsTransaction,
            Self::ClockSync(_) => Type::ClockSync,
        }
    }

    pub fn meta(&self) -> &Meta {
        match self {
            Self::ExecveCall(e) => &e.meta,
            Self::ExecveResult(e) | Self::ConnectResult(e) => &e.meta,
            Self::CommitCreds(e) => &e.meta,
            Self::ForkResult(e) => &e.meta,
            Self::ProcessExit(e) => &e.meta,
            Self::SocketCreate(e) => &e.meta,
            Self::SocketRelease(e) => &e.meta,
            Self::ConnectCall(e) => &e.meta,
            Self::AcceptResult(e) => &e.meta,
            Self::IpLocalOut(e) => &e.meta,
            Self::TcpRecv(e) | Self::UdpSend(e) | Self::UdpRecv(e) => &e.meta,
            Self::DnsTransaction(e) => &e.meta,
            Self::ClockSync(e) => &e.meta,
        }
    }

    /// Applies the event to the state. Errors are protocol violations of
    /// the producer, the state remains consistent when one is returned.
    pub fn update(self, state: &State) -> Result<(), state::Error> {
        match self {
            Self::ExecveCall(_) | Self::ConnectCall(_) => state.thread_enter(self.meta().tid, self),
            Self::ExecveResult(e) => e.update_execve(state),
            Self::CommitCreds(e) => {
                e.update(state);
                Ok(())
            }
            Self::ForkResult(e) => e.update(state),
            Self::ProcessExit(e) => e.update(state),
            Self::SocketCreate(e) => {
                e.update(state);
                Ok(())
            }
            Self::SocketRelease(e) => {
                e.update(state);
                Ok(())
            }
            Self::ConnectResult(e) => {
                e.update_connect(state);
                Ok(())
            }
            Self::AcceptResult(e) => {
                e.update(state);
                Ok(())
            }
            Self::IpLocalOut(e) => {
                e.update(state);
                Ok(())
            }
            Self::TcpRecv(e) => {
                e.update_tcp_recv(state);
                Ok(())
            }
            Self::UdpSend(e) => {
                e.update_udp_send(state);
                Ok(())
            }
            Self::UdpRecv(e) => {
                e.update_udp_recv(state);
                Ok(())
            }
            Self::DnsTransaction(e) => {
                e.update(state);
                Ok(())
            }
            Self::ClockSync(e) => {
                e.update(state);
                Ok(())
            }
        }
    }
}
