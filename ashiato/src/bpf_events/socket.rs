use std::net::SocketAddr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::state::{
    flow::{Direction, Endpoint, Flow, InetType, Protocol},
    State,
};

use super::{Event, Meta, SyscallResult};

/// A socket of an IP family being created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketCreate {
    pub meta: Meta,
    pub sock: u64,
    pub family: u16,
    pub protocol: u16,
}

impl SocketCreate {
    pub(crate) fn update(self, state: &State) {
        let inet = InetType::from_family(self.family);
        if !inet.is_known() {
            debug!("ignoring socket of family {}", self.family);
            return;
        }

        state.create_socket(
            Flow::new(self.sock, self.meta.timestamp)
                .with_inet(inet)
                .with_proto(Protocol::from_number(self.protocol))
                .with_pid(self.meta.pid),
        );
    }
}

/// A socket released by its process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketRelease {
    pub meta: Meta,
    pub sock: u64,
}

impl SocketRelease {
    pub(crate) fn update(self, state: &State) {
        state.on_sock_destroyed(self.sock, self.meta.pid, self.meta.timestamp);
    }
}

/// connect entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectCall {
    pub meta: Meta,
    pub sock: u64,
    pub remote: SocketAddr,
}

impl SyscallResult {
    /// A non blocking connect returning EINPROGRESS still creates the flow
    /// but does not prove the connection got established.
    #[inline(always)]
    fn connect_succeeded(&self) -> bool {
        self.retval == 0 || self.retval == -i64::from(libc::EINPROGRESS)
    }

    pub(crate) fn update_connect(self, state: &State) {
        let call = match state.thread_leave(self.meta.tid) {
            Some(Event::ConnectCall(call)) => call,
            Some(other) => {
                debug!("connect result does not match pending call: {other}");
                return;
            }
            None => {
                debug!("connect result without call tid={}", self.meta.tid);
                return;
            }
        };

        if !self.connect_succeeded() {
            return;
        }

        state.update_flow(
            Flow::new(call.sock, self.meta.timestamp)
                .with_pid(self.meta.pid)
                .with_dir(Direction::Outbound)
                .with_remote(Endpoint::new(Some(call.remote)))
                .with_complete(self.retval == 0),
        );
    }
}

/// Return of a TCP accept, `sock` is the newly created socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptResult {
    pub meta: Meta,
    pub sock: u64,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl AcceptResult {
    pub(crate) fn update(self, state: &State) {
        state.create_socket(
            Flow::new(self.sock, self.meta.timestamp)
                .with_proto(Protocol::Tcp)
                .with_dir(Direction::Inbound)
                .with_pid(self.meta.pid)
                .with_local(Endpoint::new(Some(self.local)))
                .with_remote(Endpoint::new(Some(self.remote)))
                .with_complete(true),
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{clock::ManualClock, config::Config};

    fn state() -> State {
        State::with_clock(&Config::default(), Arc::new(ManualClock::new(Utc::now())))
    }

    fn meta(ts: u64) -> Meta {
        Meta {
            timestamp: ts,
            pid: 42,
            tid: 42,
        }
    }

    fn connect(s: &State, sock: u64, retval: i64) {
        Event::ConnectCall(ConnectCall {
            meta: meta(1),
            sock,
            remote: "10.0.0.2:80".parse().unwrap(),
        })
        .update(s)
        .unwrap();
        Event::ConnectResult(SyscallResult {
            meta: meta(2),
            retval,
        })
        .update(s)
        .unwrap();
    }

    #[test]
    fn test_connect_results() {
        let s = state();
        connect(&s, 1, 0);
        connect(&s, 2, -i64::from(libc::EINPROGRESS));
        connect(&s, 3, -i64::from(libc::ECONNREFUSED));

        let st = s.stats();
        assert_eq!(st.pending_calls, 0);
        assert_eq!(st.flows, 2);
        assert_eq!(st.flow_lru, 2);
    }

    #[test]
    fn test_non_ip_socket() {
        let s = state();
        Event::SocketCreate(SocketCreate {
            meta: meta(1),
            sock: 1,
            family: libc::AF_UNIX as u16,
            protocol: 0,
        })
        .update(&s)
        .unwrap();
        assert_eq!(s.stats().sockets, 0);
    }
}
