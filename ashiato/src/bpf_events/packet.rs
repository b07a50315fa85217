use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::state::{
    flow::{Direction, Endpoint, Flow, InetType, Protocol},
    not_udp, State,
};

use super::Meta;

/// IP packet leaving the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPacket {
    pub meta: Meta,
    pub sock: u64,
    pub size: u64,
    pub protocol: u16,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl IpPacket {
    pub(crate) fn update(self, state: &State) {
        let flow = Flow::new(self.sock, self.meta.timestamp)
            .with_proto(Protocol::from_number(self.protocol))
            .with_local(Endpoint::new(Some(self.local)).with_traffic(1, self.size))
            .with_remote(Endpoint::new(Some(self.remote)));

        // datagrams are already accounted by UDP probes
        state.update_flow_with_condition(flow, not_udp);
    }
}

/// Transport layer packet seen by TCP or UDP probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub meta: Meta,
    pub sock: u64,
    pub size: u64,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl Packet {
    #[inline(always)]
    fn udp_size(&self, state: &State) -> u64 {
        self.size
            .saturating_add(state.udp_overhead(InetType::from(&self.remote)))
    }

    /// Receive path runs in softirq context, the current task is not the
    /// owner of the socket.
    pub(crate) fn update_tcp_recv(self, state: &State) {
        state.update_flow(
            Flow::new(self.sock, self.meta.timestamp)
                .with_proto(Protocol::Tcp)
                .with_local(Endpoint::new(Some(self.local)))
                .with_remote(Endpoint::new(Some(self.remote)).with_traffic(1, self.size)),
        );
    }

    pub(crate) fn update_udp_send(self, state: &State) {
        let size = self.udp_size(state);
        state.update_flow(
            Flow::new(self.sock, self.meta.timestamp)
                .with_proto(Protocol::Udp)
                .with_dir(Direction::Outbound)
                .with_pid(self.meta.pid)
                .with_local(Endpoint::new(Some(self.local)).with_traffic(1, size))
                .with_remote(Endpoint::new(Some(self.remote))),
        );
    }

    pub(crate) fn update_udp_recv(self, state: &State) {
        let size = self.udp_size(state);
        state.update_flow(
            Flow::new(self.sock, self.meta.timestamp)
                .with_proto(Protocol::Udp)
                .with_dir(Direction::Inbound)
                .with_pid(self.meta.pid)
                .with_local(Endpoint::new(Some(self.local)))
                .with_remote(Endpoint::new(Some(self.remote)).with_traffic(1, size)),
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::{bpf_events::Event, clock::ManualClock, config::Config};

    fn packet(ts: u64, size: u64, remote: &str) -> Packet {
        Packet {
            meta: Meta {
                timestamp: ts,
                pid: 42,
                tid: 42,
            },
            sock: 0xbeef,
            size,
            local: "[fd00::1]:5353".parse().unwrap(),
            remote: remote.parse().unwrap(),
        }
    }

    #[test]
    fn test_udp_accounting() {
        let s = State::with_clock(&Config::default(), Arc::new(ManualClock::new(Utc::now())));
        let server = "[fd00::53]:5353";

        Event::UdpRecv(packet(1, 100, server)).update(&s).unwrap();
        Event::UdpSend(packet(2, 10, server)).update(&s).unwrap();
        Event::IpLocalOut(IpPacket {
            meta: Meta::default(),
            sock: 0xbeef,
            size: 58,
            protocol: libc::IPPROTO_UDP as u16,
            local: "[fd00::1]:5353".parse().unwrap(),
            remote: server.parse().unwrap(),
        })
        .update(&s)
        .unwrap();
        s.terminate_all();

        let done = s.done_flows();
        assert_eq!(done.len(), 1);
        let f = &done[0];
        assert_eq!(f.dir(), Direction::Inbound);
        assert_eq!(f.inet(), InetType::V6);
        assert_eq!(f.remote().bytes(), 148);
        assert_eq!(f.local().bytes(), 58);
        assert_eq!(f.local().packets(), 1);
    }
}
