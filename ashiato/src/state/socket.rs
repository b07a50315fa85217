use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use super::{
    flow::{Direction, Flow, InetType, Protocol},
    process::Process,
};

/// A kernel socket, identified by the address of its kernel structure.
/// That address gets reused once the socket is freed so it must not be
/// taken as a stable identity.
#[derive(Debug, Default)]
pub struct Socket {
    ptr: u64,
    inet: InetType,
    proto: Protocol,
    dir: Direction,
    bound: bool,
    local: Option<SocketAddr>,
    pid: Option<u32>,
    process: Option<Arc<Process>>,
    flows: HashMap<SocketAddr, Flow>,
    // flow whose remote address is not known yet
    pending: Option<Flow>,
    closing: bool,
}

impl Socket {
    pub fn new(ptr: u64) -> Self {
        Self {
            ptr,
            ..Default::default()
        }
    }

    #[inline(always)]
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    #[inline(always)]
    pub fn dir(&self) -> Direction {
        self.dir
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
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    #[inline(always)]
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    #[inline(always)]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    #[inline(always)]
    pub(crate) fn set_closing(&mut self) {
        self.closing = true;
    }

    #[inline(always)]
    pub(crate) fn set_process(&mut self, pid: u32, process: Option<Arc<Process>>) {
        self.pid = Some(pid);
        self.process = process;
    }

    #[inline(always)]
    pub fn flows_len(&self) -> usize {
        self.flows.len()
    }

    #[inline(always)]
    pub(crate) fn insert_flow(&mut self, remote: SocketAddr, flow: Flow) {
        self.flows.insert(remote, flow);
    }

    #[inline(always)]
    pub(crate) fn remove_flow(&mut self, remote: &SocketAddr) -> Option<Flow> {
        self.flows.remove(remote)
    }

    /// Removes the only flow of the socket if it goes between the same
    /// endpoints as `flow`.
    pub(crate) fn take_matching_flow(&mut self, flow: &Flow) -> Option<Flow> {
        if self.flows.len() != 1 {
            return None;
        }

        let remote = flow.remote().addr()?;
        let matches = self
            .flows
            .get(&remote)
            .map(|f| f.local().addr() == flow.local().addr())
            .unwrap_or_default();

        if matches {
            return self.flows.remove(&remote);
        }
        None
    }

    /// Merges `flow` into the flow waiting for its remote address
    pub(crate) fn merge_pending(&mut self, flow: Flow) {
        match self.pending.as_mut() {
            Some(p) => p.update_with(&flow),
            None => self.pending = Some(flow),
        }
    }

    #[inline(always)]
    pub(crate) fn take_pending(&mut self) -> Option<Flow> {
        self.pending.take()
    }

    /// Drains every flow of the socket, including the pending one
    pub(crate) fn drain_flows(&mut self) -> Vec<Flow> {
        let mut out: Vec<Flow> = self.flows.drain().map(|(_, f)| f).collect();
        if let Some(p) = self.pending.take() {
            out.push(p);
        }
        out
    }

    /// Shares what the socket and one of its flows know about each other.
    /// Attributes are only ever filled in, the first side knowing about one
    /// of them gives it to the other. The local address of a socket which is
    /// not bound yet comes from its flows.
    pub(crate) fn enrich(&mut self, flow: &mut Flow) {
        if !self.dir.is_known() {
            self.dir = flow.dir();
        } else if !flow.dir().is_known() {
            flow.set_dir(self.dir);
        }

        if !self.inet.is_known() {
            self.inet = flow.inet();
        } else if !flow.inet().is_known() {
            flow.set_inet(self.inet);
        }

        if !self.proto.is_known() {
            self.proto = flow.proto();
        } else if !flow.proto().is_known() {
            flow.set_proto(self.proto);
        }

        match (self.process.is_some(), flow.process().is_some()) {
            (false, true) => {
                self.pid = flow.pid();
                self.process = flow.process().cloned();
            }
            (true, false) => {
                if let Some(pid) = self.pid {
                    flow.set_process(pid, self.process.clone());
                }
            }
            _ => {
                if self.pid.is_none() {
                    self.pid = flow.pid();
                } else if flow.pid().is_none() {
                    if let Some(pid) = self.pid {
                        flow.set_process(pid, None);
                    }
                }
            }
        }

        if !self.bound {
            if let Some(local) = flow.local().addr() {
                self.local = Some(local);
                self.bound = true;
            }
        } else if let Some(local) = self.local {
            flow.local_mut().set_addr_if_unknown(local);
        }
    }
}
