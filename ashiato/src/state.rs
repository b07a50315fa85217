//! Process, socket and flow bookkeeping.
//!
//! [State] is fed serially with kernel events and turns them into flows. All
//! mutations and the periodic expiration happen under a single lock which is
//! never held across I/O. Terminated flows accumulate in a done queue that a
//! reporter drains with [State::done_flows].

use std::{
    collections::{hash_map::Entry, HashMap},
    fmt::Display,
    mem,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::{
    bpf_events::Event,
    clock::{Clock, KernelClock, SystemClock},
    config::Config,
};

pub mod dns;
pub mod flow;
pub mod lru;
pub mod process;
pub mod socket;

use dns::{Correlator, HostResolver, Transaction};
use flow::{Flow, FlowKey, InetType, Protocol};
use lru::LruList;
use process::{Credentials, Process, KERNEL_PID};
use socket::Socket;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("cannot {op} kernel process")]
    KernelPid { op: &'static str },
    #[error("process pid={0} already exists")]
    ProcessExists(u32),
    #[error("tid={tid} entered {current} while {previous} was pending")]
    PendingCall {
        tid: u32,
        current: String,
        previous: String,
    },
}

/// Snapshot of the state sizes and counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub processes: usize,
    pub sockets: usize,
    pub flows: usize,
    pub pending_calls: usize,
    pub flow_lru: usize,
    pub socket_lru: usize,
    pub closing_lru: usize,
    pub done: usize,
    pub dns_transactions: usize,
    pub dns_endpoints: usize,
    pub flows_created: u64,
    pub flows_terminated: u64,
    pub flows_discarded: u64,
    pub sockets_superseded: u64,
}

impl Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processes={} sockets={} flows={} pending_calls={} lru(flow={} socket={} closing={}) done={} dns(transactions={} endpoints={}) flows_created={} flows_terminated={} flows_discarded={} sockets_superseded={}",
            self.processes,
            self.sockets,
            self.flows,
            self.pending_calls,
            self.flow_lru,
            self.socket_lru,
            self.closing_lru,
            self.done,
            self.dns_transactions,
            self.dns_endpoints,
            self.flows_created,
            self.flows_terminated,
            self.flows_discarded,
            self.sockets_superseded,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    flow_inactive: Duration,
    socket_inactive: Duration,
    closing: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    flows_created: u64,
    flows_terminated: u64,
    flows_discarded: u64,
    sockets_superseded: u64,
}

#[inline]
fn attach_process(processes: &HashMap<u32, Arc<Process>>, flow: &mut Flow) {
    if flow.process().is_some() {
        return;
    }
    if let Some(pid) = flow.pid() {
        if let Some(p) = processes.get(&pid) {
            flow.set_process(pid, Some(p.clone()));
        }
    }
}

struct Inner {
    processes: HashMap<u32, Arc<Process>>,
    sockets: HashMap<u64, Socket>,
    threads: HashMap<u32, Event>,
    flow_lru: LruList<FlowKey>,
    socket_lru: LruList<u64>,
    closing_lru: LruList<u64>,
    done: Vec<Flow>,
    dns: Correlator,
    kclock: KernelClock,
    counters: Counters,
}

impl Inner {
    #[inline(always)]
    fn wall(&mut self, kernel_ns: u64, now: DateTime<Utc>) -> DateTime<Utc> {
        self.kclock.to_wall(kernel_ns, now)
    }

    fn stamp(&mut self, flow: &mut Flow, now: DateTime<Utc>) {
        let created = self.wall(flow.created().kernel, now);
        let last_seen = self.wall(flow.last_seen().kernel, now);
        flow.set_wall_times(created, last_seen);
    }

    fn create_flow(&mut self, mut flow: Flow, now: DateTime<Utc>) {
        let ptr = flow.sock();
        let last_seen = flow.last_seen().wall;

        attach_process(&self.processes, &mut flow);

        let sock = match self.sockets.entry(ptr) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                self.socket_lru.push(ptr, last_seen);
                e.insert(Socket::new(ptr))
            }
        };

        let Some(remote) = flow.remote().addr() else {
            sock.enrich(&mut flow);
            sock.merge_pending(flow);
            if !sock.is_closing() {
                self.socket_lru.push(ptr, last_seen);
            }
            return;
        };

        if let Some(pending) = sock.take_pending() {
            flow.absorb(pending);
        }

        sock.enrich(&mut flow);
        // the socket may know a pid we have a process for
        if flow.process().is_none() {
            attach_process(&self.processes, &mut flow);
            sock.enrich(&mut flow);
        }

        self.dns.register_flow(&mut flow, now);

        self.flow_lru.push(FlowKey { sock: ptr, remote }, last_seen);
        if !sock.is_closing() {
            self.socket_lru.push(ptr, last_seen);
        }

        sock.insert_flow(remote, flow);
        self.counters.flows_created += 1;
    }

    fn update_flow<F>(&mut self, flow: Flow, now: DateTime<Utc>, cond: F)
    where
        F: Fn(&Flow) -> bool,
    {
        let ptr = flow.sock();

        let Some(remote) = flow.remote().addr() else {
            return self.create_flow(flow, now);
        };

        let Some(sock) = self.sockets.get_mut(&ptr) else {
            return self.create_flow(flow, now);
        };

        let Some(mut existing) = sock.remove_flow(&remote) else {
            return self.create_flow(flow, now);
        };

        if !cond(&existing) {
            sock.insert_flow(remote, existing);
            return;
        }

        existing.update_with(&flow);
        attach_process(&self.processes, &mut existing);
        sock.enrich(&mut existing);
        self.dns.register_flow(&mut existing, now);

        let last_seen = existing.last_seen().wall;
        self.flow_lru.push(FlowKey { sock: ptr, remote }, last_seen);
        if !sock.is_closing() {
            self.socket_lru.push(ptr, last_seen);
        }

        sock.insert_flow(remote, existing);
    }

    fn finish_flow(&mut self, mut flow: Flow) {
        flow.mark_done();
        if flow.is_valid() {
            self.counters.flows_terminated += 1;
            self.done.push(flow);
        } else {
            // flows never seen with a remote address are not worth a log line
            if flow.remote().is_known() {
                debug!("discarding invalid flow sock={:#x} {flow:?}", flow.sock());
                self.counters.flows_discarded += 1;
            }
        }
    }

    fn finish_flows(&mut self, flows: Vec<Flow>) {
        for f in flows {
            if let Some(key) = f.key() {
                self.flow_lru.remove(&key);
            }
            self.finish_flow(f);
        }
    }

    /// Terminates a socket already removed from the registry
    fn terminate_socket(&mut self, mut sock: Socket) {
        self.socket_lru.remove(&sock.ptr());
        self.closing_lru.remove(&sock.ptr());
        let flows = sock.drain_flows();
        self.finish_flows(flows);
    }

    fn expire_older(&mut self, now: DateTime<Utc>, timeouts: &Timeouts) {
        let deadline = now - timeouts.flow_inactive;
        while let Some((key, _)) = self.flow_lru.pop_older(deadline) {
            let flow = self
                .sockets
                .get_mut(&key.sock)
                .and_then(|s| s.remove_flow(&key.remote));
            if let Some(f) = flow {
                self.finish_flow(f);
            }
        }

        let deadline = now - timeouts.socket_inactive;
        while let Some((ptr, _)) = self.socket_lru.pop_older(deadline) {
            let Some(sock) = self.sockets.get_mut(&ptr) else {
                continue;
            };
            sock.set_closing();
            let flows = sock.drain_flows();
            self.closing_lru.push(ptr, now);
            self.finish_flows(flows);
        }

        let deadline = now - timeouts.closing;
        while let Some((ptr, _)) = self.closing_lru.pop_older(deadline) {
            if let Some(sock) = self.sockets.remove(&ptr) {
                self.terminate_socket(sock);
            }
        }

        self.dns.cleanup(now);
    }
}

pub struct State {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    own_pid: u32,
    timeouts: Timeouts,
    udp_overhead_ipv4: u64,
    udp_overhead_ipv6: u64,
    resolver: Option<Arc<HostResolver>>,
}

impl State {
    /// Creates a state driven by the system clock
    pub fn new(config: &Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let mut processes = HashMap::new();
        processes.insert(KERNEL_PID, Arc::new(Process::kernel()));

        let resolver = match config.host_dns_cache_size {
            0 => None,
            n => Some(Arc::new(HostResolver::with_max_entries(n))),
        };

        Self {
            inner: Mutex::new(Inner {
                processes,
                sockets: HashMap::new(),
                threads: HashMap::new(),
                flow_lru: LruList::new(),
                socket_lru: LruList::new(),
                closing_lru: LruList::new(),
                done: vec![],
                dns: Correlator::new(config.dns_cache_timeout()),
                kclock: KernelClock::new(config.clock_max_drift()),
                counters: Counters::default(),
            }),
            clock,
            own_pid: std::process::id(),
            timeouts: Timeouts {
                flow_inactive: config.flow_inactive_timeout(),
                socket_inactive: config.socket_inactive_timeout(),
                closing: config.flow_termination_timeout(),
            },
            udp_overhead_ipv4: config.udp_overhead_ipv4,
            udp_overhead_ipv6: config.udp_overhead_ipv6,
            resolver,
        }
    }

    /// Overrides the pid clock synchronization events must come from
    #[inline(always)]
    pub fn with_own_pid(mut self, pid: u32) -> Self {
        self.own_pid = pid;
        self
    }

    #[inline(always)]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline(always)]
    pub fn own_pid(&self) -> u32 {
        self.own_pid
    }

    #[inline(always)]
    pub fn host_resolver(&self) -> Option<Arc<HostResolver>> {
        self.resolver.clone()
    }

    /// Bytes of IP and UDP headers not accounted by UDP probes
    pub fn udp_overhead(&self, inet: InetType) -> u64 {
        match inet {
            InetType::V6 => self.udp_overhead_ipv6,
            _ => self.udp_overhead_ipv4,
        }
    }

    /// Converts a kernel timestamp into wall clock time
    pub fn kernel_time(&self, kernel_ns: u64) -> DateTime<Utc> {
        let now = self.clock.now();
        self.lock().wall(kernel_ns, now)
    }

    /// Applies a clock synchronization sample. Samples not emitted by
    /// our own process are ignored.
    pub fn sync_clock(&self, pid: u32, kernel_ns: u64, wall_ns: u64) -> bool {
        if pid != self.own_pid {
            debug!("ignoring clock sync from pid={pid}");
            return false;
        }
        self.lock().kclock.sync(kernel_ns, wall_ns)
    }

    pub fn create_process(&self, mut p: Process) -> Result<(), Error> {
        if p.pid() == KERNEL_PID {
            return Err(Error::KernelPid { op: "create" });
        }

        let now = self.clock.now();
        let mut inner = self.lock();
        if p.created().is_none() {
            let created = inner.wall(p.created_kernel(), now);
            p.set_created(created);
        }
        inner.processes.insert(p.pid(), Arc::new(p));
        Ok(())
    }

    pub fn fork_process(&self, parent: u32, child: u32, kernel_ts: u64) -> Result<(), Error> {
        if parent == child {
            return Ok(());
        }

        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.processes.contains_key(&child) {
            return Err(Error::ProcessExists(child));
        }

        // an unknown parent still gets a child whose image the next exec fills
        let mut c = match inner.processes.get(&parent) {
            Some(p) => p.fork(child, kernel_ts),
            None => Process::new(child, "", vec![], kernel_ts),
        };
        let created = inner.wall(kernel_ts, now);
        c.set_created(created);
        inner.processes.insert(child, Arc::new(c));
        Ok(())
    }

    pub fn terminate_process(&self, pid: u32) -> Result<(), Error> {
        if pid == KERNEL_PID {
            return Err(Error::KernelPid { op: "terminate" });
        }
        self.lock().processes.remove(&pid);
        Ok(())
    }

    #[inline]
    pub fn process(&self, pid: u32) -> Option<Arc<Process>> {
        self.lock().processes.get(&pid).cloned()
    }

    /// Sets the credentials of a registered process, returns false if
    /// the process is unknown.
    pub fn set_process_credentials(&self, pid: u32, creds: Credentials) -> bool {
        match self.lock().processes.get(&pid) {
            Some(p) => {
                p.set_creds(creds);
                true
            }
            None => false,
        }
    }

    /// Stores a call event until its result shows up. A call already
    /// pending for the thread is replaced and reported as an error.
    pub fn thread_enter(&self, tid: u32, ev: Event) -> Result<(), Error> {
        let current = ev.to_string();
        match self.lock().threads.insert(tid, ev) {
            Some(previous) => Err(Error::PendingCall {
                tid,
                current,
                previous: previous.to_string(),
            }),
            None => Ok(()),
        }
    }

    #[inline]
    pub fn thread_leave(&self, tid: u32) -> Option<Event> {
        self.lock().threads.remove(&tid)
    }

    /// Runs `f` on the call pending for `tid`, returns None if there is none
    pub fn with_pending_call<F, R>(&self, tid: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut Event) -> R,
    {
        self.lock().threads.get_mut(&tid).map(f)
    }

    /// Registers the flow of a socket being created. If the socket pointer
    /// is already known, the kernel reused it: the flow of the old socket
    /// going between the same endpoints is carried over and the old socket
    /// is terminated.
    pub fn create_socket(&self, mut flow: Flow) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.stamp(&mut flow, now);

        if let Some(mut stale) = inner.sockets.remove(&flow.sock()) {
            debug!("socket {:#x} superseded", flow.sock());
            if let Some(prev) = stale.take_matching_flow(&flow) {
                if let Some(key) = prev.key() {
                    inner.flow_lru.remove(&key);
                }
                flow.supersede(prev);
            }
            inner.counters.sockets_superseded += 1;
            inner.terminate_socket(stale);
        }

        inner.create_flow(flow, now);
    }

    #[inline]
    pub fn update_flow(&self, flow: Flow) {
        self.update_flow_with_condition(flow, |_| true)
    }

    /// Merges `flow` into the matching flow of its socket if `cond` holds
    /// for the latter. Missing sockets and flows are created.
    pub fn update_flow_with_condition<F>(&self, mut flow: Flow, cond: F)
    where
        F: Fn(&Flow) -> bool,
    {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.stamp(&mut flow, now);
        inner.update_flow(flow, now, cond);
    }

    /// Marks a socket released by its process as closing
    pub fn on_sock_destroyed(&self, ptr: u64, pid: u32, kernel_ts: u64) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let ts = inner.wall(kernel_ts, now);

        let inner = &mut *inner;
        let sock = inner.sockets.entry(ptr).or_insert_with(|| Socket::new(ptr));
        if sock.is_closing() {
            return;
        }

        if sock.pid().is_none() {
            sock.set_process(pid, inner.processes.get(&pid).cloned());
        }
        sock.set_closing();
        inner.socket_lru.remove(&ptr);
        inner.closing_lru.push(ptr, ts);
    }

    pub fn on_dns_transaction(&self, tr: Transaction) {
        if let Some(r) = self.resolver.as_ref() {
            r.add_transaction(&tr);
        }
        let now = self.clock.now();
        self.lock().dns.add_transaction(tr, now);
    }

    /// Process having claimed a DNS client address
    pub fn dns_client(&self, addr: &SocketAddr) -> Option<Arc<Process>> {
        self.lock().dns.process(addr).cloned()
    }

    /// Expires inactive flows, idle sockets, closed sockets and DNS
    /// entries according to their respective timeouts.
    pub fn expire_older(&self) {
        let now = self.clock.now();
        self.lock().expire_older(now, &self.timeouts);
    }

    /// Terminates every socket and flow, used to flush the state on exit
    pub fn terminate_all(&self) {
        let mut inner = self.lock();
        let sockets = mem::take(&mut inner.sockets);
        for (_, sock) in sockets {
            inner.terminate_socket(sock);
        }
        inner.flow_lru.clear();
        inner.socket_lru.clear();
        inner.closing_lru.clear();
    }

    /// Takes the flows terminated since the last call
    pub fn done_flows(&self) -> Vec<Flow> {
        mem::take(&mut self.lock().done)
    }

    pub fn stats(&self) -> Stats {
        let inner = self.lock();
        Stats {
            processes: inner.processes.len(),
            sockets: inner.sockets.len(),
            flows: inner.sockets.values().map(|s| s.flows_len()).sum(),
            pending_calls: inner.threads.len(),
            flow_lru: inner.flow_lru.len(),
            socket_lru: inner.socket_lru.len(),
            closing_lru: inner.closing_lru.len(),
            done: inner.done.len(),
            dns_transactions: inner.dns.pending_transactions(),
            dns_endpoints: inner.dns.registered_endpoints(),
            flows_created: inner.counters.flows_created,
            flows_terminated: inner.counters.flows_terminated,
            flows_discarded: inner.counters.flows_discarded,
            sockets_superseded: inner.counters.sockets_superseded,
        }
    }
}

/// Predicate keeping IP layer accounting off flows already accounted at
/// the UDP layer
#[inline(always)]
pub fn not_udp(flow: &Flow) -> bool {
    flow.proto() != Protocol::Udp
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bpf_events::{Meta, SyscallResult},
        clock::ManualClock,
        state::flow::Endpoint,
    };

    fn state() -> (Arc<ManualClock>, State) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let state = State::with_clock(&Config::default(), clock.clone());
        (clock, state)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_kernel_pid() {
        let (_, s) = state();
        assert_eq!(
            s.create_process(Process::new(0, "/sbin/init", vec![], 0)),
            Err(Error::KernelPid { op: "create" })
        );
        assert!(s.terminate_process(0).is_err());
        assert!(s.process(0).is_some());
    }

    #[test]
    fn test_fork() {
        let (_, s) = state();
        s.create_process(Process::new(10, "/bin/bash", vec![], 1)).unwrap();

        s.fork_process(10, 10, 2).unwrap();
        s.fork_process(10, 11, 2).unwrap();
        assert_eq!(s.process(11).map(|p| p.name().to_string()), Some("bash".into()));
        assert_eq!(s.fork_process(10, 11, 3), Err(Error::ProcessExists(11)));
        // unknown parent
        s.fork_process(4242, 12, 3).unwrap();
        let child = s.process(12).unwrap();
        assert_eq!(child.pid(), 12);
        assert_eq!(child.name(), "");
        assert!(child.created().is_some());
        assert_eq!(s.fork_process(4242, 12, 4), Err(Error::ProcessExists(12)));
    }

    #[test]
    fn test_pending_calls() {
        let (_, s) = state();
        let ev = |tid| {
            Event::ExecveResult(SyscallResult {
                meta: Meta {
                    timestamp: 0,
                    pid: tid,
                    tid,
                },
                retval: 0,
            })
        };

        s.thread_enter(1, ev(1)).unwrap();
        assert!(matches!(
            s.thread_enter(1, ev(1)),
            Err(Error::PendingCall { tid: 1, .. })
        ));
        assert_eq!(s.with_pending_call(1, |ev| ev.meta().tid), Some(1));
        assert!(s.thread_leave(1).is_some());
        assert!(s.thread_leave(1).is_none());
        assert!(s.with_pending_call(1, |_| ()).is_none());
    }

    #[test]
    fn test_condition() {
        let (_, s) = state();
        let remote = Endpoint::new(Some(addr("8.8.8.8:53")));
        let local = Endpoint::new(Some(addr("10.0.0.1:40000")));

        s.update_flow(
            Flow::new(0xff, 1)
                .with_proto(Protocol::Udp)
                .with_local(local.clone().with_traffic(1, 100))
                .with_remote(remote.clone()),
        );
        s.update_flow_with_condition(
            Flow::new(0xff, 2).with_local(local.with_traffic(1, 100)).with_remote(remote),
            not_udp,
        );
        s.terminate_all();

        let done = s.done_flows();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].local().bytes(), 100);
        assert_eq!(done[0].local().packets(), 1);
    }

    #[test]
    fn test_sock_destroyed_stub() {
        let (_, s) = state();
        s.on_sock_destroyed(0xdead, 42, 1);
        s.on_sock_destroyed(0xdead, 43, 2);
        let st = s.stats();
        assert_eq!(st.sockets, 1);
        assert_eq!(st.closing_lru, 1);
        assert_eq!(st.socket_lru, 0);
    }

    #[test]
    fn test_clock_sync_own_pid() {
        let (_, s) = state();
        let s = s.with_own_pid(4242);
        assert!(!s.sync_clock(1, 1_000, 2_000_000_000));
        assert!(s.sync_clock(4242, 1_000, 2_000_000_000));
    }
}
