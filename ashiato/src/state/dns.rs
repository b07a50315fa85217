use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Duration, Utc};
use lru_st::collections::LruHashMap;
use serde::{Deserialize, Serialize};

use super::{
    flow::{Flow, Protocol},
    lru::LruList,
    process::Process,
};

const DNS_PORT: u16 = 53;

/// A DNS query and its answer as seen on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub domain: String,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

/// Correlates DNS transactions with the process which issued them.
///
/// Transactions are keyed by the client address of the query. A process
/// claims an address by registering it (it sent a datagram to port 53 from
/// it). Both may happen in any order so whichever comes first waits in its
/// cache until the other shows up or the entry expires.
#[derive(Debug)]
pub struct Correlator {
    timeout: Duration,
    transactions: HashMap<SocketAddr, Vec<Transaction>>,
    transactions_lru: LruList<SocketAddr>,
    endpoints: HashMap<SocketAddr, Arc<Process>>,
    endpoints_lru: LruList<SocketAddr>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            transactions: HashMap::new(),
            transactions_lru: LruList::new(),
            endpoints: HashMap::new(),
            endpoints_lru: LruList::new(),
        }
    }

    pub fn add_transaction(&mut self, tr: Transaction, now: DateTime<Utc>) {
        if let Some(p) = self.endpoints.get(&tr.client) {
            p.add_transaction(&tr);
            return;
        }

        self.transactions_lru.push(tr.client, now);
        self.transactions.entry(tr.client).or_default().push(tr);
    }

    pub fn register_endpoint(&mut self, addr: SocketAddr, p: Arc<Process>, now: DateTime<Utc>) {
        if let Some(txs) = self.transactions.remove(&addr) {
            self.transactions_lru.remove(&addr);
            for tr in txs.iter() {
                p.add_transaction(tr);
            }
        }

        self.endpoints_lru.push(addr, now);
        self.endpoints.insert(addr, p);
    }

    /// Registers the local address of a UDP flow going to a DNS server,
    /// once the process owning the flow is known. Later activity of a
    /// registered flow keeps its registration alive.
    pub(crate) fn register_flow(&mut self, flow: &mut Flow, now: DateTime<Utc>) {
        if flow.proto() != Protocol::Udp {
            return;
        }

        if flow.remote().addr().map(|a| a.port()) != Some(DNS_PORT) {
            return;
        }

        let Some(local) = flow.local().addr() else {
            return;
        };

        if flow.dns_registered() && self.endpoints.contains_key(&local) {
            self.endpoints_lru.push(local, now);
            return;
        }

        let Some(p) = flow.process().cloned() else {
            return;
        };

        self.register_endpoint(local, p, now);
        flow.set_dns_registered();
    }

    /// Returns the process having registered `addr`
    #[inline]
    pub fn process(&self, addr: &SocketAddr) -> Option<&Arc<Process>> {
        self.endpoints.get(addr)
    }

    /// Drops entries older than the correlator timeout
    pub fn cleanup(&mut self, now: DateTime<Utc>) {
        let deadline = now - self.timeout;

        while let Some((addr, _)) = self.transactions_lru.pop_older(deadline) {
            self.transactions.remove(&addr);
        }

        while let Some((addr, _)) = self.endpoints_lru.pop_older(deadline) {
            self.endpoints.remove(&addr);
        }
    }

    #[inline(always)]
    pub fn pending_transactions(&self) -> usize {
        self.transactions.values().map(|v| v.len()).sum()
    }

    #[inline(always)]
    pub fn registered_endpoints(&self) -> usize {
        self.endpoints.len()
    }
}

/// Bounded host wide view of DNS answers, used to name addresses of flows
/// whose process did not resolve them itself.
pub struct HostResolver(Mutex<LruHashMap<IpAddr, String>>);

impl HostResolver {
    pub fn with_max_entries(cap: usize) -> Self {
        Self(Mutex::new(LruHashMap::with_max_entries(cap)))
    }

    pub fn add_transaction(&self, tr: &Transaction) {
        let mut cache = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        for ip in tr.addresses.iter() {
            cache.insert(*ip, tr.domain.clone());
        }
    }

    pub fn resolve_ip(&self, ip: &IpAddr) -> Option<String> {
        let mut cache = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get(ip).cloned()
    }
}
