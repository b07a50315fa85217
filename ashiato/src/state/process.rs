use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::basename;

use super::dns::Transaction;

pub const KERNEL_PID: u32 = 0;
const KERNEL_NAME: &str = "[kernel_task]";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// A process known to the state. Processes are shared by the flows they
/// own, the fields which can change after registration (credentials and
/// resolved domains) have their own lock so they can be read while
/// rendering reports without holding the state lock.
#[derive(Debug)]
pub struct Process {
    pid: u32,
    name: String,
    path: String,
    args: Vec<String>,
    created_kernel: u64,
    created: Option<DateTime<Utc>>,
    creds: RwLock<Option<Credentials>>,
    resolved: RwLock<HashMap<IpAddr, String>>,
}

impl Clone for Process {
    fn clone(&self) -> Self {
        Self {
            pid: self.pid,
            name: self.name.clone(),
            path: self.path.clone(),
            args: self.args.clone(),
            created_kernel: self.created_kernel,
            created: self.created,
            creds: RwLock::new(self.creds()),
            resolved: RwLock::new(
                self.resolved
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
            ),
        }
    }
}

impl Process {
    /// Creates a process from its executable path, the name of the
    /// process is the last component of the path.
    pub fn new<S: AsRef<str>>(pid: u32, path: S, args: Vec<String>, created_kernel: u64) -> Self {
        Self {
            pid,
            name: basename(path.as_ref()),
            path: path.as_ref().to_string(),
            args,
            created_kernel,
            created: None,
            creds: RwLock::new(None),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Pseudo process owning what the kernel does on its own
    pub fn kernel() -> Self {
        let mut p = Self::new(KERNEL_PID, "", vec![], 0);
        p.name = KERNEL_NAME.into();
        p
    }

    #[inline(always)]
    pub fn with_creds(self, creds: Credentials) -> Self {
        self.set_creds(creds);
        self
    }

    /// Builds the child of a fork. Resolved domains are copied so that
    /// parent and child evolve independently from now on.
    pub fn fork(&self, child: u32, created_kernel: u64) -> Self {
        let mut p = self.clone();
        p.pid = child;
        p.created_kernel = created_kernel;
        p.created = None;
        p
    }

    #[inline(always)]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline(always)]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[inline(always)]
    pub fn created_kernel(&self) -> u64 {
        self.created_kernel
    }

    #[inline(always)]
    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    #[inline(always)]
    pub(crate) fn set_created(&mut self, created: DateTime<Utc>) {
        self.created = Some(created);
    }

    pub fn creds(&self) -> Option<Credentials> {
        *self.creds.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_creds(&self, creds: Credentials) {
        *self.creds.write().unwrap_or_else(PoisonError::into_inner) = Some(creds);
    }

    /// Returns the domain this process resolved `ip` from, if any
    pub fn resolve_ip(&self, ip: &IpAddr) -> Option<String> {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip)
            .cloned()
    }

    /// Records every address of a DNS answer as resolved from its domain
    pub fn add_transaction(&self, tr: &Transaction) {
        let mut resolved = self.resolved.write().unwrap_or_else(PoisonError::into_inner);
        for ip in tr.addresses.iter() {
            resolved.insert(*ip, tr.domain.clone());
        }
    }

    pub fn resolved_len(&self) -> usize {
        self.resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn transaction(domain: &str, ips: &[&str]) -> Transaction {
        Transaction {
            client: "10.0.0.2:34567".parse().unwrap(),
            server: "10.0.0.1:53".parse().unwrap(),
            domain: domain.into(),
            addresses: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_name_from_path() {
        let p = Process::new(1234, "/usr/bin/curl", vec!["curl".into()], 42);
        assert_eq!(p.name(), "curl");
        assert_eq!(p.path(), "/usr/bin/curl");
        assert_eq!(Process::kernel().name(), KERNEL_NAME);
    }

    #[test]
    fn test_fork_copies_resolved() {
        let parent = Process::new(1, "/bin/sh", vec![], 0).with_creds(Credentials {
            uid: 1000,
            gid: 1000,
            euid: 1000,
            egid: 1000,
        });
        parent.add_transaction(&transaction("example.net", &["1.2.3.4"]));

        let child = parent.fork(2, 10);
        assert_eq!(child.pid(), 2);
        assert_eq!(child.name(), "sh");
        assert_eq!(child.creds(), parent.creds());
        assert_eq!(child.resolve_ip(&"1.2.3.4".parse().unwrap()), Some("example.net".into()));

        // maps are not shared
        child.add_transaction(&transaction("example.org", &["5.6.7.8"]));
        parent.add_transaction(&transaction("example.com", &["9.9.9.9"]));
        assert_eq!(parent.resolve_ip(&"5.6.7.8".parse().unwrap()), None);
        assert_eq!(child.resolve_ip(&"9.9.9.9".parse().unwrap()), None);
        assert_eq!(parent.resolved_len(), 2);
        assert_eq!(child.resolved_len(), 2);
    }
}
