use log::debug;
use serde::{Deserialize, Serialize};

use crate::state::{
    self,
    process::{Credentials, Process},
    State,
};

use super::{Event, Meta, SyscallResult};

/// execve entry, the new process is only created when the syscall succeeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecveCall {
    pub meta: Meta,
    pub path: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub creds: Option<Credentials>,
}

impl SyscallResult {
    pub(crate) fn update_execve(self, state: &State) -> Result<(), state::Error> {
        let call = match state.thread_leave(self.meta.tid) {
            Some(Event::ExecveCall(call)) => call,
            Some(other) => {
                debug!("execve result does not match pending call: {other}");
                return Ok(());
            }
            None => {
                debug!("execve result without call tid={}", self.meta.tid);
                return Ok(());
            }
        };

        if self.retval < 0 {
            return Ok(());
        }

        let pid = self.meta.pid;
        // credentials are kept across execve
        let creds = call
            .creds
            .or_else(|| state.process(pid).and_then(|p| p.creds()));

        let mut p = Process::new(pid, &call.path, call.argv, self.meta.timestamp);
        if let Some(creds) = creds {
            p = p.with_creds(creds);
        }

        state.create_process(p)
    }
}

/// Credentials being installed on the current task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitCreds {
    pub meta: Meta,
    pub creds: Credentials,
}

impl CommitCreds {
    pub(crate) fn update(self, state: &State) {
        let creds = self.creds;
        let attached = state.with_pending_call(self.meta.tid, |ev| match ev {
            Event::ExecveCall(call) => {
                call.creds = Some(creds);
                true
            }
            _ => false,
        });

        if attached != Some(true) {
            state.set_process_credentials(self.meta.pid, creds);
        }
    }
}

/// Return of a fork/clone in the parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkResult {
    pub meta: Meta,
    pub retval: i64,
}

impl ForkResult {
    pub(crate) fn update(self, state: &State) -> Result<(), state::Error> {
        // zero is the child side, negative a failure
        let Ok(child) = u32::try_from(self.retval) else {
            return Ok(());
        };
        if child == 0 {
            return Ok(());
        }
        state.fork_process(self.meta.pid, child, self.meta.timestamp)
    }
}

/// Task exit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub meta: Meta,
}

impl ProcessExit {
    pub(crate) fn update(self, state: &State) -> Result<(), state::Error> {
        state.thread_leave(self.meta.tid);
        // only the exit of the thread group leader ends the process
        if self.meta.tid != self.meta.pid {
            return Ok(());
        }
        state.terminate_process(self.meta.pid)
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

    fn meta(ts: u64, pid: u32, tid: u32) -> Meta {
        Meta {
            timestamp: ts,
            pid,
            tid,
        }
    }

    const CREDS: Credentials = Credentials {
        uid: 1000,
        gid: 100,
        euid: 0,
        egid: 100,
    };

    fn exec(state: &State, pid: u32, tid: u32, path: &str, retval: i64) {
        Event::ExecveCall(ExecveCall {
            meta: meta(1, pid, tid),
            path: path.into(),
            argv: vec![path.into()],
            creds: None,
        })
        .update(state)
        .unwrap();
        Event::CommitCreds(CommitCreds {
            meta: meta(2, pid, tid),
            creds: CREDS,
        })
        .update(state)
        .unwrap();
        Event::ExecveResult(SyscallResult {
            meta: meta(3, pid, tid),
            retval,
        })
        .update(state)
        .unwrap();
    }

    #[test]
    fn test_execve() {
        let s = state();
        exec(&s, 1234, 1234, "/usr/bin/curl", 0);

        let p = s.process(1234).unwrap();
        assert_eq!(p.name(), "curl");
        assert_eq!(p.args().to_vec(), vec!["/usr/bin/curl".to_string()]);
        assert_eq!(p.creds(), Some(CREDS));
        assert!(p.created().is_some());
        assert_eq!(s.stats().pending_calls, 0);
    }

    #[test]
    fn test_execve_failure() {
        let s = state();
        exec(&s, 1234, 1234, "/nonexistent", -2);
        assert!(s.process(1234).is_none());
        assert_eq!(s.stats().pending_calls, 0);

        // result without call
        Event::ExecveResult(SyscallResult {
            meta: meta(3, 1234, 1234),
            retval: 0,
        })
        .update(&s)
        .unwrap();
        assert!(s.process(1234).is_none());
    }

    #[test]
    fn test_commit_creds_on_process() {
        let s = state();
        s.create_process(Process::new(10, "/usr/bin/sudo", vec![], 0))
            .unwrap();
        Event::CommitCreds(CommitCreds {
            meta: meta(2, 10, 10),
            creds: CREDS,
        })
        .update(&s)
        .unwrap();
        assert_eq!(s.process(10).and_then(|p| p.creds()), Some(CREDS));
    }

    #[test]
    fn test_fork_and_exit() {
        let s = state();
        exec(&s, 100, 100, "/bin/bash", 0);

        Event::ForkResult(ForkResult {
            meta: meta(4, 100, 100),
            retval: 101,
        })
        .update(&s)
        .unwrap();
        assert_eq!(s.process(101).map(|p| p.name().to_string()), Some("bash".into()));

        // failed fork and child side
        for retval in [-11, 0] {
            Event::ForkResult(ForkResult {
                meta: meta(5, 100, 100),
                retval,
            })
            .update(&s)
            .unwrap();
        }

        // thread exit keeps the process
        Event::ProcessExit(ProcessExit {
            meta: meta(6, 101, 102),
        })
        .update(&s)
        .unwrap();
        assert!(s.process(101).is_some());

        Event::ProcessExit(ProcessExit {
            meta: meta(7, 101, 101),
        })
        .update(&s)
        .unwrap();
        assert!(s.process(101).is_none());
        assert!(s.process(100).is_some());
    }

    #[test]
    fn test_fork_from_unknown_parent() {
        let s = state();

        Event::ForkResult(ForkResult {
            meta: meta(4, 300, 300),
            retval: 301,
        })
        .update(&s)
        .unwrap();
        assert!(s.process(300).is_none());
        assert_eq!(s.process(301).map(|p| p.name().to_string()), Some("".into()));

        exec(&s, 301, 301, "/usr/bin/curl", 0);
        assert_eq!(s.process(301).map(|p| p.name().to_string()), Some("curl".into()));
    }
}
