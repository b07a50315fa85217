use serde::{Deserialize, Serialize};

use crate::state::State;

use super::Meta;

/// Clock synchronization sample triggered by the agent itself. It pairs
/// the kernel time of the event with the wall clock time read at the same
/// moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSync {
    pub meta: Meta,
    /// ns since UNIX epoch
    pub wall_ns: u64,
}

impl ClockSync {
    pub(crate) fn update(self, state: &State) {
        state.sync_clock(self.meta.pid, self.meta.timestamp, self.wall_ns);
    }
}
