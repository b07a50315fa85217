//! Correlation core of a host network auditing agent.
//!
//! Kernel events ([bpf_events::Event]) are applied serially to a
//! [state::State] which tracks processes, sockets and flows. Terminated flows
//! are rendered into [events::FlowEvent] reports and handed to a
//! [reporter::Reporter].

pub mod bpf_events;
pub mod clock;
pub mod config;
pub mod events;
pub mod reporter;
pub mod state;
pub mod util;
