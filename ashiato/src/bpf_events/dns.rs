use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::state::{dns::Transaction, State};

use super::Meta;

/// DNS answer decoded from a response packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsTransaction {
    pub meta: Meta,
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub domain: String,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
}

impl DnsTransaction {
    pub(crate) fn update(self, state: &State) {
        let timestamp = state.kernel_time(self.meta.timestamp);
        state.on_dns_transaction(Transaction {
            client: self.client,
            server: self.server,
            domain: self.domain,
            addresses: self.addresses,
            timestamp,
        });
    }
}
