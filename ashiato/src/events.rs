//! Flow reports as emitted by the agent.
//!
//! Reports are made of sections following Elastic Common Schema naming so
//! that they can be ingested as is.

use std::{net::IpAddr, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use communityid::Flow as CommunityFlow;
use serde::{Deserialize, Serialize, Serializer};

use crate::{
    state::{
        dns::HostResolver,
        flow::{Direction, Endpoint, Flow, InetType, Protocol},
        process::Process,
    },
    util::account::Accounts,
};

const EVENT_KIND: &str = "event";
const EVENT_CATEGORY: &str = "network";
const EVENT_ACTION: &str = "network_flow";

#[inline(always)]
fn serialize_utc_ts<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSection {
    pub id: uuid::Uuid,
    pub kind: String,
    pub category: Vec<String>,
    pub action: String,
    #[serde(serialize_with = "serialize_utc_ts")]
    pub start: DateTime<Utc>,
    #[serde(serialize_with = "serialize_utc_ts")]
    pub end: DateTime<Utc>,
    /// ns
    pub duration: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSection {
    pub uuid: uuid::Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSection {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl From<&Endpoint> for EndpointSection {
    fn from(value: &Endpoint) -> Self {
        Self {
            ip: value.addr().map(|a| a.ip()),
            port: value.addr().map(|a| a.port()),
            packets: value.packets(),
            bytes: value.bytes(),
            domain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub ty: InetType,
    pub transport: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_id: Option<String>,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSection {
    pub pid: u32,
    pub name: String,
    pub args: Vec<String>,
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl From<&Process> for ProcessSection {
    fn from(value: &Process) -> Self {
        Self {
            pid: value.pid(),
            name: value.name().into(),
            args: value.args().to_vec(),
            executable: value.path().into(),
            created: value.created(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSection {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveSection {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub group: GroupSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSection {
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub group: GroupSection,
    pub effective: EffectiveSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSection {
    #[serde(rename = "final")]
    pub is_final: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    #[serde(rename = "@timestamp", serialize_with = "serialize_utc_ts")]
    pub timestamp: DateTime<Utc>,
    pub event: EventSection,
    pub host: HostSection,
    pub source: EndpointSection,
    pub destination: EndpointSection,
    pub network: NetworkSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSection>,
    pub flow: FlowSection,
}

/// Turns terminated flows into reports
pub struct Renderer {
    host_uuid: uuid::Uuid,
    accounts: Accounts,
    resolver: Option<Arc<HostResolver>>,
}

impl Renderer {
    pub fn new(host_uuid: uuid::Uuid, accounts: Accounts) -> Self {
        Self {
            host_uuid,
            accounts,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<HostResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Domain an address was resolved from, the owning process knowledge
    /// takes precedence over the host one.
    fn domain(&self, process: Option<&Arc<Process>>, ip: Option<IpAddr>) -> Option<String> {
        let ip = ip?;
        process
            .and_then(|p| p.resolve_ip(&ip))
            .or_else(|| self.resolver.as_ref().and_then(|r| r.resolve_ip(&ip)))
    }

    fn user(&self, p: &Process) -> Option<UserSection> {
        let creds = p.creds()?;
        let name = |uid| self.accounts.user_name(uid).map(String::from);
        let group = |gid| GroupSection {
            id: gid,
            name: self.accounts.group_name(gid).map(String::from),
        };

        Some(UserSection {
            id: creds.uid,
            name: name(creds.uid),
            group: group(creds.gid),
            effective: EffectiveSection {
                id: creds.euid,
                name: name(creds.euid),
                group: group(creds.egid),
            },
        })
    }

    pub fn render(&self, flow: &Flow) -> FlowEvent {
        let (src, dst) = match flow.dir() {
            Direction::Inbound => (flow.remote(), flow.local()),
            Direction::Outbound | Direction::Unknown => (flow.local(), flow.remote()),
        };

        let process = flow.process();
        let mut source = EndpointSection::from(src);
        source.domain = self.domain(process, source.ip);
        let mut destination = EndpointSection::from(dst);
        destination.domain = self.domain(process, destination.ip);

        let community_id = match (src.addr(), dst.addr()) {
            (Some(s), Some(d)) if flow.proto().is_known() => Some(
                CommunityFlow::new(
                    communityid::Protocol::from(flow.proto().number()),
                    s.ip(),
                    s.port(),
                    d.ip(),
                    d.port(),
                )
                .community_id_v1(0)
                .base64(),
            ),
            _ => None,
        };

        let start = flow.created().wall;
        let end = flow.last_seen().wall;
        let duration = (end - start)
            .num_nanoseconds()
            .and_then(|ns| u64::try_from(ns).ok())
            .unwrap_or_default();

        FlowEvent {
            timestamp: end,
            event: EventSection {
                id: uuid::Uuid::new_v4(),
                kind: EVENT_KIND.into(),
                category: vec![EVENT_CATEGORY.into()],
                action: EVENT_ACTION.into(),
                start,
                end,
                duration,
            },
            host: HostSection {
                uuid: self.host_uuid,
            },
            network: NetworkSection {
                direction: flow.dir(),
                ty: flow.inet(),
                transport: flow.proto(),
                community_id,
                packets: source.packets.saturating_add(destination.packets),
                bytes: source.bytes.saturating_add(destination.bytes),
            },
            source,
            destination,
            process: process.map(|p| ProcessSection::from(p.as_ref())),
            user: process.and_then(|p| self.user(p)),
            flow: FlowSection {
                is_final: flow.is_done(),
                complete: flow.is_complete(),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        state::{dns::Transaction, process::Credentials},
        util::account::Table,
    };

    fn accounts() -> Accounts {
        let mut users = Table::new();
        users.extend_from_str("alice:x:1000:1000::/home/alice:/bin/sh\nroot:x:0:0::/root:/bin/sh").unwrap();
        let mut groups = Table::new();
        groups.extend_from_str("alice:x:1000:\nroot:x:0:").unwrap();
        Accounts::new(users, groups)
    }

    fn flow(dir: Direction) -> Flow {
        let p = Process::new(7, "/usr/bin/ssh", vec!["ssh".into(), "host".into()], 0)
            .with_creds(Credentials {
                uid: 1000,
                gid: 1000,
                euid: 0,
                egid: 0,
            });
        p.add_transaction(&Transaction {
            client: "10.0.0.1:1000".parse().unwrap(),
            server: "10.0.0.254:53".parse().unwrap(),
            domain: "ssh.example.net".into(),
            addresses: vec!["10.0.0.2".parse().unwrap()],
            timestamp: Utc::now(),
        });

        let mut f = Flow::new(1, 0)
            .with_dir(dir)
            .with_proto(Protocol::Tcp)
            .with_local(Endpoint::new(Some("10.0.0.1:40000".parse().unwrap())).with_traffic(3, 300))
            .with_remote(Endpoint::new(Some("10.0.0.2:22".parse().unwrap())).with_traffic(2, 200))
            .with_complete(true);
        f.set_process(7, Some(Arc::new(p)));
        f.mark_done();
        f
    }

    #[test]
    fn test_render_outbound() {
        let r = Renderer::new(uuid::Uuid::new_v4(), accounts());
        let v = serde_json::to_value(r.render(&flow(Direction::Outbound))).unwrap();

        assert_eq!(v["source"]["ip"], "10.0.0.1");
        assert_eq!(v["source"]["bytes"], 300);
        assert_eq!(v["destination"]["port"], 22);
        assert_eq!(v["destination"]["domain"], "ssh.example.net");
        assert!(v["source"].get("domain").is_none());
        assert_eq!(v["network"]["direction"], "egress");
        assert_eq!(v["network"]["type"], "ipv4");
        assert_eq!(v["network"]["transport"], "tcp");
        assert_eq!(v["network"]["bytes"], 500);
        assert_eq!(v["network"]["packets"], 5);
        assert!(v["network"]["community_id"].as_str().unwrap().starts_with("1:"));
        assert_eq!(v["process"]["name"], "ssh");
        assert_eq!(v["user"]["name"], "alice");
        assert_eq!(v["user"]["effective"]["name"], "root");
        assert_eq!(v["user"]["group"]["name"], "alice");
        assert_eq!(v["event"]["action"], "network_flow");
        assert_eq!(v["event"]["category"][0], "network");
        assert_eq!(v["flow"]["final"], true);
        assert_eq!(v["flow"]["complete"], true);
    }

    #[test]
    fn test_render_inbound() {
        let r = Renderer::new(uuid::Uuid::new_v4(), Accounts::default());
        let e = r.render(&flow(Direction::Inbound));

        assert_eq!(e.source.ip, Some("10.0.0.2".parse().unwrap()));
        assert_eq!(e.source.bytes, 200);
        assert_eq!(e.destination.port, Some(40000));
        // names are not resolved without account databases
        assert!(e.user.as_ref().unwrap().name.is_none());

        // community id does not depend on direction
        let o = r.render(&flow(Direction::Outbound));
        assert_eq!(e.network.community_id, o.network.community_id);
    }

    #[test]
    fn test_host_resolver_fallback() {
        let resolver = Arc::new(HostResolver::with_max_entries(16));
        resolver.add_transaction(&Transaction {
            client: "10.0.0.1:1000".parse().unwrap(),
            server: "10.0.0.254:53".parse().unwrap(),
            domain: "client.example.net".into(),
            addresses: vec!["10.0.0.1".parse().unwrap()],
            timestamp: Utc::now(),
        });

        let r = Renderer::new(uuid::Uuid::new_v4(), Accounts::default())
            .with_resolver(Some(resolver));
        let e = r.render(&flow(Direction::Outbound));
        assert_eq!(e.source.domain.as_deref(), Some("client.example.net"));
        assert_eq!(e.destination.domain.as_deref(), Some("ssh.example.net"));
    }
}
