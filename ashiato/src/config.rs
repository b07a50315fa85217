use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, time::Duration};
use thiserror::Error;

use crate::util::ns_duration;

pub const DEFAULT_FLOW_INACTIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SOCKET_INACTIVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FLOW_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLOCK_MAX_DRIFT: Duration = Duration::from_millis(100);
pub const DEFAULT_DNS_CACHE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_STATE_LOG_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_HOST_DNS_CACHE_SIZE: usize = 1024;
// IP and UDP headers, UDP probes only see the payload
pub const DEFAULT_UDP_OVERHEAD_IPV4: u64 = 28;
pub const DEFAULT_UDP_OVERHEAD_IPV6: u64 = 48;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0} must not be zero")]
    Zero(&'static str),
}

/// (De)serializes durations in their human readable form ("30s", "1m")
mod human_duration {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s)
            .map_err(|e| D::Error::custom(format!("invalid duration '{s}': {e}")))
    }
}

/// Ashiato configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    host_uuid: Option<uuid::Uuid>,
    /// stdout, stderr or path of a file reports are appended to
    pub output: String,
    #[serde(with = "human_duration")]
    pub flow_inactive_timeout: Duration,
    #[serde(with = "human_duration")]
    pub socket_inactive_timeout: Duration,
    #[serde(with = "human_duration")]
    pub flow_termination_timeout: Duration,
    #[serde(with = "human_duration")]
    pub clock_max_drift: Duration,
    #[serde(with = "human_duration")]
    pub dns_cache_timeout: Duration,
    #[serde(with = "human_duration")]
    pub reap_interval: Duration,
    /// zero disables state logging
    #[serde(with = "human_duration")]
    pub state_log_interval: Duration,
    /// zero disables host wide domain resolution
    pub host_dns_cache_size: usize,
    pub udp_overhead_ipv4: u64,
    pub udp_overhead_ipv6: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_uuid: None,
            output: "stdout".into(),
            flow_inactive_timeout: DEFAULT_FLOW_INACTIVE_TIMEOUT,
            socket_inactive_timeout: DEFAULT_SOCKET_INACTIVE_TIMEOUT,
            flow_termination_timeout: DEFAULT_FLOW_TERMINATION_TIMEOUT,
            clock_max_drift: DEFAULT_CLOCK_MAX_DRIFT,
            dns_cache_timeout: DEFAULT_DNS_CACHE_TIMEOUT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            state_log_interval: DEFAULT_STATE_LOG_INTERVAL,
            host_dns_cache_size: DEFAULT_HOST_DNS_CACHE_SIZE,
            udp_overhead_ipv4: DEFAULT_UDP_OVERHEAD_IPV4,
            udp_overhead_ipv6: DEFAULT_UDP_OVERHEAD_IPV6,
        }
    }
}

fn host_uuid() -> Option<uuid::Uuid> {
    if let Ok(machine_id) = fs::read_to_string("/etc/machine-id") {
        let machine_id = machine_id.trim_end();
        // we do not generate uuid if machine_id is empty string
        if machine_id.is_empty() {
            return None;
        }
        return Some(uuid::Uuid::new_v5(
            &uuid::Uuid::NAMESPACE_OID,
            machine_id.as_bytes(),
        ));
    }
    None
}

#[inline(always)]
fn chrono_duration(d: Duration) -> chrono::Duration {
    ns_duration(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let c: Self = serde_yaml::from_str(&fs::read_to_string(p)?)?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let durations = [
            ("flow_inactive_timeout", self.flow_inactive_timeout),
            ("socket_inactive_timeout", self.socket_inactive_timeout),
            ("flow_termination_timeout", self.flow_termination_timeout),
            ("dns_cache_timeout", self.dns_cache_timeout),
            ("reap_interval", self.reap_interval),
        ];

        for (name, d) in durations {
            if d.is_zero() {
                return Err(Error::Zero(name));
            }
        }
        Ok(())
    }

    pub fn host_uuid(&self) -> Option<uuid::Uuid> {
        // host_uuid in config supersedes system host_uuid
        self.host_uuid.or(host_uuid())
    }

    pub fn with_host_uuid(mut self, uuid: uuid::Uuid) -> Self {
        self.host_uuid = Some(uuid);
        self
    }

    /// Generates a random host uuid if none is configured or derivable
    pub fn generate_host_uuid(mut self) -> Self {
        self.host_uuid = self.host_uuid().or(Some(uuid::Uuid::new_v4()));
        self
    }

    pub fn output<P: AsRef<Path>>(mut self, p: P) -> Self {
        self.output = p.as_ref().to_string_lossy().to_string();
        self
    }

    #[inline(always)]
    pub fn flow_inactive_timeout(&self) -> chrono::Duration {
        chrono_duration(self.flow_inactive_timeout)
    }

    #[inline(always)]
    pub fn socket_inactive_timeout(&self) -> chrono::Duration {
        chrono_duration(self.socket_inactive_timeout)
    }

    #[inline(always)]
    pub fn flow_termination_timeout(&self) -> chrono::Duration {
        chrono_duration(self.flow_termination_timeout)
    }

    #[inline(always)]
    pub fn clock_max_drift(&self) -> chrono::Duration {
        chrono_duration(self.clock_max_drift)
    }

    #[inline(always)]
    pub fn dns_cache_timeout(&self) -> chrono::Duration {
        chrono_duration(self.dns_cache_timeout)
    }
}
