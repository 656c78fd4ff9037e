//! Flow identity and agent identity digests.
//!
//! Both identities are 32-bit FNV-1a digests of plain text. Flow keys are not
//! reversible and only ever used as map keys and compact event ids.

use std::fmt;
use std::net::IpAddr;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over raw bytes.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Identity of a tracked flow: digest of source, destination and destination
/// port text, concatenated in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey(u32);

impl FlowKey {
    pub fn new(source: IpAddr, destination: IpAddr, destination_port: &str) -> Self {
        let text = format!("{}{}{}", source, destination, destination_port);
        FlowKey(fnv1a_32(text.as_bytes()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who this agent is, as reported at registration and in every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    hash: u32,
    hostname: String,
    host_os: String,
}

impl AgentIdentity {
    pub fn new(hostname: impl Into<String>, host_os: impl Into<String>) -> Self {
        let hostname = hostname.into();
        AgentIdentity {
            hash: fnv1a_32(hostname.as_bytes()),
            hostname,
            host_os: host_os.into(),
        }
    }

    /// Identity of the running host. An unresolvable host name still yields a
    /// stable identity.
    pub fn detect() -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_default();
        AgentIdentity::new(hostname, std::env::consts::OS)
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn host_os(&self) -> &str {
        &self.host_os
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_fnv1a_reference_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_flow_key_digests_concatenated_text() {
        let key = FlowKey::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2), "22");
        assert_eq!(key.0, fnv1a_32(b"10.0.0.110.0.0.222"));
        assert_eq!(key.to_string(), key.0.to_string());
    }

    #[test]
    fn test_flow_key_is_order_sensitive() {
        let forward = FlowKey::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2), "22");
        let reverse = FlowKey::new(ip(10, 0, 0, 2), ip(10, 0, 0, 1), "22");
        assert_ne!(forward, reverse);
        assert_eq!(forward, FlowKey::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2), "22"));
    }

    #[test]
    fn test_agent_identity_is_stable_for_a_hostname() {
        let first = AgentIdentity::new("build-host-01", "linux");
        let second = AgentIdentity::new("build-host-01", "linux");
        assert_eq!(first.hash(), second.hash());
        assert_eq!(first.hash(), fnv1a_32(b"build-host-01"));
        assert_eq!(first.hostname(), "build-host-01");
        assert_eq!(first.host_os(), "linux");
        assert_ne!(first.hash(), AgentIdentity::new("build-host-02", "linux").hash());
    }
}
