//! Host introspection for the machine fingerprint.
//!
//! The fingerprint only has to be stable for one host and distinct across
//! hosts; it is hashed again before it ever leaves the process.

use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];
const HOSTNAME_PATHS: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];
const NET_CLASS_DIR: &str = "/sys/class/net";

/// Host characteristics the fingerprint is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub machine_id: Option<String>,
    pub hostname: Option<String>,
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    /// Hardware addresses of non-loopback interfaces, sorted
    pub mac_addresses: Vec<String>,
}

impl HostFacts {
    pub fn collect() -> Self {
        let facts = Self {
            machine_id: first_readable(MACHINE_ID_PATHS),
            hostname: first_readable(HOSTNAME_PATHS)
                .or_else(|| std::env::var("HOSTNAME").ok())
                .or_else(|| std::env::var("COMPUTERNAME").ok()),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            mac_addresses: mac_addresses(Path::new(NET_CLASS_DIR)),
        };
        debug!(
            "Collected host facts: machine_id={} hostname={:?} os={} arch={} cpus={} macs={}",
            facts.machine_id.is_some(),
            facts.hostname,
            facts.os,
            facts.arch,
            facts.cpus,
            facts.mac_addresses.len()
        );
        facts
    }

    fn canonical(&self) -> String {
        format!(
            "machine_id={};hostname={};os={};arch={};cpus={};macs={}",
            self.machine_id.as_deref().unwrap_or(""),
            self.hostname.as_deref().unwrap_or(""),
            self.os,
            self.arch,
            self.cpus,
            self.mac_addresses.join(",")
        )
    }

    /// 32-byte digest over the canonical rendering of the facts
    pub fn fingerprint(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hasher.finalize().to_vec()
    }
}

fn first_readable(paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|p| {
        std::fs::read_to_string(p)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn mac_addresses(net_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(net_dir) else {
        return Vec::new();
    };

    let mut macs: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_name() != "lo")
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("address")).ok())
        .map(|mac| mac.trim().to_ascii_lowercase())
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
        .collect();
    macs.sort();
    macs.dedup();
    macs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> HostFacts {
        HostFacts {
            machine_id: Some("4c4c4544004a3510".into()),
            hostname: Some("agent-01".into()),
            os: "linux".into(),
            arch: "x86_64".into(),
            cpus: 8,
            mac_addresses: vec!["02:42:ac:11:00:02".into()],
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(facts().fingerprint(), facts().fingerprint());
        assert_eq!(facts().fingerprint().len(), 32);
    }

    #[test]
    fn test_fingerprint_changes_with_host() {
        let mut other = facts();
        other.hostname = Some("agent-02".into());
        assert_ne!(facts().fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_mac_addresses_skip_loopback_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, mac) in [
            ("lo", "00:00:00:00:00:00"),
            ("eth1", "AA:BB:CC:00:00:02"),
            ("eth0", "aa:bb:cc:00:00:01"),
            ("dummy0", "00:00:00:00:00:00"),
        ] {
            let iface_dir = dir.path().join(iface);
            std::fs::create_dir(&iface_dir).unwrap();
            std::fs::write(iface_dir.join("address"), format!("{mac}\n")).unwrap();
        }

        assert_eq!(
            mac_addresses(dir.path()),
            vec!["aa:bb:cc:00:00:01".to_string(), "aa:bb:cc:00:00:02".to_string()]
        );
    }

    #[test]
    fn test_missing_net_dir_yields_no_macs() {
        assert!(mac_addresses(Path::new("/nonexistent/net")).is_empty());
    }
}
