//! Host facts reported to the directory service

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Machine description sent with the verification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostFacts {
    pub cpus: usize,
    /// Total physical memory in bytes (0 when unknown)
    pub memory: u64,
    pub hostname: String,
    /// Outbound-facing local address
    pub internal_ip: String,
}

impl HostFacts {
    /// Probe the current machine
    pub fn detect() -> Self {
        Self {
            cpus: num_cpus::get(),
            memory: total_memory(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            internal_ip: local_ip().to_string(),
        }
    }
}

#[cfg(target_os = "linux")]
fn total_memory() -> u64 {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return 0;
    };
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn total_memory() -> u64 {
    0
}

/// Address the OS would use to reach the outside; no packet is sent
fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
