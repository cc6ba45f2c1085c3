//! Operating-system capabilities the diverter consumes.
//!
//! The decision engine never talks to the OS directly; everything it needs
//! (interface checks, process attribution, the redirection target address)
//! arrives through the [`OsDelegate`] trait so the core stays testable and
//! portable.

use crate::packet::{PacketView, Proto};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Capability set implemented per operating system
pub trait OsDelegate: Send + Sync {
    /// At least one Ethernet interface is up
    fn check_active_ethernet_adapters(&self) -> bool;
    /// At least one interface has an IP address configured
    fn check_ipaddresses(&self) -> bool;
    /// At least one interface has a gateway set
    fn check_gateways(&self) -> bool;
    /// Attempt to configure a gateway where none is set
    fn fix_gateway(&self) -> bool;
    /// A DNS server is configured
    fn check_dns_servers(&self) -> bool;
    /// Attempt to configure a DNS server where none is set
    fn fix_dns(&self) -> bool;
    /// Discover the owning process of a packet from its 5-tuple.
    /// Either member may be unknown independently.
    fn get_pid_comm(&self, pkt: &PacketView) -> (Option<u32>, Option<String>);
    /// Address to rewrite foreign destinations to, given the packet source
    fn new_dest_ip(&self, src_ip: IpAddr) -> IpAddr;
}

/// The set of IP addresses assigned to local interfaces, split by family
#[derive(Clone, Debug, Default)]
pub struct LocalIps {
    v4: HashSet<Ipv4Addr>,
    v6: HashSet<Ipv6Addr>,
}

impl LocalIps {
    /// Snapshot the addresses of all local interfaces, loopback included
    pub fn from_interfaces() -> io::Result<Self> {
        let mut ips = LocalIps::default();
        for iface in if_addrs::get_if_addrs()? {
            ips.insert(iface.ip());
        }
        ips.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        ips.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
        Ok(ips)
    }

    pub fn insert(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => {
                self.v4.insert(v4);
            }
            IpAddr::V6(v6) => {
                self.v6.insert(v6);
            }
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.v4.contains(v4),
            IpAddr::V6(v6) => self.v6.contains(v6),
        }
    }
}

impl FromIterator<IpAddr> for LocalIps {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let mut ips = LocalIps::default();
        for ip in iter {
            ips.insert(ip);
        }
        ips
    }
}

/// Superuser check; packet interception needs CAP_NET_ADMIN or root
pub fn check_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Linux implementation backed by procfs and the interface list
pub struct LinuxDelegate;

impl LinuxDelegate {
    pub fn new() -> Self {
        LinuxDelegate
    }

    /// Find the socket inode for an endpoint in the proc net tables
    fn find_socket_inode(proto: Proto, ip: IpAddr, port: u16) -> Option<u64> {
        let matches = |local: std::net::SocketAddr| local.ip() == ip && local.port() == port;
        match proto {
            Proto::Tcp => {
                for entry in procfs::net::tcp().ok()?.into_iter() {
                    if matches(entry.local_address) {
                        return Some(entry.inode);
                    }
                }
                for entry in procfs::net::tcp6().ok()?.into_iter() {
                    if matches(entry.local_address) {
                        return Some(entry.inode);
                    }
                }
            }
            Proto::Udp => {
                for entry in procfs::net::udp().ok()?.into_iter() {
                    if matches(entry.local_address) {
                        return Some(entry.inode);
                    }
                }
                for entry in procfs::net::udp6().ok()?.into_iter() {
                    if matches(entry.local_address) {
                        return Some(entry.inode);
                    }
                }
            }
            Proto::Icmp => return None,
        }
        None
    }

    /// Walk process fd tables looking for the socket inode
    fn find_process_by_inode(inode: u64) -> Option<(u32, String)> {
        for proc in procfs::process::all_processes().ok()?.flatten() {
            let Ok(fds) = proc.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let procfs::process::FDTarget::Socket(fd_inode) = fd.target {
                    if fd_inode == inode {
                        let comm = proc.stat().ok().map(|stat| stat.comm);
                        return Some((proc.pid() as u32, comm.unwrap_or_default()));
                    }
                }
            }
        }
        None
    }
}

impl Default for LinuxDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl OsDelegate for LinuxDelegate {
    fn check_active_ethernet_adapters(&self) -> bool {
        if_addrs::get_if_addrs()
            .map(|ifaces| ifaces.iter().any(|iface| !iface.is_loopback()))
            .unwrap_or(false)
    }

    fn check_ipaddresses(&self) -> bool {
        if_addrs::get_if_addrs()
            .map(|ifaces| {
                ifaces
                    .iter()
                    .any(|iface| !iface.is_loopback() && !iface.ip().is_unspecified())
            })
            .unwrap_or(false)
    }

    fn check_gateways(&self) -> bool {
        procfs::net::route()
            .map(|routes| {
                routes
                    .iter()
                    .any(|route| route.gateway != Ipv4Addr::new(0, 0, 0, 0))
            })
            .unwrap_or(false)
    }

    fn fix_gateway(&self) -> bool {
        // Route table changes are left to the operator
        warn!("Cannot configure a gateway automatically");
        false
    }

    fn check_dns_servers(&self) -> bool {
        fs::read_to_string("/etc/resolv.conf")
            .map(|conf| {
                conf.lines()
                    .any(|line| line.trim_start().starts_with("nameserver"))
            })
            .unwrap_or(false)
    }

    fn fix_dns(&self) -> bool {
        warn!("Cannot configure a DNS server automatically");
        false
    }

    fn get_pid_comm(&self, pkt: &PacketView) -> (Option<u32>, Option<String>) {
        let Some(proto) = pkt.proto() else {
            return (None, None);
        };
        // Outbound packets carry the local socket in their source fields,
        // inbound replies in their destination fields. Try both.
        let candidates = [
            (pkt.src_ip(), pkt.sport()),
            (pkt.dst_ip(), pkt.dport()),
        ];
        for (ip, port) in candidates {
            let Some(ip) = ip else { continue };
            if let Some(inode) = Self::find_socket_inode(proto, ip, port) {
                if let Some((pid, comm)) = Self::find_process_by_inode(inode) {
                    return (Some(pid), Some(comm));
                }
            }
        }
        debug!("No owning process found for {}", pkt.hdr_to_str());
        (None, None)
    }

    fn new_dest_ip(&self, src_ip: IpAddr) -> IpAddr {
        // Loopback is routable for locally-originated traffic on Linux
        match src_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}
