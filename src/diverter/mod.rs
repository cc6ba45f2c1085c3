pub mod execute;
pub mod nfq;
mod redirect;
mod tables;

use crate::config::FilterPolicy;
use crate::debug::{self, DCB, DGENPKT, DGENPKTV, DPCAP};
use crate::os::{LocalIps, OsDelegate};
use crate::packet::{EndpointKey, PacketView, Proto};
use crate::pcap::{capture_filename, PcapWriter};
use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::process;
use std::sync::{Arc, Mutex};
use tables::FlowTables;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The packet diverter: the compiled policy, the flow tables recording who
/// talked to whom, and the pipeline that applies the redirect/masquerade
/// stages to every intercepted datagram.
///
/// `handle_pkt` takes `&self` and all mutable state is internally locked, so
/// capture backends may invoke the pipeline concurrently from several worker
/// threads.
pub struct Diverter {
    pub(crate) policy: FilterPolicy,
    pub(crate) tables: FlowTables,
    pub(crate) local_ips: LocalIps,
    pub(crate) os: Arc<dyn OsDelegate>,
    pcap: Option<Mutex<PcapWriter>>,
    /// Foreign destination IPs already reported, to log each once
    pub(crate) nonlocal_seen: Mutex<HashSet<IpAddr>>,
    /// Our own PID, for recognizing listener-originated packets
    pub(crate) pid: u32,
}

#[derive(Debug, Error)]
pub enum DiverterInitError {
    #[error("Failed to open capture file: {0}")]
    Pcap(#[from] io::Error),
}

impl Diverter {
    /// Verify the network environment, open the capture file if requested
    /// and assemble the diverter.
    pub fn new(
        policy: FilterPolicy,
        local_ips: LocalIps,
        os: Arc<dyn OsDelegate>,
    ) -> Result<Self, DiverterInitError> {
        if !os.check_active_ethernet_adapters() {
            warn!("No active ethernet interfaces detected; please enable a network interface");
        }
        if !os.check_ipaddresses() {
            warn!("No interface had an IP address configured");
        }

        let mut gw_ok = os.check_gateways();
        if !gw_ok {
            warn!("No gateways configured");
            if policy.fix_gateway {
                gw_ok = os.fix_gateway();
            }
        }
        if !gw_ok {
            warn!("Interception abilities are limited to local traffic without a gateway");
        }

        let mut dns_ok = os.check_dns_servers();
        if !dns_ok {
            warn!("No DNS servers configured");
            if policy.fix_dns {
                dns_ok = os.fix_dns();
            }
        }
        if !dns_ok {
            warn!("Network resolution will not work without a DNS server");
        }

        let pcap = if policy.dump_packets {
            let filename = capture_filename(&policy.pcap_prefix);
            info!("Capturing traffic to {filename}");
            Some(Mutex::new(PcapWriter::create(&filename)?))
        } else {
            None
        };

        Ok(Diverter {
            policy,
            tables: FlowTables::default(),
            local_ips,
            os,
            pcap,
            nonlocal_seen: Mutex::new(HashSet::new()),
            pid: process::id(),
        })
    }

    /// Generic per-packet hook, invoked by the capture backend.
    ///
    /// Writes the pristine packet to capture, applies the layer 3 stages,
    /// then the layer 4 stages, and re-captures if anything was rewritten.
    /// The caller is responsible for re-injecting the (possibly mangled)
    /// octets afterwards.
    pub fn handle_pkt(&self, pkt: &mut PacketView) {
        // Unconditionally capture the packet as it arrived
        self.write_pcap(pkt);

        if !pkt.is_parsed() {
            warn!("{}: Failed to parse IP packet", pkt.label());
            return;
        }
        self.pdebug(DGENPKT, || format!("{} {}", pkt.label(), pkt.hdr_to_str()));

        let crit = DivertParms::new(self);
        let (pid, comm) = self.os.get_pid_comm(pkt);

        if self.debug_enabled(DGENPKTV) {
            let logline = self.format_pkt(pkt, pid, comm.as_deref());
            self.pdebug(DGENPKTV, || logline);
        } else if let Some(pid) = pid {
            if pid != self.pid && crit.first_packet_new_session(pkt) {
                info!("  pid: {pid} name: {}", comm.as_deref().unwrap_or("Unknown"));
            }
        }

        // Layer 3 (network) stages. IP masquerade only applies when the
        // analysis target shares this host.
        self.check_log_icmp(pkt);
        if self.policy.single_host_mode {
            self.pdebug(DCB, || String::from("Calling maybe_redir_ip"));
            self.maybe_redir_ip(pkt, pid, comm.as_deref());
            self.pdebug(DCB, || String::from("Calling maybe_fixup_srcip"));
            self.maybe_fixup_srcip(pkt);
        }

        // Layer 4 (transport) stages. Loopback conversations fall where
        // they may.
        if matches!(pkt.proto(), Some(Proto::Tcp | Proto::Udp)) {
            if crit.is_loopback(pkt) {
                debug!("Ignoring loopback packet");
                debug!("  {}", pkt.hdr_to_str());
            } else {
                self.pdebug(DCB, || String::from("Calling maybe_redir_port"));
                self.maybe_redir_port(&crit, pkt, pid, comm.as_deref());
                self.pdebug(DCB, || String::from("Calling maybe_fixup_sport"));
                self.maybe_fixup_sport(pkt);
            }
        }

        // Double-write mangled packets so a capture reader sees both the
        // original and the rewritten datagram
        if pkt.mangled() {
            self.write_pcap(pkt);
        }
    }

    fn write_pcap(&self, pkt: &PacketView) {
        if let Some(pcap) = &self.pcap {
            self.pdebug(DPCAP, || {
                format!(
                    "Writing {} packet {}",
                    if pkt.mangled() { "mangled" } else { "initial" },
                    pkt.hdr_to_str()
                )
            });
            if let Err(err) = pcap.lock().unwrap().write_packet(pkt.octets()) {
                tracing::error!("Failed to write capture record: {err}");
            }
        }
    }

    /// Log an ICMP packet if the header was parsed as ICMP
    fn check_log_icmp(&self, pkt: &PacketView) {
        if let (Some(ty), Some(code)) = (pkt.icmp_type(), pkt.icmp_code()) {
            info!("ICMP type {ty} code {code} {}", pkt.hdr_to_str());
        }
    }

    /// Aligned per-packet analysis line for the GENPKTV debug category
    fn format_pkt(&self, pkt: &PacketView, pid: Option<u32>, comm: Option<&str>) -> String {
        let pid = pid.map(|pid| pid.to_string()).unwrap_or_default();
        let comm = comm.unwrap_or("");
        let proto = pkt
            .proto()
            .map(|proto| proto.to_string())
            .unwrap_or_else(|| String::from("UNK"));
        let src = pkt.src_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let dst = pkt.dst_ip().map(|ip| ip.to_string()).unwrap_or_default();
        let (flags, seqack) = pkt.tcp_flags_seqack().unwrap_or_default();
        format!(
            "| {} {proto} | {pid:>6} | {comm:<8} | {src:>15}:{sport:<5} | {dst:>15}:{dport:<5} | {length:>5} | {flags:<11} | {seqack:<35} |",
            pkt.label(),
            sport = pkt.sport(),
            dport = pkt.dport(),
            length = pkt.octets().len(),
        )
    }

    /// Original destination port of a masqueraded conversation, or None if
    /// the source endpoint was never port-forwarded. Called by the proxy
    /// listener to identify where a redirected client was actually headed.
    pub fn original_dest_port(&self, proto: Proto, ip: IpAddr, port: u16) -> Option<u16> {
        self.tables.port_fwd_get(&EndpointKey { proto, ip, port })
    }

    pub(crate) fn debug_enabled(&self, lvl: u32) -> bool {
        self.policy.debug_mask & lvl != 0
    }

    /// Emit a debug trace line if its category is enabled
    pub(crate) fn pdebug<F: FnOnce() -> String>(&self, lvl: u32, msg: F) {
        if self.debug_enabled(lvl) {
            debug!("[{}] {}", debug::label_for(lvl), msg());
        }
    }
}

/// Predicates over a packet plus the diverter state, bundled so the stages
/// and the pipeline share one vocabulary for their decision inputs.
pub struct DivertParms<'d> {
    diverter: &'d Diverter,
}

impl<'d> DivertParms<'d> {
    pub fn new(diverter: &'d Diverter) -> Self {
        DivertParms { diverter }
    }

    /// Both current endpoints are the loopback address
    pub fn is_loopback(&self, pkt: &PacketView) -> bool {
        match (pkt.src_ip(), pkt.dst_ip()) {
            (Some(src), Some(dst)) => src == dst && src.is_loopback(),
            _ => false,
        }
    }

    /// Does the destination port correspond to a hidden listener, i.e.
    /// should the packet go to the proxy instead of the listener itself?
    pub fn dport_hidden_listener(&self, pkt: &PacketView) -> bool {
        pkt.proto()
            .and_then(|proto| {
                self.diverter
                    .policy
                    .bound_ports
                    .get(&(proto, pkt.dport()))
            })
            .copied()
            .unwrap_or(false)
    }

    /// Is the source address one of the local IPs of this system?
    pub fn src_local(&self, pkt: &PacketView) -> bool {
        pkt.src_ip()
            .map(|ip| self.diverter.local_ips.contains(&ip))
            .unwrap_or(false)
    }

    pub fn dst_local(&self, pkt: &PacketView) -> bool {
        pkt.dst_ip()
            .map(|ip| self.diverter.local_ips.contains(&ip))
            .unwrap_or(false)
    }

    /// Is the source port bound by a listener?
    pub fn sport_bound(&self, pkt: &PacketView) -> bool {
        pkt.proto()
            .map(|proto| {
                self.diverter
                    .policy
                    .bound_ports
                    .contains_key(&(proto, pkt.sport()))
            })
            .unwrap_or(false)
    }

    pub fn dport_bound(&self, pkt: &PacketView) -> bool {
        pkt.proto()
            .map(|proto| {
                self.diverter
                    .policy
                    .bound_ports
                    .contains_key(&(proto, pkt.dport()))
            })
            .unwrap_or(false)
    }

    /// Is this the first datagram of this conversation?
    pub fn first_packet_new_session(&self, pkt: &PacketView) -> bool {
        match pkt.dst_ip() {
            Some(dst) => !self
                .diverter
                .tables
                .session_matches(pkt.sport(), (dst, pkt.dport())),
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod testsupport {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub struct TestDelegate;

    impl OsDelegate for TestDelegate {
        fn check_active_ethernet_adapters(&self) -> bool {
            true
        }
        fn check_ipaddresses(&self) -> bool {
            true
        }
        fn check_gateways(&self) -> bool {
            true
        }
        fn fix_gateway(&self) -> bool {
            true
        }
        fn check_dns_servers(&self) -> bool {
            true
        }
        fn fix_dns(&self) -> bool {
            true
        }
        fn get_pid_comm(&self, _pkt: &PacketView) -> (Option<u32>, Option<String>) {
            (None, None)
        }
        fn new_dest_ip(&self, src_ip: IpAddr) -> IpAddr {
            match src_ip {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            }
        }
    }

    /// SingleHost policy matching the canonical redirect scenarios:
    /// bound {80, 1337, 65535}, default listeners on 1337
    pub fn test_policy() -> FilterPolicy {
        let mut policy = FilterPolicy::default();
        policy.redirect_all_traffic = true;
        policy.single_host_mode = true;
        policy.default_listener.tcp = Some(1337);
        policy.default_listener.udp = Some(1337);
        for port in [80, 1337, 65535] {
            policy.bound_ports.insert((Proto::Tcp, port), false);
            policy.bound_ports.insert((Proto::Udp, port), false);
        }
        policy
    }

    pub fn test_diverter(policy: FilterPolicy, local: &[&str]) -> Diverter {
        let ips: LocalIps = local
            .iter()
            .map(|ip| ip.parse::<IpAddr>().unwrap())
            .collect();
        Diverter::new(policy, ips, Arc::new(TestDelegate)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testsupport::{test_diverter, test_policy};
    use super::*;
    use crate::packet::testutil::tcp4;
    use std::fs;

    fn capture_sizes(policy_prefix: &std::path::Path, mangled: bool) -> (usize, usize) {
        let mut policy = test_policy();
        policy.dump_packets = true;
        policy.pcap_prefix = policy_prefix.to_str().unwrap().to_owned();
        let local: &[&str] = if mangled {
            // 8.8.8.8 is foreign, so the packet is rewritten twice
            &["10.0.0.5", "127.0.0.1"]
        } else {
            // Bound destination port on a local host: untouched
            &["10.0.0.5", "8.8.8.8", "127.0.0.1"]
        };
        let div = test_diverter(policy, local);
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", if mangled { 53 } else { 80 });
        div.handle_pkt(&mut pkt);
        drop(div);

        let entry = fs::read_dir(policy_prefix.parent().unwrap())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let len = entry.metadata().unwrap().len() as usize;
        (len, usize::from(pkt.mangled()))
    }

    #[test]
    fn mangled_packets_are_captured_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (len, mangled) = capture_sizes(&dir.path().join("cap"), true);
        assert_eq!(mangled, 1);
        // Global header plus two records of the 40-byte segment
        assert_eq!(len, 24 + 2 * (16 + 40));
    }

    #[test]
    fn untouched_packets_are_captured_once() {
        let dir = tempfile::tempdir().unwrap();
        let (len, mangled) = capture_sizes(&dir.path().join("cap"), false);
        assert_eq!(mangled, 0);
        assert_eq!(len, 24 + 16 + 40);
    }

    #[test]
    fn degraded_packets_pass_through_untouched() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        let mut pkt = PacketView::parse(vec![0xde, 0xad, 0xbe, 0xef], "test");
        div.handle_pkt(&mut pkt);
        assert!(!pkt.mangled());
        assert_eq!(pkt.octets(), &[0xde, 0xad, 0xbe, 0xef][..]);
    }

    #[test]
    fn multi_host_mode_skips_ip_stages() {
        let mut policy = test_policy();
        policy.single_host_mode = false;
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        let mut pkt = tcp4("192.168.19.132", 33333, "8.8.8.8", 53);
        div.handle_pkt(&mut pkt);
        // Destination IP untouched as a gateway, but the unbound port is
        // still funneled to the default listener
        assert_eq!(pkt.dst_ip(), Some("8.8.8.8".parse().unwrap()));
        assert_eq!(pkt.dport(), 1337);
    }

    #[test]
    fn divert_parms_predicates() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let crit = DivertParms::new(&div);

        let pkt = tcp4("192.168.19.222", 80, "192.168.19.132", 33333);
        assert!(crit.src_local(&pkt));
        assert!(!crit.dst_local(&pkt));
        assert!(crit.sport_bound(&pkt));
        assert!(!crit.dport_bound(&pkt));
        assert!(!crit.is_loopback(&pkt));
        assert!(!crit.dport_hidden_listener(&pkt));

        let lo = tcp4("127.0.0.1", 1000, "127.0.0.1", 2000);
        assert!(crit.is_loopback(&lo));

        assert!(crit.first_packet_new_session(&pkt));
        div.tables
            .record_session(80, ("192.168.19.132".parse().unwrap(), 33333));
        assert!(!crit.first_packet_new_session(&pkt));
    }
}
