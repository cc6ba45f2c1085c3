//! The per-packet redirect/masquerade stages.
//!
//! Stage order is fixed by the pipeline: at layer 3 `maybe_redir_ip` then
//! `maybe_fixup_srcip` (SingleHost only), at layer 4 `maybe_redir_port` then
//! `maybe_fixup_sport`. Each stage returns whether it modified the packet.
//! Stages re-derive endpoint keys from the current header fields, so a
//! rewrite by an earlier stage changes what later stages look up.

use super::{execute, Diverter, DivertParms};
use crate::config::{portvec_contains, portvec_insert};
use crate::debug::{DDPF, DDPFV, DFTP, DIGN, DIPNAT};
use crate::packet::PacketView;
use tracing::{debug, error, info};

impl Diverter {
    /// Indicate whether a packet should be passed without mangling.
    ///
    /// Consults the global and per-listener black/whitelists against the
    /// pristine header fields, and recognizes connections the diverter's own
    /// process initiates (the FTP active-mode case) so their replies are
    /// never folded back into a default listener.
    pub(crate) fn check_should_ignore(
        &self,
        pkt: &PacketView,
        pid: Option<u32>,
        comm: Option<&str>,
    ) -> bool {
        let proto = pkt.proto();
        let src_ip = pkt.src_ip0();
        let sport = pkt.sport0();
        let dst_ip = pkt.dst_ip0();
        let dport = pkt.dport0();

        if !self.policy.redirect_all_traffic {
            self.pdebug(DIGN, || format!("Ignoring packet {}", pkt.hdr_to_str()));
            return true;
        }

        // Process filters only make sense when the sender runs on this host
        if self.policy.single_host_mode {
            if let Some(comm) = comm {
                if self.policy.blacklist_processes.contains(comm) {
                    self.pdebug(DIGN, || {
                        format!("Ignoring packet from process {comm} in the process blacklist")
                    });
                    return true;
                }
                if !self.policy.whitelist_processes.is_empty()
                    && !self.policy.whitelist_processes.contains(comm)
                {
                    self.pdebug(DIGN, || {
                        format!("Ignoring packet from process {comm} not in the process whitelist")
                    });
                    return true;
                }
                if let Some(proto) = proto {
                    if let Some(list) = self.policy.port_process_blacklist.get(&(proto, dport)) {
                        if list.iter().any(|name| name == comm) {
                            self.pdebug(DIGN, || {
                                format!(
                                    "Ignoring packet from process {comm} in the listener process blacklist"
                                )
                            });
                            return true;
                        }
                    } else if let Some(list) =
                        self.policy.port_process_whitelist.get(&(proto, dport))
                    {
                        if !list.iter().any(|name| name == comm) {
                            self.pdebug(DIGN, || {
                                format!(
                                    "Ignoring packet from process {comm} not in the listener process whitelist"
                                )
                            });
                            return true;
                        }
                    }
                }
            }
        }

        // Forwarding blacklisted port
        if let Some(proto) = proto {
            if let Some(ports) = self.policy.blacklist_ports.lock().unwrap().get(proto) {
                if portvec_contains(ports, sport) || portvec_contains(ports, dport) {
                    self.pdebug(DIGN, || {
                        format!("Forwarding blacklisted port {proto} packet: {}", pkt.hdr_to_str())
                    });
                    return true;
                }
            }
        }

        if let Some(dst) = dst_ip {
            if self.policy.blacklist_hosts.contains(&dst) {
                self.pdebug(DIGN, || {
                    format!("Ignoring packet to {dst} in the host blacklist")
                });
                return true;
            }
            if let Some(proto) = proto {
                if let Some(hosts) = self.policy.port_host_whitelist.get(&(proto, dport)) {
                    if !hosts.contains(&dst) {
                        self.pdebug(DIGN, || {
                            format!("Ignoring packet to {dst} not in the listener host whitelist")
                        });
                        return true;
                    }
                }
                if let Some(hosts) = self.policy.port_host_blacklist.get(&(proto, dport)) {
                    if hosts.contains(&dst) {
                        self.pdebug(DIGN, || {
                            format!("Ignoring packet to {dst} in the listener host blacklist")
                        });
                        return true;
                    }
                }
            }
        }

        // A packet from the diverter process itself is always left alone.
        // When a listener initiates a local connection between unbound ports
        // (FTP active mode data channel), blacklist the source port so the
        // peer's replies are not diverted to a default listener either.
        if pid == Some(self.pid) {
            if let (Some(src), Some(dst), Some(proto)) = (src_ip, dst_ip, proto) {
                let src_local = self.local_ips.contains(&src) && !src.is_loopback();
                let dst_local = self.local_ips.contains(&dst) && !dst.is_loopback();
                let sport_bound = self.policy.bound_ports.contains_key(&(proto, sport));
                let dport_bound = self.policy.bound_ports.contains_key(&(proto, dport));
                if src_local && dst_local && !sport_bound && !dport_bound {
                    self.pdebug(DIGN | DFTP, || {
                        format!(
                            "Listener initiated {proto} connection {}; blacklisting port {sport}",
                            pkt.hdr_to_str()
                        )
                    });
                    if let Some(ports) = self.policy.blacklist_ports.lock().unwrap().get_mut(proto)
                    {
                        portvec_insert(ports, sport);
                    }
                }
            }
            return true;
        }

        false
    }

    /// Conditionally redirect foreign destination IPs to a local address.
    ///
    /// Used only under SingleHost mode; the pipeline does not run this stage
    /// as a gateway.
    pub(crate) fn maybe_redir_ip(
        &self,
        pkt: &mut PacketView,
        pid: Option<u32>,
        comm: Option<&str>,
    ) -> bool {
        if self.check_should_ignore(pkt, pid, comm) {
            return false;
        }
        let (Some(src_ip), Some(dst_ip), Some(skey)) = (pkt.src_ip(), pkt.dst_ip(), pkt.skey())
        else {
            return false;
        };

        if !self.local_ips.contains(&dst_ip) {
            if self.nonlocal_seen.lock().unwrap().insert(dst_ip) {
                info!("Received packet destined for foreign host {dst_ip}");
            }
            // Record the original destination before rewriting so replies
            // can be masqueraded back
            self.tables.ip_fwd_put(skey, dst_ip);
            let newdst = self.os.new_dest_ip(src_ip);
            self.pdebug(DIPNAT, || {
                format!("REDIRECTING {} to IP {newdst}", pkt.hdr_to_str())
            });
            if let Err(err) = pkt.set_dst_ip(newdst) {
                error!("Failed to rewrite destination IP: {err}");
                return false;
            }
            true
        } else {
            // The local endpoint is reusing a client port that formerly
            // talked to a foreign host; the stale entry would otherwise
            // overwrite source IPs on the new conversation's replies
            if self.tables.ip_fwd_remove(&skey) {
                self.pdebug(DIPNAT, || format!(" - DELETING ipfwd key entry: {skey}"));
            }
            false
        }
    }

    /// Conditionally fix up the source IP if the remote endpoint had their
    /// conversation IP-forwarded, keyed by the current destination endpoint.
    pub(crate) fn maybe_fixup_srcip(&self, pkt: &mut PacketView) -> bool {
        let Some(dkey) = pkt.dkey() else {
            return false;
        };
        match self.tables.ip_fwd_get(&dkey) {
            Some(new_srcip) => {
                self.pdebug(DIPNAT, || {
                    format!("MASQUERADING {} from IP {new_srcip}", pkt.hdr_to_str())
                });
                if let Err(err) = pkt.set_src_ip(new_srcip) {
                    error!("Failed to rewrite source IP: {err}");
                    return false;
                }
                true
            }
            None => {
                self.pdebug(DIPNAT, || format!(" ! NO SUCH ipfwd key entry: {dkey}"));
                false
            }
        }
    }

    /// Conditionally redirect unbound-port traffic to the default listener.
    pub(crate) fn maybe_redir_port(
        &self,
        crit: &DivertParms,
        pkt: &mut PacketView,
        pid: Option<u32>,
        comm: Option<&str>,
    ) -> bool {
        let Some(proto) = pkt.proto() else {
            return false;
        };
        let Some(default) = self.policy.default_listener.get(proto).copied().flatten() else {
            return false;
        };
        let (Some(skey), Some(dkey)) = (pkt.skey(), pkt.dkey()) else {
            return false;
        };

        // The destination matching a port-forward entry means this packet is
        // a reply within an already-masqueraded conversation, not the start
        // of a new one with an unbound port
        if self.tables.port_fwd_contains(&dkey) {
            return false;
        }

        let mut modified = false;
        if crit.dport_hidden_listener(pkt) || self.decide_redir_port(crit, pkt) {
            self.pdebug(DDPFV, || {
                String::from("Packet destined for unbound port or hidden listener")
            });

            // A reply (e.g. a TCP RST from a closed port) belonging to a
            // conversation that was deliberately left alone stays alone
            if self.tables.ignore_get(&dkey) == Some(pkt.sport()) {
                return false;
            }

            if self.check_should_ignore(pkt, pid, comm) {
                self.tables.ignore_put(skey, pkt.dport());
                return false;
            }

            self.pdebug(DDPFV, || format!(" + ADDING portfwd key entry: {skey}"));
            self.tables.port_fwd_put(skey, pkt.dport());
            self.pdebug(DDPF, || {
                format!("Redirecting {} to go to port {default}", pkt.hdr_to_str())
            });
            match pkt.set_dport(default) {
                Ok(()) => modified = true,
                Err(err) => error!("Failed to rewrite destination port: {err}"),
            }
        } else {
            // The foreign endpoint is reusing a client port that formerly
            // talked to an unbound port here; drop the stale entry so the
            // source port of replies in the new conversation is not rewritten
            if self.tables.port_fwd_remove(&skey) {
                self.pdebug(DDPFV, || format!(" - DELETING portfwd key entry: {skey}"));
            }
        }

        if crit.first_packet_new_session(pkt) {
            if let Some(dst_ip) = pkt.dst_ip() {
                self.tables.record_session(pkt.sport(), (dst_ip, pkt.dport()));
            }
            self.maybe_execute_cmd(pkt, pid, comm);
        }

        modified
    }

    /// Decide whether to redirect a port.
    ///
    /// Truth-table-reduced form over src locality and port boundness:
    /// redirect when the destination port is unbound and either the source
    /// is foreign or the source port is unbound.
    pub(crate) fn decide_redir_port(&self, crit: &DivertParms, pkt: &PacketView) -> bool {
        let a = crit.src_local(pkt);
        let c = crit.sport_bound(pkt);
        let d = crit.dport_bound(pkt);

        if self.debug_enabled(DDPFV) {
            let b = crit.dst_local(pkt);
            let bn = |x: bool| u8::from(x).to_string();
            self.pdebug(DDPFV, || {
                format!(
                    "src {} ({}), dst {} ({}), sport {} ({}bound), dport {} ({}bound), abcd = {}{}{}{}",
                    pkt.src_ip().map(|ip| ip.to_string()).unwrap_or_default(),
                    if a { "local" } else { "foreign" },
                    pkt.dst_ip().map(|ip| ip.to_string()).unwrap_or_default(),
                    if b { "local" } else { "foreign" },
                    pkt.sport(),
                    if c { "" } else { "un" },
                    pkt.dport(),
                    if d { "" } else { "un" },
                    bn(a),
                    bn(b),
                    bn(c),
                    bn(d),
                )
            });
        }

        (!a && !d) || (!c && !d)
    }

    /// Conditionally fix up the source port if the remote endpoint had their
    /// conversation port-forwarded, keyed by the current destination endpoint.
    pub(crate) fn maybe_fixup_sport(&self, pkt: &mut PacketView) -> bool {
        let Some(dkey) = pkt.dkey() else {
            return false;
        };
        match self.tables.port_fwd_get(&dkey) {
            Some(new_sport) => {
                self.pdebug(DDPFV, || format!(" = FOUND portfwd key entry: {dkey}"));
                self.pdebug(DDPF, || {
                    format!("MASQUERADING {} to come from port {new_sport}", pkt.hdr_to_str())
                });
                if let Err(err) = pkt.set_sport(new_sport) {
                    error!("Failed to rewrite source port: {err}");
                    return false;
                }
                true
            }
            None => {
                self.pdebug(DDPFV, || format!(" ! NO SUCH portfwd key entry: {dkey}"));
                false
            }
        }
    }

    /// Build and spawn the ExecuteCmd for a new session, if one applies
    fn maybe_execute_cmd(&self, pkt: &PacketView, pid: Option<u32>, comm: Option<&str>) {
        let Some(pid) = pid else {
            return;
        };
        let Some(proto) = pkt.proto() else {
            return;
        };
        let Some(template) = self.policy.port_execute.get(&(proto, pkt.dport())) else {
            return;
        };
        let (Some(src_ip), Some(dst_ip)) = (pkt.src_ip(), pkt.dst_ip()) else {
            return;
        };
        let cmd = template.render(
            pid,
            comm.unwrap_or("Unknown"),
            src_ip,
            pkt.sport(),
            dst_ip,
            pkt.dport(),
        );
        info!("Executing command: {cmd}");
        match execute::execute_detached(&cmd) {
            Ok(child) => debug!("Detached child process {child}"),
            Err(err) => error!("Failed to execute command {cmd}: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::portvec_contains;
    use crate::diverter::testsupport::{test_diverter, test_policy};
    use crate::diverter::DivertParms;
    use crate::packet::testutil::tcp4;
    use crate::packet::{EndpointKey, Proto};
    use std::net::{IpAddr, Ipv4Addr};

    fn tkey(ip: &str, port: u16) -> EndpointKey {
        EndpointKey {
            proto: Proto::Tcp,
            ip: ip.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn redir_port_truth_table() {
        // local = {192.168.19.222, 127.0.0.1}, bound = {80, 1337, 65535}
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let crit = DivertParms::new(&div);
        let foreign = "192.168.19.132";
        let local = "192.168.19.222";
        let loopback = "127.0.0.1";
        let cases = [
            (foreign, 33333, local, 33333, true),
            (foreign, 33333, local, 80, false),
            (foreign, 80, local, 33333, true),
            (foreign, 80, local, 80, false),
            (local, 33333, foreign, 33333, true),
            (local, 80, foreign, 33333, false),
            (loopback, 33333, loopback, 33333, true),
            (loopback, 80, loopback, 80, false),
        ];
        for (src, sport, dst, dport, expect) in cases {
            let pkt = tcp4(src, sport, dst, dport);
            assert_eq!(
                div.decide_redir_port(&crit, &pkt),
                expect,
                "{src}:{sport} -> {dst}:{dport}"
            );
        }
    }

    #[test]
    fn single_host_round_trip() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        div.handle_pkt(&mut pkt);

        // L3: foreign destination redirected, original recorded
        assert_eq!(pkt.dst_ip(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert_eq!(
            div.tables.ip_fwd_get(&tkey("10.0.0.5", 40000)),
            Some("8.8.8.8".parse().unwrap())
        );
        // L4: unbound destination port redirected to the default listener
        assert_eq!(pkt.dport(), 1337);
        assert_eq!(div.tables.port_fwd_get(&tkey("10.0.0.5", 40000)), Some(53));
        assert!(pkt.mangled());

        // Pristine snapshot unchanged through both rewrites
        assert_eq!(pkt.src_ip0(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(pkt.dst_ip0(), Some("8.8.8.8".parse().unwrap()));
        assert_eq!(pkt.sport0(), 40000);
        assert_eq!(pkt.dport0(), 53);

        // Reply from the default listener: masqueraded back so the client
        // sees the conversation it started
        let mut reply = tcp4("127.0.0.1", 1337, "10.0.0.5", 40000);
        div.handle_pkt(&mut reply);
        assert_eq!(reply.src_ip(), Some("8.8.8.8".parse().unwrap()));
        assert_eq!(reply.sport(), 53);
        assert_eq!(reply.dst_ip(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(reply.dport(), 40000);
    }

    #[test]
    fn bound_port_is_not_redirected() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let mut pkt = tcp4("192.168.19.132", 33333, "192.168.19.222", 80);
        div.handle_pkt(&mut pkt);
        assert!(!pkt.mangled());
        assert_eq!(pkt.dport(), 80);
        assert!(div
            .tables
            .port_fwd_get(&tkey("192.168.19.132", 33333))
            .is_none());
    }

    #[test]
    fn hidden_listener_port_is_redirected() {
        let mut policy = test_policy();
        policy.bound_ports.insert((Proto::Tcp, 8080), true);
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        let crit = DivertParms::new(&div);
        let mut pkt = tcp4("192.168.19.132", 33333, "192.168.19.222", 8080);
        // Bound, so the plain decision says no
        assert!(!div.decide_redir_port(&crit, &pkt));
        // The hidden flag forces the proxy detour anyway
        div.maybe_redir_port(&crit, &mut pkt, None, None);
        assert_eq!(pkt.dport(), 1337);
        assert_eq!(
            div.tables.port_fwd_get(&tkey("192.168.19.132", 33333)),
            Some(8080)
        );
    }

    #[test]
    fn loopback_conversations_skip_port_stages() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let mut pkt = tcp4("127.0.0.1", 33333, "127.0.0.1", 44444);
        div.handle_pkt(&mut pkt);
        assert!(!pkt.mangled());
        assert_eq!(pkt.dport(), 44444);
    }

    #[test]
    fn blacklisted_host_conversation_is_marked_ignored() {
        let mut policy = test_policy();
        policy.blacklist_hosts.insert("8.8.4.4".parse().unwrap());
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);

        // Outbound packet to the blacklisted host is left alone but the
        // conversation is remembered
        let mut pkt = tcp4("192.168.19.222", 40000, "8.8.4.4", 9999);
        let crit = DivertParms::new(&div);
        div.maybe_redir_port(&crit, &mut pkt, None, None);
        assert!(!pkt.mangled());
        assert_eq!(
            div.tables.ignore_get(&tkey("192.168.19.222", 40000)),
            Some(9999)
        );

        // The reply (e.g. an RST off a closed port) matches the ignore
        // entry and is not mistaken for a new unbound-port conversation
        let mut reply = tcp4("8.8.4.4", 9999, "192.168.19.222", 40000);
        div.maybe_redir_port(&crit, &mut reply, None, None);
        assert!(!reply.mangled());
        assert!(div
            .tables
            .port_fwd_get(&tkey("8.8.4.4", 9999))
            .is_none());
    }

    #[test]
    fn stale_port_fwd_entry_is_deleted() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        // Leftover from an earlier conversation on the same client port
        div.tables.port_fwd_put(tkey("192.168.19.132", 33333), 9999);
        // Same foreign endpoint now talks to a bound port: no redirect, and
        // the stale entry goes away
        let crit = DivertParms::new(&div);
        let mut pkt = tcp4("192.168.19.132", 33333, "192.168.19.222", 80);
        div.maybe_redir_port(&crit, &mut pkt, None, None);
        assert!(!pkt.mangled());
        assert!(div
            .tables
            .port_fwd_get(&tkey("192.168.19.132", 33333))
            .is_none());
    }

    #[test]
    fn stale_ip_fwd_entry_is_deleted() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        div.tables
            .ip_fwd_put(tkey("10.0.0.5", 40000), "8.8.8.8".parse().unwrap());
        // The local endpoint reuses the port for a local destination
        let mut pkt = tcp4("10.0.0.5", 40000, "127.0.0.1", 80);
        div.maybe_redir_ip(&mut pkt, None, None);
        assert!(!pkt.mangled());
        assert!(div.tables.ip_fwd_get(&tkey("10.0.0.5", 40000)).is_none());
    }

    #[test]
    fn redirect_all_traffic_off_ignores_everything() {
        let mut policy = test_policy();
        policy.redirect_all_traffic = false;
        let div = test_diverter(policy, &["10.0.0.5", "127.0.0.1"]);
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        div.handle_pkt(&mut pkt);
        assert!(!pkt.mangled());
    }

    #[test]
    fn own_pid_never_proceeds_past_ignore() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        let pid = std::process::id();
        let pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        assert!(div.check_should_ignore(&pkt, Some(pid), Some("netdivert")));
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        assert!(!div.maybe_redir_ip(&mut pkt, Some(pid), Some("netdivert")));
        assert!(!pkt.mangled());
    }

    #[test]
    fn ftp_active_mode_blacklists_the_listener_port() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let pid = std::process::id();
        // Listener-initiated connection between two unbound local ports
        let pkt = tcp4("192.168.19.222", 20000, "192.168.19.222", 30000);
        assert!(div.check_should_ignore(&pkt, Some(pid), Some("netdivert")));
        let ports = div.policy.blacklist_ports.lock().unwrap();
        assert!(portvec_contains(&ports.tcp, 20000));
        drop(ports);

        // Replies to that port now match the blacklist for any process
        let reply = tcp4("192.168.19.132", 5555, "192.168.19.222", 20000);
        assert!(div.check_should_ignore(&reply, None, None));
    }

    #[test]
    fn loopback_endpoints_do_not_trigger_ftp_blacklisting() {
        let div = test_diverter(test_policy(), &["192.168.19.222", "127.0.0.1"]);
        let pid = std::process::id();
        let pkt = tcp4("127.0.0.1", 20000, "127.0.0.1", 30000);
        // Still ignored because it is the diverter's own traffic
        assert!(div.check_should_ignore(&pkt, Some(pid), None));
        let ports = div.policy.blacklist_ports.lock().unwrap();
        assert!(!portvec_contains(&ports.tcp, 20000));
    }

    #[test]
    fn process_whitelist_excludes_other_processes() {
        let mut policy = test_policy();
        policy.whitelist_processes.insert(String::from("malware.exe"));
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        let pkt = tcp4("192.168.19.222", 40000, "8.8.8.8", 53);
        assert!(div.check_should_ignore(&pkt, Some(1234), Some("chrome")));
        assert!(!div.check_should_ignore(&pkt, Some(1234), Some("malware.exe")));
        // Unknown process cannot be filtered
        assert!(!div.check_should_ignore(&pkt, None, None));
    }

    #[test]
    fn per_listener_process_blacklist_requires_a_match() {
        let mut policy = test_policy();
        policy
            .port_process_blacklist
            .insert((Proto::Tcp, 53), vec![String::from("dnscrypt")]);
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        let pkt = tcp4("192.168.19.222", 40000, "8.8.8.8", 53);
        assert!(div.check_should_ignore(&pkt, Some(1), Some("dnscrypt")));
        assert!(!div.check_should_ignore(&pkt, Some(1), Some("malware.exe")));
    }

    #[test]
    fn blacklisted_port_matches_either_endpoint() {
        let mut policy = test_policy();
        *policy.blacklist_ports.lock().unwrap() = crate::config::PerProto {
            tcp: crate::config::portvec_from(&[139]),
            udp: crate::config::portvec_from(&[]),
        };
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        assert!(div.check_should_ignore(&tcp4("1.2.3.4", 139, "192.168.19.222", 5555), None, None));
        assert!(div.check_should_ignore(&tcp4("1.2.3.4", 5555, "192.168.19.222", 139), None, None));
        assert!(!div.check_should_ignore(&tcp4("1.2.3.4", 5555, "192.168.19.222", 5556), None, None));
    }

    #[test]
    fn per_listener_host_whitelist_gates_the_port() {
        let mut policy = test_policy();
        let mut hosts = std::collections::HashSet::new();
        hosts.insert("192.168.19.132".parse().unwrap());
        policy.port_host_whitelist.insert((Proto::Tcp, 53), hosts);
        let div = test_diverter(policy, &["192.168.19.222", "127.0.0.1"]);
        // dst not in the per-port whitelist: leave alone
        assert!(div.check_should_ignore(&tcp4("192.168.19.222", 40000, "8.8.8.8", 53), None, None));
        // dst in the whitelist: fair game
        assert!(!div.check_should_ignore(
            &tcp4("192.168.19.222", 40000, "192.168.19.132", 53),
            None,
            None
        ));
    }

    #[test]
    fn masqueraded_reply_is_not_treated_as_new_conversation() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        div.handle_pkt(&mut pkt);
        // The listener's reply targets an endpoint present in port_fwd; the
        // redirect stage must not claim it even though 40000 is unbound
        let crit = DivertParms::new(&div);
        let mut reply = tcp4("127.0.0.1", 1337, "10.0.0.5", 40000);
        assert!(!div.maybe_redir_port(&crit, &mut reply, None, None));
    }

    #[test]
    fn original_dest_port_is_queryable() {
        let div = test_diverter(test_policy(), &["10.0.0.5", "127.0.0.1"]);
        let mut pkt = tcp4("10.0.0.5", 40000, "8.8.8.8", 53);
        div.handle_pkt(&mut pkt);
        assert_eq!(
            div.original_dest_port(Proto::Tcp, "10.0.0.5".parse().unwrap(), 40000),
            Some(53)
        );
        assert_eq!(
            div.original_dest_port(Proto::Tcp, "10.0.0.5".parse().unwrap(), 40001),
            None
        );
    }
}
