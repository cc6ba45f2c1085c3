//! The four flow tables backing symmetric rewrites.
//!
//! Each table has its own lock and is only ever touched through point
//! operations; a probe of one table never nests inside a lock on another.

use crate::packet::EndpointKey;
use fnv::FnvHashMap;
use std::net::IpAddr;
use std::sync::Mutex;

#[derive(Default)]
pub struct FlowTables {
    /// Source port -> last seen (dst ip, dst port), for new-session detection
    sessions: Mutex<FnvHashMap<u16, (IpAddr, u16)>>,
    /// Source endpoint -> original foreign destination IP
    ip_fwd: Mutex<FnvHashMap<EndpointKey, IpAddr>>,
    /// Source endpoint -> original destination port
    port_fwd: Mutex<FnvHashMap<EndpointKey, u16>>,
    /// Source endpoint -> destination port of a conversation to leave alone
    ignore: Mutex<FnvHashMap<EndpointKey, u16>>,
}

impl FlowTables {
    pub fn session_matches(&self, sport: u16, dst: (IpAddr, u16)) -> bool {
        self.sessions.lock().unwrap().get(&sport) == Some(&dst)
    }

    pub fn record_session(&self, sport: u16, dst: (IpAddr, u16)) {
        self.sessions.lock().unwrap().insert(sport, dst);
    }

    pub fn ip_fwd_put(&self, key: EndpointKey, dst_ip: IpAddr) {
        self.ip_fwd.lock().unwrap().insert(key, dst_ip);
    }

    pub fn ip_fwd_get(&self, key: &EndpointKey) -> Option<IpAddr> {
        self.ip_fwd.lock().unwrap().get(key).copied()
    }

    /// Remove a stale entry; true if one was present
    pub fn ip_fwd_remove(&self, key: &EndpointKey) -> bool {
        self.ip_fwd.lock().unwrap().remove(key).is_some()
    }

    pub fn port_fwd_put(&self, key: EndpointKey, dport: u16) {
        self.port_fwd.lock().unwrap().insert(key, dport);
    }

    pub fn port_fwd_get(&self, key: &EndpointKey) -> Option<u16> {
        self.port_fwd.lock().unwrap().get(key).copied()
    }

    pub fn port_fwd_contains(&self, key: &EndpointKey) -> bool {
        self.port_fwd.lock().unwrap().contains_key(key)
    }

    /// Remove a stale entry; true if one was present
    pub fn port_fwd_remove(&self, key: &EndpointKey) -> bool {
        self.port_fwd.lock().unwrap().remove(key).is_some()
    }

    pub fn ignore_put(&self, key: EndpointKey, dport: u16) {
        self.ignore.lock().unwrap().insert(key, dport);
    }

    pub fn ignore_get(&self, key: &EndpointKey) -> Option<u16> {
        self.ignore.lock().unwrap().get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Proto;

    fn key(port: u16) -> EndpointKey {
        EndpointKey {
            proto: Proto::Tcp,
            ip: "10.0.0.5".parse().unwrap(),
            port,
        }
    }

    #[test]
    fn port_fwd_round_trip() {
        let tables = FlowTables::default();
        assert!(!tables.port_fwd_contains(&key(40000)));
        tables.port_fwd_put(key(40000), 53);
        assert_eq!(tables.port_fwd_get(&key(40000)), Some(53));
        assert!(tables.port_fwd_remove(&key(40000)));
        assert!(!tables.port_fwd_remove(&key(40000)));
        assert_eq!(tables.port_fwd_get(&key(40000)), None);
    }

    #[test]
    fn ip_fwd_stores_pre_rewrite_destination() {
        let tables = FlowTables::default();
        let dst: IpAddr = "8.8.8.8".parse().unwrap();
        tables.ip_fwd_put(key(40000), dst);
        assert_eq!(tables.ip_fwd_get(&key(40000)), Some(dst));
        assert_eq!(tables.ip_fwd_get(&key(40001)), None);
    }

    #[test]
    fn sessions_detect_new_conversations() {
        let tables = FlowTables::default();
        let dst = ("8.8.8.8".parse().unwrap(), 53);
        assert!(!tables.session_matches(40000, dst));
        tables.record_session(40000, dst);
        assert!(tables.session_matches(40000, dst));
        // Same source port talking to a different peer is a new session
        assert!(!tables.session_matches(40000, ("8.8.4.4".parse().unwrap(), 53)));
    }

    #[test]
    fn ignore_tracks_conversation_port() {
        let tables = FlowTables::default();
        tables.ignore_put(key(40000), 9999);
        assert_eq!(tables.ignore_get(&key(40000)), Some(9999));
    }
}
