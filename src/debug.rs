//! Fine-grained debug trace categories.
//!
//! The `debuglevel` config option selects which categories of per-packet
//! trace output are emitted through `tracing::debug!`. Categories are bits
//! in a mask so several can be enabled at once; the token `OFF` wins over
//! everything else.

use tracing::warn;

/// Generic packet handling
pub const DGENPKT: u32 = 1 << 0;
/// Verbose per-packet table lines
pub const DGENPKTV: u32 = 1 << 1;
/// Pipeline stage entry/exit
pub const DCB: u32 = 1 << 2;
/// Capture file writes
pub const DPCAP: u32 = 1 << 3;
/// Ignored packets (black/whitelists)
pub const DIGN: u32 = 1 << 4;
/// FTP active mode handling
pub const DFTP: u32 = 1 << 5;
/// IP masquerade decisions
pub const DIPNAT: u32 = 1 << 6;
/// Dynamic port forwarding decisions
pub const DDPF: u32 = 1 << 7;
/// Dynamic port forwarding, verbose
pub const DDPFV: u32 = 1 << 8;
/// Anything else
pub const DMISC: u32 = 1 << 9;

pub const LABELS: &[(&str, u32)] = &[
    ("GENPKT", DGENPKT),
    ("GENPKTV", DGENPKTV),
    ("CB", DCB),
    ("PCAP", DPCAP),
    ("IGN", DIGN),
    ("FTP", DFTP),
    ("IPNAT", DIPNAT),
    ("DPF", DDPF),
    ("DPFV", DDPFV),
    ("MISC", DMISC),
];

/// Name of the lowest set bit in `mask`, for log line prefixes
pub fn label_for(mask: u32) -> &'static str {
    LABELS
        .iter()
        .find(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| *name)
        .unwrap_or("MISC")
}

/// Combine config label tokens into a mask. Unknown labels warn, `OFF`
/// disables everything regardless of other tokens.
pub fn parse_labels(labels: &[String]) -> u32 {
    let mut mask = 0;
    for label in labels {
        let label = label.to_uppercase();
        if label == "OFF" {
            return 0;
        }
        match LABELS.iter().find(|(name, _)| *name == label) {
            Some((_, bit)) => mask |= bit,
            None => warn!("No such debug category as {label}"),
        }
    }
    mask
}
