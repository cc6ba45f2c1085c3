//! Linux capture backend: NFQUEUE plus the iptables rules that feed it.
//!
//! Packets arrive as raw IP datagrams on two queues (inbound and outbound),
//! each drained by its own blocking worker sharing the diverter. Rules are
//! removed automatically when their guard drops, including on error paths.

use super::Diverter;
use crate::packet::PacketView;
use clap::Parser;
use nfq::{Queue, Verdict};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, trace, warn};

/// Default IPTables table
const IPTABLES_TABLE_DEFAULT: &str = "raw";
/// Default IPTables chain for inbound packets
const IPTABLES_CHAIN_IN_DEFAULT: &str = "PREROUTING";
/// Default IPTables chain for outbound packets
const IPTABLES_CHAIN_OUT_DEFAULT: &str = "OUTPUT";
/// Comment string identifying rules placed by netdivert
const IPTABLES_COMMENT: &str = "NETDIVERT NFQ";

#[derive(Debug, Parser)]
pub struct NfqArgs {
    /// IPTables arguments
    #[clap(flatten)]
    pub iptables: IpTablesArgs,
}

/// IPTables data
#[derive(Clone, Debug, Parser)]
pub struct IpTablesArgs {
    /// The IPTables table to intercept at
    #[clap(long = "iptables-table", default_value = IPTABLES_TABLE_DEFAULT)]
    pub table: String,
    /// The IPTables chain to use for inbound packets
    #[clap(long = "iptables-chain-in", default_value = IPTABLES_CHAIN_IN_DEFAULT)]
    pub chain_in: String,
    /// The IPTables chain to use for outbound packets
    #[clap(long = "iptables-chain-out", default_value = IPTABLES_CHAIN_OUT_DEFAULT)]
    pub chain_out: String,
    /// Which NFQUEUE queue number for inbound packets
    #[clap(long, default_value_t = 0)]
    pub queue_num_in: u16,
    /// Which NFQUEUE queue number for outbound packets
    #[clap(long, default_value_t = 1)]
    pub queue_num_out: u16,
}

impl IpTablesArgs {
    fn rule_inbound(&self) -> IpTablesRule {
        IpTablesRule {
            table: self.table.clone(),
            chain: self.chain_in.clone(),
            queue_num: self.queue_num_in,
        }
    }

    fn rule_outbound(&self) -> IpTablesRule {
        IpTablesRule {
            table: self.table.clone(),
            chain: self.chain_out.clone(),
            queue_num: self.queue_num_out,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IpTablesRule {
    pub table: String,
    pub chain: String,
    pub queue_num: u16,
}

impl fmt::Display for IpTablesRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "-t {} -A {} {}",
            self.table,
            self.chain,
            self.rule_string()
        )
    }
}

impl IpTablesRule {
    fn rule_string(&self) -> String {
        format!(
            "-j NFQUEUE --queue-num {} -m comment --comment \"{}\"",
            self.queue_num, IPTABLES_COMMENT
        )
    }

    /// Activate the IPTables rule.
    ///
    /// NOTE: the returned guard removes the rule again when dropped.
    fn activate(&self, is_ipv6: bool) -> Result<IpTablesRuleActivated, IpTablesError> {
        let iptables = iptables::new(is_ipv6)?;
        if !iptables.chain_exists(&self.table, &self.chain)? {
            return Err(IpTablesError::IpTablesChainDoesNotExist);
        }
        let rule = &(self.rule_string());
        // Delete leftovers of the same rule from a previous run
        if iptables.exists(&self.table, &self.chain, rule)? {
            warn!("Found a previous instance of the rule ({self}). Deleting it and all duplicates.");
            iptables.delete_all(&self.table, &self.chain, rule)?;
        }
        warn!(
            "Adding the rule: ({self}). \
               This will affect all network connectivity. \
               If you rely on SSH or other networked utilities to \
               access this system, please exercise caution"
        );
        iptables.append_unique(&self.table, &self.chain, rule)?;

        Ok(IpTablesRuleActivated {
            rule: self.clone(),
            iptables,
        })
    }
}

#[derive(Debug, Error)]
pub enum IpTablesError {
    #[error("Error interfacing with IPTables: {0}")]
    IpTables(String),
    #[error("Chain does not exist in the given table")]
    IpTablesChainDoesNotExist,
}

impl From<Box<dyn std::error::Error>> for IpTablesError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        IpTablesError::IpTables(err.to_string())
    }
}

/// Activated iptables rule; removes itself from iptables upon drop
struct IpTablesRuleActivated {
    rule: IpTablesRule,
    iptables: iptables::IPTables,
}

impl Drop for IpTablesRuleActivated {
    fn drop(&mut self) {
        let rule = &(self.rule.rule_string());
        info!(
            "The iptables({}) rule ({}) will now be removed, including any duplicates.",
            self.iptables.cmd, rule
        );
        // drop cannot return an error so this function must be infallible
        if let Err(err) = self
            .iptables
            .delete_all(&self.rule.table, &self.rule.chain, rule)
        {
            error!(
                "Error removing the rule: {err}. Please manually inspect iptables({}), particularly the {} table in the {} chain.",
                self.iptables.cmd, self.rule.table, self.rule.chain
            );
        }
    }
}

/// Error running the NFQUEUE capture loop
#[derive(Debug, Error)]
pub enum NfqModeError {
    #[error("Error interfacing with IPTables: {0}")]
    IpTables(#[from] IpTablesError),
    #[error("Error opening nfqueue: {0}")]
    NfqOpen(io::Error),
    #[error("Error binding nfqueue: {0}")]
    NfqBind(io::Error),
    #[error("Error interacting with nfqueue: {0}")]
    Nfq(io::Error),
    #[error("Error joining a queue worker: {0}")]
    ThreadJoin(#[from] JoinError),
}

/// Intercept traffic until a termination signal arrives.
///
/// Binds both queues before inserting the iptables rules so no packet is
/// queued with nobody listening, then runs one blocking worker per queue.
pub async fn run_nfq(diverter: Arc<Diverter>, args: NfqArgs) -> Result<(), NfqModeError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_task = tokio::task::spawn(signal_task(shutdown.clone()));

    trace!("Opening netfilter queues");
    let mut queues = Vec::new();
    for (queue_num, label) in [
        (args.iptables.queue_num_in, "in"),
        (args.iptables.queue_num_out, "out"),
    ] {
        let mut queue = Queue::open().map_err(NfqModeError::NfqOpen)?;
        queue.set_nonblocking(true);
        queue.bind(queue_num).map_err(NfqModeError::NfqBind)?;
        queues.push((queue, queue_num, label));
    }
    info!("Opened netfilter queues");

    // Activate the iptables rules for both IPv4 and IPv6. Connectivity is
    // disrupted from here until the workers start pulling packets. Upon drop
    // (including the error path) the rules are removed.
    let rule_in = args.iptables.rule_inbound();
    let rule_out = args.iptables.rule_outbound();
    let _rule_in_ipv4 = rule_in.activate(false)?;
    let _rule_in_ipv6 = rule_in.activate(true)?;
    let _rule_out_ipv4 = rule_out.activate(false)?;
    let _rule_out_ipv6 = rule_out.activate(true)?;

    info!("Starting packet workers");
    let mut workers = Vec::new();
    for (queue, queue_num, label) in queues {
        let diverter = diverter.clone();
        let shutdown = shutdown.clone();
        workers.push(tokio::task::spawn_blocking(move || {
            queue_loop(diverter, queue, queue_num, label, shutdown)
        }));
    }

    let mut result = Ok(());
    for worker in workers {
        if let Err(err) = worker.await? {
            // Unblock the sibling worker before reporting
            shutdown.store(true, Ordering::Relaxed);
            result = Err(err);
        }
    }
    signal_task.abort();
    result
}

/// Drain one queue until shutdown, applying the pipeline to every packet
fn queue_loop(
    diverter: Arc<Diverter>,
    mut queue: Queue,
    queue_num: u16,
    label: &'static str,
    shutdown: Arc<AtomicBool>,
) -> Result<(), NfqModeError> {
    while !shutdown.load(Ordering::Relaxed) {
        match queue.recv() {
            Ok(mut msg) => {
                let mut pkt = PacketView::parse(msg.get_payload().to_vec(), label);
                diverter.handle_pkt(&mut pkt);
                if pkt.mangled() {
                    msg.set_payload(pkt.into_octets());
                }
                msg.set_verdict(Verdict::Accept);
                queue.verdict(msg).map_err(NfqModeError::Nfq)?;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_micros(500));
            }
            Err(err) => return Err(NfqModeError::Nfq(err)),
        }
    }
    queue.unbind(queue_num).map_err(NfqModeError::Nfq)?;
    Ok(())
}

async fn signal_task(shutdown: Arc<AtomicBool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Error waiting for interrupt signal: {err}");
    } else {
        info!("Received interrupt, shutting down");
    }
    shutdown.store(true, Ordering::Relaxed);
}
