use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

use thiserror::Error;

use crate::policy::PolicyConfig;
use crate::resolver::Resolver;

// Public recursive resolvers dropped unconditionally on the forward path so
// clients cannot sidestep DNS-based blocking by switching resolvers.
const PUBLIC_RESOLVERS: &[&str] = &["8.8.8.8", "8.8.4.4", "1.1.1.1", "1.0.0.1"];

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Filter command failed after retry: {0}")]
    CommandFailed(String),
    #[error("Filter command timed out: {0}")]
    CommandTimeout(String),
    #[error("Failed to run filter command: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Lost communication with filter worker")]
    CommunicationError,
}

/// The two alternating kernel chains realising the global deny layer. Sync
/// fills the inactive chain and flips the FORWARD jump in one rule
/// replacement, so there is never a window with no deny rules installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DenyChain {
    A,
    B,
}

impl DenyChain {
    fn name(&self) -> &'static str {
        match self {
            DenyChain::A => "WARDEN_DENY_A",
            DenyChain::B => "WARDEN_DENY_B",
        }
    }

    fn other(&self) -> DenyChain {
        match self {
            DenyChain::A => DenyChain::B,
            DenyChain::B => DenyChain::A,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FirewallConfig {
    pub hotspot_interface: String,
    pub uplink_interface: String,
    pub portal_port: u16,
    pub command_timeout: std::time::Duration,
}

/// Handle to the single filter worker. All kernel-filter mutations in the
/// program serialize through this one task; nothing else may write rules.
#[derive(Debug)]
pub struct Iptables {
    dispatch_channel: tokio::sync::mpsc::Sender<FilterRequest>,
    log: slog::Logger,
}

impl Iptables {
    pub fn new(
        config: FirewallConfig,
        resolver: Resolver,
        log: slog::Logger,
    ) -> Iptables {
        let (sender, receiver) = tokio::sync::mpsc::channel(64);
        let local_logger = log.clone();
        tokio::task::spawn(async move {
            let mut worker = FilterWorker {
                config,
                resolver,
                active_chain: DenyChain::A,
                resolved: BTreeMap::new(),
                log,
            };
            worker.run(receiver).await;
        });
        Iptables {
            dispatch_channel: sender,
            log: local_logger,
        }
    }

    pub async fn install_base(&self) -> Result<(), FirewallError> {
        self.dispatch(|reply| FilterRequest::InstallBase { reply }).await
    }

    pub async fn sync_policy(&self, policy: PolicyConfig) -> Result<(), FirewallError> {
        self.dispatch(|reply| FilterRequest::SyncPolicy { policy, reply })
            .await
    }

    pub async fn allow_client(&self, ip: IpAddr) -> Result<(), FirewallError> {
        self.dispatch(|reply| FilterRequest::AllowClient { ip, reply })
            .await
    }

    pub async fn deny_client(&self, ip: IpAddr) -> Result<(), FirewallError> {
        self.dispatch(|reply| FilterRequest::DenyClient { ip, reply })
            .await
    }

    /// Re-resolve all blocked hostnames and rewrite the deny layer if any
    /// address set changed. Returns whether a rewrite happened.
    pub async fn refresh_ips(&self, policy: PolicyConfig) -> Result<bool, FirewallError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(FilterRequest::RefreshIps {
                policy,
                reply: reply_tx,
            })
            .await
            .or(Err(FirewallError::CommunicationError))?;
        reply_rx.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive filter worker result"; "error" => e.to_string());
            Err(FirewallError::CommunicationError)
        })
    }

    pub async fn reset_all(&self) -> Result<(), FirewallError> {
        self.dispatch(|reply| FilterRequest::ResetAll { reply }).await
    }

    async fn dispatch<F>(&self, build: F) -> Result<(), FirewallError>
    where
        F: FnOnce(tokio::sync::oneshot::Sender<Result<(), FirewallError>>) -> FilterRequest,
    {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.dispatch_channel
            .send(build(reply_tx))
            .await
            .or(Err(FirewallError::CommunicationError))?;
        reply_rx.await.unwrap_or_else(|e| {
            slog::error!(self.log, "failed to receive filter worker result"; "error" => e.to_string());
            Err(FirewallError::CommunicationError)
        })
    }
}

enum FilterRequest {
    InstallBase {
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    SyncPolicy {
        policy: PolicyConfig,
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    AllowClient {
        ip: IpAddr,
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    DenyClient {
        ip: IpAddr,
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
    RefreshIps {
        policy: PolicyConfig,
        reply: tokio::sync::oneshot::Sender<Result<bool, FirewallError>>,
    },
    ResetAll {
        reply: tokio::sync::oneshot::Sender<Result<(), FirewallError>>,
    },
}

struct FilterWorker {
    config: FirewallConfig,
    resolver: Resolver,
    active_chain: DenyChain,
    // Last successfully resolved address set per blocked hostname. Retained
    // across failed re-resolutions so a flaky resolver never fails open.
    resolved: BTreeMap<String, BTreeSet<Ipv4Addr>>,
    log: slog::Logger,
}

impl FilterWorker {
    async fn run(&mut self, mut chan: tokio::sync::mpsc::Receiver<FilterRequest>) {
        while let Some(request) = chan.recv().await {
            match request {
                FilterRequest::InstallBase { reply } => {
                    let result = self.install_base().await;
                    let _ = reply.send(result);
                }
                FilterRequest::SyncPolicy { policy, reply } => {
                    let result = self.sync_policy(&policy).await;
                    let _ = reply.send(result);
                }
                FilterRequest::AllowClient { ip, reply } => {
                    let result = self.allow_client(ip).await;
                    let _ = reply.send(result);
                }
                FilterRequest::DenyClient { ip, reply } => {
                    let result = self.deny_client(ip).await;
                    let _ = reply.send(result);
                }
                FilterRequest::RefreshIps { policy, reply } => {
                    let result = self.refresh_ips(&policy).await;
                    let _ = reply.send(result);
                }
                FilterRequest::ResetAll { reply } => {
                    let result = self.reset_all().await;
                    let _ = reply.send(result);
                }
            }
        }
        slog::debug!(self.log, "filter worker shutting down");
    }

    // Install the fixed NAT, redirection, and chain skeleton. Every rule is
    // probed with `-C` before insertion so repeat application leaves the
    // filter state unchanged.
    async fn install_base(&mut self) -> Result<(), FirewallError> {
        self.sysctl("net.ipv4.ip_forward=1").await?;
        // IPv6 is disabled on the hotspot side entirely; traffic that does
        // not traverse the IPv4 forward chains must not exist.
        for key in [
            "net.ipv6.conf.all.disable_ipv6=1",
            "net.ipv6.conf.default.disable_ipv6=1",
        ] {
            if let Err(e) = self.sysctl(key).await {
                slog::warn!(self.log, "failed to disable IPv6"; "key" => key, "error" => e.to_string());
            }
        }

        for chain in [DenyChain::A, DenyChain::B] {
            // Creation fails when the chain already exists, which is fine.
            let _ = self.iptables_status(&["-N", chain.name()]).await;
        }

        let uplink = self.config.uplink_interface.clone();
        let hotspot = self.config.hotspot_interface.clone();
        let portal_port = self.config.portal_port.to_string();

        self.ensure_rule(&[
            "-t", "nat", "POSTROUTING", "-o", &uplink, "-j", "MASQUERADE",
        ])
        .await?;
        self.ensure_rule(&[
            "-t", "nat", "PREROUTING", "-i", &hotspot, "-p", "tcp", "--dport", "80",
            "-j", "REDIRECT", "--to-ports", &portal_port,
        ])
        .await?;

        // The hotspot must always reach DHCP, DNS, and the portal itself.
        self.ensure_rule(&[
            "INPUT", "-i", &hotspot, "-p", "udp", "--dport", "67:68", "-j", "ACCEPT",
        ])
        .await?;
        self.ensure_rule(&[
            "INPUT", "-i", &hotspot, "-p", "udp", "--dport", "53", "-j", "ACCEPT",
        ])
        .await?;
        self.ensure_rule(&[
            "INPUT", "-i", &hotspot, "-p", "tcp", "--dport", &portal_port, "-j", "ACCEPT",
        ])
        .await?;

        // Jump into the active deny chain from position 1 of FORWARD. The
        // deny layer must precede every per-client allow.
        let jump_a = self.rule_present(&["FORWARD", "-j", DenyChain::A.name()]).await;
        let jump_b = self.rule_present(&["FORWARD", "-j", DenyChain::B.name()]).await;
        match (jump_a, jump_b) {
            (true, _) => self.active_chain = DenyChain::A,
            (false, true) => self.active_chain = DenyChain::B,
            (false, false) => {
                self.run_checked(&["-I", "FORWARD", "1", "-j", DenyChain::A.name()])
                    .await?;
                self.active_chain = DenyChain::A;
            }
        }

        self.ensure_rule(&[
            "FORWARD", "-i", &uplink, "-o", &hotspot, "-m", "state", "--state",
            "RELATED,ESTABLISHED", "-j", "ACCEPT",
        ])
        .await?;
        // Trailing default drop: unauthenticated clients reach only the
        // portal. Appended so per-client allows inserted at position 2 stay
        // in front of it.
        self.ensure_rule(&[
            "FORWARD", "-i", &hotspot, "-o", &uplink, "-j", "DROP",
        ])
        .await?;
        self.run_checked(&["-P", "FORWARD", "DROP"]).await?;

        slog::info!(self.log, "base filter installed";
            "hotspot" => &self.config.hotspot_interface,
            "uplink" => &self.config.uplink_interface,
            "active_chain" => self.active_chain.name());
        Ok(())
    }

    async fn sync_policy(&mut self, policy: &PolicyConfig) -> Result<(), FirewallError> {
        self.resolve_blocked(policy).await;
        self.rewrite_deny_chain().await
    }

    async fn refresh_ips(&mut self, policy: &PolicyConfig) -> Result<bool, FirewallError> {
        let previous = self.resolved.clone();
        self.resolve_blocked(policy).await;
        if self.resolved == previous {
            slog::debug!(self.log, "blocked address sets unchanged");
            return Ok(false);
        }
        slog::info!(self.log, "blocked address sets changed, rewriting deny layer");
        self.rewrite_deny_chain().await?;
        Ok(true)
    }

    // Resolve every blocked hostname, keeping the previous address set for
    // hostnames whose resolution fails outright (fail closed) and dropping
    // entries that are no longer blocked. A successful resolution always
    // wins, even when it shrinks the set.
    async fn resolve_blocked(&mut self, policy: &PolicyConfig) {
        let blocked = policy.blocked_hostnames();
        let mut fresh = BTreeMap::new();
        for hostname in &blocked {
            match self.resolver.resolve_ipv4(hostname).await {
                Ok(addresses) => {
                    slog::debug!(self.log, "resolved blocked hostname";
                        "hostname" => hostname, "addresses" => addresses.len());
                    fresh.insert(hostname.clone(), addresses);
                }
                Err(e) => match self.resolved.get(hostname) {
                    Some(previous) => {
                        slog::warn!(self.log, "resolution failed, retaining previous addresses";
                            "hostname" => hostname, "error" => e.to_string());
                        fresh.insert(hostname.clone(), previous.clone());
                    }
                    None => {
                        slog::warn!(self.log, "resolution failed, skipping hostname";
                            "hostname" => hostname, "error" => e.to_string());
                    }
                },
            }
        }
        self.resolved = fresh;
    }

    // Build the inactive chain from the current resolution table, then flip
    // the FORWARD jump to it with a single rule replacement and flush the
    // retired chain.
    async fn rewrite_deny_chain(&mut self) -> Result<(), FirewallError> {
        let staging = self.active_chain.other();
        self.run_checked(&["-F", staging.name()]).await?;

        for entry in deny_chain_entries(staging.name(), &self.resolved) {
            let args: Vec<&str> = entry.iter().map(String::as_str).collect();
            self.run_checked(&args).await?;
        }

        self.run_checked(&["-R", "FORWARD", "1", "-j", staging.name()])
            .await?;
        let retired = self.active_chain;
        self.active_chain = staging;
        self.run_checked(&["-F", retired.name()]).await?;

        let total_addresses: usize = self.resolved.values().map(BTreeSet::len).sum();
        slog::info!(self.log, "deny layer rewritten";
            "hostnames" => self.resolved.len(),
            "addresses" => total_addresses,
            "active_chain" => self.active_chain.name());
        Ok(())
    }

    async fn allow_client(&mut self, ip: IpAddr) -> Result<(), FirewallError> {
        let rule = allow_rule_spec(
            &self.config.hotspot_interface,
            &self.config.uplink_interface,
            ip,
        );
        let check: Vec<&str> = rule.iter().map(String::as_str).collect();
        if self.rule_present(&check).await {
            slog::info!(self.log, "forwarding allowance already present"; "ip" => ip.to_string());
            return Ok(());
        }
        // Position 2: immediately after the deny-chain jump, ahead of the
        // trailing default drop.
        let mut args = vec!["-I", "FORWARD", "2"];
        args.extend(check.iter().skip(1).copied());
        self.run_checked(&args).await?;
        slog::info!(self.log, "client forwarding allowed"; "ip" => ip.to_string());
        Ok(())
    }

    async fn deny_client(&mut self, ip: IpAddr) -> Result<(), FirewallError> {
        let rule = allow_rule_spec(
            &self.config.hotspot_interface,
            &self.config.uplink_interface,
            ip,
        );
        let check: Vec<&str> = rule.iter().map(String::as_str).collect();
        if !self.rule_present(&check).await {
            slog::debug!(self.log, "no forwarding allowance to remove"; "ip" => ip.to_string());
            return Ok(());
        }
        let mut args = vec!["-D"];
        args.extend(check.iter().copied());
        self.run_checked(&args).await?;
        slog::info!(self.log, "client forwarding denied"; "ip" => ip.to_string());
        Ok(())
    }

    // Tear down everything the engine installed and rebuild the baseline.
    // Per-client allowances are gone afterwards; the caller re-installs them
    // from the session store.
    async fn reset_all(&mut self) -> Result<(), FirewallError> {
        slog::warn!(self.log, "resetting all filter state");
        let (required, tolerated) = reset_teardown_plan();
        for entry in &required {
            let args: Vec<&str> = entry.iter().map(String::as_str).collect();
            self.run_checked(&args).await?;
        }
        for entry in &tolerated {
            // Deleting a chain that was never created fails, which is fine.
            let args: Vec<&str> = entry.iter().map(String::as_str).collect();
            let _ = self.iptables_status(&args).await;
        }
        self.active_chain = DenyChain::A;
        self.install_base().await?;
        self.rewrite_deny_chain().await
    }

    // `-C` probes report rule presence through the exit status; a non-zero
    // exit is an answer, not a failure.
    async fn rule_present(&self, rule: &[&str]) -> bool {
        let mut args = vec!["-C"];
        let mut rest = rule.to_vec();
        if rule.first() == Some(&"-t") {
            // Table selector precedes the -C verb.
            args = vec![rule[0], rule[1], "-C"];
            rest = rule[2..].to_vec();
        }
        args.extend(rest);
        matches!(self.iptables_status(&args).await, Ok(true))
    }

    async fn ensure_rule(&self, rule: &[&str]) -> Result<(), FirewallError> {
        if self.rule_present(rule).await {
            return Ok(());
        }
        let mut args = vec!["-A"];
        let mut rest = rule.to_vec();
        if rule.first() == Some(&"-t") {
            args = vec![rule[0], rule[1], "-A"];
            rest = rule[2..].to_vec();
        }
        args.extend(rest);
        self.run_checked(&args).await
    }

    // Best-effort with one retry; persistent failure is surfaced to the
    // caller, which decides whether it is fatal.
    async fn run_checked(&self, args: &[&str]) -> Result<(), FirewallError> {
        for attempt in 0..2 {
            match self.iptables_status(args).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    slog::warn!(self.log, "iptables command returned failure";
                        "args" => args.join(" "), "attempt" => attempt);
                }
                Err(e) => {
                    slog::warn!(self.log, "iptables command did not run";
                        "args" => args.join(" "), "attempt" => attempt, "error" => e.to_string());
                }
            }
        }
        Err(FirewallError::CommandFailed(args.join(" ")))
    }

    async fn iptables_status(&self, args: &[&str]) -> Result<bool, FirewallError> {
        let status = tokio::process::Command::new("iptables").args(args).status();
        let status = tokio::time::timeout(self.config.command_timeout, status)
            .await
            .map_err(|_| FirewallError::CommandTimeout(args.join(" ")))??;
        Ok(status.success())
    }

    async fn sysctl(&self, assignment: &str) -> Result<(), FirewallError> {
        let status = tokio::process::Command::new("sysctl")
            .args(&["-w", assignment])
            .status();
        let status = tokio::time::timeout(self.config.command_timeout, status)
            .await
            .map_err(|_| FirewallError::CommandTimeout(assignment.to_owned()))??;
        if !status.success() {
            return Err(FirewallError::CommandFailed(assignment.to_owned()));
        }
        Ok(())
    }
}

// The per-client allowance in `-C`/`-D` argument form (without the verb).
fn allow_rule_spec(hotspot_interface: &str, uplink_interface: &str, ip: IpAddr) -> Vec<String> {
    vec![
        "FORWARD".to_owned(),
        "-s".to_owned(),
        ip.to_string(),
        "-i".to_owned(),
        hotspot_interface.to_owned(),
        "-o".to_owned(),
        uplink_interface.to_owned(),
        "-j".to_owned(),
        "ACCEPT".to_owned(),
    ]
}

// The teardown executed by a full reset, in order: first the built-in
// chains the engine writes to, which must flush cleanly, then the engine's
// own chains, whose deletion is tolerated to fail when they were never
// created. The baseline is reinstalled afterwards.
fn reset_teardown_plan() -> (Vec<Vec<String>>, Vec<Vec<String>>) {
    let required = vec![
        vec!["-F".to_owned(), "FORWARD".to_owned()],
        vec!["-F".to_owned(), "INPUT".to_owned()],
        vec!["-t".to_owned(), "nat".to_owned(), "-F".to_owned()],
    ];
    let tolerated = [DenyChain::A, DenyChain::B]
        .iter()
        .flat_map(|chain| {
            [
                vec!["-F".to_owned(), chain.name().to_owned()],
                vec!["-X".to_owned(), chain.name().to_owned()],
            ]
        })
        .collect();
    (required, tolerated)
}

// Every append needed to fill a deny chain: unconditional public-resolver
// drops, then a plain drop and an explicit UDP/443 (QUIC) drop per blocked
// address.
fn deny_chain_entries(
    chain: &str,
    resolved: &BTreeMap<String, BTreeSet<Ipv4Addr>>,
) -> Vec<Vec<String>> {
    let mut entries = Vec::new();
    for resolver in PUBLIC_RESOLVERS {
        entries.push(vec![
            "-A".to_owned(),
            chain.to_owned(),
            "-d".to_owned(),
            (*resolver).to_owned(),
            "-j".to_owned(),
            "DROP".to_owned(),
        ]);
    }
    for addresses in resolved.values() {
        for address in addresses {
            entries.push(vec![
                "-A".to_owned(),
                chain.to_owned(),
                "-d".to_owned(),
                address.to_string(),
                "-j".to_owned(),
                "DROP".to_owned(),
            ]);
            entries.push(vec![
                "-A".to_owned(),
                chain.to_owned(),
                "-d".to_owned(),
                address.to_string(),
                "-p".to_owned(),
                "udp".to_owned(),
                "--dport".to_owned(),
                "443".to_owned(),
                "-j".to_owned(),
                "DROP".to_owned(),
            ]);
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn resolved_fixture() -> BTreeMap<String, BTreeSet<Ipv4Addr>> {
        let mut resolved = BTreeMap::new();
        resolved.insert(
            "example.net".to_owned(),
            [Ipv4Addr::from_str("93.184.216.34").unwrap()]
                .into_iter()
                .collect(),
        );
        resolved
    }

    #[test]
    fn test_allow_rule_matches_forward_layout() {
        let rule = allow_rule_spec("wlan0", "eth0", IpAddr::from_str("10.0.0.7").unwrap());
        assert_eq!(
            rule,
            vec!["FORWARD", "-s", "10.0.0.7", "-i", "wlan0", "-o", "eth0", "-j", "ACCEPT"]
        );
    }

    #[test]
    fn test_deny_chain_entries_cover_tcp_and_quic() {
        let entries = deny_chain_entries("WARDEN_DENY_B", &resolved_fixture());
        let plain: Vec<_> = entries
            .iter()
            .filter(|entry| entry.contains(&"93.184.216.34".to_owned()))
            .collect();
        assert_eq!(plain.len(), 2);
        assert!(plain.iter().any(|entry| !entry.contains(&"udp".to_owned())));
        assert!(plain
            .iter()
            .any(|entry| entry.contains(&"udp".to_owned()) && entry.contains(&"443".to_owned())));
        // All entries target the staging chain.
        assert!(entries
            .iter()
            .all(|entry| entry[1] == "WARDEN_DENY_B" && entry[0] == "-A"));
    }

    #[test]
    fn test_deny_chain_entries_force_local_resolver() {
        let entries = deny_chain_entries("WARDEN_DENY_A", &BTreeMap::new());
        let dropped: Vec<_> = entries.iter().map(|entry| entry[3].as_str()).collect();
        assert_eq!(dropped, vec!["8.8.8.8", "8.8.4.4", "1.1.1.1", "1.0.0.1"]);
    }

    #[test]
    fn test_deny_chains_alternate() {
        assert_eq!(DenyChain::A.other(), DenyChain::B);
        assert_eq!(DenyChain::B.other(), DenyChain::A);
        assert_ne!(DenyChain::A.name(), DenyChain::B.name());
    }

    #[test]
    fn test_reset_teardown_covers_every_written_chain() {
        let (required, tolerated) = reset_teardown_plan();
        // The built-in chains the engine appends to must all be flushed.
        assert!(required.contains(&vec!["-F".to_owned(), "FORWARD".to_owned()]));
        assert!(required.contains(&vec!["-F".to_owned(), "INPUT".to_owned()]));
        assert!(required.contains(&vec![
            "-t".to_owned(),
            "nat".to_owned(),
            "-F".to_owned()
        ]));
        // Both deny chains are flushed and then deleted, in that order: a
        // chain still holding rules cannot be deleted.
        for chain in [DenyChain::A, DenyChain::B] {
            let flush = tolerated
                .iter()
                .position(|entry| entry[0] == "-F" && entry[1] == chain.name())
                .unwrap();
            let delete = tolerated
                .iter()
                .position(|entry| entry[0] == "-X" && entry[1] == chain.name())
                .unwrap();
            assert!(flush < delete);
        }
    }

    #[test]
    fn test_sync_is_idempotent_for_unchanged_resolution() {
        // Rewriting the deny layer from the same resolution table must
        // produce the same chain contents regardless of which chain is
        // active.
        let resolved = resolved_fixture();
        let first: Vec<_> = deny_chain_entries("WARDEN_DENY_A", &resolved)
            .into_iter()
            .map(|mut entry| {
                entry.remove(1);
                entry
            })
            .collect();
        let second: Vec<_> = deny_chain_entries("WARDEN_DENY_B", &resolved)
            .into_iter()
            .map(|mut entry| {
                entry.remove(1);
                entry
            })
            .collect();
        assert_eq!(first, second);
    }
}
