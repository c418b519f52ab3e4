//! Per-family rule management
//!
//! A [`StackRuleManager`] owns the three custom chains of one protocol family:
//!
//! - `mangle/OUTPUT` → [`MARK_CHAIN`]: sets the bypass mark on selected UIDs
//! - `filter/OUTPUT` → [`FILTER_CHAIN`]: rejects selected UIDs (IPv6 fallback)
//! - `nat/POSTROUTING` → [`NAT_CHAIN`]: masquerades marked traffic
//!
//! Nothing is tracked locally. Every operation reads the kernel state back
//! (`-S`, `-C`) and only then mutates it, so repeating an operation is
//! harmless. Expected races are absorbed: appending to a chain that does not
//! exist yet creates it and retries, and appending a rule that is already
//! present counts as success.
//!
//! [`CombinedRuleManager`] fans every operation out to IPv4 first, then IPv6.

use crate::core::chain::ChainController;
use crate::core::error::{Family, Result};
use crate::core::shell::{CommandResult, CommandRunner};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Mark chain hooked into `mangle/OUTPUT`
pub const MARK_CHAIN: &str = "vpnbypass_mout";
/// Reject chain hooked into `filter/OUTPUT`
pub const FILTER_CHAIN: &str = "vpnbypass_fout";
/// Masquerade chain hooked into `nat/POSTROUTING`
pub const NAT_CHAIN: &str = "vpnbypass_npsr";

/// Packet mark (value/mask) routed outside the tunnel
pub const BYPASS_MARK: &str = "0x20000/0x20000";

pub fn mark_rule(uid: u32) -> String {
    format!("-m owner --uid-owner {uid} -j MARK --set-mark {BYPASS_MARK}")
}

pub fn reject_rule(uid: u32) -> String {
    format!("-m owner --uid-owner {uid} -j REJECT")
}

pub fn masquerade_rule() -> String {
    format!("-m mark --mark {BYPASS_MARK} -j MASQUERADE")
}

/// Rule-level operations shared by single-stack and combined managers
pub trait RuleManager: Send + Sync {
    fn add_uid(&self, uid: u32) -> impl Future<Output = Result<()>> + Send;
    fn remove_uid(&self, uid: u32) -> impl Future<Output = Result<()>> + Send;
    fn reject_uid(&self, uid: u32) -> impl Future<Output = Result<()>> + Send;
    fn unreject_uid(&self, uid: u32) -> impl Future<Output = Result<()>> + Send;
    fn clear_uids(&self) -> impl Future<Output = Result<()>> + Send;
    fn clear_and_add_uids(&self, uids: &[u32]) -> impl Future<Output = Result<()>> + Send;
    fn clear_and_reject_uids(&self, uids: &[u32]) -> impl Future<Output = Result<()>> + Send;
    fn cleanup(&self) -> impl Future<Output = Result<()>> + Send;
    fn enable(&self) -> impl Future<Output = Result<()>> + Send;
    fn disable(&self) -> impl Future<Output = Result<()>> + Send;
    fn masquerade(&self) -> impl Future<Output = Result<()>> + Send;
    fn unmasquerade(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The three chains of one protocol family
pub struct StackRuleManager<R> {
    family: Family,
    mark: ChainController<R>,
    filter: ChainController<R>,
    nat: ChainController<R>,
    lock: Mutex<()>,
}

impl<R: CommandRunner> StackRuleManager<R> {
    pub fn new(runner: Arc<R>, family: Family, binary: &str) -> Self {
        let chain = |table, parent, name| {
            ChainController::new(Arc::clone(&runner), family, binary, table, parent, name)
        };
        Self {
            family,
            mark: chain("mangle", "OUTPUT", MARK_CHAIN),
            filter: chain("filter", "OUTPUT", FILTER_CHAIN),
            nat: chain("nat", "POSTROUTING", NAT_CHAIN),
            lock: Mutex::new(()),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn enforce(&self, result: CommandResult) -> Result<()> {
        if result.success() {
            Ok(())
        } else {
            Err(self.family.rule_error(result))
        }
    }

    /// UIDs currently marked for bypass. A missing mark chain yields none.
    pub async fn list_uids(&self) -> Result<Vec<u32>> {
        let _guard = self.lock.lock().await;
        let result = self.mark.list_rules().await?;
        if !result.success() {
            return Ok(Vec::new());
        }
        Ok(parse_uids(&result.stdout, |line| {
            line.contains("-j MARK") && line.contains(BYPASS_MARK)
        }))
    }

    /// UIDs currently rejected in the filter chain
    pub async fn list_rejected_uids(&self) -> Result<Vec<u32>> {
        let _guard = self.lock.lock().await;
        let result = self.filter.list_rules().await?;
        if !result.success() {
            return Ok(Vec::new());
        }
        Ok(parse_uids(&result.stdout, |line| line.contains("-j REJECT")))
    }

    async fn toggle(&self, chain: &ChainController<R>, rule: &str, on: bool) -> Result<()> {
        if !on {
            if chain.has_rule(rule).await? {
                self.enforce(chain.remove_rule(rule).await?)?;
            }
            return Ok(());
        }

        let mut created = false;
        loop {
            let result = chain.add_rule(rule).await?;
            if result.success() {
                return Ok(());
            }
            if !created && !chain.exists().await? {
                debug!(
                    family = %chain.family(),
                    table = chain.table(),
                    chain = chain.name(),
                    "creating missing chain"
                );
                self.enforce(chain.create().await?)?;
                created = true;
                continue;
            }
            if chain.has_rule(rule).await? {
                return Ok(());
            }
            return self.enforce(result);
        }
    }

    /// Creates `chain` if absent, otherwise empties it
    async fn reset(&self, chain: &ChainController<R>) -> Result<()> {
        if chain.exists().await? {
            self.enforce(chain.flush().await?)
        } else {
            self.enforce(chain.create().await?)
        }
    }

    async fn hook(&self, chain: &ChainController<R>) -> Result<()> {
        if !chain.exists().await? {
            self.enforce(chain.create().await?)?;
        }
        if !chain.is_enabled().await? {
            debug!(
                family = %chain.family(),
                table = chain.table(),
                parent = chain.parent(),
                chain = chain.name(),
                "hooking chain"
            );
            self.enforce(chain.enable().await?)?;
        }
        Ok(())
    }

    /// Flush, unhook and delete `chain` if it exists
    async fn tear_down(&self, chain: &ChainController<R>) -> Result<()> {
        if chain.exists().await? {
            self.enforce(chain.flush().await?)?;
            if chain.is_enabled().await? {
                self.enforce(chain.disable().await?)?;
            }
            self.enforce(chain.delete().await?)?;
        }
        Ok(())
    }

    /// Hooks only the reject chain, leaving the mark chain alone
    pub async fn enable_reject(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.hook(&self.filter).await
    }

    async fn add_each(
        &self,
        chain: &ChainController<R>,
        uids: &[u32],
        rule: fn(u32) -> String,
    ) -> Result<()> {
        for &uid in uids {
            self.enforce(chain.add_rule(&rule(uid)).await?)?;
        }
        Ok(())
    }
}

impl<R: CommandRunner> RuleManager for StackRuleManager<R> {
    async fn add_uid(&self, uid: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.toggle(&self.mark, &mark_rule(uid), true).await
    }

    async fn remove_uid(&self, uid: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.toggle(&self.mark, &mark_rule(uid), false).await
    }

    async fn reject_uid(&self, uid: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.toggle(&self.filter, &reject_rule(uid), true).await
    }

    async fn unreject_uid(&self, uid: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.toggle(&self.filter, &reject_rule(uid), false).await
    }

    async fn clear_uids(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for chain in [&self.mark, &self.filter] {
            if chain.exists().await? {
                self.enforce(chain.flush().await?)?;
            }
        }
        Ok(())
    }

    /// Replaces the mark rules with `uids`; also empties the reject chain
    /// when present so stale IPv6 rejects do not outlive a reselection.
    async fn clear_and_add_uids(&self, uids: &[u32]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.reset(&self.mark).await?;
        if self.filter.exists().await? {
            self.enforce(self.filter.flush().await?)?;
        }
        self.add_each(&self.mark, uids, mark_rule).await
    }

    async fn clear_and_reject_uids(&self, uids: &[u32]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.reset(&self.filter).await?;
        self.add_each(&self.filter, uids, reject_rule).await
    }

    async fn cleanup(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for chain in [&self.mark, &self.filter, &self.nat] {
            self.tear_down(chain).await?;
        }
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for chain in [&self.mark, &self.filter] {
            self.hook(chain).await?;
        }
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        for chain in [&self.mark, &self.filter] {
            if chain.is_enabled().await? {
                self.enforce(chain.disable().await?)?;
            }
        }
        Ok(())
    }

    async fn masquerade(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.hook(&self.nat).await?;
        let rule = masquerade_rule();
        if !self.nat.has_rule(&rule).await? {
            self.enforce(self.nat.add_rule(&rule).await?)?;
        }
        Ok(())
    }

    async fn unmasquerade(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.tear_down(&self.nat).await
    }
}

/// Extracts `--uid-owner <uid>` from `-S` lines accepted by `keep`
fn parse_uids(listing: &str, keep: impl Fn(&str) -> bool) -> Vec<u32> {
    listing
        .lines()
        .filter(|line| keep(line))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|token| *token == "--uid-owner")?;
            tokens.next()?.parse().ok()
        })
        .collect()
}

/// IPv4 and IPv6 managers driven together, IPv4 always first
pub struct CombinedRuleManager<R> {
    ipv4: StackRuleManager<R>,
    ipv6: StackRuleManager<R>,
}

impl<R: CommandRunner> CombinedRuleManager<R> {
    pub fn new(runner: Arc<R>, ipv4_binary: &str, ipv6_binary: &str) -> Self {
        Self {
            ipv4: StackRuleManager::new(Arc::clone(&runner), Family::V4, ipv4_binary),
            ipv6: StackRuleManager::new(runner, Family::V6, ipv6_binary),
        }
    }

    /// Managers using the stock `iptables` and `ip6tables` binaries
    pub fn with_default_binaries(runner: Arc<R>) -> Self {
        Self::new(
            runner,
            Family::V4.default_binary(),
            Family::V6.default_binary(),
        )
    }

    pub fn ipv4(&self) -> &StackRuleManager<R> {
        &self.ipv4
    }

    pub fn ipv6(&self) -> &StackRuleManager<R> {
        &self.ipv6
    }

    pub fn stack(&self, family: Family) -> &StackRuleManager<R> {
        match family {
            Family::V4 => &self.ipv4,
            Family::V6 => &self.ipv6,
        }
    }
}

impl<R: CommandRunner> RuleManager for CombinedRuleManager<R> {
    async fn add_uid(&self, uid: u32) -> Result<()> {
        self.ipv4.add_uid(uid).await?;
        self.ipv6.add_uid(uid).await
    }

    async fn remove_uid(&self, uid: u32) -> Result<()> {
        self.ipv4.remove_uid(uid).await?;
        self.ipv6.remove_uid(uid).await
    }

    async fn reject_uid(&self, uid: u32) -> Result<()> {
        self.ipv4.reject_uid(uid).await?;
        self.ipv6.reject_uid(uid).await
    }

    async fn unreject_uid(&self, uid: u32) -> Result<()> {
        self.ipv4.unreject_uid(uid).await?;
        self.ipv6.unreject_uid(uid).await
    }

    async fn clear_uids(&self) -> Result<()> {
        self.ipv4.clear_uids().await?;
        self.ipv6.clear_uids().await
    }

    async fn clear_and_add_uids(&self, uids: &[u32]) -> Result<()> {
        self.ipv4.clear_and_add_uids(uids).await?;
        self.ipv6.clear_and_add_uids(uids).await
    }

    async fn clear_and_reject_uids(&self, uids: &[u32]) -> Result<()> {
        self.ipv4.clear_and_reject_uids(uids).await?;
        self.ipv6.clear_and_reject_uids(uids).await
    }

    async fn cleanup(&self) -> Result<()> {
        self.ipv4.cleanup().await?;
        self.ipv6.cleanup().await
    }

    async fn enable(&self) -> Result<()> {
        self.ipv4.enable().await?;
        self.ipv6.enable().await
    }

    async fn disable(&self) -> Result<()> {
        self.ipv4.disable().await?;
        self.ipv6.disable().await
    }

    async fn masquerade(&self) -> Result<()> {
        self.ipv4.masquerade().await?;
        self.ipv6.masquerade().await
    }

    async fn unmasquerade(&self) -> Result<()> {
        self.ipv4.unmasquerade().await?;
        self.ipv6.unmasquerade().await
    }
}
