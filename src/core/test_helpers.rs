//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::error::{Family, Result};
use crate::core::shell::{CommandResult, CommandRunner};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("VPN_BYPASS_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("VPN_BYPASS_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

type ChainKey = (Family, String, String);

#[derive(Default)]
struct FirewallState {
    chains: HashMap<ChainKey, Vec<String>>,
    commands: Vec<String>,
    failures: Vec<(Family, String)>,
    hangs: Vec<(Family, String)>,
    reject_duplicates: bool,
}

/// In-memory iptables/ip6tables that answers the command lines produced by
/// [`crate::core::chain::ChainController`].
///
/// Behaves like the real tools where the rule managers depend on it:
/// `-N` on an existing chain, `-A`/`-F`/`-S` on a missing one, `-D` of an
/// absent rule and `-X` of a non-empty or referenced chain all fail. Builtin
/// (uppercase) chains always exist. Duplicate `-A` is accepted unless
/// [`FakeFirewall::reject_duplicates`] is switched on.
#[derive(Default)]
pub struct FakeFirewall {
    state: Mutex<FirewallState>,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FirewallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command line received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Rules of `chain`, or `None` if the chain does not exist
    pub fn rules(&self, family: Family, table: &str, chain: &str) -> Option<Vec<String>> {
        let state = self.lock();
        let key = (family, table.to_string(), chain.to_string());
        match state.chains.get(&key) {
            Some(rules) => Some(rules.clone()),
            None if is_builtin(chain) => Some(Vec::new()),
            None => None,
        }
    }

    pub fn reject_duplicates(&self, reject: bool) {
        self.lock().reject_duplicates = reject;
    }

    /// Makes every `family` command containing `pattern` exit with status 1.
    /// An empty pattern breaks the whole family.
    pub fn fail_when(&self, family: Family, pattern: &str) {
        self.lock().failures.push((family, pattern.to_string()));
    }

    /// Lifts all injected failures
    pub fn heal(&self) {
        self.lock().failures.clear();
    }

    /// Makes every `family` command containing `pattern` never complete
    pub fn hang_when(&self, family: Family, pattern: &str) {
        self.lock().hangs.push((family, pattern.to_string()));
    }

    fn execute(&self, command: &str) -> Outcome {
        let mut state = self.lock();
        state.commands.push(command.to_string());

        let Some(parsed) = Parsed::from_command(command) else {
            return Outcome::Done(failure(2, format!("sh: unrecognised command: {command}")));
        };

        let matches = |rules: &[(Family, String)]| {
            rules
                .iter()
                .any(|(family, pattern)| *family == parsed.family && command.contains(pattern))
        };
        if matches(&state.hangs) {
            return Outcome::Hang;
        }
        if matches(&state.failures) {
            return Outcome::Done(failure(1, format!("{}: injected failure", parsed.binary)));
        }

        Outcome::Done(state.apply(&parsed))
    }
}

impl CommandRunner for FakeFirewall {
    async fn run_command(&self, command: &str) -> Result<CommandResult> {
        match self.execute(command) {
            Outcome::Done(result) => Ok(result),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

enum Outcome {
    Done(CommandResult),
    Hang,
}

struct Parsed<'a> {
    family: Family,
    binary: &'a str,
    table: &'a str,
    op: &'a str,
    chain: &'a str,
    rule: String,
}

impl<'a> Parsed<'a> {
    /// `<binary> -t <table> <op> <chain> [rule...]`
    fn from_command(command: &'a str) -> Option<Self> {
        let mut tokens = command.split_whitespace();
        let binary = tokens.next()?;
        let family = if binary.ends_with("ip6tables") {
            Family::V6
        } else if binary.ends_with("iptables") {
            Family::V4
        } else {
            return None;
        };
        if tokens.next()? != "-t" {
            return None;
        }
        let table = tokens.next()?;
        let op = tokens.next()?;
        let chain = tokens.next()?;
        let rule = tokens.collect::<Vec<_>>().join(" ");
        Some(Self {
            family,
            binary,
            table,
            op,
            chain,
            rule,
        })
    }

    fn key(&self) -> ChainKey {
        (self.family, self.table.to_string(), self.chain.to_string())
    }
}

impl FirewallState {
    fn chain_mut(&mut self, parsed: &Parsed<'_>) -> Option<&mut Vec<String>> {
        let key = parsed.key();
        if is_builtin(parsed.chain) {
            return Some(self.chains.entry(key).or_default());
        }
        self.chains.get_mut(&key)
    }

    fn is_referenced(&self, parsed: &Parsed<'_>) -> bool {
        let jump = format!("-j {}", parsed.chain);
        self.chains.iter().any(|((family, table, _), rules)| {
            *family == parsed.family && table == parsed.table && rules.contains(&jump)
        })
    }

    fn apply(&mut self, parsed: &Parsed<'_>) -> CommandResult {
        let binary = parsed.binary;
        let no_chain = || {
            failure(
                1,
                format!("{binary}: No chain/target/match by that name."),
            )
        };

        match parsed.op {
            "-N" => {
                if self.chain_mut(parsed).is_some() {
                    return failure(1, format!("{binary}: Chain already exists."));
                }
                self.chains.insert(parsed.key(), Vec::new());
                ok("")
            }
            "-X" => {
                let Some(rules) = self.chains.get(&parsed.key()) else {
                    return no_chain();
                };
                if !rules.is_empty() {
                    return failure(1, format!("{binary}: Directory not empty."));
                }
                if self.is_referenced(parsed) {
                    return failure(1, format!("{binary}: Too many links."));
                }
                self.chains.remove(&parsed.key());
                ok("")
            }
            "-F" => match self.chain_mut(parsed) {
                Some(rules) => {
                    rules.clear();
                    ok("")
                }
                None => no_chain(),
            },
            "-S" => {
                let chain = parsed.chain;
                match self.chain_mut(parsed) {
                    Some(rules) => {
                        let mut listing = format!("-N {chain}\n");
                        for rule in rules.iter() {
                            listing.push_str(&format!("-A {chain} {rule}\n"));
                        }
                        ok(&listing)
                    }
                    None => no_chain(),
                }
            }
            "-C" => match self.chain_mut(parsed) {
                Some(rules) if rules.contains(&parsed.rule) => ok(""),
                Some(_) => failure(
                    1,
                    format!("{binary}: Bad rule (does a matching rule exist in that chain?)."),
                ),
                None => no_chain(),
            },
            "-A" => {
                let reject_duplicates = self.reject_duplicates;
                match self.chain_mut(parsed) {
                    Some(rules) if reject_duplicates && rules.contains(&parsed.rule) => {
                        failure(1, format!("{binary}: rule already present"))
                    }
                    Some(rules) => {
                        rules.push(parsed.rule.clone());
                        ok("")
                    }
                    None => no_chain(),
                }
            }
            "-D" => match self.chain_mut(parsed) {
                Some(rules) => match rules.iter().position(|rule| *rule == parsed.rule) {
                    Some(index) => {
                        rules.remove(index);
                        ok("")
                    }
                    None => failure(
                        1,
                        format!("{binary}: Bad rule (does a matching rule exist in that chain?)."),
                    ),
                },
                None => no_chain(),
            },
            other => failure(2, format!("{binary}: unknown option \"{other}\"")),
        }
    }
}

fn is_builtin(chain: &str) -> bool {
    chain.chars().all(|c| c.is_ascii_uppercase())
}

fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failure(exit_code: i32, stderr: String) -> CommandResult {
    CommandResult {
        exit_code,
        stdout: String::new(),
        stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builtin_chains_always_exist() {
        let firewall = FakeFirewall::new();
        assert_eq!(firewall.rules(Family::V4, "nat", "POSTROUTING"), Some(vec![]));
        assert_eq!(firewall.rules(Family::V4, "nat", "custom"), None);

        let result = firewall
            .run_command("iptables -t nat -S POSTROUTING")
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_families_are_separate() {
        let firewall = FakeFirewall::new();
        firewall
            .run_command("ip6tables -t filter -N chain")
            .await
            .unwrap();
        assert!(firewall.rules(Family::V6, "filter", "chain").is_some());
        assert!(firewall.rules(Family::V4, "filter", "chain").is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_and_heal() {
        let firewall = FakeFirewall::new();
        firewall.fail_when(Family::V4, "");

        let result = firewall.run_command("iptables -t filter -N x").await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("injected"));

        firewall.heal();
        let result = firewall.run_command("iptables -t filter -N x").await.unwrap();
        assert!(result.success());
    }
}
