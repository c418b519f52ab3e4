//! Custom iptables chain
//!
//! A [`ChainController`] names one chain (`table`, parent hook chain, chain
//! name) for one protocol family and turns each administrative verb into a
//! single command line for the root shell. It holds no state of its own: every
//! question is answered by asking the kernel.

use crate::core::error::{Family, Result};
use crate::core::shell::{CommandResult, CommandRunner};
use std::sync::Arc;

pub struct ChainController<R> {
    runner: Arc<R>,
    family: Family,
    binary: String,
    table: &'static str,
    parent: &'static str,
    name: &'static str,
}

impl<R: CommandRunner> ChainController<R> {
    pub fn new(
        runner: Arc<R>,
        family: Family,
        binary: impl Into<String>,
        table: &'static str,
        parent: &'static str,
        name: &'static str,
    ) -> Self {
        Self {
            runner,
            family,
            binary: binary.into(),
            table,
            parent,
            name,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn parent(&self) -> &'static str {
        self.parent
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, args: &str) -> Result<CommandResult> {
        self.runner
            .run_command(&format!("{} -t {} {args}", self.binary, self.table))
            .await
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(self.list_rules().await?.success())
    }

    pub async fn create(&self) -> Result<CommandResult> {
        self.run(&format!("-N {}", self.name)).await
    }

    pub async fn delete(&self) -> Result<CommandResult> {
        self.run(&format!("-X {}", self.name)).await
    }

    pub async fn flush(&self) -> Result<CommandResult> {
        self.run(&format!("-F {}", self.name)).await
    }

    /// Whether the parent chain jumps to this chain
    pub async fn is_enabled(&self) -> Result<bool> {
        Ok(self
            .run(&format!("-C {} -j {}", self.parent, self.name))
            .await?
            .success())
    }

    /// Appends a jump from the parent chain to this chain
    pub async fn enable(&self) -> Result<CommandResult> {
        self.run(&format!("-A {} -j {}", self.parent, self.name)).await
    }

    pub async fn disable(&self) -> Result<CommandResult> {
        self.run(&format!("-D {} -j {}", self.parent, self.name)).await
    }

    /// `-S` listing; a non-zero exit means the chain does not exist
    pub async fn list_rules(&self) -> Result<CommandResult> {
        self.run(&format!("-S {}", self.name)).await
    }

    pub async fn has_rule(&self, rule: &str) -> Result<bool> {
        Ok(self
            .run(&format!("-C {} {rule}", self.name))
            .await?
            .success())
    }

    pub async fn add_rule(&self, rule: &str) -> Result<CommandResult> {
        self.run(&format!("-A {} {rule}", self.name)).await
    }

    pub async fn remove_rule(&self, rule: &str) -> Result<CommandResult> {
        self.run(&format!("-D {} {rule}", self.name)).await
    }
}
