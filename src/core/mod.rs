//! Core firewall rule orchestration
//!
//! Layered bottom-up:
//!
//! - [`shell`]: the persistent root shell every command goes through
//! - [`chain`]: one custom iptables chain, one command per verb
//! - [`stack`]: mark/filter/nat chains of one protocol family, and both families combined
//! - [`queue`]: strict FIFO execution of async units of work
//! - [`orchestrator`]: queued session façade with per-stack failure tracking
//! - [`error`]: error types and iptables error translation

pub mod chain;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod shell;
pub mod stack;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
