//! vpn-bypass - route selected applications around a VPN tunnel
//!
//! Traffic of selected UIDs is marked in `mangle/OUTPUT` so policy routing
//! can send it outside the tunnel, with the marked traffic masqueraded on the
//! way out. Every iptables/ip6tables command goes through one persistent
//! root shell.
//!
//! # Architecture
//!
//! - [`core`] - Shell channel, chain and rule management, orchestration
//! - [`elevation`] - Privilege elevation for the root shell
//! - [`selection`] - Persisted app selection and UID resolution
//! - [`audit`] - Audit logging for privileged operations
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Degradation
//!
//! IPv4 and IPv6 are managed independently. When IPv6 marking is not
//! supported by the kernel, IPv6 traffic of bypassed apps is rejected instead
//! of being silently sent through the tunnel.

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod selection;
pub mod utils;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::orchestrator::{Orchestrator, OrchestratorEvent};
