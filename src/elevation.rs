//! Privilege elevation for the persistent root shell
//!
//! vpn-bypass runs as an unprivileged user and elevates exactly one process:
//! a long-lived `sh` that receives every iptables command over stdin (see
//! [`crate::core::shell`]). Spawning one elevated shell instead of one
//! elevated process per rule keeps the authentication prompt to a single one
//! per session.
//!
//! # Elevation Strategy
//!
//! - **Already root**: plain `sh`
//! - **Preferred**: `run0 sh` when available (systemd v256+, no SUID)
//! - **CLI fallback**: `sudo sh` for terminal environments
//! - **GUI fallback**: `pkexec sh` for graphical authentication
//! - **Last resort**: `su`, which on Android-style systems reads commands from stdin
//!
//! # Environment Variables
//!
//! - `VPN_BYPASS_ELEVATION_METHOD`: Force a specific elevation method (`su`, `sudo`,
//!   `run0`, or `pkexec`). Useful with sudoers NOPASSWD rules.
//!   Example: `VPN_BYPASS_ELEVATION_METHOD=sudo vpn-bypass apply`
//!
//! - `VPN_BYPASS_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Example
//!
//! ```no_run
//! use vpn_bypass::elevation::create_elevated_shell_command;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_elevated_shell_command()?;
//! cmd.stdin(std::process::Stdio::piped());
//! # Ok(())
//! # }
//! ```

use tokio::process::Command;

/// Shell run behind the elevation wrapper
const SHELL: &str = "sh";

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// No elevation binary could be found at all
    #[error("No elevation method found - install sudo, run0, pkexec or su")]
    NoMethodAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `VPN_BYPASS_ELEVATION_METHOD`
    #[error("Invalid VPN_BYPASS_ELEVATION_METHOD '{0}'. Valid options: su, sudo, run0, pkexec")]
    InvalidMethod(String),
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Wraps the shell in `method`; `su` takes no program argument.
fn wrap(method: &str) -> Command {
    let mut cmd = Command::new(method);
    if method != "su" {
        cmd.arg(SHELL);
    }
    cmd
}

/// Creates the command for the elevated shell session
///
/// The returned command has no stdio configured; the shell channel pipes all
/// three streams itself.
///
/// # Errors
///
/// - `InvalidMethod` if `VPN_BYPASS_ELEVATION_METHOD` names an unknown method
/// - `MethodNotAvailable` if the forced method's binary is missing
/// - `NoMethodAvailable` if automatic detection finds nothing usable
pub fn create_elevated_shell_command() -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("VPN_BYPASS_TEST_NO_ELEVATION").is_ok() {
        return Ok(Command::new(SHELL));
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(Command::new(SHELL));
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("VPN_BYPASS_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "su" | "sudo" | "run0" | "pkexec" => {
                    if binary_exists(&method) {
                        Ok(wrap(&method))
                    } else {
                        Err(ElevationError::MethodNotAvailable(method))
                    }
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(wrap("run0"));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty && binary_exists("sudo") {
        return Ok(wrap("sudo"));
    }
    if binary_exists("pkexec") {
        return Ok(wrap("pkexec"));
    }
    if binary_exists("su") {
        return Ok(wrap("su"));
    }

    Err(ElevationError::NoMethodAvailable)
}
