use crate::core::shell::CommandResult;
use std::fmt;
use thiserror::Error;

/// Protocol family a firewall chain belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum Family {
    #[strum(serialize = "IPv4")]
    V4,
    #[strum(serialize = "IPv6")]
    V6,
}

impl Family {
    /// Binary used when the configuration does not name one.
    ///
    /// Packagers can bake a different path in through `VPN_BYPASS_IPTABLES` and
    /// `VPN_BYPASS_IP6TABLES` at build time.
    pub const fn default_binary(self) -> &'static str {
        match self {
            Family::V4 => match option_env!("VPN_BYPASS_IPTABLES") {
                Some(path) => path,
                None => "iptables",
            },
            Family::V6 => match option_env!("VPN_BYPASS_IP6TABLES") {
                Some(path) => path,
                None => "ip6tables",
            },
        }
    }

    /// Wraps a failed chain command in this family's error kind
    pub fn rule_error(self, result: CommandResult) -> Error {
        match self {
            Family::V4 => Error::Ipv4Rule(result),
            Family::V6 => Error::Ipv6Rule(result),
        }
    }
}

/// Core error types for vpn-bypass
#[derive(Debug, Error)]
pub enum Error {
    /// The elevated shell could not be spawned, written to, or died mid-command
    #[error("Privileged access denied: {0}")]
    PrivilegedAccessDenied(String),

    /// No end marker within the allotted time
    #[error("Command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    /// iptables command failed
    #[error("iptables error: {0}")]
    Ipv4Rule(CommandResult),

    /// ip6tables command failed
    #[error("ip6tables error: {0}")]
    Ipv6Rule(CommandResult),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// End marker seen but the trailer could not be parsed
    #[error("Malformed shell output: {0}")]
    MalformedOutput(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stack a rule error came from, `None` for shell and persistence errors
    pub fn family(&self) -> Option<Family> {
        match self {
            Error::Ipv4Rule(_) => Some(Family::V4),
            Error::Ipv6Rule(_) => Some(Family::V6),
            _ => None,
        }
    }

    pub fn is_ipv6_rule(&self) -> bool {
        matches!(self, Error::Ipv6Rule(_))
    }

    /// The failed command's output, if this is a rule error
    pub fn command_result(&self) -> Option<&CommandResult> {
        match self {
            Error::Ipv4Rule(result) | Error::Ipv6Rule(result) => Some(result),
            _ => None,
        }
    }

    /// How loudly a single failed step should be surfaced.
    ///
    /// IPv6 rule failures leave IPv4 bypass working, so they only warn.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Ipv6Rule(_) => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// User-facing explanation with suggestions
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::PrivilegedAccessDenied(_) => {
                ErrorTranslation::new("Root access was denied or the root shell died")
                    .with_suggestion("Grant root access when prompted")
                    .with_suggestion(
                        "Force an elevation method with VPN_BYPASS_ELEVATION_METHOD=su|sudo|run0|pkexec",
                    )
            }
            Error::Timeout { .. } => ErrorTranslation::new("Firewall command timed out")
                .with_suggestion("Another process may be holding the xtables lock")
                .with_suggestion("Raise command_timeout_secs in config.json"),
            Error::Ipv4Rule(result) | Error::Ipv6Rule(result) => {
                IptablesErrorPattern::match_error(&result.stderr)
            }
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

/// Severity of a reported condition, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub enum Severity {
    #[strum(serialize = "ok")]
    Success,
    #[strum(serialize = "warning")]
    Warning,
    #[strum(serialize = "error")]
    Error,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

impl fmt::Display for ErrorTranslation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message)?;
        for suggestion in &self.suggestions {
            write!(f, "\n  - {suggestion}")?;
        }
        if let Some(url) = &self.help_url {
            write!(f, "\n  See: {url}")?;
        }
        Ok(())
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an iptables stderr message against known patterns.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("you must be root") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("The shell was not elevated; check that su/sudo grants root")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // ip6tables on kernels without IPv6 netfilter support
        if lower.contains("can't initialize") && lower.contains("table") {
            return ErrorTranslation::new("Firewall table is not available in this kernel")
                .with_suggestion("IPv6 NAT and mangle tables are missing on many devices")
                .with_suggestion("Load the module: modprobe ip6table_mangle ip6table_nat")
                .with_help("https://wiki.archlinux.org/title/Iptables");
        }

        if lower.contains("couldn't load target") || lower.contains("couldn't load match") {
            return ErrorTranslation::new("Required iptables extension is missing")
                .with_suggestion("MARK, MASQUERADE, REJECT and owner must be built into the kernel")
                .with_suggestion("Check kernel modules: lsmod | grep xt_");
        }

        if lower.contains("no chain/target/match") {
            return ErrorTranslation::new("Firewall chain not found")
                .with_suggestion("Run `vpn-bypass apply` to recreate the chains");
        }

        if lower.contains("chain already exists") {
            return ErrorTranslation::new("Firewall chain already exists")
                .with_suggestion("Run `vpn-bypass cleanup` to reset the chains");
        }

        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process is modifying iptables")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("bad rule") {
            return ErrorTranslation::new("Rule not present in chain")
                .with_suggestion("The chain was modified outside vpn-bypass");
        }

        if lower.contains("not found") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables, or set iptables_command in config.json");
        }

        ErrorTranslation::new(format!("Firewall error: {}", msg.trim()))
            .with_suggestion("Inspect the rules: iptables -t mangle -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
