//! Detector Configuration
//!
//! This module provides the configuration surface of the leak detector.
//! Configuration can be set programmatically or loaded from the environment.
//!
//! # Environment
//!
//! Options are read from the `LEAKWATCH_OPTIONS` variable as a sanitizer-style
//! option string: `key=value` pairs separated by `:`, `,` or whitespace.
//!
//! | Option | Description | Default |
//! |--------|-------------|---------|
//! | `detect_leaks` | Master switch for tracking and checks | true |
//! | `leak_check_at_exit` | Run one implicit check at process exit | true |
//! | `exitcode` | Exit status used when leaks are found | 23 |
//! | `leak_policy` | `fail` (terminate) or `report` (report only) | fail |
//! | `report_objects` | List the addresses of leaked objects | false |
//! | `max_leaks` | Maximum report entries printed (0 = all) | 0 |
//! | `suppressions` | Path of a suppression file | none |
//! | `print_suppressions` | Print used-suppression statistics | true |
//! | `malloc_context_size` | Allocation-site stack depth | 30 |
//! | `use_globals` | Scan writable global segments | true |
//! | `use_stacks` | Scan thread stacks | true |
//! | `use_registers` | Scan captured register files | true |
//! | `use_tls` | Scan static TLS blocks | true |
//! | `use_root_regions` | Scan user-registered root regions | true |
//! | `use_unaligned` | Consider pointers at every byte offset | false |
//! | `ignored_objects_are_roots` | Seed the scan from ignored objects | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use leakwatch_runtime::config::DetectorConfig;
//!
//! let config = DetectorConfig::builder()
//!     .report_objects(true)
//!     .max_leaks(10)
//!     .build()?;
//!
//! let config = DetectorConfig::parse_options("report_objects=1:max_leaks=10")?;
//! ```

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

/// Environment variable holding the option string.
pub const OPTIONS_ENV: &str = "LEAKWATCH_OPTIONS";

/// Maximum supported allocation-site stack depth.
pub const MAX_STACK_DEPTH: usize = 256;

/// What happens after a final leak check finds unsuppressed leaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeakPolicy {
    /// Report, then terminate the process with the configured exit code.
    #[default]
    Fail,
    /// Report only.
    ReportOnly,
}

impl LeakPolicy {
    /// Parse a policy from its option spelling.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "fail" | "exit" | "die" => Some(LeakPolicy::Fail),
            "report" | "report_only" | "warn" => Some(LeakPolicy::ReportOnly),
            _ => None,
        }
    }

    /// Convert to the option spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeakPolicy::Fail => "fail",
            LeakPolicy::ReportOnly => "report",
        }
    }
}

/// Which root sources the scanner consults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Scan writable data segments of loaded modules.
    pub use_globals: bool,
    /// Scan thread stacks.
    pub use_stacks: bool,
    /// Scan register files captured while threads are suspended.
    pub use_registers: bool,
    /// Scan static TLS blocks.
    pub use_tls: bool,
    /// Scan regions registered with `register_root_region`.
    pub use_root_regions: bool,
    /// Consider candidate pointers at every byte offset, not only at
    /// pointer-aligned offsets.
    pub use_unaligned: bool,
    /// Treat ignored objects as roots, making everything they point to
    /// reachable.
    pub ignored_objects_are_roots: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            use_globals: true,
            use_stacks: true,
            use_registers: true,
            use_tls: true,
            use_root_regions: true,
            use_unaligned: false,
            ignored_objects_are_roots: true,
        }
    }
}

/// How findings are reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    /// Include the addresses of leaked objects in each entry.
    pub report_objects: bool,
    /// Maximum number of entries rendered (0 = unlimited).
    pub max_leaks: usize,
    /// Suppression file to load at start-up.
    pub suppressions: Option<PathBuf>,
    /// Render statistics for suppressions that matched.
    pub print_suppressions: bool,
    /// Exit status used by the `Fail` policy.
    pub exitcode: i32,
    /// What a final check does after finding leaks.
    pub policy: LeakPolicy,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            report_objects: false,
            max_leaks: 0,
            suppressions: None,
            print_suppressions: true,
            exitcode: 23,
            policy: LeakPolicy::Fail,
        }
    }
}

/// Allocation-site capture settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Maximum number of return addresses recorded per allocation.
    pub malloc_context_size: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            malloc_context_size: 30,
        }
    }
}

/// Complete detector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Master switch. When false nothing is tracked and checks do not run.
    pub detect_leaks: bool,
    /// Run one implicit leak check when the process exits.
    pub leak_check_at_exit: bool,
    /// Root selection.
    pub scan: ScanConfig,
    /// Reporting.
    pub report: ReportConfig,
    /// Stack capture.
    pub stack: StackConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detect_leaks: true,
            leak_check_at_exit: true,
            scan: ScanConfig::default(),
            report: ReportConfig::default(),
            stack: StackConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// Create a new builder for DetectorConfig.
    pub fn builder() -> DetectorConfigBuilder {
        DetectorConfigBuilder::new()
    }

    /// Load configuration from `LEAKWATCH_OPTIONS`.
    ///
    /// Options that fail to parse are logged and skipped; the rest still apply.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(options) = env::var(OPTIONS_ENV) {
            for (key, value) in split_options(&options) {
                if let Err(err) = config.apply_option(key, value) {
                    warn!(%err, "ignoring option from {}", OPTIONS_ENV);
                }
            }
        }
        config
    }

    /// Parse an option string on top of the defaults.
    pub fn parse_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in split_options(options) {
            config.apply_option(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply one `key=value` option.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "detect_leaks" => self.detect_leaks = parse_bool(key, value)?,
            "leak_check_at_exit" => self.leak_check_at_exit = parse_bool(key, value)?,
            "exitcode" => {
                self.report.exitcode = value.parse().map_err(|_| ConfigError::InvalidValue {
                    option: key.into(),
                    value: value.into(),
                    expected: "an integer",
                })?
            }
            "leak_policy" => {
                self.report.policy =
                    LeakPolicy::from_str(value).ok_or_else(|| ConfigError::InvalidValue {
                        option: key.into(),
                        value: value.into(),
                        expected: "'fail' or 'report'",
                    })?
            }
            "report_objects" => self.report.report_objects = parse_bool(key, value)?,
            "max_leaks" => self.report.max_leaks = parse_usize(key, value)?,
            "suppressions" => {
                self.report.suppressions = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            "print_suppressions" => self.report.print_suppressions = parse_bool(key, value)?,
            "malloc_context_size" => self.stack.malloc_context_size = parse_usize(key, value)?,
            "use_globals" => self.scan.use_globals = parse_bool(key, value)?,
            "use_stacks" => self.scan.use_stacks = parse_bool(key, value)?,
            "use_registers" => self.scan.use_registers = parse_bool(key, value)?,
            "use_tls" => self.scan.use_tls = parse_bool(key, value)?,
            "use_root_regions" => self.scan.use_root_regions = parse_bool(key, value)?,
            "use_unaligned" => self.scan.use_unaligned = parse_bool(key, value)?,
            "ignored_objects_are_roots" => {
                self.scan.ignored_objects_are_roots = parse_bool(key, value)?
            }
            _ => return Err(ConfigError::UnknownOption(key.into())),
        }
        Ok(())
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack.malloc_context_size == 0 || self.stack.malloc_context_size > MAX_STACK_DEPTH {
            return Err(ConfigError::OutOfRange {
                option: "malloc_context_size",
                message: format!("must be between 1 and {}", MAX_STACK_DEPTH),
            });
        }

        if !(0..=255).contains(&self.report.exitcode) {
            return Err(ConfigError::OutOfRange {
                option: "exitcode",
                message: "must be between 0 and 255".into(),
            });
        }

        if self.report.policy == LeakPolicy::Fail && self.report.exitcode == 0 {
            return Err(ConfigError::OutOfRange {
                option: "exitcode",
                message: "must be non-zero when leak_policy=fail".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The option name is not recognised.
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    /// The option value does not parse.
    #[error("invalid value '{value}' for option '{option}': expected {expected}")]
    InvalidValue {
        /// Option name.
        option: String,
        /// Raw value.
        value: String,
        /// What was expected.
        expected: &'static str,
    },
    /// The option parsed but is outside its valid range.
    #[error("invalid configuration for '{option}': {message}")]
    OutOfRange {
        /// Option name.
        option: &'static str,
        /// Error message.
        message: String,
    },
}

/// Builder for DetectorConfig.
#[derive(Debug, Clone, Default)]
pub struct DetectorConfigBuilder {
    config: DetectorConfig,
}

impl DetectorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable tracking and checks.
    pub fn detect_leaks(mut self, enabled: bool) -> Self {
        self.config.detect_leaks = enabled;
        self
    }

    /// Enable or disable the at-exit check.
    pub fn leak_check_at_exit(mut self, enabled: bool) -> Self {
        self.config.leak_check_at_exit = enabled;
        self
    }

    /// Set the exit status used by the `Fail` policy.
    pub fn exitcode(mut self, code: i32) -> Self {
        self.config.report.exitcode = code;
        self
    }

    /// Set the leak policy.
    pub fn leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.config.report.policy = policy;
        self
    }

    /// List leaked object addresses in the report.
    pub fn report_objects(mut self, enabled: bool) -> Self {
        self.config.report.report_objects = enabled;
        self
    }

    /// Limit the number of rendered entries.
    pub fn max_leaks(mut self, max: usize) -> Self {
        self.config.report.max_leaks = max;
        self
    }

    /// Load suppressions from a file at start-up.
    pub fn suppressions(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.report.suppressions = Some(path.into());
        self
    }

    /// Render suppression statistics.
    pub fn print_suppressions(mut self, enabled: bool) -> Self {
        self.config.report.print_suppressions = enabled;
        self
    }

    /// Set the allocation-site stack depth.
    pub fn malloc_context_size(mut self, depth: usize) -> Self {
        self.config.stack.malloc_context_size = depth;
        self
    }

    /// Replace the whole scan configuration.
    pub fn scan(mut self, scan: ScanConfig) -> Self {
        self.config.scan = scan;
        self
    }

    /// Scan global data segments.
    pub fn use_globals(mut self, enabled: bool) -> Self {
        self.config.scan.use_globals = enabled;
        self
    }

    /// Scan thread stacks.
    pub fn use_stacks(mut self, enabled: bool) -> Self {
        self.config.scan.use_stacks = enabled;
        self
    }

    /// Scan captured registers.
    pub fn use_registers(mut self, enabled: bool) -> Self {
        self.config.scan.use_registers = enabled;
        self
    }

    /// Scan static TLS blocks.
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.config.scan.use_tls = enabled;
        self
    }

    /// Scan user-registered root regions.
    pub fn use_root_regions(mut self, enabled: bool) -> Self {
        self.config.scan.use_root_regions = enabled;
        self
    }

    /// Consider unaligned candidate pointers.
    pub fn use_unaligned(mut self, enabled: bool) -> Self {
        self.config.scan.use_unaligned = enabled;
        self
    }

    /// Treat ignored objects as scan roots.
    pub fn ignored_objects_are_roots(mut self, enabled: bool) -> Self {
        self.config.scan.ignored_objects_are_roots = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<DetectorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> DetectorConfig {
        self.config
    }
}

/// Split an option string into `(key, value)` pairs.
///
/// A bare key is shorthand for `key=1`.
fn split_options(options: &str) -> impl Iterator<Item = (&str, &str)> {
    options
        .split(|c: char| c == ':' || c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (item.trim(), "1"),
        })
}

fn parse_bool(option: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            option: option.into(),
            value: value.into(),
            expected: "a boolean",
        }),
    }
}

fn parse_usize(option: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        option: option.into(),
        value: value.into(),
        expected: "a non-negative integer",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DetectorConfig::default();
        assert!(config.detect_leaks);
        assert!(config.leak_check_at_exit);
        assert_eq!(config.report.exitcode, 23);
        assert_eq!(config.report.policy, LeakPolicy::Fail);
        assert_eq!(config.stack.malloc_context_size, 30);
        assert!(config.scan.use_globals);
        assert!(!config.scan.use_unaligned);
        assert!(config.scan.ignored_objects_are_roots);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DetectorConfig::builder()
            .report_objects(true)
            .max_leaks(5)
            .use_stacks(false)
            .leak_policy(LeakPolicy::ReportOnly)
            .build()
            .unwrap();

        assert!(config.report.report_objects);
        assert_eq!(config.report.max_leaks, 5);
        assert!(!config.scan.use_stacks);
        assert_eq!(config.report.policy, LeakPolicy::ReportOnly);
    }

    #[test]
    fn test_builder_validation() {
        assert!(DetectorConfig::builder().malloc_context_size(0).build().is_err());
        assert!(DetectorConfig::builder()
            .malloc_context_size(MAX_STACK_DEPTH + 1)
            .build()
            .is_err());
        assert!(DetectorConfig::builder().exitcode(0).build().is_err());
        assert!(DetectorConfig::builder()
            .exitcode(0)
            .leak_policy(LeakPolicy::ReportOnly)
            .build()
            .is_ok());
    }

    #[test]
    fn test_parse_options() {
        let config = DetectorConfig::parse_options(
            "report_objects=1:max_leaks=3, use_unaligned=true exitcode=42 suppressions=/tmp/supp.txt",
        )
        .unwrap();

        assert!(config.report.report_objects);
        assert_eq!(config.report.max_leaks, 3);
        assert!(config.scan.use_unaligned);
        assert_eq!(config.report.exitcode, 42);
        assert_eq!(config.report.suppressions, Some(PathBuf::from("/tmp/supp.txt")));
    }

    #[test]
    fn test_parse_options_bare_key() {
        let config = DetectorConfig::parse_options("report_objects").unwrap();
        assert!(config.report.report_objects);
    }

    #[test]
    fn test_parse_options_errors() {
        assert_eq!(
            DetectorConfig::parse_options("no_such_flag=1"),
            Err(ConfigError::UnknownOption("no_such_flag".into()))
        );
        assert!(matches!(
            DetectorConfig::parse_options("max_leaks=lots"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            DetectorConfig::parse_options("malloc_context_size=0"),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_leak_policy_from_str() {
        assert_eq!(LeakPolicy::from_str("fail"), Some(LeakPolicy::Fail));
        assert_eq!(LeakPolicy::from_str("REPORT"), Some(LeakPolicy::ReportOnly));
        assert_eq!(LeakPolicy::from_str("maybe"), None);
        assert_eq!(LeakPolicy::ReportOnly.as_str(), "report");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            option: "max_leaks".into(),
            value: "x".into(),
            expected: "a non-negative integer",
        };
        assert!(err.to_string().contains("max_leaks"));
        assert!(err.to_string().contains("non-negative"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var(OPTIONS_ENV);
        let config = DetectorConfig::from_env();
        assert_eq!(config, DetectorConfig::default());
    }
}
