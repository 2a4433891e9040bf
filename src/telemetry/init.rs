// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry initialization and configuration.

use std::io;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Default log level if RUST_LOG is not set.
    pub default_level: Level,

    /// Whether to include span close events with timings.
    pub include_span_events: bool,

    /// Whether to include file/line information.
    pub include_file_line: bool,

    /// Whether to include target module path.
    pub include_target: bool,

    /// Whether to use ANSI colors in output.
    pub ansi_colors: bool,

    /// Whether to use compact log format.
    pub compact: bool,

    /// Custom filter directive (overrides default_level).
    pub filter_directive: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            default_level: Level::WARN,
            include_span_events: false,
            include_file_line: false,
            include_target: true,
            ansi_colors: true,
            compact: true,
            filter_directive: None,
        }
    }
}

impl TelemetryConfig {
    /// Verbose output for local debugging of a swarm.
    pub fn development() -> Self {
        Self {
            default_level: Level::DEBUG,
            include_span_events: true,
            include_file_line: true,
            include_target: true,
            ansi_colors: true,
            compact: false,
            filter_directive: None,
        }
    }

    /// Minimal output for unattended runs.
    pub fn production() -> Self {
        Self {
            default_level: Level::WARN,
            include_span_events: false,
            include_file_line: false,
            include_target: false,
            ansi_colors: false,
            compact: true,
            filter_directive: None,
        }
    }

    /// Trace-level output scoped to this crate.
    pub fn testing() -> Self {
        Self {
            default_level: Level::TRACE,
            include_span_events: true,
            include_file_line: true,
            include_target: true,
            ansi_colors: false,
            compact: false,
            filter_directive: Some("codi_swarm=trace".to_string()),
        }
    }

    /// Pick a preset from the CLI's `--verbose` / `--debug` flags.
    pub fn from_flags(verbose: bool, debug: bool) -> Self {
        if debug {
            Self::development()
        } else if verbose {
            Self::default().with_level(Level::INFO)
        } else {
            Self::default()
        }
    }

    /// Set the default log level.
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    /// Set a custom filter directive.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_directive = Some(filter.into());
        self
    }

    /// Enable or disable ANSI colors.
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi_colors = ansi;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.default_level.to_string());
        match &self.filter_directive {
            Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| fallback()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback()),
        }
    }
}

/// Guard returned by [`init_telemetry`]. Keep it alive for the program's lifetime.
pub struct TelemetryGuard {
    _private: (),
}

/// Initialize telemetry with the given configuration.
///
/// Logs go to stderr so that stdout stays free for command output
/// (`codi-swarm parse` prints JSON there).
pub fn init_telemetry(config: &TelemetryConfig) -> io::Result<TelemetryGuard> {
    let filter = config.env_filter();

    let span_events = if config.include_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let fmt_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_file(config.include_file_line)
        .with_line_number(config.include_file_line)
        .with_span_events(span_events);

    let result = if config.compact {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.compact())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(TelemetryGuard { _private: () })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_telemetry_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.default_level, Level::WARN);
        assert!(config.compact);
    }

    #[test]
    fn test_from_flags() {
        assert_eq!(TelemetryConfig::from_flags(false, false).default_level, Level::WARN);
        assert_eq!(TelemetryConfig::from_flags(true, false).default_level, Level::INFO);
        let debug = TelemetryConfig::from_flags(true, true);
        assert_eq!(debug.default_level, Level::DEBUG);
        assert!(debug.include_span_events);
    }

    #[test]
    fn test_testing_preset_scopes_filter() {
        let config = TelemetryConfig::testing();
        assert_eq!(config.filter_directive.as_deref(), Some("codi_swarm=trace"));
        assert!(!config.ansi_colors);
    }

    #[test]
    fn test_telemetry_config_builder() {
        let config = TelemetryConfig::production()
            .with_level(Level::DEBUG)
            .with_filter("codi_swarm::orchestrate=debug")
            .with_ansi(true);

        assert_eq!(config.default_level, Level::DEBUG);
        assert_eq!(
            config.filter_directive,
            Some("codi_swarm::orchestrate=debug".to_string())
        );
        assert!(config.ansi_colors);
    }
}
