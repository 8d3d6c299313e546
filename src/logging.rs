//! Tracing subscriber setup shared by both binaries

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output formats accepted in `[logging] format`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "full" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(crate::Error::Config(format!("Unknown log format: {}", other))),
        }
    }
}

/// Filter directive in effect: command line, then `RUST_LOG`, then the config file
pub fn filter_directive(config: &LoggingConfig, level_override: Option<&str>) -> String {
    if let Some(level) = level_override {
        return level.to_string();
    }
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.trim().is_empty() => env,
        _ => config.level.clone(),
    }
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> Result<(), crate::Error> {
    let directive = filter_directive(config, level_override);
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| crate::Error::Config(format!("Invalid log filter {:?}: {}", directive, e)))?;
    let format = LogFormat::parse(&config.format)?;

    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| crate::Error::Config(format!("Failed to open log file {}: {}", path, e)))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_ansi(ansi).with_writer(writer))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(ansi).with_writer(writer))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init(),
    };

    result.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
}
