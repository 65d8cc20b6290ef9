//! Tracing setup shared by the cafc binaries and tests.
//!
//! Deliberately small: a stderr `fmt` layer, an `EnvFilter` driven by
//! `RUST_LOG`, and an indicatif progress layer so long-running operations
//! (the startup rescan in particular) can show a progress bar without
//! fighting the log output for the terminal.

use lazy_static::lazy_static;
use tracing::Level;
use tracing_indicatif::{filter::IndicatifFilter, IndicatifLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

lazy_static! {
    pub static ref PB_PROGRESS_STYLE: indicatif::ProgressStyle =
        indicatif::ProgressStyle::with_template(
            "{span_child_prefix}{bar:30} {wide_msg} [{elapsed_precise}]  {pos:>7}/{len:7}"
        )
        .expect("invalid progress template");
    pub static ref PB_SPINNER_STYLE: indicatif::ProgressStyle =
        indicatif::ProgressStyle::with_template(
            "{span_child_prefix}{spinner} {wide_msg} [{elapsed_precise}]  {pos:>7}/{len:7}"
        )
        .expect("invalid progress template");
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Configuration for [TracingBuilder]. The embedding binary loads this from
/// its own config surface (CLI flags, env, ...); this crate only consumes
/// the resulting values.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    pub level: Level,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json: false,
        }
    }
}

pub struct TracingBuilder {
    config: TracingConfig,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        Self {
            config: TracingConfig::default(),
        }
    }
}

impl TracingBuilder {
    pub fn with_config(config: TracingConfig) -> Self {
        Self { config }
    }

    /// Set the log level for the stderr layer. RUST_LOG still takes priority.
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    /// Sets up a global tracing subscriber: a stderr writer, an `EnvFilter`
    /// seeded from `self.level` (overridable via `RUST_LOG`), and an
    /// indicatif layer for spans carrying the `indicatif.pb_show` field.
    pub fn build(self) -> Result<(), Error> {
        let indicatif_layer = IndicatifLayer::new().with_progress_style(PB_SPINNER_STYLE.clone());

        let fmt_layer = if self.config.json {
            tracing_subscriber::fmt::Layer::new()
                .json()
                .with_writer(indicatif_layer.get_stderr_writer())
                .boxed()
        } else {
            tracing_subscriber::fmt::Layer::new()
                .with_writer(indicatif_layer.get_stderr_writer())
                .compact()
                .boxed()
        };

        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(self.config.level.into())
                    .from_env()
                    .expect("invalid RUST_LOG"),
            )
            .with(fmt_layer)
            .with(indicatif_layer.with_filter(IndicatifFilter::new(false)))
            .try_init()?;

        Ok(())
    }
}
