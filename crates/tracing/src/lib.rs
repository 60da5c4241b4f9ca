//!  The `tracing` module provides functionalities for setting up and configuring logging.
//!
//!  The module's primary entry point is the [`AquaTracer`] struct, which installs a stdout layer
//!  in the configured format. Tests install [`TestTracer`] through [`init_test_tracing`].
//!
//!  # Examples
//!
//!  ```
//!  use aqua_tracing::{tracing::level_filters::LevelFilter, AquaTracer, LayerInfo, LogFormat, Tracer};
//!
//!  fn main() -> eyre::Result<()> {
//!      let tracer = AquaTracer::new().with_stdout(LayerInfo::new(
//!          LogFormat::Json,
//!          LevelFilter::INFO.to_string(),
//!          "downloaders::sync=debug".to_string(),
//!          None,
//!      ));
//!
//!      tracer.init()?;
//!
//!      // Your application logic here
//!
//!      Ok(())
//!  }
//!  ```

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

// Re-export tracing crates
pub use tracing;
pub use tracing_subscriber;

// Re-export our types
pub use formatter::{BoxedLayer, LogFormat};
pub use test_tracer::TestTracer;

mod formatter;
mod test_tracer;
mod throttle;

#[doc(hidden)]
pub mod __private {
    pub use super::throttle::Throttle;
}

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

///  Tracer for application logging.
///
///  Manages the configuration and initialization of the stdout logging layer.
#[derive(Debug, Clone, Default)]
pub struct AquaTracer {
    stdout: LayerInfo,
}

impl AquaTracer {
    ///  Constructs a new `Tracer` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    ///  Sets a custom configuration for the stdout layer.
    pub fn with_stdout(mut self, config: LayerInfo) -> Self {
        self.stdout = config;
        self
    }
}

///  Configuration for a logging layer.
///
///  This struct holds configuration parameters for a tracing layer, including
///  the format, filtering directives, optional coloring, and directive.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    format: LogFormat,
    default_directive: String,
    filters: String,
    color: Option<String>,
}

impl LayerInfo {
    ///  Constructs a new `LayerInfo`.
    ///
    ///  # Arguments
    ///  * `format` - Specifies the format for log messages.
    ///  * `default_directive` - Directive for filtering log messages.
    ///  * `filters` - Additional comma separated filtering directives.
    ///  * `color` - Optional color configuration for the log messages.
    pub const fn new(
        format: LogFormat,
        default_directive: String,
        filters: String,
        color: Option<String>,
    ) -> Self {
        Self { format, default_directive, filters, color }
    }
}

impl Default for LayerInfo {
    ///  Provides default values for `LayerInfo`.
    ///
    ///  By default, it uses terminal format, INFO level filter,
    ///  no additional filters, and colors.
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            default_directive: LevelFilter::INFO.to_string(),
            filters: String::new(),
            color: Some("always".to_string()),
        }
    }
}

/// Trait defining a general interface for logging configuration.
pub trait Tracer {
    /// Initialize the logging configuration.
    fn init(self) -> eyre::Result<()>;
}

impl Tracer for AquaTracer {
    fn init(self) -> eyre::Result<()> {
        let filter = build_env_filter(&self.stdout.default_directive, &self.stdout.filters)?;
        let layer: BoxedLayer<Registry> = self.stdout.format.apply(filter, self.stdout.color);

        // The error is returned if the global default subscriber is already set,
        // so it's safe to ignore it
        let _ = tracing_subscriber::registry().with(layer).try_init();
        Ok(())
    }
}

/// Builds an [`EnvFilter`] from `RUST_LOG`, falling back to `default_directive`, and appends the
/// comma separated `directives`.
pub(crate) fn build_env_filter(
    default_directive: &str,
    directives: &str,
) -> eyre::Result<EnvFilter> {
    let default: Directive = default_directive.parse()?;
    let env_filter = EnvFilter::builder().with_default_directive(default).from_env_lossy();

    directives
        .split(',')
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .try_fold(env_filter, |env_filter, directive| {
            Ok(env_filter.add_directive(directive.parse()?))
        })
}

///  Initializes a [`TestTracer`] with its default filter.
///
///  The filter is configurable via `RUST_LOG`. Calling it again is harmless.
pub fn init_test_tracing() {
    let _ = TestTracer::default().init();
}
