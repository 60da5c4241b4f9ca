use crate::{build_env_filter, Tracer};

/// Directive used by tests when `RUST_LOG` is unset.
const TEST_DEFAULT_DIRECTIVE: &str = "warn";

/// Tracer for unit and integration tests.
///
/// Output goes through the test writer, so it is captured per test and only shown for failing
/// ones. `RUST_LOG` overrides the default directive, `filters` narrows it further, e.g.
/// `downloaders::queue=trace`. Installing a second subscriber is silently ignored.
#[derive(Debug, Clone)]
pub struct TestTracer {
    default_directive: String,
    filters: String,
}

impl TestTracer {
    /// Creates a tracer logging warnings and errors unless `RUST_LOG` says otherwise.
    pub fn new() -> Self {
        Self { default_directive: TEST_DEFAULT_DIRECTIVE.to_string(), filters: String::new() }
    }

    /// Adds comma separated directives on top of the default one.
    pub fn with_filters(mut self, filters: impl Into<String>) -> Self {
        self.filters = filters.into();
        self
    }
}

impl Default for TestTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for TestTracer {
    fn init(self) -> eyre::Result<()> {
        let filter = build_env_filter(&self.default_directive, &self.filters)?;
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
        Ok(())
    }
}
