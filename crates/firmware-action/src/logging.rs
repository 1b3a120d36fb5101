use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogOpts {
    /// One JSON object per record.
    pub json: bool,
    /// Multi-line human records.
    pub indent: bool,
    /// Debug level plus source locations.
    pub debug: bool,
}

impl LogOpts {
    fn default_directive(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over the flags for the level.
pub fn init(opts: LogOpts) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.default_directive()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(opts.debug)
        .with_line_number(opts.debug)
        .with_target(opts.debug);

    // try_init: tests and repeated calls must not panic on an installed subscriber.
    let _ = if opts.json {
        builder
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .try_init()
    } else if opts.indent {
        builder.pretty().without_time().try_init()
    } else {
        builder.compact().without_time().try_init()
    };
}
