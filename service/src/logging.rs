use crate::config::Config;
use log::LevelFilter;
use simplelog::{self, ConfigBuilder};

/// Dependency modules silenced below Trace. The HTTP stack underneath
/// long-lived streams logs every poll and frame at debug level.
const FILTERED_MODULES: &[&str] = &["tower", "tracing", "hyper", "h2", "axum", "reqwest"];

pub struct Logger {}

impl Logger {
    /// Installs the global terminal logger at the level configured in `config`.
    ///
    /// Dependency output is filtered out unless the level is Trace. Calling this
    /// more than once keeps the first logger and reports the conflict on stderr.
    pub fn init_logger(config: &Config) {
        let filter = config.log_level_filter;
        let log_config = Self::build_log_config(Self::should_filter_dependencies(filter));

        if let Err(e) = simplelog::TermLogger::init(
            Self::convert_level_filter(filter),
            log_config,
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        ) {
            eprintln!("Logger already initialized, keeping the existing one: {e}");
        }
    }

    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    fn should_filter_dependencies(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    fn build_log_config(apply_filters: bool) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder.set_time_format_rfc3339();

        if apply_filters {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}
