use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::Targets, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Environment variable holding the maximum log level
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";

/// Environment variable holding per-target directives such as
/// `courier_dispatch=debug,courier_common=warn`
pub const LOG_FILTER_VAR: &str = "COURIER_LOG";

/// Prefix shared by every target the engine logs under
const TARGET_PREFIX: &str = "courier";

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Events about transport calls leaving the engine
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Events about the engine's own bookkeeping
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Resolve the level filter from an optional `LOG_LEVEL` value.
///
/// Unparsable values fall back to `default`.
pub fn level_from(value: Option<&str>, default: LevelFilter) -> LevelFilter {
    value.map_or(default, |level| {
        LevelFilter::from_str(level).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

/// Build the target filter.
///
/// Without directives every `courier` target is enabled up to `level` and
/// everything else is off. Directives that fail to parse fall back to that.
pub fn filter_from(directives: Option<&str>, level: LevelFilter) -> Targets {
    let fallback = || Targets::new().with_target(TARGET_PREFIX, level);

    directives.map_or_else(fallback, |directives| {
        directives.parse::<Targets>().unwrap_or_else(|e| {
            eprintln!("Invalid log filter {directives}: {e}, defaulting to {TARGET_PREFIX}={level}");
            fallback()
        })
    })
}

/// Install the global subscriber.
///
/// `COURIER_LOG` takes precedence over `LOG_LEVEL`.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = level_from(std::env::var(LOG_LEVEL_VAR).ok().as_deref(), default);
    let filter = filter_from(std::env::var(LOG_FILTER_VAR).ok().as_deref(), level);

    tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(filter),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn level_parsing() {
        assert_eq!(level_from(Some("warn"), LevelFilter::INFO), LevelFilter::WARN);
        assert_eq!(level_from(Some("DEBUG"), LevelFilter::INFO), LevelFilter::DEBUG);
        assert_eq!(level_from(None, LevelFilter::INFO), LevelFilter::INFO);
        assert_eq!(level_from(Some("loud"), LevelFilter::ERROR), LevelFilter::ERROR);
    }

    #[test]
    fn default_filter_covers_only_courier_targets() {
        let filter = filter_from(None, LevelFilter::INFO);
        assert!(filter.would_enable("courier_dispatch::resolver", &Level::INFO));
        assert!(!filter.would_enable("courier_dispatch::resolver", &Level::DEBUG));
        assert!(filter.would_enable("courier_common", &Level::WARN));
        assert!(!filter.would_enable("hyper::client", &Level::ERROR));
    }

    #[test]
    fn directives_override_the_level() {
        let filter = filter_from(Some("courier_dispatch=debug,courier_common=warn"), LevelFilter::ERROR);
        assert!(filter.would_enable("courier_dispatch::report", &Level::DEBUG));
        assert!(!filter.would_enable("courier_common::address", &Level::INFO));
        assert!(filter.would_enable("courier_common::address", &Level::WARN));

        let fallback = filter_from(Some("courier=loudest"), LevelFilter::WARN);
        assert!(fallback.would_enable("courier_dispatch", &Level::WARN));
        assert!(!fallback.would_enable("courier_dispatch", &Level::INFO));
    }

    #[test]
    fn macros_expand_outside_a_subscriber() {
        crate::internal!("bookkeeping without a subscriber");
        crate::internal!(level = DEBUG, count = 3, "with fields");
        crate::outgoing!(level = INFO, address = "a@example.com", "sending");
    }
}
