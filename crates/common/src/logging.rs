use tracing_core::Level;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Install a compact stderr logger filtered at the provided level.
///
/// HTTP client internals are capped at `WARN` to keep debug output readable.
pub fn init(level: LevelFilter) {
    let fmt = fmt::format().with_target(false).compact();

    let target_filters = Targets::new()
        .with_target("reqwest", Level::WARN)
        .with_target("hyper", Level::WARN)
        .with_target("rustls", Level::WARN)
        .with_default(level);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .event_format(fmt)
                .with_writer(std::io::stderr),
        )
        .with(target_filters)
        .init();
}
