use std::panic;

use tracing::error;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` filtering (defaulting to
/// `info`), output on stderr, panics logged before the default hook runs.
///
/// Safe to call more than once; later calls leave the first subscriber in
/// place.
pub fn initialize_logger() {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(directive) = "rustls=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
    if installed.is_err() {
        return;
    }

    let default_panic_hook = panic::take_hook();

    panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("unknown");

        let location = panic_info
            .location()
            .unwrap_or_else(|| panic::Location::caller());

        error!(
            location = tracing::field::display(location),
            "Panic occurred: {}", message
        );

        default_panic_hook(panic_info);
    }));

    tracing::debug!("logger initialized");
}
