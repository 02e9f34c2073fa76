//! `tracing` initialization. Grounded on `tvix-store`'s binary wiring:
//! a compact `fmt` layer gated by an `EnvFilter` built from a default
//! level plus `RUST_LOG`.

use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global `tracing` subscriber. `default_level` is used
/// when `RUST_LOG` is unset or doesn't cover a given target.
///
/// Returns an error if a global subscriber is already installed;
/// callers should only call this once, from their binary's entry
/// point.
pub fn init(default_level: Level) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::Layer::new().compact().with_filter(filter))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic_on_bad_env_filter() {
        std::env::set_var("RUST_LOG", "not a valid directive!!!");
        let _ = init(Level::INFO);
        std::env::remove_var("RUST_LOG");
    }
}
