use std::{
    env,
    fmt::Debug,
    str::FromStr,
};

use tracing_subscriber::EnvFilter;

/// Reads one of the gateway's `DBC_*` tunables from the environment.
///
/// Every knob is a `LazyLock` static initialized through this helper, so the
/// full env surface of a deployment is `ADDR`, `DBC_CONFIG`, `DBC_LOG` (all
/// consumed by the binary's flags and [`log_filter`]) plus the `DBC_*` knobs
/// declared next to the code they tune. Unset or unparsable values fall back
/// to `default`; overrides are logged so a deployment's effective knobs can
/// be reconstructed from its startup output.
pub fn env_config<T>(name: &str, default: T) -> T
where
    T: Debug + FromStr,
    T::Err: Debug,
{
    debug_assert!(name.starts_with("DBC_"), "knob names share the DBC_ prefix");
    let Ok(raw) = env::var(name) else {
        return default;
    };
    match raw.parse::<T>() {
        Ok(value) => {
            tracing::info!("Knob {name} overridden to {value:?} from the environment");
            value
        },
        Err(e) => {
            tracing::warn!("Ignoring {name}={raw} ({e:?}); keeping default {default:?}");
            default
        },
    }
}

/// Builds the log filter for the process: `DBC_LOG` wins, then `RUST_LOG`,
/// then the provided default directive.
pub fn log_filter(default_directive: &str) -> EnvFilter {
    if let Ok(directives) = env::var("DBC_LOG") {
        return EnvFilter::new(directives);
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Call this from tests that want log output. Initialization is best-effort
/// since multiple tests race to install the global subscriber.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter("info"))
        .with_test_writer()
        .compact()
        .try_init();
}
