use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// calls after the first are no-ops.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper_util=warn"));
        let _ = tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .try_init();
    });
}
