pub mod network;
pub mod peer;

pub use network::TestNetwork;
pub use peer::{basic_migrations, extended_migrations, ManualClock, QueueSocket, TestPeer, START_MS};

/// Install a compact test subscriber; repeated calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
