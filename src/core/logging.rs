use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Install a global fmt subscriber at `level`.
///
/// Returns `false` when a global subscriber was already set, which makes
/// this safe to call from every test.
pub fn init_tracing(level: Level) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
