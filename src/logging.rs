use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Installs the global fmt subscriber. Logs go to stderr so the console
/// transport keeps stdout for replies.
pub fn init(level: Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    // already set when a test or embedding application installed one
    tracing::subscriber::set_global_default(subscriber).ok();
}
