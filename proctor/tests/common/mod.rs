use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .with(filter)
            .init();
    });
}

/// Drain every notice currently buffered on a bus receiver.
#[allow(dead_code)]
pub fn drain_notices(rx: &mut tokio::sync::broadcast::Receiver<String>) -> Vec<serde_json::Value> {
    let mut notices = Vec::new();
    while let Ok(line) = rx.try_recv() {
        notices.push(serde_json::from_str(&line).expect("notice should be JSON"));
    }
    notices
}

/// Names of the given notices, in order.
#[allow(dead_code)]
pub fn notice_names(notices: &[serde_json::Value]) -> Vec<String> {
    notices
        .iter()
        .map(|n| n["event"].as_str().unwrap_or_default().to_string())
        .collect()
}
