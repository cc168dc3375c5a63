use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "join_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct JoinMetrics {
    pub records_yielded: usize,
    pub records_skipped: usize,
    pub ran_ahead: usize,
    pub timeouts: usize,
    pub commits: usize,
    pub groups_processed: usize,
    pub groups_dropped: usize,
    pub outputs_sent: usize,
}
