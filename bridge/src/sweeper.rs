use crate::errors::Error;
use crate::model::Outcome;
use crate::store::CommandStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: usize,
    pub evicted: usize,
}

/// Times out pending commands past their deadline, then evicts settled
/// commands older than `retention`.
pub fn sweep_once(store: &CommandStore, now: DateTime<Utc>, retention: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    for command in store.list_expired(now) {
        match store.transition(&command.command_id, Outcome::timeout()) {
            Ok(_) => {
                report.timed_out += 1;
                info!(
                    command_id = %command.command_id,
                    device_id = %command.device_id,
                    action = %command.action,
                    "Command timed out"
                );
            }
            Err(Error::AlreadyTerminal { status, .. }) => {
                debug!(command_id = %command.command_id, status = %status, "Command settled before timeout");
            }
            Err(e) => {
                warn!(command_id = %command.command_id, "Failed to time out command: {}", e);
            }
        }
    }

    for command_id in store.list_retention_expired(now, retention) {
        if store.evict(&command_id).is_some() {
            report.evicted += 1;
        }
    }

    report
}

pub async fn run_sweeper(store: Arc<CommandStore>, every: std::time::Duration, retention: Duration) {
    info!(
        "Starting command sweeper with interval={:?}, retention={}s",
        every,
        retention.num_seconds()
    );

    let mut ticker = interval(every);

    loop {
        ticker.tick().await;

        let report = sweep_once(&store, Utc::now(), retention);
        if report.timed_out > 0 || report.evicted > 0 {
            debug!(
                "Sweep timed out {} and evicted {} commands ({} tracked)",
                report.timed_out,
                report.evicted,
                store.len()
            );
        }
    }
}
