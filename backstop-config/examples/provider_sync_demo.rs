//! Sync issues from a flaky provider through the recovery system.
//!
//! Run with `cargo run -p backstop-config --example provider_sync_demo`,
//! optionally with `BACKSTOP_*` variables set.

use backstop_config::ConfigLoader;
use backstop_resilience::{
    init_global_recovery_system, global_recovery_system, ExecuteOptions, OperationContext,
    ProviderError, RecoveryStrategy,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::new().load(None::<&str>)?;
    backstop_logging::init_logging_from_config(&config.logging)?;

    init_global_recovery_system(config.recovery).map_err(anyhow::Error::msg)?;
    let recovery = global_recovery_system();

    // The first two calls hit the rate limit, the third goes through
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let issues = recovery
        .execute_with_context(
            "linear",
            move |attempt| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(ProviderError::rate_limited(Some(1)).with_quota(0, 1500))
                    } else {
                        let page_size = 50 >> attempt;
                        Ok((0..page_size).map(|n| format!("LIN-{}", n)).collect::<Vec<_>>())
                    }
                }
            },
            ExecuteOptions::new()
                .strategy(RecoveryStrategy::ReduceBatch)
                .context("job", "tracker-sync")
                .on_rate_limit(|notice| {
                    log::info!(
                        "{} attempt {} rate limited, next delay {:?}",
                        notice.provider,
                        notice.attempt,
                        notice.next_delay
                    );
                }),
        )
        .await?;
    log::info!("Fetched {} issues after {} calls", issues.len(), calls.load(Ordering::SeqCst));

    // A webhook replay that is parked on the queue and settled by its worker
    let mut context = OperationContext::new();
    context.insert("delivery".to_string(), "replay-42".into());
    let replay = recovery.queue_for_retry(
        "slack",
        || async { Ok::<_, ProviderError>("delivered") },
        context,
    )?;
    log::info!("Webhook replay {}: {}", replay.id(), replay.await?);

    for status in recovery.all_provider_statuses() {
        log::info!(
            "{}: circuit {}, {} calls, {} rate limited",
            status.provider,
            status.circuit,
            status.metrics.total_calls,
            status.metrics.total_rate_limited
        );
    }

    recovery.shutdown();
    Ok(())
}
