use rlimit::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Warns when the open file limit is too low for `concurrency` segment files plus sockets
pub fn warn_ulimit(concurrency: usize) {
    let Ok((limit, _)) = rlimit::getrlimit(Resource::NOFILE) else {
        return;
    };

    let wanted = concurrency as u64 * 2 + 64;
    if limit < wanted {
        warn!(
            "Your file limit ({limit}) is very low for {concurrency} parallel downloads. Consider raising your file limit via `ulimit -n {}`",
            wanted.max(10240)
        );
    }
}

/// Spawn a task that watches for termination signals and cancels a [`CancellationToken`] when caught.
///
/// A second signal exits the process right away, without waiting for in-flight transfers.
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        relay_signals(&ct, wait_for_signal).await;
        warn!("Caught a second termination signal, exiting without waiting for downloads");
        std::process::exit(130);
    });
}

/// Cancels `ct` on the first signal and returns on the second
async fn relay_signals<F, Fut>(ct: &CancellationToken, mut next_signal: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    next_signal().await;
    info!("Caught termination signal! Send it again to quit immediately");
    ct.cancel();
    next_signal().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut term), Ok(mut hup), Ok(mut quit)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
        signal(SignalKind::quit()),
    ) else {
        warn!("Unable to listen for termination signals, only CTRL+C is handled");
        tokio::signal::ctrl_c().await.ok();
        return;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = hup.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::Notify;

    use super::*;

    #[tokio::test]
    async fn first_signal_cancels_and_second_one_returns() {
        let ct = CancellationToken::new();
        let signals = Arc::new(Notify::new());

        let relay = {
            let ct = ct.clone();
            let signals = signals.clone();
            tokio::spawn(async move {
                relay_signals(&ct, || {
                    let signals = signals.clone();
                    async move { signals.notified().await }
                })
                .await;
            })
        };

        signals.notify_one();
        tokio::time::timeout(Duration::from_secs(1), ct.cancelled())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_finished());

        signals.notify_one();
        tokio::time::timeout(Duration::from_secs(1), relay)
            .await
            .unwrap()
            .unwrap();
    }
}
