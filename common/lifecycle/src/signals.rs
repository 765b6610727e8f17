use futures::future::select_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) fn default_signals() -> Vec<SignalKind> {
    vec![SignalKind::interrupt(), SignalKind::terminate()]
}

pub(crate) fn signal_name(kind: SignalKind) -> String {
    match kind {
        k if k == SignalKind::interrupt() => "SIGINT".to_string(),
        k if k == SignalKind::terminate() => "SIGTERM".to_string(),
        k if k == SignalKind::hangup() => "SIGHUP".to_string(),
        k if k == SignalKind::quit() => "SIGQUIT".to_string(),
        k => format!("{k:?}"),
    }
}

/// Waits for the first of `kinds` to be delivered, returning which one. Returns `None`
/// when `stop` fires first. The subscriptions are dropped on return either way.
pub(crate) async fn wait_for_any(
    kinds: &[SignalKind],
    stop: &CancellationToken,
) -> Option<SignalKind> {
    let mut streams = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        match signal(kind) {
            Ok(stream) => streams.push((kind, stream)),
            Err(e) => warn!(signal = %signal_name(kind), error = %e, "failed to install signal handler"),
        }
    }

    if streams.is_empty() {
        stop.cancelled().await;
        return None;
    }

    let received = streams.iter_mut().map(|(kind, stream)| {
        let kind = *kind;
        Box::pin(async move {
            stream.recv().await;
            kind
        })
    });

    tokio::select! {
        (kind, _, _) = select_all(received) => Some(kind),
        _ = stop.cancelled() => None,
    }
}
