//! The TCP accept loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sentry::{Hub, SentryFutureExt};
use tokio::net::TcpListener;

use crate::backend::ProfileBackend;
use crate::loader::LoadError;
use crate::service::{ConnectionError, ProfileService};

/// Accepts connections on `listener` until `shutdown` resolves.
///
/// Every connection is served on its own task. Connections that are still running when the
/// server shuts down are not awaited.
pub async fn serve<B, F>(listener: TcpListener, service: Arc<ProfileService<B>>, shutdown: F)
where
    B: ProfileBackend,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually running out of file descriptors, which resolves itself once other
                    // connections close.
                    tracing::error!(error = &err as &dyn std::error::Error, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        metric!(counter("connections.accepted") += 1);
        tracing::trace!(%peer, "Accepted connection");

        let service = Arc::clone(&service);
        let connection = async move {
            match service.handle_connection(stream).await {
                Ok(outcome) => tracing::debug!(%peer, outcome = outcome.as_str(), "Closed connection"),
                Err(err) => report_connection_error(&err),
            }
        };
        tokio::spawn(connection.bind_hub(Hub::new_from_top(Hub::current())));
    }

    tracing::info!("Stopped accepting connections");
}

fn report_connection_error(err: &ConnectionError) {
    metric!(counter("connections.failed") += 1);
    let err_ref = err as &dyn std::error::Error;
    match err {
        ConnectionError::Load(LoadError::InternalError) | ConnectionError::InternalError => {
            tracing::error!(error = err_ref, "Failed to serve connection");
        }
        ConnectionError::Load(_) | ConnectionError::Serialize(_) => {
            tracing::warn!(error = err_ref, "Failed to serve connection");
        }
        ConnectionError::Io(_) | ConnectionError::LineTooLong(_) => {
            tracing::debug!(error = err_ref, "Dropped connection");
        }
    }
}
