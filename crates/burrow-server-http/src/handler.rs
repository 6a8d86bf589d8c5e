//! Hand-off route handler

use axum::{
    body::{Body, Bytes},
    extract::{rejection::QueryRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use burrow_broker::{BrokerError, RelayFuture, TunnelBroker, TunnelToken};
use futures::Stream;
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const MISSING_TUNNEL_ID: &str = "missing tunnel id\n";
pub const INVALID_TUNNEL_ID: &str = "invalid tunnel id\n";
pub const TUNNEL_NOT_FOUND: &str = "tunnel not found\n";

const INTERNAL_ERROR: &str = "internal error\n";

/// Buffer between the session relay and the response body
const BODY_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
pub struct TunnelQuery {
    pub id: Option<String>,
}

/// Build the hand-off router
pub fn router(broker: Arc<TunnelBroker>) -> Router {
    Router::new()
        .route("/", any(hand_off))
        .with_state(broker)
        .layer(TraceLayer::new_for_http())
}

type Rejection = (StatusCode, &'static str);

/// Claim the tunnel named by `id` and stream its relay as the response body.
///
/// The response starts as soon as the session has the hand-off; the body
/// ends after the session's end-of-stream and the trailer. A failed relay
/// aborts the body instead.
async fn hand_off(
    State(broker): State<Arc<TunnelBroker>>,
    query: Result<Query<TunnelQuery>, QueryRejection>,
) -> Result<Response, Rejection> {
    let Query(query) = query.map_err(|e| {
        debug!("Rejected query string: {}", e);
        (StatusCode::BAD_REQUEST, INVALID_TUNNEL_ID)
    })?;
    let token = parse_token(query.id.as_deref())?;

    let (destination, body) = tokio::io::duplex(BODY_PIPE_CAPACITY);
    let relay = broker
        .hand_off_with_deadline(token, destination)
        .map_err(reject)?;

    let stream = RelayBody {
        token,
        reader: Some(ReaderStream::new(body)),
        relay: Some(relay),
    };

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

fn parse_token(id: Option<&str>) -> Result<TunnelToken, Rejection> {
    let Some(id) = id else {
        debug!("Request without tunnel id");
        return Err((StatusCode::BAD_REQUEST, MISSING_TUNNEL_ID));
    };

    id.parse().map_err(|_| {
        debug!("Rejected tunnel id {:?}", id);
        (StatusCode::BAD_REQUEST, INVALID_TUNNEL_ID)
    })
}

fn reject(err: BrokerError) -> Rejection {
    match err {
        BrokerError::TokenNotFound | BrokerError::SessionClosed => {
            (StatusCode::NOT_FOUND, TUNNEL_NOT_FOUND)
        }
        BrokerError::MalformedInput(_) => (StatusCode::BAD_REQUEST, INVALID_TUNNEL_ID),
        other => {
            error!("Hand-off failed before relay: {}", other);
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
    }
}

/// Response body carrying the relayed bytes, then the relay outcome.
///
/// A failed relay ends the body with an error so the response is aborted
/// rather than completed. Dropping the body cancels the tunnel.
struct RelayBody<S> {
    token: TunnelToken,
    reader: Option<S>,
    relay: Option<RelayFuture>,
}

impl<S> RelayBody<S> {
    /// Ready with `Some` once the relay has failed
    fn poll_relay(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Error>> {
        let Some(relay) = self.relay.as_mut() else {
            return Poll::Ready(None);
        };

        let result = ready!(relay.as_mut().poll(cx));
        self.relay = None;

        match result {
            Ok(bytes) => {
                info!(token = %self.token, bytes, "Hand-off complete");
                Poll::Ready(None)
            }
            Err(e) => {
                warn!(token = %self.token, error = %e, "Hand-off failed");
                self.reader = None;
                Poll::Ready(Some(io::Error::other(e)))
            }
        }
    }
}

impl<S> Stream for RelayBody<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        // Polled before the reader so the relay deadline fires while the session is idle
        if let Poll::Ready(Some(e)) = this.poll_relay(cx) {
            return Poll::Ready(Some(Err(e)));
        }

        if let Some(reader) = this.reader.as_mut() {
            match ready!(Pin::new(reader).poll_next(cx)) {
                Some(chunk) => return Poll::Ready(Some(chunk)),
                None => this.reader = None,
            }
        }

        this.poll_relay(cx).map(|failure| failure.map(Err))
    }
}
