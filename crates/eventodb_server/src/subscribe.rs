//! `GET /subscribe`: SSE poke delivery.
//!
//! A subscriber names exactly one of a stream, a category, or the whole
//! namespace, plus an optional starting global position. Pokes carry
//! pointers only (stream, position, global position); the client fetches
//! message bodies through the read RPCs at its own pace, which is what
//! keeps per-subscriber server memory bounded.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use eventodb::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth;
use crate::pubsub::SubscriptionKind;
use crate::rpc::protocol_error_response;
use crate::server::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    stream: Option<String>,
    category: Option<String>,
    all: Option<bool>,
    position: Option<i64>,
    token: Option<String>,
}

impl SubscribeQuery {
    fn kind(&self) -> Result<SubscriptionKind> {
        match (&self.stream, &self.category, self.all.unwrap_or(false)) {
            (Some(stream), None, false) => Ok(SubscriptionKind::Stream(stream.clone())),
            (None, Some(category), false) => Ok(SubscriptionKind::Category(category.clone())),
            (None, None, true) => Ok(SubscriptionKind::All),
            _ => Err(Error::invalid_request(
                "subscribe takes exactly one of stream, category or all=true",
            )),
        }
    }
}

pub async fn handle_subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SubscribeQuery>,
) -> Response {
    let auth = match auth::authenticate(&state, &headers, query.token.as_deref()).await {
        Ok(auth) => auth,
        Err(err) => return protocol_error_response(&err),
    };
    let kind = match query.kind() {
        Ok(kind) => kind,
        Err(err) => return protocol_error_response(&err),
    };

    let min_position = query.position.unwrap_or(0);
    let mut subscription = state.hub.subscribe(&auth.namespace, kind.clone());
    debug!(namespace = %auth.namespace, ?kind, min_position, "subscriber connected");

    let stream = async_stream::stream! {
        // Tells the client the subscription is live before any write lands.
        yield Ok::<Event, Infallible>(Event::default().comment("ready"));

        while let Some(event) = subscription.receiver.recv().await {
            if event.global_position < min_position {
                continue;
            }
            let payload = json!({
                "stream": event.stream,
                "position": event.position,
                "globalPosition": event.global_position,
            });
            yield Ok(Event::default().event("poke").data(payload.to_string()));
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keep-alive"),
        )
        .into_response()
}
