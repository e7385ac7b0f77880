//! `POST /import`: streaming NDJSON bulk import.
//!
//! One message per line in the export schema. Lines are framed and parsed
//! incrementally off the request body, committed in batches, and the
//! response body streams one JSON progress line per committed batch. The
//! target namespace must be empty; earlier batches stay committed when a
//! later one fails, so the recovery path is delete-and-recreate.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use eventodb::{Error, ExportedMessage};
use eventodb_store::StoreFacade;
use futures::StreamExt;
use serde_json::json;
use tracing::info;

use crate::auth;
use crate::rpc::protocol_error_response;
use crate::server::AppState;

const NDJSON: &str = "application/x-ndjson";

pub async fn handle_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(NDJSON) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("import expects {NDJSON}"),
        )
            .into_response();
    }

    let auth = match auth::authenticate(&state, &headers, None).await {
        Ok(auth) => auth,
        Err(err) => return protocol_error_response(&err),
    };
    if let Err(err) = state.facade.assert_namespace_empty(&auth.namespace).await {
        return protocol_error_response(&err);
    }

    let facade = state.facade.clone();
    let namespace = auth.namespace.clone();
    let batch_size = state.config.import_batch_size.max(1);

    let progress = async_stream::stream! {
        let start = Instant::now();
        let mut body = body.into_data_stream();
        let mut buf: Vec<u8> = Vec::new();
        let mut batch: Vec<(u64, ExportedMessage)> = Vec::new();
        let mut imported = 0u64;
        let mut line_no = 0u64;

        'read: loop {
            let chunk = match body.next().await {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    yield Ok::<String, Infallible>(error_line(&Error::invalid_request(
                        format!("failed to read request body: {err}"),
                    )));
                    return;
                }
                None => break 'read,
            };
            buf.extend_from_slice(&chunk);

            while let Some(end) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=end).collect();
                line_no += 1;
                match parse_line(&line, line_no) {
                    Ok(None) => continue,
                    Ok(Some(msg)) => batch.push((line_no, msg)),
                    Err(err) => {
                        yield Ok(error_line(&err));
                        return;
                    }
                }

                if batch.len() >= batch_size {
                    match commit(&facade, &namespace, &mut batch, &mut imported).await {
                        Ok(line) => yield Ok(line),
                        Err(line) => {
                            yield Ok(line);
                            return;
                        }
                    }
                }
            }
        }

        // A final line without a trailing newline still counts.
        if !buf.is_empty() {
            line_no += 1;
            match parse_line(&buf, line_no) {
                Ok(None) => {}
                Ok(Some(msg)) => batch.push((line_no, msg)),
                Err(err) => {
                    yield Ok(error_line(&err));
                    return;
                }
            }
        }
        if !batch.is_empty() {
            match commit(&facade, &namespace, &mut batch, &mut imported).await {
                Ok(line) => yield Ok(line),
                Err(line) => {
                    yield Ok(line);
                    return;
                }
            }
        }

        info!(namespace = %namespace, imported, "bulk import finished");
        yield Ok(format!(
            "{}\n",
            json!({
                "done": true,
                "imported": imported,
                "elapsed": start.elapsed().as_secs_f64(),
            })
        ));
    };

    Response::builder()
        .header(CONTENT_TYPE, NDJSON)
        .body(Body::from_stream(progress))
        .expect("static response parts")
}

fn parse_line(line: &[u8], line_no: u64) -> Result<Option<ExportedMessage>, Error> {
    let trimmed = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| {
            let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap_or(start);
            &line[start..=end]
        });
    let Some(trimmed) = trimmed else {
        return Ok(None);
    };

    serde_json::from_slice(trimmed).map(Some).map_err(|err| {
        Error::invalid_request(format!("line {line_no}: invalid import record: {err}"))
    })
}

async fn commit(
    facade: &Arc<StoreFacade>,
    namespace: &str,
    batch: &mut Vec<(u64, ExportedMessage)>,
    imported: &mut u64,
) -> Result<String, String> {
    let messages: Vec<ExportedMessage> = batch.iter().map(|(_, msg)| msg.clone()).collect();
    match facade.import_batch(namespace, &messages).await {
        Ok(()) => {
            *imported += messages.len() as u64;
            let last_gpos = messages.last().map(|msg| msg.gpos).unwrap_or_default();
            batch.clear();
            Ok(format!(
                "{}\n",
                json!({ "imported": imported, "gpos": last_gpos })
            ))
        }
        Err(err) => Err(error_line(&attach_line(err, batch))),
    }
}

/// Maps a colliding global position back to its input line number.
fn attach_line(err: Error, batch: &[(u64, ExportedMessage)]) -> Error {
    match err {
        Error::PositionExists {
            global_position, ..
        } => Error::PositionExists {
            global_position,
            line: batch
                .iter()
                .rev()
                .find(|(_, msg)| msg.gpos == global_position)
                .map(|(line, _)| *line),
        },
        other => other,
    }
}

fn error_line(err: &Error) -> String {
    format!("{}\n", err.to_envelope())
}
