//! `POST /rpc`: positional JSON-RPC dispatch.
//!
//! The request body is a JSON array `["method", arg1, …]` with at most four
//! arguments. Protocol-level failures (unparsable body, non-array) are 4xx;
//! everything after that is HTTP 200 carrying either the result value or
//! the typed error envelope, so clients switch on `error.code` rather than
//! on status codes.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use eventodb::{CategoryFilter, ConsumerGroup, Error, Message, Result};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::auth::{self, AuthContext};
use crate::server::AppState;

/// Response header carrying a token minted by test mode.
pub const TOKEN_HEADER: &str = "x-eventodb-token";

const MAX_ARGS: usize = 4;

pub async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, format!("malformed JSON: {err}")).into_response();
        }
    };
    let Some(call) = parsed.as_array() else {
        return (
            StatusCode::BAD_REQUEST,
            "request body must be a JSON array".to_owned(),
        )
            .into_response();
    };

    let auth = match auth::authenticate(&state, &headers, None).await {
        Ok(auth) => auth,
        Err(err) => return rpc_response(Json(err.to_envelope()).into_response(), None),
    };
    let minted = auth.minted_token.clone();

    let outcome = async {
        let method = call
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::invalid_request("missing method name"))?;
        let args = &call[1..];
        if args.len() > MAX_ARGS {
            return Err(Error::invalid_request(format!(
                "{method} called with {} arguments (max {MAX_ARGS})",
                args.len()
            )));
        }
        dispatch(&state, &auth, method, args).await
    };

    let body = match tokio::time::timeout(state.config.request_timeout, outcome).await {
        Err(_) => Error::Timeout.to_envelope(),
        Ok(Err(err)) => err.to_envelope(),
        Ok(Ok(value)) => value,
    };
    rpc_response(Json(body).into_response(), minted)
}

fn rpc_response(mut response: Response, minted_token: Option<String>) -> Response {
    if let Some(token) = minted_token {
        if let Ok(value) = token.parse() {
            response.headers_mut().insert(TOKEN_HEADER, value);
        }
    }
    response
}

/// Maps an error to a status for the non-RPC endpoints (`/subscribe`,
/// `/import`), which do use HTTP semantics.
pub fn protocol_error_response(err: &Error) -> Response {
    let status = match err {
        Error::AuthRequired | Error::AuthInvalidToken | Error::AuthUnauthorized => {
            StatusCode::UNAUTHORIZED
        }
        Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        Error::NamespaceNotFound { .. } => StatusCode::NOT_FOUND,
        Error::NamespaceNotEmpty { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err.to_envelope())).into_response()
}

async fn dispatch(
    state: &AppState,
    auth: &AuthContext,
    method: &str,
    args: &[Value],
) -> Result<Value> {
    match method {
        "stream.write" => stream_write(state, auth, args).await,
        "stream.get" => stream_get(state, auth, args).await,
        "stream.last" => stream_last(state, auth, args).await,
        "stream.version" => stream_version(state, auth, args).await,
        "category.get" => category_get(state, auth, args).await,
        "ns.create" => ns_create(state, auth, args).await,
        "ns.delete" => ns_delete(state, auth, args).await,
        "ns.list" => ns_list(state, auth).await,
        "ns.info" => ns_info(state, auth, args).await,
        "ns.rotateToken" => ns_rotate_token(state, auth, args).await,
        "ns.streams" => ns_streams(state, auth, args).await,
        "ns.categories" => ns_categories(state, auth).await,
        "sys.version" => Ok(json!(env!("CARGO_PKG_VERSION"))),
        "sys.health" => Ok(json!({
            "status": "ok",
            "backend": state.facade.backend_kind(),
            "connections": state.facade.connection_count(),
        })),
        other => Err(Error::invalid_request(format!("unknown method {other:?}"))),
    }
}

// ----------------------------------------------------------------------
// stream.* / category.*
// ----------------------------------------------------------------------

async fn stream_write(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let stream = required_str(args, 0, "stream")?;
    let message = required_object(args, 1, "message")?;
    let options = optional_object(args, 2)?;

    let msg_type = message
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_request("message.type must be a string"))?;
    let data = message.get("data").cloned().unwrap_or(Value::Null);
    let metadata = match message.get("metadata") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    };

    let id = match options.as_ref().and_then(|opts| opts.get("id")) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let raw = value
                .as_str()
                .ok_or_else(|| Error::invalid_request("options.id must be a string"))?;
            Some(
                Uuid::parse_str(raw)
                    .map_err(|_| Error::invalid_request(format!("invalid message id {raw:?}")))?,
            )
        }
    };
    let expected_version = opt_i64(options.as_ref(), "expectedVersion")?;

    let (written, event) = state
        .facade
        .write_message(
            &auth.namespace,
            stream,
            msg_type,
            data,
            metadata,
            id,
            expected_version,
        )
        .await?;

    state.hub.publish(&event);
    Ok(serde_json::to_value(written).map_err(Error::backend)?)
}

async fn stream_get(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let stream = required_str(args, 0, "stream")?;
    let options = optional_object(args, 1)?;

    let messages = state
        .facade
        .get_stream_messages(
            &auth.namespace,
            stream,
            opt_i64(options.as_ref(), "position")?,
            opt_i64(options.as_ref(), "globalPosition")?,
            opt_i64(options.as_ref(), "batchSize")?,
        )
        .await?;
    Ok(Value::Array(messages.iter().map(stream_row).collect()))
}

async fn stream_last(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let stream = required_str(args, 0, "stream")?;
    let options = optional_object(args, 1)?;
    let msg_type = opt_string(options.as_ref(), "type")?;

    let message = state
        .facade
        .get_last_stream_message(&auth.namespace, stream, msg_type.as_deref())
        .await?;
    Ok(message.as_ref().map(stream_row).unwrap_or(Value::Null))
}

async fn stream_version(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let stream = required_str(args, 0, "stream")?;
    let version = state.facade.stream_version(&auth.namespace, stream).await?;
    Ok(json!(version))
}

async fn category_get(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    // A null or absent category means every message in the namespace.
    let category = match args.first() {
        None | Some(Value::Null) => "",
        Some(value) => value
            .as_str()
            .ok_or_else(|| Error::invalid_request("category must be a string"))?,
    };
    let options = optional_object(args, 1)?;

    let consumer_group = match options.as_ref().and_then(|opts| opts.get("consumerGroup")) {
        None | Some(Value::Null) => None,
        Some(value) => {
            let group = value
                .as_object()
                .ok_or_else(|| Error::invalid_request("consumerGroup must be an object"))?;
            let member = group
                .get("member")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::invalid_request("consumerGroup.member must be a non-negative integer"))?;
            let size = group
                .get("size")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::invalid_request("consumerGroup.size must be a positive integer"))?;
            Some(ConsumerGroup { member, size })
        }
    };

    let filter = CategoryFilter {
        correlation: opt_string(options.as_ref(), "correlation")?,
        consumer_group,
    };
    let messages = state
        .facade
        .get_category_messages(
            &auth.namespace,
            category,
            opt_i64(options.as_ref(), "position")?,
            opt_i64(options.as_ref(), "batchSize")?,
            filter,
        )
        .await?;
    Ok(Value::Array(messages.iter().map(category_row).collect()))
}

// ----------------------------------------------------------------------
// ns.*
// ----------------------------------------------------------------------

async fn ns_create(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    auth.require_admin()?;
    let id = required_str(args, 0, "namespace")?;
    let options = optional_object(args, 1)?;

    let (record, token) = state
        .facade
        .create_namespace(
            id,
            opt_string(options.as_ref(), "token")?,
            opt_string(options.as_ref(), "description")?,
            options.as_ref().and_then(|opts| opts.get("metadata").cloned()),
        )
        .await?;

    Ok(json!({
        "namespace": record.id,
        "token": token,
        "createdAt": record.created_at,
    }))
}

async fn ns_delete(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let id = required_str(args, 0, "namespace")?;
    auth.authorize(id)?;

    let deleted = state.facade.delete_namespace(id).await?;
    Ok(json!({
        "namespace": id,
        "deletedAt": Utc::now(),
        "messagesDeleted": deleted,
    }))
}

async fn ns_list(state: &AppState, auth: &AuthContext) -> Result<Value> {
    auth.require_admin()?;

    let details = state.facade.list_namespace_details().await?;
    Ok(Value::Array(
        details
            .into_iter()
            .map(|d| {
                json!({
                    "namespace": d.namespace,
                    "description": d.description,
                    "createdAt": d.created_at,
                    "messageCount": d.message_count,
                    "streamCount": d.stream_count,
                })
            })
            .collect(),
    ))
}

async fn ns_info(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let id = match args.first() {
        None | Some(Value::Null) => auth.namespace.clone(),
        Some(value) => value
            .as_str()
            .ok_or_else(|| Error::invalid_request("namespace must be a string"))?
            .to_owned(),
    };
    auth.authorize(&id)?;

    let details = state.facade.namespace_details(&id).await?;
    Ok(json!({
        "namespace": details.namespace,
        "description": details.description,
        "createdAt": details.created_at,
        "messageCount": details.message_count,
        "streamCount": details.stream_count,
        "lastActivity": details.last_activity,
    }))
}

async fn ns_rotate_token(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let id = required_str(args, 0, "namespace")?;
    auth.authorize(id)?;

    let token = state.facade.rotate_token(id).await?;
    Ok(json!({
        "namespace": id,
        "token": token,
        "rotatedAt": Utc::now(),
    }))
}

async fn ns_streams(state: &AppState, auth: &AuthContext, args: &[Value]) -> Result<Value> {
    let options = optional_object(args, 0)?;
    let streams = state
        .facade
        .list_streams(
            &auth.namespace,
            opt_string(options.as_ref(), "prefix")?,
            opt_string(options.as_ref(), "cursor")?,
            opt_i64(options.as_ref(), "limit")?,
        )
        .await?;
    Ok(serde_json::to_value(streams).map_err(Error::backend)?)
}

async fn ns_categories(state: &AppState, auth: &AuthContext) -> Result<Value> {
    let categories = state.facade.list_categories(&auth.namespace).await?;
    Ok(serde_json::to_value(categories).map_err(Error::backend)?)
}

// ----------------------------------------------------------------------
// Row projections and argument helpers
// ----------------------------------------------------------------------

fn stream_row(msg: &Message) -> Value {
    json!([
        msg.id,
        msg.msg_type,
        msg.position,
        msg.global_position,
        msg.data,
        msg.metadata,
        msg.time,
    ])
}

fn category_row(msg: &Message) -> Value {
    json!([
        msg.id,
        msg.stream_name,
        msg.msg_type,
        msg.position,
        msg.global_position,
        msg.data,
        msg.metadata,
        msg.time,
    ])
}

fn required_str<'a>(args: &'a [Value], idx: usize, name: &str) -> Result<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::invalid_request(format!("{name} must be a non-empty string")))
}

fn required_object<'a>(
    args: &'a [Value],
    idx: usize,
    name: &str,
) -> Result<&'a Map<String, Value>> {
    args.get(idx)
        .and_then(Value::as_object)
        .ok_or_else(|| Error::invalid_request(format!("{name} must be an object")))
}

fn optional_object(args: &[Value], idx: usize) -> Result<Option<Map<String, Value>>> {
    match args.get(idx) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(_) => Err(Error::invalid_request("options must be an object")),
    }
}

fn opt_i64(options: Option<&Map<String, Value>>, key: &str) -> Result<Option<i64>> {
    match options.and_then(|opts| opts.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::invalid_request(format!("{key} must be an integer"))),
    }
}

fn opt_string(options: Option<&Map<String, Value>>, key: &str) -> Result<Option<String>> {
    match options.and_then(|opts| opts.get(key)) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(|s| Some(s.to_owned()))
            .ok_or_else(|| Error::invalid_request(format!("{key} must be a string"))),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn positional_args_parse() {
        let args = vec![json!("account-1"), json!({"batchSize": 5})];
        assert_eq!(required_str(&args, 0, "stream").unwrap(), "account-1");
        assert!(required_str(&args, 1, "stream").is_err());
        assert!(required_str(&args, 9, "stream").is_err());

        let opts = optional_object(&args, 1).unwrap().unwrap();
        assert_eq!(opt_i64(Some(&opts), "batchSize").unwrap(), Some(5));
        assert_eq!(opt_i64(Some(&opts), "missing").unwrap(), None);

        assert!(optional_object(&args, 0).is_err());
        assert!(optional_object(&args, 9).unwrap().is_none());
    }

    #[test]
    fn option_values_are_type_checked() {
        let opts = json!({"batchSize": "ten", "type": 5, "nullable": null});
        let opts = opts.as_object().unwrap();
        assert!(opt_i64(Some(opts), "batchSize").is_err());
        assert!(opt_string(Some(opts), "type").is_err());
        assert_eq!(opt_i64(Some(opts), "nullable").unwrap(), None);
        assert_eq!(opt_string(Some(opts), "nullable").unwrap(), None);
    }

    #[test]
    fn rows_render_in_wire_order() {
        let msg = Message {
            id: Uuid::nil(),
            stream_name: "account-1".to_owned(),
            msg_type: "Opened".to_owned(),
            position: 0,
            global_position: 7,
            data: json!({"balance": 3}),
            metadata: None,
            time: Utc::now(),
        };

        let row = stream_row(&msg);
        assert_eq!(row[1], "Opened");
        assert_eq!(row[2], 0);
        assert_eq!(row[3], 7);
        assert_eq!(row[5], serde_json::Value::Null);

        let row = category_row(&msg);
        assert_eq!(row[1], "account-1");
        assert_eq!(row[2], "Opened");
        assert_eq!(row.as_array().unwrap().len(), 8);
    }
}
