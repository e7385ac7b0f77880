//! Bearer-token authentication.
//!
//! The token arrives in the `Authorization` header or, for clients that
//! cannot set headers (the browser event-source API), in a `token` query
//! parameter. Its middle segment names the namespace; the hash of the whole
//! plaintext must match the registry row. The `default` namespace's token
//! doubles as the admin credential.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use eventodb::{Error, Result};
use eventodb_store::{token, DEFAULT_NAMESPACE};
use tracing::info;

use crate::server::AppState;

/// The authenticated caller of one request.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub namespace: String,
    pub is_admin: bool,
    /// Set when test mode minted a namespace for a tokenless request; the
    /// plaintext goes back in the `X-EventoDB-Token` response header.
    pub minted_token: Option<String>,
}

impl AuthContext {
    /// Admin may target any namespace; everyone else only their own.
    pub fn authorize(&self, namespace: &str) -> Result<()> {
        if self.is_admin || self.namespace == namespace {
            Ok(())
        } else {
            Err(Error::AuthUnauthorized)
        }
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(Error::AuthUnauthorized)
        }
    }
}

pub async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthContext> {
    let token = match bearer_token(headers).or(query_token) {
        Some(token) => token,
        None if state.config.test_mode => return mint_test_namespace(state).await,
        None => return Err(Error::AuthRequired),
    };

    let namespace = token::parse_namespace(token)?;
    let record = state
        .facade
        .get_namespace_record(&namespace)
        .await?
        .ok_or(Error::AuthInvalidToken)?;
    if !token::verify(token, &record.token_hash) {
        return Err(Error::AuthInvalidToken);
    }

    Ok(AuthContext {
        is_admin: namespace == DEFAULT_NAMESPACE,
        namespace,
        minted_token: None,
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Test-mode path: a tokenless request gets a namespace of its own.
async fn mint_test_namespace(state: &AppState) -> Result<AuthContext> {
    loop {
        let id = format!("test-{:08x}", rand::random::<u32>());
        match state.facade.create_namespace(&id, None, None, None).await {
            Ok((record, plaintext)) => {
                info!(namespace = %record.id, "test mode minted a namespace");
                return Ok(AuthContext {
                    namespace: record.id,
                    is_admin: false,
                    minted_token: Some(plaintext),
                });
            }
            Err(Error::NamespaceExists { .. }) => continue,
            Err(err) => return Err(err),
        }
    }
}
