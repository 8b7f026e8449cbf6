//! Upgrade-time authentication: credential extraction, lookup and agent/browser classification.

use crate::backend::{BackendError, CredentialLookup};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::{DateTime, Utc};
use sindri_console_core::{hash_credential, Principal};
use std::collections::HashMap;
use thiserror::Error;

const API_KEY_HEADER: &str = "x-api-key";
const INSTANCE_HEADER: &str = "x-instance-id";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("unknown credential")]
    UnknownCredential,
    #[error("credential expired")]
    Expired,
    #[error("credential bound to instance {bound}, connection claims {claimed}")]
    InstanceMismatch { bound: String, claimed: String },
    #[error("credential lookup failed: {0}")]
    Lookup(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientKind {
    Agent { instance_id: String },
    Browser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub principal: Principal,
    pub kind: ClientKind,
}

/// `Authorization: Bearer`, then `X-Api-Key`, then `?token=`, then `?apiKey=`.
pub fn extract_credential(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::to_string);
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    [
        bearer,
        api_key,
        query.get("token").cloned(),
        query.get("apiKey").cloned(),
    ]
    .into_iter()
    .flatten()
    .map(|value| value.trim().to_string())
    .find(|value| !value.is_empty())
}

pub fn extract_instance_hint(
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Option<String> {
    headers
        .get(INSTANCE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("instanceId").cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// A principal bound to an instance is an agent; an unbound one is a browser.
pub fn classify(principal: &Principal, hint: Option<&str>) -> Result<ClientKind, AuthError> {
    match (&principal.instance_id, hint) {
        (Some(bound), Some(claimed)) if bound != claimed => Err(AuthError::InstanceMismatch {
            bound: bound.clone(),
            claimed: claimed.to_string(),
        }),
        (Some(bound), _) => Ok(ClientKind::Agent {
            instance_id: bound.clone(),
        }),
        (None, _) => Ok(ClientKind::Browser),
    }
}

pub async fn authenticate(
    lookup: &dyn CredentialLookup,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<Admission, AuthError> {
    let raw = extract_credential(headers, query).ok_or(AuthError::MissingCredential)?;
    let principal = lookup
        .find_principal_by_credential(&hash_credential(&raw))
        .await?
        .ok_or(AuthError::UnknownCredential)?;
    if principal.is_expired(now) {
        return Err(AuthError::Expired);
    }
    let hint = extract_instance_hint(headers, query);
    let kind = classify(&principal, hint.as_deref())?;
    Ok(Admission { principal, kind })
}
