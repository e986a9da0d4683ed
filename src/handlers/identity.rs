//! Identity extraction from headers set by the authenticating proxy.

use crate::{errors::AppError, models::identity::Identity};
use axum::{extract::FromRequestParts, http::request::Parts};

pub const SUBJECT_HEADER: &str = "x-auth-subject";
pub const ROLE_HEADER: &str = "x-auth-role";

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let subject = header(parts, SUBJECT_HEADER)
            .ok_or_else(|| AppError::unauthorized("missing authenticated subject"))?;
        let role = header(parts, ROLE_HEADER).unwrap_or("user");

        Ok(Identity::new(subject, role))
    }
}

/// Non-empty, visible-ASCII header value.
fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
