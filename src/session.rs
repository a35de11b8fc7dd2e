//! Cookie-backed server-side sessions.
//!
//! The browser holds an opaque random token; storage only ever sees its SHA-256
//! digest. Every request passes through [`session_layer`], which guarantees a live
//! [`Session`] in the request extensions.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{
        header::{COOKIE, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{AppError, ErrorPage, Result};
use crate::models::{Flash, Member, Session};
use crate::state::AppState;
use crate::templates::PageContext;

pub const SESSION_COOKIE: &str = "unique_meal_session";
pub const LOGIN_REQUIRED_MESSAGE: &str = "Please log in to access this page.";

pub fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// `Set-Cookie` value for a session token.
pub fn session_cookie(config: &SessionConfig, token: &str) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        config.ttl_hours * 3600
    );
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Value of the first cookie called `name` across all `Cookie` headers.
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"'))
}

/// Creates and stores a fresh session, returning the cookie token alongside it.
pub async fn start_session(state: &AppState, member_id: Option<i64>) -> Result<(String, Session)> {
    let token = new_token();
    let now = Utc::now();
    let session = Session {
        id: token_digest(&token),
        member_id,
        csrf_token: new_token(),
        flashes: Vec::new(),
        created_at: now,
        expires_at: now + Duration::hours(state.config.session.ttl_hours),
    };
    state.storage.create_session(&session).await?;
    debug!(authenticated = member_id.is_some(), "Started new session");
    Ok((token, session))
}

/// Replaces `old` with a new session, so a token seen before login is useless after it.
pub async fn rotate_session(
    state: &AppState,
    old: &Session,
    member_id: Option<i64>,
) -> Result<(String, Session)> {
    state.storage.delete_session(&old.id).await?;
    start_session(state, member_id).await
}

/// Resolves the request's session, starting a new one when the cookie is absent,
/// unknown or expired. The token is returned only when a new session was started.
async fn load_or_start(state: &AppState, headers: &HeaderMap) -> Result<(Session, Option<String>)> {
    if let Some(token) = read_cookie(headers, SESSION_COOKIE) {
        let id = token_digest(token);
        match state.storage.get_session(&id).await? {
            Some(session) if !session.is_expired(Utc::now()) => return Ok((session, None)),
            Some(_) => {
                debug!("Session expired, starting a new one");
                state.storage.delete_session(&id).await?;
            }
            None => debug!("Unknown session cookie, starting a new one"),
        }
    }

    let (token, session) = start_session(state, None).await?;
    Ok((session, Some(token)))
}

fn sets_session_cookie(response: &Response) -> bool {
    let prefix = format!("{SESSION_COOKIE}=");
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.starts_with(&prefix))
}

/// Renders an error page again with the session's navigation and flashes.
async fn error_page_for(
    state: &AppState,
    session: &Session,
    error_page: ErrorPage,
) -> Result<Response> {
    let member = session_member(state, session).await?;
    let page = PageContext::load(state, session, member.as_ref()).await?;
    Ok(error_page.render(page))
}

/// Middleware that attaches the current [`Session`] to every request.
pub async fn session_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers().clone();
    let (session, new_token) = match load_or_start(&state, &headers).await {
        Ok(loaded) => loaded,
        Err(e) => return e.into_response(),
    };

    request.extensions_mut().insert(session.clone());
    let mut response = next.run(request).await;

    if let Some(error_page) = response.extensions_mut().remove::<ErrorPage>() {
        match error_page_for(&state, &session, error_page).await {
            Ok(rendered) => response = rendered,
            Err(e) => warn!("Could not render error page with session: {}", e),
        }
    }

    // Handlers that rotate the session set their own cookie
    if let Some(token) = new_token {
        if !sets_session_cookie(&response) {
            match HeaderValue::from_str(&session_cookie(&state.config.session, &token)) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!("Could not encode session cookie: {}", e),
            }
        }
    }

    response
}

/// Compares the submitted token with the session's without short-circuiting.
pub fn verify_csrf(session: &Session, submitted: &str) -> Result<()> {
    let expected = session.csrf_token.as_bytes();
    let submitted = submitted.as_bytes();
    let matches = expected.len() == submitted.len()
        && expected
            .iter()
            .zip(submitted)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if matches {
        Ok(())
    } else {
        warn!("Rejected form submission with invalid CSRF token");
        Err(AppError::InvalidCsrfToken)
    }
}

/// Member bound to `session`, if any.
pub async fn session_member(state: &AppState, session: &Session) -> Result<Option<Member>> {
    match session.member_id {
        Some(id) => state.storage.get_member(id).await,
        None => Ok(None),
    }
}

/// Extractor for pages that require a logged-in member.
///
/// Anonymous visitors are flashed a notice and redirected to `/login?next=<path>`.
#[derive(Debug, Clone)]
pub struct CurrentMember {
    pub member: Member,
    pub session: Session,
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentMember {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        let session = parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| AppError::internal("session layer is not installed").into_response())?;

        if let Some(member) = session_member(state, &session)
            .await
            .map_err(IntoResponse::into_response)?
        {
            return Ok(CurrentMember { member, session });
        }

        if let Err(e) = state
            .storage
            .push_flash(&session.id, Flash::info(LOGIN_REQUIRED_MESSAGE))
            .await
        {
            warn!("Failed to store login notice: {}", e);
        }

        let next = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Err(Redirect::to(&login_redirect_target(next)).into_response())
    }
}

pub fn login_redirect_target(next: &str) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("next", next)
        .finish();
    format!("/login?{query}")
}
