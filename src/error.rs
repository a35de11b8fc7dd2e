use askama::Template;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::templates::{ErrorTemplate, PageContext};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Template rendering failed: {0}")]
    Template(#[from] askama::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    #[error("Username is already taken")]
    UsernameTaken,

    #[error("Email is already registered")]
    EmailTaken,

    #[error("You have already booked that meal for that date")]
    DuplicateBooking,

    #[error("Unknown member: {0}")]
    UnknownMember(i64),

    #[error("Past bookings cannot be cancelled")]
    BookingInPast,

    #[error("Invalid form submission")]
    InvalidCsrfToken,

    #[error("Not found")]
    NotFound,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        AppError::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::UsernameTaken | AppError::EmailTaken | AppError::DuplicateBooking => {
                StatusCode::CONFLICT
            }
            AppError::InvalidCsrfToken => StatusCode::FORBIDDEN,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::UnknownMember(_) | AppError::BookingInPast => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Database(_)
            | AppError::Template(_)
            | AppError::Json(_)
            | AppError::Toml(_)
            | AppError::Io(_)
            | AppError::Config(_)
            | AppError::PasswordHash(_)
            | AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A rendered error page. It travels in the response extensions so the session
/// layer can render it again with the visitor's own navigation.
#[derive(Debug, Clone)]
pub struct ErrorPage {
    pub status: StatusCode,
    pub message: String,
}

impl ErrorPage {
    pub fn render(&self, page: PageContext) -> Response {
        let template = ErrorTemplate {
            page,
            status: self.status.as_u16(),
            message: self.message.clone(),
        };

        let mut response = match template.render() {
            Ok(body) => (self.status, Html(body)).into_response(),
            Err(e) => {
                error!("Failed to render error page: {}", e);
                (self.status, self.status.to_string()).into_response()
            }
        };
        response.extensions_mut().insert(self.clone());
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Server-side failures are logged in full and shown generically
        let message = if status.is_server_error() {
            error!(error = %self, "Request failed");
            "Something went wrong on our side. Please try again later.".to_string()
        } else {
            self.to_string()
        };

        ErrorPage { status, message }.render(PageContext::default())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_keep_their_message() {
        let response = AppError::BookingInPast.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let page = response.extensions().get::<ErrorPage>().unwrap();
        assert_eq!(page.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(page.message, "Past bookings cannot be cancelled");
    }

    #[test]
    fn test_server_errors_hide_details() {
        let response = AppError::internal("disk on fire").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let page = response.extensions().get::<ErrorPage>().unwrap();
        assert!(!page.message.contains("disk on fire"));
    }
}
