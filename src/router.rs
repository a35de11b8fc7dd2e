use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    book_meal_form, book_meal_submit, cancel_booking, health, index, login_form, login_submit,
    logout, not_found, profile, register_form, register_submit,
};
use crate::session::session_layer;
use crate::state::AppState;

/// Builds the application router. Pages run behind the session layer; health
/// checks and static files do not.
pub fn app_router(state: AppState) -> Router {
    let static_dir = ServeDir::new(&state.config.server.static_dir);

    Router::new()
        .route("/", get(index))
        .route("/register", get(register_form).post(register_submit))
        .route("/login", get(login_form).post(login_submit))
        .route("/logout", get(logout))
        .route("/profile", get(profile))
        .route("/book_meal", get(book_meal_form).post(book_meal_submit))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), session_layer))
        .route("/health", get(health))
        .nest_service("/static", static_dir)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
