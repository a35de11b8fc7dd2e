use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header::SET_COOKIE, StatusCode},
    response::{Html, IntoResponse, Json, Redirect, Response},
    Extension, Form,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tracing::info;

use crate::auth;
use crate::error::{AppError, Result};
use crate::forms::{safe_next, BookingForm, CsrfForm, FormErrors, LoginForm, RegistrationForm};
use crate::models::{Flash, NewBooking, Session};
use crate::session::{rotate_session, session_cookie, session_member, verify_csrf, CurrentMember};
use crate::state::AppState;
use crate::templates::{
    tier_options, BookMealTemplate, IndexTemplate, LoginTemplate, PageContext, ProfileTemplate,
    RegisterTemplate,
};

const DEFAULT_LANDING: &str = "/profile";

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn render<T: Template>(status: StatusCode, template: &T) -> Result<Response> {
    Ok((status, Html(template.render()?)).into_response())
}

/// Redirect that also hands the browser a new session cookie.
fn redirect_with_session(state: &AppState, token: &str, target: &str) -> Response {
    (
        [(SET_COOKIE, session_cookie(&state.config.session, token))],
        Redirect::to(target),
    )
        .into_response()
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "unique_meal",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn not_found() -> AppError {
    AppError::NotFound
}

pub async fn index(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    let member = session_member(&state, &session).await?;
    let page = PageContext::load(&state, &session, member.as_ref()).await?;
    render(StatusCode::OK, &IndexTemplate { page })
}

async fn render_register(
    state: &AppState,
    session: &Session,
    form: &RegistrationForm,
    errors: FormErrors,
    status: StatusCode,
) -> Result<Response> {
    let page = PageContext::load(state, session, None).await?;
    let selected = if form.membership_tier.is_empty() {
        "standard"
    } else {
        form.membership_tier.as_str()
    };
    render(
        status,
        &RegisterTemplate {
            page,
            username: form.username.trim().to_string(),
            email: form.email.trim().to_string(),
            tiers: tier_options(selected),
            errors,
        },
    )
}

pub async fn register_form(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Response> {
    if session.is_authenticated() {
        return Ok(Redirect::to(DEFAULT_LANDING).into_response());
    }
    render_register(
        &state,
        &session,
        &RegistrationForm::default(),
        FormErrors::new(),
        StatusCode::OK,
    )
    .await
}

pub async fn register_submit(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Form(form): Form<RegistrationForm>,
) -> Result<Response> {
    verify_csrf(&session, &form.csrf_token)?;

    let registration = match form.validate() {
        Ok(registration) => registration,
        Err(errors) => {
            return render_register(
                &state,
                &session,
                &form,
                errors,
                StatusCode::UNPROCESSABLE_ENTITY,
            )
            .await;
        }
    };

    match auth::register(state.storage.as_ref(), registration).await {
        Ok(_) => {
            state
                .storage
                .push_flash(&session.id, Flash::success("Registration successful! Please log in."))
                .await?;
            Ok(Redirect::to("/login").into_response())
        }
        Err(e @ AppError::UsernameTaken) => {
            let errors = FormErrors::single("username", e.to_string());
            render_register(&state, &session, &form, errors, e.status()).await
        }
        Err(e @ AppError::EmailTaken) => {
            let errors = FormErrors::single("email", e.to_string());
            render_register(&state, &session, &form, errors, e.status()).await
        }
        Err(e) => Err(e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginQuery {
    pub next: String,
}

async fn render_login(
    state: &AppState,
    session: &Session,
    username: &str,
    next: Option<String>,
    errors: FormErrors,
    status: StatusCode,
) -> Result<Response> {
    let page = PageContext::load(state, session, None).await?;
    render(
        status,
        &LoginTemplate {
            page,
            username: username.trim().to_string(),
            next: next.unwrap_or_default(),
            errors,
        },
    )
}

pub async fn login_form(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(query): Query<LoginQuery>,
) -> Result<Response> {
    let next = safe_next(&query.next);
    if session.is_authenticated() {
        let target = next.unwrap_or_else(|| DEFAULT_LANDING.to_string());
        return Ok(Redirect::to(&target).into_response());
    }
    render_login(&state, &session, "", next, FormErrors::new(), StatusCode::OK).await
}

pub async fn login_submit(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Form(form): Form<LoginForm>,
) -> Result<Response> {
    verify_csrf(&session, &form.csrf_token)?;

    let login = match form.validate() {
        Ok(login) => login,
        Err(errors) => {
            return render_login(
                &state,
                &session,
                &form.username,
                safe_next(&form.next),
                errors,
                StatusCode::UNPROCESSABLE_ENTITY,
            )
            .await
        }
    };

    let member =
        auth::authenticate(state.storage.as_ref(), &login.username, &login.password).await?;
    let Some(member) = member else {
        let errors = FormErrors::single("credentials", "Invalid username or password.");
        return render_login(
            &state,
            &session,
            &login.username,
            login.next,
            errors,
            StatusCode::UNAUTHORIZED,
        )
        .await;
    };

    let (token, new_session) = rotate_session(&state, &session, Some(member.id)).await?;
    state
        .storage
        .push_flash(
            &new_session.id,
            Flash::success(format!("Welcome back, {}!", member.username)),
        )
        .await?;
    info!(member_id = member.id, "Member logged in");

    let target = login.next.unwrap_or_else(|| DEFAULT_LANDING.to_string());
    Ok(redirect_with_session(&state, &token, &target))
}

pub async fn logout(State(state): State<AppState>, current: CurrentMember) -> Result<Response> {
    let (token, new_session) = rotate_session(&state, &current.session, None).await?;
    state
        .storage
        .push_flash(&new_session.id, Flash::info("You have been logged out."))
        .await?;
    info!(member_id = current.member.id, "Member logged out");

    Ok(redirect_with_session(&state, &token, "/"))
}

pub async fn profile(State(state): State<AppState>, current: CurrentMember) -> Result<Response> {
    let bookings = state.storage.list_bookings(current.member.id).await?;
    let page = PageContext::load(&state, &current.session, Some(&current.member)).await?;
    render(
        StatusCode::OK,
        &ProfileTemplate {
            page,
            member: current.member,
            bookings,
            today: today(),
        },
    )
}

async fn render_book_meal(
    state: &AppState,
    current: &CurrentMember,
    form: &BookingForm,
    errors: FormErrors,
    status: StatusCode,
) -> Result<Response> {
    let page = PageContext::load(state, &current.session, Some(&current.member)).await?;
    render(
        status,
        &BookMealTemplate {
            page,
            meal_name: form.meal_name.trim().to_string(),
            meal_date: form.meal_date.trim().to_string(),
            min_date: today().format("%Y-%m-%d").to_string(),
            errors,
        },
    )
}

pub async fn book_meal_form(
    State(state): State<AppState>,
    current: CurrentMember,
) -> Result<Response> {
    render_book_meal(
        &state,
        &current,
        &BookingForm::default(),
        FormErrors::new(),
        StatusCode::OK,
    )
    .await
}

pub async fn book_meal_submit(
    State(state): State<AppState>,
    current: CurrentMember,
    Form(form): Form<BookingForm>,
) -> Result<Response> {
    verify_csrf(&current.session, &form.csrf_token)?;

    let booking = match form.validate(today()) {
        Ok(booking) => booking,
        Err(errors) => {
            return render_book_meal(
                &state,
                &current,
                &form,
                errors,
                StatusCode::UNPROCESSABLE_ENTITY,
            )
            .await;
        }
    };

    let created = state
        .storage
        .create_booking(NewBooking {
            member_id: current.member.id,
            meal_name: booking.meal_name,
            meal_date: booking.meal_date,
        })
        .await;

    match created {
        Ok(booking) => {
            info!(
                member_id = current.member.id,
                booking_id = booking.id,
                meal_date = %booking.meal_date,
                "Meal booked"
            );
            state
                .storage
                .push_flash(&current.session.id, Flash::success("Meal booked successfully!"))
                .await?;
            Ok(Redirect::to("/book_meal").into_response())
        }
        Err(e @ AppError::DuplicateBooking) => {
            let errors = FormErrors::single("meal_name", e.to_string());
            render_book_meal(&state, &current, &form, errors, e.status()).await
        }
        Err(e) => Err(e),
    }
}

pub async fn cancel_booking(
    State(state): State<AppState>,
    current: CurrentMember,
    Path(booking_id): Path<i64>,
    Form(form): Form<CsrfForm>,
) -> Result<Response> {
    verify_csrf(&current.session, &form.csrf_token)?;

    let booking = state
        .storage
        .get_booking(current.member.id, booking_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if booking.meal_date < today() {
        return Err(AppError::BookingInPast);
    }

    if !state
        .storage
        .delete_booking(current.member.id, booking_id)
        .await?
    {
        return Err(AppError::NotFound);
    }

    info!(member_id = current.member.id, booking_id, "Booking cancelled");
    state
        .storage
        .push_flash(&current.session.id, Flash::info("Booking cancelled."))
        .await?;
    Ok(Redirect::to(DEFAULT_LANDING).into_response())
}
