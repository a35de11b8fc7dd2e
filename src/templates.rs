use askama::Template;
use chrono::NaiveDate;

use crate::error::Result;
use crate::forms::FormErrors;
use crate::models::{Flash, MealBooking, Member, MembershipTier, Session};
use crate::state::AppState;

/// Data every page's layout needs.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub username: Option<String>,
    pub flashes: Vec<Flash>,
    pub csrf_token: String,
}

impl PageContext {
    /// Builds the layout context, consuming the session's pending flashes.
    pub async fn load(
        state: &AppState,
        session: &Session,
        member: Option<&Member>,
    ) -> Result<Self> {
        let flashes = state.storage.take_flashes(&session.id).await?;
        Ok(Self {
            username: member.map(|m| m.username.clone()),
            flashes,
            csrf_token: session.csrf_token.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TierOption {
    pub value: &'static str,
    pub label: &'static str,
    pub selected: bool,
}

pub fn tier_options(selected: &str) -> Vec<TierOption> {
    MembershipTier::ALL
        .iter()
        .map(|tier| TierOption {
            value: tier.as_str(),
            label: tier.label(),
            selected: tier.as_str() == selected,
        })
        .collect()
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub page: PageContext,
}

#[derive(Template)]
#[template(path = "register.html")]
pub struct RegisterTemplate {
    pub page: PageContext,
    pub username: String,
    pub email: String,
    pub tiers: Vec<TierOption>,
    pub errors: FormErrors,
}

#[derive(Template)]
#[template(path = "login.html")]
pub struct LoginTemplate {
    pub page: PageContext,
    pub username: String,
    pub next: String,
    pub errors: FormErrors,
}

#[derive(Template)]
#[template(path = "profile.html")]
pub struct ProfileTemplate {
    pub page: PageContext,
    pub member: Member,
    pub bookings: Vec<MealBooking>,
    pub today: NaiveDate,
}

#[derive(Template)]
#[template(path = "book_meal.html")]
pub struct BookMealTemplate {
    pub page: PageContext,
    pub meal_name: String,
    pub meal_date: String,
    pub min_date: String,
    pub errors: FormErrors,
}

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorTemplate {
    pub page: PageContext,
    pub status: u16,
    pub message: String,
}
