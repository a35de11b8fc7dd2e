//! Form payloads posted by the HTML pages and their validation rules.
//!
//! Every field defaults to an empty string so that a missing field is reported
//! as a validation error on the page instead of an extractor rejection.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::models::MembershipTier;

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 100;
pub const EMAIL_MAX: usize = 100;
pub const PASSWORD_MIN: usize = 8;
pub const PASSWORD_MAX: usize = 128;
pub const MEAL_NAME_MAX: usize = 100;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Validation failures, in the order the fields appear on the form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormErrors {
    errors: Vec<FieldError>,
}

impl FormErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &'static str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field,
            message: message.into(),
        });
    }

    pub fn single(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// First message for `field`, or an empty string.
    pub fn message(&self, field: &str) -> &str {
        self.errors
            .iter()
            .find(|e| e.field == field)
            .map(|e| e.message.as_str())
            .unwrap_or("")
    }

    pub fn has(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }

    fn into_result<T>(self, value: impl FnOnce() -> T) -> Result<T, FormErrors> {
        if self.is_empty() {
            Ok(value())
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub membership_tier: String,
    pub csrf_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRegistration {
    pub username: String,
    pub email: String,
    pub password: String,
    pub membership_tier: MembershipTier,
}

impl RegistrationForm {
    pub fn validate(&self) -> Result<ValidRegistration, FormErrors> {
        let mut errors = FormErrors::new();

        let username = self.username.trim().to_string();
        let username_len = username.chars().count();
        if username.is_empty() {
            errors.add("username", "Username is required.");
        } else if !(USERNAME_MIN..=USERNAME_MAX).contains(&username_len) {
            errors.add(
                "username",
                format!("Username must be between {USERNAME_MIN} and {USERNAME_MAX} characters."),
            );
        } else if !USERNAME_RE.is_match(&username) {
            errors.add(
                "username",
                "Username may only contain letters, digits, '_', '.' and '-'.",
            );
        }

        let email = self.email.trim().to_lowercase();
        if email.is_empty() {
            errors.add("email", "Email is required.");
        } else if email.chars().count() > EMAIL_MAX {
            errors.add("email", format!("Email must be at most {EMAIL_MAX} characters."));
        } else if !EMAIL_RE.is_match(&email) {
            errors.add("email", "Enter a valid email address.");
        }

        let password_len = self.password.chars().count();
        if self.password.is_empty() {
            errors.add("password", "Password is required.");
        } else if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&password_len) {
            errors.add(
                "password",
                format!("Password must be between {PASSWORD_MIN} and {PASSWORD_MAX} characters."),
            );
        }

        if self.confirm_password != self.password {
            errors.add("confirm_password", "Passwords must match.");
        }

        let membership_tier = match self.membership_tier.parse::<MembershipTier>() {
            Ok(tier) => Some(tier),
            Err(_) => {
                errors.add("membership_tier", "Choose a membership tier.");
                None
            }
        };

        errors.into_result(|| ValidRegistration {
            username,
            email,
            password: self.password.clone(),
            membership_tier: membership_tier.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
    pub next: String,
    pub csrf_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidLogin {
    pub username: String,
    pub password: String,
    pub next: Option<String>,
}

impl LoginForm {
    pub fn validate(&self) -> Result<ValidLogin, FormErrors> {
        let mut errors = FormErrors::new();

        let username = self.username.trim().to_string();
        if username.is_empty() {
            errors.add("username", "Username is required.");
        }
        if self.password.is_empty() {
            errors.add("password", "Password is required.");
        }

        errors.into_result(|| ValidLogin {
            username,
            password: self.password.clone(),
            next: safe_next(&self.next),
        })
    }
}

/// Only local absolute paths are followed after login.
pub fn safe_next(next: &str) -> Option<String> {
    let next = next.trim();
    let is_local = next.starts_with('/')
        && !next.starts_with("//")
        && !next.contains('\\')
        && !next.chars().any(char::is_control);
    is_local.then(|| next.to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BookingForm {
    pub meal_name: String,
    pub meal_date: String,
    pub csrf_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidBooking {
    pub meal_name: String,
    pub meal_date: NaiveDate,
}

impl BookingForm {
    /// `today` is the earliest date that can still be booked.
    pub fn validate(&self, today: NaiveDate) -> Result<ValidBooking, FormErrors> {
        let mut errors = FormErrors::new();

        let meal_name = self.meal_name.trim().to_string();
        if meal_name.is_empty() {
            errors.add("meal_name", "Meal name is required.");
        } else if meal_name.chars().count() > MEAL_NAME_MAX {
            errors.add(
                "meal_name",
                format!("Meal name must be at most {MEAL_NAME_MAX} characters."),
            );
        }

        let meal_date = match NaiveDate::parse_from_str(self.meal_date.trim(), "%Y-%m-%d") {
            Ok(date) if date < today => {
                errors.add("meal_date", "Meals cannot be booked in the past.");
                None
            }
            Ok(date) => Some(date),
            Err(_) if self.meal_date.trim().is_empty() => {
                errors.add("meal_date", "Meal date is required.");
                None
            }
            Err(_) => {
                errors.add("meal_date", "Enter the date as YYYY-MM-DD.");
                None
            }
        };

        errors.into_result(|| ValidBooking {
            meal_name,
            meal_date: meal_date.unwrap_or(today),
        })
    }
}

/// Forms with no fields of their own, such as booking cancellation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CsrfForm {
    pub csrf_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> RegistrationForm {
        RegistrationForm {
            username: "  gourmet_gina ".to_string(),
            email: " Gina@Example.COM ".to_string(),
            password: "truffles-and-tea".to_string(),
            confirm_password: "truffles-and-tea".to_string(),
            membership_tier: "premium".to_string(),
            csrf_token: "token".to_string(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, 15).unwrap()
    }

    #[test]
    fn test_valid_registration_is_cleaned() {
        let valid = registration().validate().unwrap();
        assert_eq!(valid.username, "gourmet_gina");
        assert_eq!(valid.email, "gina@example.com");
        assert_eq!(valid.membership_tier, MembershipTier::Premium);
    }

    #[test]
    fn test_empty_registration_reports_every_field() {
        let errors = RegistrationForm::default().validate().unwrap_err();
        assert!(errors.has("username"));
        assert!(errors.has("email"));
        assert!(errors.has("password"));
        assert!(errors.has("membership_tier"));
        // Both passwords empty, so they match
        assert!(!errors.has("confirm_password"));
    }

    #[test]
    fn test_registration_rules() {
        let mut form = registration();
        form.username = "ab".to_string();
        form.email = "not-an-email".to_string();
        form.password = "short".to_string();
        form.confirm_password = "shorter".to_string();
        form.membership_tier = "diamond".to_string();

        let errors = form.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
        assert_eq!(
            errors.message("username"),
            "Username must be between 3 and 100 characters."
        );
        assert_eq!(errors.message("email"), "Enter a valid email address.");
        assert_eq!(errors.message("confirm_password"), "Passwords must match.");
    }

    #[test]
    fn test_username_charset() {
        let mut form = registration();
        form.username = "gina <script>".to_string();
        let errors = form.validate().unwrap_err();
        assert!(errors.message("username").starts_with("Username may only contain"));
    }

    #[test]
    fn test_overlong_fields() {
        let mut form = registration();
        form.username = "u".repeat(101);
        form.email = format!("{}@example.com", "e".repeat(95));
        let errors = form.validate().unwrap_err();
        assert!(errors.has("username"));
        assert!(errors.has("email"));
    }

    #[test]
    fn test_login_requires_both_fields() {
        let errors = LoginForm::default().validate().unwrap_err();
        assert_eq!(errors.len(), 2);

        let valid = LoginForm {
            username: " gina ".to_string(),
            password: "pw".to_string(),
            next: "/book_meal".to_string(),
            csrf_token: String::new(),
        }
        .validate()
        .unwrap();
        assert_eq!(valid.username, "gina");
        assert_eq!(valid.next.as_deref(), Some("/book_meal"));
    }

    #[test]
    fn test_safe_next_rejects_offsite_targets() {
        assert_eq!(safe_next("/profile").as_deref(), Some("/profile"));
        assert_eq!(safe_next(""), None);
        assert_eq!(safe_next("https://evil.example"), None);
        assert_eq!(safe_next("//evil.example"), None);
        assert_eq!(safe_next("/\\evil.example"), None);
        assert_eq!(safe_next("profile"), None);
    }

    #[test]
    fn test_valid_booking() {
        let form = BookingForm {
            meal_name: "  Lobster Thermidor ".to_string(),
            meal_date: "2030-06-15".to_string(),
            csrf_token: String::new(),
        };
        let valid = form.validate(today()).unwrap();
        assert_eq!(valid.meal_name, "Lobster Thermidor");
        assert_eq!(valid.meal_date, today());
    }

    #[test]
    fn test_booking_rejects_past_and_malformed_dates() {
        let past = BookingForm {
            meal_name: "Soup".to_string(),
            meal_date: "2030-06-14".to_string(),
            csrf_token: String::new(),
        };
        assert_eq!(
            past.validate(today()).unwrap_err().message("meal_date"),
            "Meals cannot be booked in the past."
        );

        let malformed = BookingForm {
            meal_name: "Soup".to_string(),
            meal_date: "15/06/2030".to_string(),
            csrf_token: String::new(),
        };
        assert_eq!(
            malformed.validate(today()).unwrap_err().message("meal_date"),
            "Enter the date as YYYY-MM-DD."
        );
    }

    #[test]
    fn test_booking_requires_fields() {
        let errors = BookingForm::default().validate(today()).unwrap_err();
        assert_eq!(errors.message("meal_name"), "Meal name is required.");
        assert_eq!(errors.message("meal_date"), "Meal date is required.");
    }
}
