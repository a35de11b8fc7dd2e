use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registered club member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub membership_tier: MembershipTier,
    pub created_at: DateTime<Utc>,
}

/// Member fields known before storage assigns an id.
#[derive(Debug, Clone)]
pub struct NewMember {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub membership_tier: MembershipTier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    #[default]
    Standard,
    Premium,
    Elite,
}

impl MembershipTier {
    pub const ALL: [MembershipTier; 3] = [
        MembershipTier::Standard,
        MembershipTier::Premium,
        MembershipTier::Elite,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipTier::Standard => "standard",
            MembershipTier::Premium => "premium",
            MembershipTier::Elite => "elite",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MembershipTier::Standard => "Standard",
            MembershipTier::Premium => "Premium",
            MembershipTier::Elite => "Elite",
        }
    }
}

impl fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MembershipTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(MembershipTier::Standard),
            "premium" => Ok(MembershipTier::Premium),
            "elite" => Ok(MembershipTier::Elite),
            other => Err(format!("unknown membership tier '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MealBooking {
    pub id: i64,
    pub member_id: i64,
    pub meal_name: String,
    pub meal_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub member_id: i64,
    pub meal_name: String,
    pub meal_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Info,
    Success,
    Error,
}

impl FlashLevel {
    pub fn css_class(&self) -> &'static str {
        match self {
            FlashLevel::Info => "flash-info",
            FlashLevel::Success => "flash-success",
            FlashLevel::Error => "flash-error",
        }
    }
}

/// One-shot message shown on the next rendered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flash {
    pub level: FlashLevel,
    pub message: String,
}

impl Flash {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: FlashLevel::Error,
            message: message.into(),
        }
    }
}

/// Server-side session. `id` is the digest of the cookie token, never the token itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub member_id: Option<i64>,
    pub csrf_token: String,
    pub flashes: Vec<Flash>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_authenticated(&self) -> bool {
        self.member_id.is_some()
    }
}
