use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::Storage;
use crate::error::{AppError, Result};
use crate::models::{Flash, MealBooking, Member, NewBooking, NewMember, Session};

#[derive(Default)]
struct Tables {
    members: BTreeMap<i64, Member>,
    sessions: HashMap<String, Session>,
    bookings: BTreeMap<i64, MealBooking>,
    next_member_id: i64,
    next_booking_id: i64,
}

/// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| AppError::internal("in-memory storage lock poisoned"))
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn create_member(&self, member: NewMember) -> Result<Member> {
        let mut tables = self.lock()?;

        let username = member.username.to_lowercase();
        let email = member.email.to_lowercase();
        if tables
            .members
            .values()
            .any(|m| m.username.to_lowercase() == username)
        {
            return Err(AppError::UsernameTaken);
        }
        if tables.members.values().any(|m| m.email.to_lowercase() == email) {
            return Err(AppError::EmailTaken);
        }

        tables.next_member_id += 1;
        let created = Member {
            id: tables.next_member_id,
            username: member.username,
            email: member.email,
            password_hash: member.password_hash,
            membership_tier: member.membership_tier,
            created_at: Utc::now(),
        };
        tables.members.insert(created.id, created.clone());

        debug!("Created member: {} with id {}", created.username, created.id);
        Ok(created)
    }

    async fn get_member(&self, id: i64) -> Result<Option<Member>> {
        Ok(self.lock()?.members.get(&id).cloned())
    }

    async fn get_member_by_username(&self, username: &str) -> Result<Option<Member>> {
        let username = username.to_lowercase();
        let tables = self.lock()?;
        Ok(tables
            .members
            .values()
            .find(|m| m.username.to_lowercase() == username)
            .cloned())
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        self.lock()?
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.lock()?.sessions.get(id).cloned())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        self.lock()?.sessions.remove(id);
        Ok(())
    }

    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.lock()?;
        let before = tables.sessions.len();
        tables.sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - tables.sessions.len())
    }

    async fn push_flash(&self, session_id: &str, flash: Flash) -> Result<()> {
        if let Some(session) = self.lock()?.sessions.get_mut(session_id) {
            session.flashes.push(flash);
        }
        Ok(())
    }

    async fn take_flashes(&self, session_id: &str) -> Result<Vec<Flash>> {
        Ok(self
            .lock()?
            .sessions
            .get_mut(session_id)
            .map(|s| std::mem::take(&mut s.flashes))
            .unwrap_or_default())
    }

    async fn create_booking(&self, booking: NewBooking) -> Result<MealBooking> {
        let mut tables = self.lock()?;

        if !tables.members.contains_key(&booking.member_id) {
            return Err(AppError::UnknownMember(booking.member_id));
        }

        let meal_name = booking.meal_name.to_lowercase();
        let duplicate = tables.bookings.values().any(|b| {
            b.member_id == booking.member_id
                && b.meal_date == booking.meal_date
                && b.meal_name.to_lowercase() == meal_name
        });
        if duplicate {
            return Err(AppError::DuplicateBooking);
        }

        tables.next_booking_id += 1;
        let created = MealBooking {
            id: tables.next_booking_id,
            member_id: booking.member_id,
            meal_name: booking.meal_name,
            meal_date: booking.meal_date,
            created_at: Utc::now(),
        };
        tables.bookings.insert(created.id, created.clone());

        debug!(
            "Created booking {} for member {} on {}",
            created.id, created.member_id, created.meal_date
        );
        Ok(created)
    }

    async fn get_booking(&self, member_id: i64, booking_id: i64) -> Result<Option<MealBooking>> {
        Ok(self
            .lock()?
            .bookings
            .get(&booking_id)
            .filter(|b| b.member_id == member_id)
            .cloned())
    }

    async fn list_bookings(&self, member_id: i64) -> Result<Vec<MealBooking>> {
        let tables = self.lock()?;
        let mut bookings: Vec<MealBooking> = tables
            .bookings
            .values()
            .filter(|b| b.member_id == member_id)
            .cloned()
            .collect();
        bookings.sort_by(|a, b| a.meal_date.cmp(&b.meal_date).then(a.id.cmp(&b.id)));
        Ok(bookings)
    }

    async fn delete_booking(&self, member_id: i64, booking_id: i64) -> Result<bool> {
        let mut tables = self.lock()?;
        let owned = tables
            .bookings
            .get(&booking_id)
            .is_some_and(|b| b.member_id == member_id);
        if owned {
            tables.bookings.remove(&booking_id);
        }
        Ok(owned)
    }
}
