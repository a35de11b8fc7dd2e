mod in_memory;
mod sqlite;

pub use in_memory::InMemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Flash, MealBooking, Member, NewBooking, NewMember, Session};

/// Storage trait for persisting members, sessions and meal bookings
#[async_trait]
pub trait Storage: Send + Sync {
    /// Create tables if they do not exist yet.
    async fn init(&self) -> Result<()>;

    // Member operations
    async fn create_member(&self, member: NewMember) -> Result<Member>;
    async fn get_member(&self, id: i64) -> Result<Option<Member>>;
    async fn get_member_by_username(&self, username: &str) -> Result<Option<Member>>;

    // Session operations
    async fn create_session(&self, session: &Session) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    async fn delete_session(&self, id: &str) -> Result<()>;
    async fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    // Flash messages
    async fn push_flash(&self, session_id: &str, flash: Flash) -> Result<()>;
    async fn take_flashes(&self, session_id: &str) -> Result<Vec<Flash>>;

    // Booking operations
    async fn create_booking(&self, booking: NewBooking) -> Result<MealBooking>;
    async fn get_booking(&self, member_id: i64, booking_id: i64) -> Result<Option<MealBooking>>;
    async fn list_bookings(&self, member_id: i64) -> Result<Vec<MealBooking>>;
    async fn delete_booking(&self, member_id: i64, booking_id: i64) -> Result<bool>;
}

/// Behaviour every backend must share. Each backend's test module runs these.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::error::AppError;
    use crate::models::MembershipTier;
    use chrono::{Duration, NaiveDate};

    pub fn new_member(username: &str, email: &str) -> NewMember {
        NewMember {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$not-a-real-hash".to_string(),
            membership_tier: MembershipTier::Premium,
        }
    }

    pub fn session(id: &str, member_id: Option<i64>, expires_in: Duration) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            member_id,
            csrf_token: format!("csrf-{id}"),
            flashes: Vec::new(),
            created_at: now,
            expires_at: now + expires_in,
        }
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    pub async fn member_round_trip(storage: &dyn Storage) {
        let created = storage
            .create_member(new_member("alice", "alice@example.com"))
            .await
            .unwrap();

        let by_id = storage.get_member(created.id).await.unwrap().unwrap();
        assert_eq!(by_id, created);
        assert_eq!(by_id.membership_tier, MembershipTier::Premium);

        let by_name = storage.get_member_by_username("ALICE").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);

        assert!(storage.get_member_by_username("bob").await.unwrap().is_none());
        assert!(storage.get_member(created.id + 100).await.unwrap().is_none());
    }

    pub async fn member_uniqueness(storage: &dyn Storage) {
        storage
            .create_member(new_member("alice", "alice@example.com"))
            .await
            .unwrap();

        let same_name = storage
            .create_member(new_member("Alice", "other@example.com"))
            .await;
        assert!(matches!(same_name, Err(AppError::UsernameTaken)));

        let same_email = storage
            .create_member(new_member("alicia", "ALICE@example.com"))
            .await;
        assert!(matches!(same_email, Err(AppError::EmailTaken)));
    }

    pub async fn session_lifecycle(storage: &dyn Storage) {
        let live = session("live", None, Duration::hours(1));
        let stale = session("stale", None, Duration::hours(-1));
        storage.create_session(&live).await.unwrap();
        storage.create_session(&stale).await.unwrap();

        assert_eq!(storage.get_session("live").await.unwrap(), Some(live.clone()));

        let purged = storage.purge_expired_sessions(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(storage.get_session("stale").await.unwrap().is_none());

        storage.delete_session("live").await.unwrap();
        assert!(storage.get_session("live").await.unwrap().is_none());
    }

    pub async fn flashes_are_taken_once(storage: &dyn Storage) {
        let s = session("flashy", None, Duration::hours(1));
        storage.create_session(&s).await.unwrap();

        storage.push_flash("flashy", Flash::success("one")).await.unwrap();
        storage.push_flash("flashy", Flash::error("two")).await.unwrap();

        let flashes = storage.take_flashes("flashy").await.unwrap();
        assert_eq!(flashes, vec![Flash::success("one"), Flash::error("two")]);
        assert!(storage.take_flashes("flashy").await.unwrap().is_empty());

        // Unknown sessions have nothing to show
        assert!(storage.take_flashes("missing").await.unwrap().is_empty());
    }

    pub async fn bookings(storage: &dyn Storage) {
        let alice = storage
            .create_member(new_member("alice", "alice@example.com"))
            .await
            .unwrap();
        let bob = storage
            .create_member(new_member("bob", "bob@example.com"))
            .await
            .unwrap();

        let later = storage
            .create_booking(NewBooking {
                member_id: alice.id,
                meal_name: "Truffle Risotto".to_string(),
                meal_date: date("2030-05-02"),
            })
            .await
            .unwrap();
        let sooner = storage
            .create_booking(NewBooking {
                member_id: alice.id,
                meal_name: "Sunday Roast".to_string(),
                meal_date: date("2030-05-01"),
            })
            .await
            .unwrap();

        let duplicate = storage
            .create_booking(NewBooking {
                member_id: alice.id,
                meal_name: "truffle risotto".to_string(),
                meal_date: date("2030-05-02"),
            })
            .await;
        assert!(matches!(duplicate, Err(AppError::DuplicateBooking)));

        // Case folding is not limited to ASCII
        storage
            .create_booking(NewBooking {
                member_id: alice.id,
                meal_name: "Crème Brûlée".to_string(),
                meal_date: date("2030-05-03"),
            })
            .await
            .unwrap();
        let accented = storage
            .create_booking(NewBooking {
                member_id: alice.id,
                meal_name: "CRÈME BRÛLÉE".to_string(),
                meal_date: date("2030-05-03"),
            })
            .await;
        assert!(matches!(accented, Err(AppError::DuplicateBooking)));

        // Another member may book the same meal
        storage
            .create_booking(NewBooking {
                member_id: bob.id,
                meal_name: "Truffle Risotto".to_string(),
                meal_date: date("2030-05-02"),
            })
            .await
            .unwrap();

        let listed = storage.list_bookings(alice.id).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[..2], [sooner.clone(), later.clone()]);
        let brulee = listed[2].clone();

        assert_eq!(
            storage.get_booking(alice.id, later.id).await.unwrap(),
            Some(later.clone())
        );
        assert!(storage.get_booking(bob.id, later.id).await.unwrap().is_none());

        // Only the owner can cancel
        assert!(!storage.delete_booking(bob.id, later.id).await.unwrap());
        assert!(storage.delete_booking(alice.id, later.id).await.unwrap());
        assert!(!storage.delete_booking(alice.id, later.id).await.unwrap());
        assert!(storage.get_booking(alice.id, later.id).await.unwrap().is_none());
        assert_eq!(
            storage.list_bookings(alice.id).await.unwrap(),
            vec![sooner, brulee]
        );
    }

    pub async fn booking_requires_member(storage: &dyn Storage) {
        let result = storage
            .create_booking(NewBooking {
                member_id: 4242,
                meal_name: "Ghost Supper".to_string(),
                meal_date: date("2030-01-01"),
            })
            .await;
        assert!(matches!(result, Err(AppError::UnknownMember(4242))));
    }
}
