use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::forms::ValidRegistration;
use crate::models::{Member, NewMember};
use crate::storage::Storage;

/// Verified against when the username is unknown, so a miss costs as much as a hit.
static DUMMY_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("unique-meal-dummy-password").ok());

/// Hashes a password with Argon2id and a random 16-byte salt, returning a PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt_bytes: [u8; 16] = rand::random();
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AppError::PasswordHash(e.to_string()))?;

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::PasswordHash(e.to_string()))
}

/// Returns false for a wrong password and for a hash that cannot be parsed.
pub fn verify_password(password: &str, password_hash: &str) -> bool {
    match PasswordHash::new(password_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

pub async fn register(storage: &dyn Storage, registration: ValidRegistration) -> Result<Member> {
    let password_hash = hash_password(&registration.password)?;

    let member = storage
        .create_member(NewMember {
            username: registration.username,
            email: registration.email,
            password_hash,
            membership_tier: registration.membership_tier,
        })
        .await?;

    info!(member_id = member.id, tier = %member.membership_tier, "Registered new member");
    Ok(member)
}

/// Looks the member up by username and checks the password.
pub async fn authenticate(
    storage: &dyn Storage,
    username: &str,
    password: &str,
) -> Result<Option<Member>> {
    match storage.get_member_by_username(username.trim()).await? {
        Some(member) if verify_password(password, &member.password_hash) => Ok(Some(member)),
        Some(member) => {
            info!(member_id = member.id, "Rejected login with wrong password");
            Ok(None)
        }
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = verify_password(password, dummy);
            }
            info!("Rejected login for unknown username");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MembershipTier;
    use crate::storage::InMemoryStorage;

    fn registration(username: &str) -> ValidRegistration {
        ValidRegistration {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: "correct horse battery".to_string(),
            membership_tier: MembershipTier::Elite,
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret-password").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("s3cret-password", &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn test_same_password_gets_different_salts() {
        let first = hash_password("repeat-me-please").unwrap();
        let second = hash_password("repeat-me-please").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_malformed_hash_never_verifies() {
        assert!(!verify_password("anything", "plaintext-password"));
        assert!(!verify_password("anything", ""));
    }

    #[tokio::test]
    async fn test_register_stores_hash_not_password() {
        let storage = InMemoryStorage::new();
        let member = register(&storage, registration("erin")).await.unwrap();

        assert_ne!(member.password_hash, "correct horse battery");
        assert!(verify_password("correct horse battery", &member.password_hash));
        assert_eq!(member.membership_tier, MembershipTier::Elite);
    }

    #[tokio::test]
    async fn test_authenticate() {
        let storage = InMemoryStorage::new();
        let member = register(&storage, registration("frank")).await.unwrap();

        let ok = authenticate(&storage, " Frank ", "correct horse battery")
            .await
            .unwrap();
        assert_eq!(ok.map(|m| m.id), Some(member.id));

        let wrong = authenticate(&storage, "frank", "incorrect").await.unwrap();
        assert!(wrong.is_none());

        let unknown = authenticate(&storage, "nobody", "correct horse battery")
            .await
            .unwrap();
        assert!(unknown.is_none());
    }
}
