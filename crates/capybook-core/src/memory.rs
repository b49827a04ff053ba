//! In-memory record store
//!
//! Backs development runs without `DATABASE_URL` and the test suites.
//! Uniqueness rules match the PostgreSQL schema.

use crate::account::{Account, NewAccount, Permissions, Verification};
use crate::store::{AccountStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    next_id: i64,
    accounts: HashMap<i64, Account>,
    permissions: HashMap<i64, BTreeSet<String>>,
    verifications: Vec<Verification>,
}

impl Tables {
    fn find(&self, pred: impl Fn(&Account) -> bool) -> Result<Account, StoreError> {
        self.accounts
            .values()
            .find(|a| pred(a))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

/// Record store kept entirely in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_by_username(&self, username: &str) -> Result<Account, StoreError> {
        self.tables.read().await.find(|a| a.username == username)
    }

    async fn get_by_email(&self, email: &str) -> Result<Account, StoreError> {
        self.tables.read().await.find(|a| a.email == email)
    }

    async fn insert(&self, account: NewAccount) -> Result<Account, StoreError> {
        let mut tables = self.tables.write().await;

        if tables.accounts.values().any(|a| a.username == account.username) {
            return Err(StoreError::DuplicateUsername);
        }
        if tables.accounts.values().any(|a| a.email == account.email) {
            return Err(StoreError::DuplicateEmail);
        }

        tables.next_id += 1;
        let stored = Account {
            id: tables.next_id,
            username: account.username,
            email: account.email,
            password_hash: account.password_hash,
            token_hash: account.token_hash,
            activated: account.activated,
            created_at: Utc::now(),
        };
        tables.accounts.insert(stored.id, stored.clone());

        Ok(stored)
    }

    async fn update(&self, account: &Account) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        let clash = tables.accounts.values().find(|a| {
            a.id != account.id && (a.username == account.username || a.email == account.email)
        });
        if let Some(other) = clash {
            return Err(if other.username == account.username {
                StoreError::DuplicateUsername
            } else {
                StoreError::DuplicateEmail
            });
        }

        match tables.accounts.get_mut(&account.id) {
            Some(slot) => {
                *slot = account.clone();
                Ok(())
            }
            None => Err(StoreError::EditConflict),
        }
    }

    async fn delete(&self, username: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;

        let id = tables
            .accounts
            .values()
            .find(|a| a.username == username)
            .map(|a| a.id)
            .ok_or(StoreError::NotFound)?;

        tables.accounts.remove(&id);
        tables.permissions.remove(&id);
        tables.verifications.retain(|v| v.account_id != id);

        Ok(())
    }

    async fn permissions_for(&self, account_id: i64) -> Result<Permissions, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .permissions
            .get(&account_id)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_permissions(&self, account_id: i64, codes: &[&str]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.accounts.contains_key(&account_id) {
            return Err(StoreError::NotFound);
        }
        tables
            .permissions
            .entry(account_id)
            .or_default()
            .extend(codes.iter().map(|c| c.to_string()));
        Ok(())
    }

    async fn insert_verification(&self, verification: &Verification) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.accounts.contains_key(&verification.account_id) {
            return Err(StoreError::NotFound);
        }
        tables.verifications.push(verification.clone());
        Ok(())
    }

    async fn get_by_verification_code(
        &self,
        code_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Account, StoreError> {
        let tables = self.tables.read().await;
        let verification = tables
            .verifications
            .iter()
            .find(|v| v.code_hash == code_hash && !v.is_expired_at(now))
            .ok_or(StoreError::NotFound)?;

        tables
            .accounts
            .get(&verification.account_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete_verifications(&self, account_id: i64) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .verifications
            .retain(|v| v.account_id != account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_account(username: &str, email: &str) -> NewAccount {
        NewAccount {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            token_hash: "secret".to_string(),
            activated: false,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let alice = store
                .insert(new_account("alice", "alice@example.com"))
                .await
                .unwrap();

            assert_eq!(alice.id, 1);
            assert_eq!(store.get_by_username("alice").await.unwrap(), alice);
            assert_eq!(store.get_by_email("alice@example.com").await.unwrap(), alice);
            assert!(matches!(
                store.get_by_username("bob").await,
                Err(StoreError::NotFound)
            ));
        });
    }

    #[test]
    fn test_duplicates_rejected() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store
                .insert(new_account("alice", "alice@example.com"))
                .await
                .unwrap();

            assert!(matches!(
                store.insert(new_account("alice", "other@example.com")).await,
                Err(StoreError::DuplicateUsername)
            ));
            assert!(matches!(
                store.insert(new_account("alicia", "alice@example.com")).await,
                Err(StoreError::DuplicateEmail)
            ));
        });
    }

    #[test]
    fn test_update_persists_rotated_secret() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let mut alice = store
                .insert(new_account("alice", "alice@example.com"))
                .await
                .unwrap();

            alice.change_password("new-hash".to_string(), "rotated".to_string());
            store.update(&alice).await.unwrap();

            let reloaded = store.get_by_username("alice").await.unwrap();
            assert_eq!(reloaded.token_hash, "rotated");
        });
    }

    #[test]
    fn test_update_missing_is_conflict() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let mut ghost = store
                .insert(new_account("ghost", "ghost@example.com"))
                .await
                .unwrap();
            store.delete("ghost").await.unwrap();

            ghost.activated = true;
            assert!(matches!(
                store.update(&ghost).await,
                Err(StoreError::EditConflict)
            ));
        });
    }

    #[test]
    fn test_permissions() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let alice = store
                .insert(new_account("alice", "alice@example.com"))
                .await
                .unwrap();

            assert!(store.permissions_for(alice.id).await.unwrap().is_empty());

            store
                .add_permissions(alice.id, &["books:read", "books:read", "users:write"])
                .await
                .unwrap();
            let perms = store.permissions_for(alice.id).await.unwrap();
            assert_eq!(perms.len(), 2);
            assert!(perms.includes("users:write"));
        });
    }

    #[test]
    fn test_verification_lifecycle() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let alice = store
                .insert(new_account("alice", "alice@example.com"))
                .await
                .unwrap();
            let now = Utc::now();

            store
                .insert_verification(&Verification {
                    code_hash: vec![1; 32],
                    account_id: alice.id,
                    expiry: now + Duration::hours(1),
                })
                .await
                .unwrap();

            let found = store.get_by_verification_code(&[1; 32], now).await.unwrap();
            assert_eq!(found.id, alice.id);

            // expired lookups miss
            assert!(store
                .get_by_verification_code(&[1; 32], now + Duration::hours(2))
                .await
                .is_err());

            store.delete_verifications(alice.id).await.unwrap();
            assert!(store.get_by_verification_code(&[1; 32], now).await.is_err());
        });
    }
}
