//! User profile storage port, consulted by the rule evaluator and the
//! throttle gate on every message.

use aegis_common::model::UserProfile;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<UserProfile>;
    async fn upsert(&self, profile: UserProfile);
    async fn delete(&self, user_id: &str);
    /// Snapshot of every known profile, consulted by the dispatcher's
    /// fan-out -- a domain event is evaluated against all of these,
    /// not just one.
    async fn load_all(&self) -> Vec<UserProfile>;
}

#[derive(Default)]
pub struct InMemoryUserRepo {
    profiles: Arc<RwLock<HashMap<String, UserProfile>>>,
}

impl InMemoryUserRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepo for InMemoryUserRepo {
    async fn get(&self, user_id: &str) -> Option<UserProfile> {
        self.profiles.read().get(user_id).cloned()
    }

    async fn upsert(&self, mut profile: UserProfile) {
        profile.updated_at = chrono::Utc::now();
        self.profiles.write().insert(profile.user_id.clone(), profile);
    }

    async fn delete(&self, user_id: &str) {
        self.profiles.write().remove(user_id);
    }

    async fn load_all(&self) -> Vec<UserProfile> {
        self.profiles.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let repo = InMemoryUserRepo::new();
        let profile = UserProfile::new("u1");
        repo.upsert(profile.clone()).await;

        let fetched = repo.get("u1").await.unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert!(repo.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn load_all_returns_every_profile() {
        let repo = InMemoryUserRepo::new();
        repo.upsert(UserProfile::new("u1")).await;
        repo.upsert(UserProfile::new("u2")).await;

        let mut ids: Vec<String> = repo.load_all().await.into_iter().map(|p| p.user_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn delete_removes_profile() {
        let repo = InMemoryUserRepo::new();
        repo.upsert(UserProfile::new("u1")).await;
        repo.delete("u1").await;
        assert!(repo.get("u1").await.is_none());
    }
}
