//! Session Store & Notifier (§4.7): `sessionId → ClientSession` and
//! `userId → Set<ClientSession>` indices.

use std::sync::Arc;

use dashmap::DashMap;
use gateway_types::{AuthContext, CloseReason};
use tracing::info;

use crate::reverse::ReverseTimeouts;
use crate::session::ClientSession;

#[derive(Default)]
pub struct SessionStore {
    by_session: DashMap<String, Arc<ClientSession>>,
    by_user: DashMap<String, Vec<Arc<ClientSession>>>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, session_id: String, auth_context: AuthContext) -> Arc<ClientSession> {
        self.create_with_timeouts(session_id, auth_context, ReverseTimeouts::default())
    }

    /// Same as [`Self::create`], but lets the caller supply reverse-request
    /// timeouts other than the §4.3 defaults (e.g. from configuration).
    pub fn create_with_timeouts(
        &self,
        session_id: String,
        auth_context: AuthContext,
        timeouts: ReverseTimeouts,
    ) -> Arc<ClientSession> {
        let session = ClientSession::with_timeouts(session_id.clone(), auth_context, timeouts);
        self.by_session.insert(session_id, session.clone());
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .push(session.clone());
        session
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<ClientSession>> {
        self.by_session.get(session_id).map(|e| e.clone())
    }

    #[must_use]
    pub fn get_user_sessions(&self, user_id: &str) -> Vec<Arc<ClientSession>> {
        self.by_user.get(user_id).map(|e| e.clone()).unwrap_or_default()
    }

    pub fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.by_session.remove(session_id) {
            if let Some(mut user_sessions) = self.by_user.get_mut(&session.user_id) {
                user_sessions.retain(|s| s.session_id != session_id);
            }
        }
    }

    /// Closes and removes every session belonging to `user_id` (used on
    /// disable/delete/expiry, §4.7).
    pub fn remove_all_user_sessions(&self, user_id: &str, reason: CloseReason) {
        let Some((_, sessions)) = self.by_user.remove(user_id) else {
            return;
        };
        for session in &sessions {
            session.close(reason);
            self.by_session.remove(&session.session_id);
        }
        info!(user_id, count = sessions.len(), ?reason, "removed all user sessions");
    }

    /// Reloads a user's `AuthContext` (e.g. after a preferences edit) and
    /// propagates it to every live session (§4.7 "updateUserPreferences").
    pub fn update_user_auth_context(&self, user_id: &str, auth_context: AuthContext) {
        for session in self.get_user_sessions(user_id) {
            session.set_auth_context(auth_context.clone());
        }
    }

    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.by_session.len()
    }

    /// Every live session, used by the broadcast path (§4.6) to find
    /// which sessions have access to a server that just announced a
    /// `list_changed`/`resourceUpdated` event.
    #[must_use]
    pub fn all_sessions(&self) -> Vec<Arc<ClientSession>> {
        self.by_session.iter().map(|e| e.value().clone()).collect()
    }

    /// Sweeps idle sessions past the §4.3 idle timeout, closing each with
    /// `SessionTimeout`. Intended to be driven by a periodic task.
    pub fn sweep_idle(&self, now_millis: u64) -> usize {
        let idle: Vec<String> = self
            .by_session
            .iter()
            .filter(|e| e.value().is_idle(now_millis))
            .map(|e| e.key().clone())
            .collect();
        let count = idle.len();
        for session_id in idle {
            if let Some(session) = self.get(&session_id) {
                session.close(CloseReason::SessionTimeout);
            }
            self.remove(&session_id);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_types::schema::{LaunchConfigsBlob, PermissionsBlob, PreferencesBlob};
    use gateway_types::{Role, UserStatus};

    fn auth_context(user_id: &str) -> AuthContext {
        AuthContext {
            user_id: user_id.to_string(),
            token_mask: "abcd1234…abcd1234".into(),
            role: Role::User,
            status: UserStatus::Enabled,
            permissions: PermissionsBlob::default(),
            preferences: PreferencesBlob::default(),
            launch_configs: LaunchConfigsBlob::default(),
            authenticated_at_millis: gateway_types::now_millis(),
            expires_at: 0,
            rate_limit: 60,
        }
    }

    #[test]
    fn create_and_lookup_by_session_and_user() {
        let store = SessionStore::new();
        store.create("s1".into(), auth_context("u1"));
        assert!(store.get("s1").is_some());
        assert_eq!(store.get_user_sessions("u1").len(), 1);
    }

    #[test]
    fn remove_all_user_sessions_closes_and_clears_both_indices() {
        let store = SessionStore::new();
        store.create("s1".into(), auth_context("u1"));
        store.create("s2".into(), auth_context("u1"));
        store.remove_all_user_sessions("u1", CloseReason::UserExpired);
        assert!(store.get("s1").is_none());
        assert!(store.get("s2").is_none());
        assert!(store.get_user_sessions("u1").is_empty());
    }

    #[test]
    fn remove_one_session_keeps_siblings() {
        let store = SessionStore::new();
        store.create("s1".into(), auth_context("u1"));
        store.create("s2".into(), auth_context("u1"));
        store.remove("s1");
        assert!(store.get("s1").is_none());
        assert_eq!(store.get_user_sessions("u1").len(), 1);
    }

    #[test]
    fn all_sessions_lists_every_live_session() {
        let store = SessionStore::new();
        store.create("s1".into(), auth_context("u1"));
        store.create("s2".into(), auth_context("u2"));
        let mut ids: Vec<String> = store.all_sessions().iter().map(|s| s.session_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn sweep_idle_closes_only_expired_sessions() {
        let store = SessionStore::new();
        let session = store.create("s1".into(), auth_context("u1"));
        session.touch();
        let closed = store.sweep_idle(session.last_active_millis() + crate::session::IDLE_TIMEOUT_MILLIS + 1);
        assert_eq!(closed, 1);
        assert!(store.get("s1").is_none());
    }
}
