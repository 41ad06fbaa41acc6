//! Runtime allow-list
//!
//! Seeded from `AUTHORIZED_USERS` and editable by the admin through bot
//! commands. Changes live in memory only. The bot is open to everyone only
//! while there is neither an admin nor a listed user.

use crate::config::Settings;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};

/// Result of removing a user from the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotListed,
    /// The admin cannot be locked out
    Admin,
}

#[derive(Debug, Default)]
pub struct AccessList {
    admin: Option<i64>,
    users: RwLock<HashSet<i64>>,
}

impl AccessList {
    #[must_use]
    pub fn new(admin: Option<i64>, users: HashSet<i64>) -> Self {
        Self {
            admin,
            users: RwLock::new(users),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.admin_id, settings.authorized_users())
    }

    #[must_use]
    pub const fn admin(&self) -> Option<i64> {
        self.admin
    }

    #[must_use]
    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin == Some(user_id)
    }

    #[must_use]
    pub fn is_authorized(&self, user_id: i64) -> bool {
        if self.is_admin(user_id) {
            return true;
        }
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        (self.admin.is_none() && users.is_empty()) || users.contains(&user_id)
    }

    /// `true` while anyone may use the bot
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.admin.is_none()
            && self
                .users
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
    }

    /// Adds `user_id`; returns `false` if it was already listed.
    pub fn add(&self, user_id: i64) -> bool {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id)
    }

    pub fn remove(&self, user_id: i64) -> Removal {
        if self.is_admin(user_id) {
            return Removal::Admin;
        }
        let removed = self
            .users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&user_id);
        if removed {
            Removal::Removed
        } else {
            Removal::NotListed
        }
    }

    /// Listed users, ascending
    #[must_use]
    pub fn users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        users.sort_unstable();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_open() {
        let access = AccessList::new(None, HashSet::new());
        assert!(access.is_open());
        assert!(access.is_authorized(42));
    }

    #[test]
    fn test_admin_closes_an_empty_list() {
        let access = AccessList::new(Some(10), HashSet::new());
        assert!(!access.is_open());
        assert!(access.is_authorized(10));
        assert!(!access.is_authorized(42));

        assert!(access.add(42));
        assert_eq!(access.remove(42), Removal::Removed);
        // Emptying the list again does not reopen the bot
        assert!(!access.is_authorized(42));
    }

    #[test]
    fn test_seeded_from_settings() {
        let mut settings = crate::config::test_settings();
        settings.authorized_users_str = Some("1, 2".to_string());
        settings.admin_id = Some(99);

        let access = AccessList::from_settings(&settings);
        assert!(access.is_authorized(1));
        assert!(!access.is_authorized(42));
        assert!(access.is_authorized(99));
        assert_eq!(access.users(), vec![1, 2]);
    }

    #[test]
    fn test_add_and_remove() {
        let access = AccessList::new(Some(10), HashSet::from([1]));
        assert!(access.add(7));
        assert!(!access.add(7));
        assert!(access.is_authorized(7));

        assert_eq!(access.remove(7), Removal::Removed);
        assert_eq!(access.remove(7), Removal::NotListed);
        assert!(!access.is_authorized(7));
    }

    #[test]
    fn test_admin_cannot_be_removed() {
        let access = AccessList::new(Some(10), HashSet::from([10, 1]));
        assert_eq!(access.remove(10), Removal::Admin);
        assert!(access.users().contains(&10));

        // Even with the list emptied of everyone else the admin stays in
        assert_eq!(access.remove(1), Removal::Removed);
        assert!(access.is_authorized(10));
    }
}
