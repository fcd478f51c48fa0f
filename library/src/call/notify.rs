use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use log::info;
use peercall_protocol::UserId;
use tokio::sync::RwLock;

use crate::call::session::CallType;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Channel {
    Push,
    Email,
    InApp,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Notification {
    MissedCall {
        callee: UserId,
        caller: UserId,
        call_type: CallType,
    },
    Busy {
        caller: UserId,
        callee_name: String,
    },
    Declined {
        caller: UserId,
        callee_name: String,
    },
}

impl Notification {
    #[must_use]
    pub const fn channels(&self) -> &'static [Channel] {
        match *self {
            Self::MissedCall { .. } => &[Channel::Push, Channel::Email],
            Self::Busy { .. } | Self::Declined { .. } => &[Channel::InApp],
        }
    }

    #[must_use]
    pub const fn recipient(&self) -> &UserId {
        match *self {
            Self::MissedCall { ref callee, .. } => callee,
            Self::Busy { ref caller, .. } | Self::Declined { ref caller, .. } => caller,
        }
    }
}

/// Fire-and-forget user notifications.
pub trait Notifier: Send + Sync {
    fn notify_missed_call(&self, callee: &UserId, caller: &UserId, call_type: CallType);

    fn notify_busy(&self, caller: &UserId, callee_name: &str);

    fn notify_declined(&self, caller: &UserId, callee_name: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_missed_call(&self, callee: &UserId, caller: &UserId, call_type: CallType) {
        info!("notify {callee}: missed {} call from {caller}", call_type.as_str());
    }

    fn notify_busy(&self, caller: &UserId, callee_name: &str) {
        info!("notify {caller}: {callee_name} is busy");
    }

    fn notify_declined(&self, caller: &UserId, callee_name: &str) {
        info!("notify {caller}: {callee_name} declined");
    }
}

/// Keeps every notification for inspection.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<Notification> {
        self.lock().clone()
    }

    #[must_use]
    pub fn sent_to(&self, user: &UserId) -> Vec<Notification> {
        self.lock()
            .iter()
            .filter(|notification| notification.recipient() == user)
            .cloned()
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.lock().push(notification);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Notifier for MemoryNotifier {
    fn notify_missed_call(&self, callee: &UserId, caller: &UserId, call_type: CallType) {
        self.push(Notification::MissedCall {
            callee: callee.clone(),
            caller: caller.clone(),
            call_type,
        });
    }

    fn notify_busy(&self, caller: &UserId, callee_name: &str) {
        self.push(Notification::Busy {
            caller: caller.clone(),
            callee_name: callee_name.to_owned(),
        });
    }

    fn notify_declined(&self, caller: &UserId, callee_name: &str) {
        self.push(Notification::Declined {
            caller: caller.clone(),
            callee_name: callee_name.to_owned(),
        });
    }
}

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_name(&self, user: &UserId) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct MemoryProfiles {
    names: RwLock<HashMap<UserId, String>>,
}

impl MemoryProfiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserId, name: impl Into<String>) {
        self.names.write().await.insert(user, name.into());
    }
}

#[async_trait]
impl ProfileDirectory for MemoryProfiles {
    async fn display_name(&self, user: &UserId) -> Option<String> {
        self.names.read().await.get(user).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missed_calls_go_out_on_push_and_email() {
        let notifier = MemoryNotifier::new();
        notifier.notify_missed_call(&UserId::from("dana"), &UserId::from("carl"), CallType::Video);
        notifier.notify_busy(&UserId::from("carl"), "Dana");

        let to_dana = notifier.sent_to(&UserId::from("dana"));
        assert_eq!(to_dana.len(), 1);
        assert_eq!(to_dana[0].channels(), &[Channel::Push, Channel::Email]);
        assert_eq!(notifier.sent_to(&UserId::from("carl"))[0].channels(), &[Channel::InApp]);
    }

    #[tokio::test]
    async fn test_profiles_lookup() {
        let profiles = MemoryProfiles::new();
        profiles.insert(UserId::from("dana"), "Dana").await;
        assert_eq!(profiles.display_name(&UserId::from("dana")).await.as_deref(), Some("Dana"));
        assert_eq!(profiles.display_name(&UserId::from("eve")).await, None);
    }
}
