//! Chat registry — binds each chat to a repository, a company, or the
//! cross-context HQ role, and fans events out accordingly.
//!
//! The registry is the persisted routing table for notifications: webhook
//! events, pipeline outcomes, and scheduled digests all ask it which chats
//! care. A chat has at most one registration; re-registering replaces it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{RegistryError, ShipmateError};
use crate::store::{ChatRegistration, ChatType, NotificationLevel, Store};

/// The company codes this operator runs. Fixed set; anything else is a
/// typo we reject early.
pub const COMPANY_CODES: &[&str] = &["GMH", "GACC", "GCAP", "GQCARS", "GSPV"];

/// A registration request from the chat admin skill.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub chat_type: ChatType,
    pub target: Option<String>,
    pub notifications: NotificationLevel,
    pub platform: String,
    pub label: Option<String>,
    pub registered_by: String,
}

/// The ambient context a chat's registration implies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    pub repo: Option<String>,
    pub company: Option<String>,
    pub hq: bool,
}

/// An event to fan out to chats.
#[derive(Debug, Clone, Default)]
pub struct RouteEvent {
    pub repo: Option<String>,
    pub company: Option<String>,
    pub critical: bool,
}

/// Where an event goes: chats to message now, and chats whose digest queue
/// should accumulate it for the next batched flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutedDelivery {
    pub immediate: Vec<String>,
    pub digest: Vec<String>,
}

/// The chat registry. Thin, validated veneer over the store's
/// registration rows.
pub struct ChatRegistry {
    store: Arc<Store>,
}

impl ChatRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register (or re-register) a chat. Repo and company registrations
    /// require a target; company targets must be a known code; hq takes
    /// none.
    pub fn register(
        &self,
        chat_id: &str,
        req: RegisterRequest,
    ) -> Result<ChatRegistration, ShipmateError> {
        let target = match req.chat_type {
            ChatType::Hq => None,
            ChatType::Repo => Some(req.target.clone().ok_or(RegistryError::MissingTarget {
                reg_type: "repo".into(),
            })?),
            ChatType::Company => {
                let code = req.target.clone().ok_or(RegistryError::MissingTarget {
                    reg_type: "company".into(),
                })?;
                let code = code.to_uppercase();
                if !COMPANY_CODES.contains(&code.as_str()) {
                    return Err(RegistryError::UnknownCompany { code }.into());
                }
                Some(code)
            }
        };
        let reg = ChatRegistration {
            chat_id: chat_id.to_string(),
            chat_type: req.chat_type,
            target,
            notifications: req.notifications,
            platform: req.platform,
            label: req.label,
            registered_at: Utc::now(),
            registered_by: req.registered_by,
        };
        self.store.put_registration(&reg)?;
        tracing::info!(chat_id, reg_type = reg.chat_type.as_str(), "chat registered");
        Ok(reg)
    }

    /// A chat's registration, if any.
    pub fn get(&self, chat_id: &str) -> Result<Option<ChatRegistration>, ShipmateError> {
        Ok(self.store.get_registration(chat_id)?)
    }

    /// Drop a chat's registration. Returns whether one existed.
    pub fn unregister(&self, chat_id: &str) -> Result<bool, ShipmateError> {
        Ok(self.store.delete_registration(chat_id)?)
    }

    /// All registrations.
    pub fn list(&self) -> Result<Vec<ChatRegistration>, ShipmateError> {
        Ok(self.store.list_registrations()?)
    }

    /// Change a chat's notification level. The level arrives as user text.
    pub fn set_notification_level(&self, chat_id: &str, level: &str) -> Result<(), ShipmateError> {
        let parsed = NotificationLevel::parse(level).ok_or(RegistryError::InvalidLevel {
            level: level.to_string(),
        })?;
        if self.store.get_registration(chat_id)?.is_none() {
            return Err(RegistryError::NotRegistered {
                chat_id: chat_id.to_string(),
            }
            .into());
        }
        self.store.set_registration_notifications(chat_id, parsed)?;
        Ok(())
    }

    /// The ambient parameters a chat's registration implies.
    pub fn context_for(&self, chat_id: &str) -> Result<ChatContext, ShipmateError> {
        let Some(reg) = self.store.get_registration(chat_id)? else {
            return Ok(ChatContext::default());
        };
        Ok(match reg.chat_type {
            ChatType::Repo => ChatContext {
                repo: reg.target,
                ..ChatContext::default()
            },
            ChatType::Company => ChatContext {
                company: reg.target,
                ..ChatContext::default()
            },
            ChatType::Hq => ChatContext {
                hq: true,
                ..ChatContext::default()
            },
        })
    }

    /// Every chat that should see `event`, split by delivery mode.
    ///
    /// HQ chats match everything; repo/company chats match on target.
    /// Within the matches, level `all` delivers immediately, `critical`
    /// delivers only critical events, and `digest` accumulates for the
    /// batched flush.
    pub fn route_for(&self, event: &RouteEvent) -> Result<RoutedDelivery, ShipmateError> {
        let mut delivery = RoutedDelivery::default();
        for reg in self.store.list_registrations()? {
            let matches = match reg.chat_type {
                ChatType::Hq => true,
                ChatType::Repo => {
                    reg.target.as_deref().is_some()
                        && reg.target.as_deref() == event.repo.as_deref()
                }
                ChatType::Company => {
                    reg.target.as_deref().is_some()
                        && reg.target.as_deref() == event.company.as_deref()
                }
            };
            if !matches {
                continue;
            }
            match reg.notifications {
                NotificationLevel::All => delivery.immediate.push(reg.chat_id),
                NotificationLevel::Critical => {
                    if event.critical {
                        delivery.immediate.push(reg.chat_id);
                    }
                }
                NotificationLevel::Digest => delivery.digest.push(reg.chat_id),
            }
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ChatRegistry {
        ChatRegistry::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    fn req(chat_type: ChatType, target: Option<&str>, level: NotificationLevel) -> RegisterRequest {
        RegisterRequest {
            chat_type,
            target: target.map(String::from),
            notifications: level,
            platform: "telegram".into(),
            label: None,
            registered_by: "u1".into(),
        }
    }

    #[test]
    fn test_register_repo_and_context() {
        let reg = registry();
        reg.register("C1", req(ChatType::Repo, Some("aws-clawd-bot"), NotificationLevel::All))
            .unwrap();

        let ctx = reg.context_for("C1").unwrap();
        assert_eq!(ctx.repo.as_deref(), Some("aws-clawd-bot"));
        assert!(!ctx.hq);
    }

    #[test]
    fn test_company_code_validation() {
        let reg = registry();
        // lowercase is accepted and canonicalized
        let r = reg
            .register("C1", req(ChatType::Company, Some("gmh"), NotificationLevel::All))
            .unwrap();
        assert_eq!(r.target.as_deref(), Some("GMH"));

        let err = reg
            .register("C2", req(ChatType::Company, Some("ACME"), NotificationLevel::All))
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Registry(RegistryError::UnknownCompany { .. })
        ));
    }

    #[test]
    fn test_repo_requires_target() {
        let reg = registry();
        let err = reg
            .register("C1", req(ChatType::Repo, None, NotificationLevel::All))
            .unwrap_err();
        assert!(matches!(
            err,
            ShipmateError::Registry(RegistryError::MissingTarget { .. })
        ));
    }

    #[test]
    fn test_set_level_validation() {
        let reg = registry();
        reg.register("C1", req(ChatType::Hq, None, NotificationLevel::All))
            .unwrap();
        reg.set_notification_level("C1", "digest").unwrap();
        assert!(reg.set_notification_level("C1", "loud").is_err());
        assert!(reg.set_notification_level("ghost", "all").is_err());
    }

    #[test]
    fn test_route_for_critical_event() {
        let reg = registry();
        reg.register("repo-match", req(ChatType::Repo, Some("api"), NotificationLevel::All))
            .unwrap();
        reg.register("repo-other", req(ChatType::Repo, Some("web"), NotificationLevel::All))
            .unwrap();
        reg.register("hq", req(ChatType::Hq, None, NotificationLevel::All))
            .unwrap();
        reg.register(
            "crit-match",
            req(ChatType::Repo, Some("api"), NotificationLevel::Critical),
        )
        .unwrap();
        reg.register(
            "crit-other",
            req(ChatType::Repo, Some("web"), NotificationLevel::Critical),
        )
        .unwrap();

        let delivery = reg
            .route_for(&RouteEvent {
                repo: Some("api".into()),
                company: None,
                critical: true,
            })
            .unwrap();

        let mut immediate = delivery.immediate.clone();
        immediate.sort();
        assert_eq!(immediate, vec!["crit-match", "hq", "repo-match"]);
        assert!(delivery.digest.is_empty());
    }

    #[test]
    fn test_route_for_noncritical_skips_critical_chats() {
        let reg = registry();
        reg.register("crit", req(ChatType::Repo, Some("api"), NotificationLevel::Critical))
            .unwrap();
        reg.register("all", req(ChatType::Repo, Some("api"), NotificationLevel::All))
            .unwrap();

        let delivery = reg
            .route_for(&RouteEvent {
                repo: Some("api".into()),
                company: None,
                critical: false,
            })
            .unwrap();
        assert_eq!(delivery.immediate, vec!["all"]);
    }

    #[test]
    fn test_route_for_digest_accumulates() {
        let reg = registry();
        reg.register("d", req(ChatType::Hq, None, NotificationLevel::Digest))
            .unwrap();
        let delivery = reg
            .route_for(&RouteEvent {
                repo: Some("api".into()),
                ..RouteEvent::default()
            })
            .unwrap();
        assert!(delivery.immediate.is_empty());
        assert_eq!(delivery.digest, vec!["d"]);
    }

    #[test]
    fn test_event_without_repo_does_not_match_repo_chats() {
        let reg = registry();
        reg.register("r", req(ChatType::Repo, Some("api"), NotificationLevel::All))
            .unwrap();
        let delivery = reg.route_for(&RouteEvent::default()).unwrap();
        assert!(delivery.immediate.is_empty());
    }

    #[test]
    fn test_unregister() {
        let reg = registry();
        reg.register("C1", req(ChatType::Hq, None, NotificationLevel::All))
            .unwrap();
        assert!(reg.unregister("C1").unwrap());
        assert!(!reg.unregister("C1").unwrap());
    }
}
