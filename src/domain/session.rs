//! Checkpoint sessions and the actions that resolve them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::request::Identity;
use super::stage::StageId;
use super::state::PipelineState;

/// Action an external caller may apply to a paused execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Approve,
    Edit,
    ApproveAll,
    Cancel,
    Save,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Approve => "approve",
            ActionKind::Edit => "edit",
            ActionKind::ApproveAll => "approve_all",
            ActionKind::Cancel => "cancel",
            ActionKind::Save => "save",
        }
    }

    /// Actions after which the execution keeps running
    pub fn continues(&self) -> bool {
        matches!(
            self,
            ActionKind::Approve | ActionKind::Edit | ActionKind::ApproveAll
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ActionKind::Approve),
            "edit" => Ok(ActionKind::Edit),
            "approve_all" | "approve-all" => Ok(ActionKind::ApproveAll),
            "cancel" => Ok(ActionKind::Cancel),
            "save" => Ok(ActionKind::Save),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Generate an opaque, unguessable session token
pub fn new_session_token() -> String {
    // Two v4 UUIDs give 244 random bits
    format!(
        "cs_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// A suspended execution awaiting an external decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSession {
    pub session_id: String,
    pub execution_id: Uuid,

    /// Stage that just completed; its output is what `edit` replaces
    pub paused_stage: StageId,

    /// Stage that runs when the execution continues
    pub next_stage: StageId,

    /// State at pause time
    pub snapshot: PipelineState,

    /// `Some(Save)` once parked for later
    pub pending_action: Option<ActionKind>,

    /// Instructions recorded by `save` for the stage that runs next
    pub instructions: Option<String>,

    /// Scope for discovery of saved sessions
    pub identity: Identity,

    pub created_at: DateTime<Utc>,
    pub saved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl CheckpointSession {
    pub fn new(
        snapshot: PipelineState,
        paused_stage: StageId,
        next_stage: StageId,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: new_session_token(),
            execution_id: snapshot.execution_id,
            identity: snapshot.request.identity.clone(),
            paused_stage,
            next_stage,
            snapshot,
            pending_action: None,
            instructions: None,
            created_at: now,
            saved_at: None,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_saved(&self) -> bool {
        self.pending_action == Some(ActionKind::Save)
    }
}

/// Action submission as received from a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub session_id: String,
    pub action: ActionKind,

    #[serde(default)]
    pub edited_output: Option<serde_json::Value>,

    #[serde(default)]
    pub next_stage_instructions: Option<String>,
}

impl ActionRequest {
    pub fn new(session_id: impl Into<String>, action: ActionKind) -> Self {
        Self {
            session_id: session_id.into(),
            action,
            edited_output: None,
            next_stage_instructions: None,
        }
    }

    pub fn approve(session_id: impl Into<String>) -> Self {
        Self::new(session_id, ActionKind::Approve)
    }

    pub fn edit(session_id: impl Into<String>, edited_output: serde_json::Value) -> Self {
        Self {
            edited_output: Some(edited_output),
            ..Self::new(session_id, ActionKind::Edit)
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.next_stage_instructions = Some(instructions.into());
        self
    }
}

/// Which saved sessions to list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionScope {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

impl SessionScope {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
        }
    }

    pub fn user(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn matches(&self, identity: &Identity) -> bool {
        identity.tenant_id == self.tenant_id
            && self
                .user_id
                .as_ref()
                .map_or(true, |u| *u == identity.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::ContentRequest;
    use crate::domain::state::ExecutionMode;

    #[test]
    fn test_session_tokens_are_unique_and_opaque() {
        let a = new_session_token();
        let b = new_session_token();
        assert_ne!(a, b);
        assert!(a.starts_with("cs_"));
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn test_session_expiry() {
        let state = PipelineState::new(
            Uuid::new_v4(),
            ContentRequest::new("t", Identity::new("acme", "u1")),
            ExecutionMode::Checkpoint,
        );
        let session = CheckpointSession::new(
            state,
            StageId::Research,
            StageId::ToneAnalysis,
            Duration::minutes(5),
        );

        assert!(!session.is_expired(Utc::now()));
        assert!(session.is_expired(Utc::now() + Duration::minutes(6)));
        assert_eq!(session.identity.tenant_id, "acme");
    }

    #[test]
    fn test_scope_matching() {
        let id = Identity::new("acme", "u1");
        assert!(SessionScope::tenant("acme").matches(&id));
        assert!(SessionScope::user("acme", "u1").matches(&id));
        assert!(!SessionScope::user("acme", "u2").matches(&id));
        assert!(!SessionScope::tenant("other").matches(&id));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("approve-all".parse::<ActionKind>().unwrap(), ActionKind::ApproveAll);
        assert!("reject".parse::<ActionKind>().is_err());
        assert!(ActionKind::Edit.continues());
        assert!(!ActionKind::Save.continues());
    }
}
