//! Portal operations exposed to callers.

use std::collections::BTreeMap;

use autoportal_engine::FormField;
use serde::{Deserialize, Serialize};

/// Mutation of a managed sub-entry on the portal account.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationOp {
    AddSubAccount {
        username: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    EditSubAccount {
        username: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
    },
    RemoveSubAccount { username: String },
}

impl MutationOp {
    pub fn action(&self) -> &'static str {
        match self {
            Self::AddSubAccount { .. } => "add",
            Self::EditSubAccount { .. } => "edit",
            Self::RemoveSubAccount { .. } => "remove",
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::AddSubAccount { username, .. }
            | Self::EditSubAccount { username, .. }
            | Self::RemoveSubAccount { username } => username,
        }
    }

    /// Form representation used by both the cheap and the expensive path.
    pub fn form_fields(&self) -> Vec<FormField> {
        let mut fields = vec![
            FormField::new("action", self.action()),
            FormField::new("username", self.username()),
        ];
        match self {
            Self::AddSubAccount { fields: extra, .. }
            | Self::EditSubAccount { fields: extra, .. } => {
                for (name, value) in extra {
                    fields.push(FormField::new(name.clone(), value.clone()));
                }
            }
            Self::RemoveSubAccount { .. } => {}
        }
        fields
    }

    pub fn describe(&self) -> String {
        format!("{} sub-account '{}'", self.action(), self.username())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub success: bool,
    pub message: String,
}

/// Internal operation form the orchestrator routes on.
#[derive(Debug, Clone, Copy)]
pub enum PortalOperation<'a> {
    Read { query: &'a str },
    Mutate { op: &'a MutationOp },
}
