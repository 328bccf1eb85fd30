//! Document addressing: `workspace` or `workspace:variant:guid`.
//!
//! Every update and snapshot is keyed by a [`DocId`]. The textual form is the
//! wire representation at API boundaries; the parsed form is only ever built
//! transiently (request boundary, buffer key construction) and persisted as
//! its canonical string.
//!
//! ```text
//! "ws"               → workspace doc of "ws"
//! "ws:space:page1"   → sub-document "page1" (variant Space) of "ws"
//! "space:page1" + hint "ws" → same as above
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Address parse failures. Messages identify the violated rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocIdError {
    #[error("Invalid format of Doc ID: {0}")]
    InvalidFormat(String),
    #[error("Workspace is required")]
    WorkspaceRequired,
    #[error("Invalid ID variant: {0}")]
    InvalidVariant(String),
    #[error("ID is required for non-workspace doc")]
    GuidRequired,
    #[error("Variant is required for non-workspace doc")]
    VariantRequired,
}

/// Kind of entity a [`DocId`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DocVariant {
    #[default]
    Workspace,
    Space,
    Settings,
}

impl DocVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocVariant::Workspace => "workspace",
            DocVariant::Space => "space",
            DocVariant::Settings => "settings",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "workspace" => Some(DocVariant::Workspace),
            "space" => Some(DocVariant::Space),
            "settings" => Some(DocVariant::Settings),
            _ => None,
        }
    }
}

impl fmt::Display for DocVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Universal id of any entity inside a workspace.
#[derive(Debug, Clone)]
pub struct DocId {
    raw: String,
    workspace: String,
    variant: DocVariant,
    sub: Option<String>,
}

impl DocId {
    /// Parse a raw id, optionally under an authoritative workspace.
    ///
    /// With a `workspace_hint`, the two-part form `variant:guid` is accepted
    /// and any workspace segment embedded in a three-part id is replaced.
    pub fn parse(raw: &str, workspace_hint: Option<&str>) -> Result<Self, DocIdError> {
        let mut parts: Vec<&str> = raw.split(':').collect();

        if parts.len() > 3 {
            return Err(DocIdError::InvalidFormat(raw.to_string()));
        }

        if parts.len() == 2 {
            match workspace_hint {
                Some(ws) if !ws.is_empty() => parts.insert(0, ws),
                _ => return Err(DocIdError::WorkspaceRequired),
            }
        }

        let workspace = match workspace_hint {
            Some(ws) if !ws.is_empty() => ws,
            _ => parts[0],
        };
        let variant = parts.get(1).copied().filter(|v| !v.is_empty());
        let sub = parts.get(2).copied().filter(|s| !s.is_empty());

        if workspace.is_empty() {
            return Err(DocIdError::WorkspaceRequired);
        }

        let variant = match (variant, sub) {
            (Some(v), sub) => {
                let variant = DocVariant::from_segment(v)
                    .ok_or_else(|| DocIdError::InvalidVariant(v.to_string()))?;
                if sub.is_none() {
                    return Err(DocIdError::GuidRequired);
                }
                // a workspace doc is addressed by its bare workspace id
                if variant == DocVariant::Workspace {
                    return Err(DocIdError::InvalidFormat(raw.to_string()));
                }
                variant
            }
            (None, Some(_)) => return Err(DocIdError::VariantRequired),
            (None, None) => DocVariant::Workspace,
        };

        Ok(Self {
            raw: raw.to_string(),
            workspace: workspace.to_string(),
            variant,
            sub: sub.map(str::to_string),
        })
    }

    /// Like [`DocId::parse`] without a hint, but malformed input is `None`.
    pub fn try_parse(raw: &str) -> Option<Self> {
        Self::parse(raw, None).ok()
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn variant(&self) -> DocVariant {
        self.variant
    }

    /// The string this id was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_workspace(&self) -> bool {
        self.variant == DocVariant::Workspace
    }

    /// Pure guid without prefix: the workspace id for workspace docs,
    /// the sub-document id otherwise.
    pub fn guid(&self) -> &str {
        match &self.sub {
            Some(sub) if !self.is_workspace() => sub,
            _ => &self.workspace,
        }
    }

    /// Bare workspace id, or `variant:guid` for sub-documents.
    ///
    /// Kept for clients that still address sub-documents without the
    /// workspace prefix.
    pub fn legacy_id(&self) -> String {
        if self.is_workspace() {
            self.workspace.clone()
        } else {
            format!("{}:{}", self.variant, self.guid())
        }
    }

    /// Canonical full form.
    pub fn full(&self) -> String {
        if self.is_workspace() {
            self.workspace.clone()
        } else {
            format!("{}:{}:{}", self.workspace, self.variant, self.guid())
        }
    }

    /// Rebind the workspace segment of a sub-document id.
    ///
    /// No-op for workspace ids, whose workspace segment is the address itself.
    pub fn fix_workspace(&mut self, workspace: &str) {
        if !self.is_workspace() && self.workspace != workspace {
            self.workspace = workspace.to_string();
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_workspace() {
            f.write_str(&self.workspace)
        } else {
            write!(f, "{}:{}:{}", self.workspace, self.variant, self.guid())
        }
    }
}

impl PartialEq for DocId {
    fn eq(&self, other: &Self) -> bool {
        self.full() == other.full()
    }
}

impl Eq for DocId {}

impl std::hash::Hash for DocId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.full().hash(state);
    }
}

impl FromStr for DocId {
    type Err = DocIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, None)
    }
}

impl Serialize for DocId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DocId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DocId::parse(&raw, None).map_err(serde::de::Error::custom)
    }
}
