use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::ChoiceId,
    error::FetchError,
    protocol::UpdatePatch,
};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod chained;
pub mod dselect;
pub mod entity_selector;
pub mod expression;
pub mod ordered;
pub mod registry;
pub mod template;

pub use chained::{ChainedSelects, PropagationReport};
pub use dselect::{ChoiceSource, Datatype, DynamicSelect};
pub use entity_selector::{
    EntitySelector, EntitySelectorOptions, ListViewDialog, MissingSelectionDialog, QFilter,
    SelectionDialog, SelectionOutcome, SelectionRequest, SelectorList,
};
pub use expression::{Expression, ExpressionError};
pub use ordered::OrderedMultiSelect;
pub use registry::{standard_registry, standard_registry_with, ControlSpec, WidgetRegistry};
pub use template::{TemplateError, UrlTemplate};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WidgetId(pub Uuid);

impl WidgetId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WidgetValue {
    #[default]
    Empty,
    Single(ChoiceId),
    Multiple(Vec<ChoiceId>),
}

impl WidgetValue {
    pub fn single(id: impl Into<ChoiceId>) -> Self {
        Self::Single(id.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Single(_) => false,
            Self::Multiple(ids) => ids.is_empty(),
        }
    }

    pub fn as_single(&self) -> Option<&ChoiceId> {
        match self {
            Self::Single(id) => Some(id),
            _ => None,
        }
    }

    pub fn ids(&self) -> Vec<ChoiceId> {
        match self {
            Self::Empty => Vec::new(),
            Self::Single(id) => vec![id.clone()],
            Self::Multiple(ids) => ids.clone(),
        }
    }

    /// Text form used when feeding this value into a URL template tag.
    /// Empty values render as nothing so strict templates stay incomplete.
    pub fn render(&self) -> Option<String> {
        match self {
            Self::Empty => None,
            Self::Single(id) => Some(id.0.clone()),
            Self::Multiple(ids) if ids.is_empty() => None,
            Self::Multiple(ids) => {
                let raw: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
                serde_json::to_string(&raw).ok()
            }
        }
    }
}

impl From<Option<ChoiceId>> for WidgetValue {
    fn from(value: Option<ChoiceId>) -> Self {
        match value {
            Some(id) => Self::Single(id),
            None => Self::Empty,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WidgetEvent {
    ValueChanged {
        widget: WidgetId,
        value: WidgetValue,
    },
    ChoicesReloaded {
        widget: WidgetId,
        url: String,
    },
    FetchFailed {
        widget: WidgetId,
        error: FetchError,
    },
    SelectorAppended {
        widget: WidgetId,
    },
    SelectorRemoved {
        widget: WidgetId,
    },
}

#[derive(Debug, Error)]
pub enum WidgetError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error("invalid local value: {detail}")]
    InvalidValue { detail: String },
    #[error("invalid payload: {detail}")]
    InvalidPayload { detail: String },
    #[error("unknown widget kind: {0}")]
    UnknownKind(String),
    #[error("no chain member named {0}")]
    UnknownMember(String),
    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),
}

impl WidgetError {
    pub fn invalid_value(detail: impl Into<String>) -> Self {
        Self::InvalidValue {
            detail: detail.into(),
        }
    }

    pub fn invalid_payload(detail: impl Into<String>) -> Self {
        Self::InvalidPayload {
            detail: detail.into(),
        }
    }
}

/// The value/update/reload contract every control implements. Change
/// notifications are strict: storing an equal value emits nothing, a
/// differing value emits exactly one `ValueChanged`.
#[async_trait]
pub trait Widget: Send + Sync {
    fn id(&self) -> WidgetId;

    async fn value(&self) -> WidgetValue;

    async fn set_value(&self, value: WidgetValue) -> Result<(), WidgetError>;

    /// Apply externally-sourced partial state without a remote fetch.
    async fn update(&self, patch: UpdatePatch) -> Result<(), WidgetError>;

    /// Merge `params` into the widget's URL template and re-fetch remote
    /// choices. Widgets without a remote source treat this as a no-op.
    async fn reload(&self, params: &HashMap<String, String>) -> Result<(), WidgetError>;

    /// Template tag names this widget reads from the shared context.
    fn dependencies(&self) -> HashSet<String>;

    fn subscribe(&self) -> broadcast::Receiver<WidgetEvent>;
}

fn event_channel() -> broadcast::Sender<WidgetEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

#[cfg(test)]
mod tests;
