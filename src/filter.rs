//! Event filter and classifier.
//!
//! Filter rules are a small predicate tree evaluated against a typed
//! [`ChangeEvent`]. Classification is pure: the same event always maps to
//! the same target set, so redelivered events are classified identically.
//!
//! ```json
//! { "type": "all", "rules": [
//!     { "type": "field_equals", "field": "change_kind", "value": "INSERT" },
//!     { "type": "field_equals", "field": "entity_type", "value": "EMAIL" },
//!     { "type": "field_prefix", "field": "new_image.aiInsights.category", "prefix": "Fin" }
//! ] }
//! ```

use crate::config::FanoutConfig;
use crate::event::{lookup_path, ChangeEvent, ChangeKind, ENTITY_EMAIL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;

/// Name of a downstream delivery target.
pub type TargetName = String;

pub const TARGET_TTS: &str = "tts";
pub const TARGET_NOTIFICATIONS: &str = "notifications";

const NEW_IMAGE_PREFIX: &str = "new_image.";

/// Field a rule inspects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventField {
    ChangeKind,
    EntityType,
    Tenant,
    PartitionKey,
    SortKey,
    /// Dotted path into the after image.
    NewImage(String),
}

impl EventField {
    fn extract<'a>(&self, event: &'a ChangeEvent) -> Option<Cow<'a, str>> {
        match self {
            EventField::ChangeKind => Some(Cow::Borrowed(event.change_kind.as_str())),
            EventField::EntityType => Some(Cow::Borrowed(event.entity_type.as_str())),
            EventField::Tenant => Some(Cow::Borrowed(event.tenant.as_str())),
            EventField::PartitionKey => Some(Cow::Borrowed(event.key.partition_key.as_str())),
            EventField::SortKey => Some(Cow::Borrowed(event.key.sort_key.as_str())),
            EventField::NewImage(path) => event
                .after_image
                .as_ref()
                .and_then(|img| lookup_path(img, path))
                .and_then(scalar_text),
        }
    }
}

/// Scalars compare by their textual form; objects, arrays and null never match.
fn scalar_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        _ => None,
    }
}

impl TryFrom<String> for EventField {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "change_kind" => Ok(EventField::ChangeKind),
            "entity_type" => Ok(EventField::EntityType),
            "tenant" => Ok(EventField::Tenant),
            "partition_key" => Ok(EventField::PartitionKey),
            "sort_key" => Ok(EventField::SortKey),
            other => match other.strip_prefix(NEW_IMAGE_PREFIX) {
                Some(path) if !path.is_empty() => Ok(EventField::NewImage(path.to_string())),
                _ => Err(format!("unknown filter field: {}", other)),
            },
        }
    }
}

impl From<EventField> for String {
    fn from(field: EventField) -> Self {
        field.to_string()
    }
}

impl fmt::Display for EventField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventField::ChangeKind => f.write_str("change_kind"),
            EventField::EntityType => f.write_str("entity_type"),
            EventField::Tenant => f.write_str("tenant"),
            EventField::PartitionKey => f.write_str("partition_key"),
            EventField::SortKey => f.write_str("sort_key"),
            EventField::NewImage(path) => write!(f, "{}{}", NEW_IMAGE_PREFIX, path),
        }
    }
}

/// Predicate tree over change events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterRule {
    FieldEquals { field: EventField, value: String },
    FieldPrefix { field: EventField, prefix: String },
    /// Boolean AND. An empty list matches everything.
    All { rules: Vec<FilterRule> },
}

impl FilterRule {
    pub fn field_equals(field: EventField, value: impl Into<String>) -> Self {
        FilterRule::FieldEquals {
            field,
            value: value.into(),
        }
    }

    pub fn field_prefix(field: EventField, prefix: impl Into<String>) -> Self {
        FilterRule::FieldPrefix {
            field,
            prefix: prefix.into(),
        }
    }

    pub fn all(rules: Vec<FilterRule>) -> Self {
        FilterRule::All { rules }
    }

    /// INSERT of an EMAIL record, optionally restricted to one tenant.
    pub fn new_email(tenant: Option<&str>) -> Self {
        let mut rules = vec![
            Self::field_equals(EventField::ChangeKind, ChangeKind::Insert.as_str()),
            Self::field_equals(EventField::EntityType, ENTITY_EMAIL),
        ];
        if let Some(tenant) = tenant {
            rules.push(Self::field_equals(EventField::Tenant, tenant));
        }
        Self::all(rules)
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            FilterRule::FieldEquals { field, value } => {
                field.extract(event).is_some_and(|v| v == value.as_str())
            }
            FilterRule::FieldPrefix { field, prefix } => field
                .extract(event)
                .is_some_and(|v| v.starts_with(prefix.as_str())),
            FilterRule::All { rules } => rules.iter().all(|rule| rule.matches(event)),
        }
    }
}

/// Maps events to the set of targets that want them.
#[derive(Debug, Clone)]
pub struct Classifier {
    routes: Vec<(TargetName, FilterRule)>,
}

impl Classifier {
    pub fn new(routes: Vec<(TargetName, FilterRule)>) -> Self {
        Self { routes }
    }

    /// The new-email rule for every listed target.
    pub fn default_routes(targets: &[&str], current_tenant: Option<&str>) -> Self {
        Self::new(
            targets
                .iter()
                .map(|t| (t.to_string(), FilterRule::new_email(current_tenant)))
                .collect(),
        )
    }

    /// Configured routes, or defaults for the enabled targets.
    pub fn from_config(config: &FanoutConfig) -> Self {
        if !config.routes.is_empty() {
            return Self::new(
                config
                    .routes
                    .iter()
                    .map(|r| (r.target.clone(), r.rule.clone()))
                    .collect(),
            );
        }

        let mut targets = Vec::new();
        if config.tts.enabled {
            targets.push(TARGET_TTS);
        }
        if config.notifications.enabled {
            targets.push(TARGET_NOTIFICATIONS);
        }
        Self::default_routes(&targets, config.current_tenant.as_deref())
    }

    /// Targets that should receive `event`. Empty means filtered out.
    pub fn classify(&self, event: &ChangeEvent) -> BTreeSet<TargetName> {
        self.routes
            .iter()
            .filter(|(_, rule)| rule.matches(event))
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(t, _)| t.as_str())
    }

    pub fn rule_for(&self, target: &str) -> Option<&FilterRule> {
        self.routes
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, rule)| rule)
    }
}
