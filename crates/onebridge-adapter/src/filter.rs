//! Admission filter for inbound message and notice events.
//!
//! Rules are read from a TOML file at construction time and evaluated in file
//! order; the first rule whose conditions all match decides. An event no rule
//! matches is dropped.
//!
//! ```toml
//! [[rule]]
//! action = "drop"
//! user_ids = [10000]
//!
//! [[rule]]
//! action = "accept"
//! post_type = "message"
//! message_type = "group"
//! group_ids = [100, 200]
//! text_pattern = "^/"
//! ```

use onebridge_types::error::{BridgeError, BridgeResult};
use onebridge_wire::event::WireEvent;
use regex_lite::Regex;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

/// Decides whether an inbound event is translated and dispatched.
///
/// Implementations must be pure: the same event always yields the same answer.
pub trait EventFilter: Send + Sync {
    fn should_handle(&self, event: &WireEvent) -> bool;
}

/// Filter used when no rule file is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EventFilter for AcceptAll {
    fn should_handle(&self, _event: &WireEvent) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Drop,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    action: RuleAction,
    post_type: Option<String>,
    message_type: Option<String>,
    notice_type: Option<String>,
    #[serde(default)]
    self_ids: Vec<i64>,
    #[serde(default)]
    group_ids: Vec<i64>,
    #[serde(default)]
    user_ids: Vec<i64>,
    text_pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
}

#[derive(Debug)]
struct Rule {
    action: RuleAction,
    post_type: Option<String>,
    message_type: Option<String>,
    notice_type: Option<String>,
    self_ids: Vec<i64>,
    group_ids: Vec<i64>,
    user_ids: Vec<i64>,
    text_pattern: Option<Regex>,
}

/// The fields of an event that rules can inspect.
struct Facts<'a> {
    post_type: &'static str,
    self_id: i64,
    message_type: Option<&'a str>,
    notice_type: Option<&'a str>,
    group_id: Option<i64>,
    user_id: Option<i64>,
    text: Option<String>,
}

impl<'a> Facts<'a> {
    fn of(event: &'a WireEvent) -> Self {
        let mut facts = Facts {
            post_type: event.post_type(),
            self_id: event.self_id(),
            message_type: None,
            notice_type: None,
            group_id: None,
            user_id: None,
            text: None,
        };
        match event {
            WireEvent::Message(m) => {
                facts.message_type = Some(m.message_type.as_str());
                facts.group_id = m.group_id;
                facts.user_id = m.user_id;
                facts.text = Some(
                    m.segments
                        .iter()
                        .filter(|s| s.kind == "text")
                        .filter_map(|s| s.data_str("text"))
                        .collect(),
                );
            }
            WireEvent::Notice(n) => {
                facts.notice_type = Some(n.notice_type.as_str());
                facts.group_id = n.group_id;
                facts.user_id = n.user_id;
            }
            _ => {}
        }
        facts
    }
}

fn matches_id(allowed: &[i64], actual: Option<i64>) -> bool {
    allowed.is_empty() || actual.is_some_and(|id| allowed.contains(&id))
}

fn matches_str(expected: &Option<String>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(e) => actual == Some(e.as_str()),
    }
}

impl Rule {
    fn compile(raw: RawRule, index: usize) -> BridgeResult<Self> {
        let text_pattern = raw
            .text_pattern
            .map(|p| {
                Regex::new(&p).map_err(|e| {
                    BridgeError::Filter(format!("rule {index}: invalid text_pattern '{p}': {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            action: raw.action,
            post_type: raw.post_type,
            message_type: raw.message_type,
            notice_type: raw.notice_type,
            self_ids: raw.self_ids,
            group_ids: raw.group_ids,
            user_ids: raw.user_ids,
            text_pattern,
        })
    }

    fn matches(&self, facts: &Facts<'_>) -> bool {
        matches_str(&self.post_type, Some(facts.post_type))
            && matches_str(&self.message_type, facts.message_type)
            && matches_str(&self.notice_type, facts.notice_type)
            && matches_id(&self.self_ids, Some(facts.self_id))
            && matches_id(&self.group_ids, facts.group_id)
            && matches_id(&self.user_ids, facts.user_id)
            && match (&self.text_pattern, &facts.text) {
                (None, _) => true,
                (Some(re), Some(text)) => re.is_match(text),
                (Some(_), None) => false,
            }
    }
}

/// Rule-file driven filter.
#[derive(Debug)]
pub struct RuleFilter {
    rules: Vec<Rule>,
}

impl RuleFilter {
    /// Parse rules from TOML text. Fails on malformed TOML or regexes.
    pub fn from_toml(text: &str) -> BridgeResult<Self> {
        let file: RuleFile =
            toml::from_str(text).map_err(|e| BridgeError::Filter(e.to_string()))?;
        let rules = file
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, raw)| Rule::compile(raw, i))
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Load rules from a file.
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Filter(format!("cannot read {}: {e}", path.display()))
        })?;
        let filter = Self::from_toml(&text)?;
        info!(path = %path.display(), rules = filter.rules.len(), "Loaded event filter rules");
        Ok(filter)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl EventFilter for RuleFilter {
    fn should_handle(&self, event: &WireEvent) -> bool {
        let facts = Facts::of(event);
        match self.rules.iter().position(|r| r.matches(&facts)) {
            Some(i) => self.rules[i].action == RuleAction::Accept,
            None => {
                debug!(
                    post_type = facts.post_type,
                    self_id = facts.self_id,
                    "No filter rule matched, dropping event"
                );
                false
            }
        }
    }
}
