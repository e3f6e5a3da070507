//! `PanelLayout` / `LayoutNode` — the tree a session's UI is built from,
//! plus the deterministic walk that derives a session's required
//! subscription set.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SwitchboardError;

pub const PANEL_NAMES: [&str; 4] = ["left", "main", "right", "bottom"];

pub fn validate_panel_name(name: &str) -> Result<(), SwitchboardError> {
    if PANEL_NAMES.contains(&name) {
        Ok(())
    } else {
        Err(SwitchboardError::Validation(format!(
            "panel '{name}' not in {PANEL_NAMES:?}"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitAxis {
    Horizontal,
    Vertical,
}

impl SplitAxis {
    fn as_str(self) -> &'static str {
        match self {
            SplitAxis::Horizontal => "horizontal",
            SplitAxis::Vertical => "vertical",
        }
    }

    fn parse(s: &str) -> Result<Self, SwitchboardError> {
        match s {
            "horizontal" => Ok(SplitAxis::Horizontal),
            "vertical" => Ok(SplitAxis::Vertical),
            other => Err(SwitchboardError::Validation(format!(
                "split axis must be horizontal or vertical, got '{other}'"
            ))),
        }
    }
}

/// The enumerated fraction set a binary split's `at` may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fraction {
    Half,
    OneThird,
    TwoThirds,
    OneQuarter,
    ThreeQuarters,
}

impl Fraction {
    fn as_str(self) -> &'static str {
        match self {
            Fraction::Half => "1/2",
            Fraction::OneThird => "1/3",
            Fraction::TwoThirds => "2/3",
            Fraction::OneQuarter => "1/4",
            Fraction::ThreeQuarters => "3/4",
        }
    }

    fn parse(s: &str) -> Result<Self, SwitchboardError> {
        match s {
            "1/2" => Ok(Fraction::Half),
            "1/3" => Ok(Fraction::OneThird),
            "2/3" => Ok(Fraction::TwoThirds),
            "1/4" => Ok(Fraction::OneQuarter),
            "3/4" => Ok(Fraction::ThreeQuarters),
            other => Err(SwitchboardError::Validation(format!(
                "'at' must be one of 1/2, 1/3, 2/3, 1/4, 3/4, got '{other}'"
            ))),
        }
    }
}

/// Exactly one variant is populated per node; the invariant that the other
/// variants' fields are empty is structural — there is nowhere to put
/// them once constructed as this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutNode {
    Leaf {
        subscription: String,
    },
    Document {
        document_paths: Vec<String>,
    },
    Component {
        component: String,
    },
    Command {
        command: String,
        script: Option<String>,
        defaults: BTreeMap<String, Value>,
    },
    Split {
        split: SplitAxis,
        at: Fraction,
        first: Box<LayoutNode>,
        second: Box<LayoutNode>,
    },
    EvenSplit {
        n: usize,
        direction: SplitAxis,
        items: Vec<LayoutNode>,
    },
}

impl LayoutNode {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        match self {
            LayoutNode::Leaf { subscription } => {
                if subscription.is_empty() {
                    return Err(SwitchboardError::Validation(
                        "leaf node subscription must be non-empty".into(),
                    ));
                }
                Ok(())
            }
            LayoutNode::Document { document_paths } => {
                if document_paths.is_empty() {
                    return Err(SwitchboardError::Validation(
                        "document node requires at least one path".into(),
                    ));
                }
                Ok(())
            }
            LayoutNode::Component { component } => {
                if component.is_empty() {
                    return Err(SwitchboardError::Validation(
                        "component node requires an identifier".into(),
                    ));
                }
                Ok(())
            }
            LayoutNode::Command { command, script, .. } => {
                if command.is_empty() {
                    return Err(SwitchboardError::Validation(
                        "command node requires a message-type tag".into(),
                    ));
                }
                if command == "ScriptRunCommand" && script.is_none() {
                    return Err(SwitchboardError::Validation(
                        "ScriptRunCommand node requires 'script'".into(),
                    ));
                }
                Ok(())
            }
            LayoutNode::Split { first, second, .. } => {
                first.validate()?;
                second.validate()
            }
            LayoutNode::EvenSplit { n, items, .. } => {
                if !(2..=5).contains(n) {
                    return Err(SwitchboardError::Validation(format!(
                        "even split N must be in 2..=5, got {n}"
                    )));
                }
                if items.len() != *n {
                    return Err(SwitchboardError::Validation(format!(
                        "even-{n} split requires exactly {n} items, got {}",
                        items.len()
                    )));
                }
                for item in items {
                    item.validate()?;
                }
                Ok(())
            }
        }
    }

    /// Subjects this node (and its descendants) contribute to the required
    /// subscription set. `component == "terminal"` is the one variant whose
    /// contribution depends on the session id rather than the node alone.
    fn collect_subscriptions(&self, session_id: &str, out: &mut Vec<String>) {
        match self {
            LayoutNode::Leaf { subscription } => out.push(subscription.clone()),
            LayoutNode::Component { component } if component == "terminal" => {
                out.push(crate::bus::event_terminal_freeze(session_id));
            }
            LayoutNode::Component { .. }
            | LayoutNode::Document { .. }
            | LayoutNode::Command { .. } => {}
            LayoutNode::Split { first, second, .. } => {
                first.collect_subscriptions(session_id, out);
                second.collect_subscriptions(session_id, out);
            }
            LayoutNode::EvenSplit { items, .. } => {
                for item in items {
                    item.collect_subscriptions(session_id, out);
                }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        match self {
            LayoutNode::Leaf { subscription } => {
                map.insert("subscription".into(), Value::String(subscription.clone()));
            }
            LayoutNode::Document { document_paths } => {
                map.insert(
                    "document_paths".into(),
                    Value::Array(
                        document_paths
                            .iter()
                            .map(|p| Value::String(p.clone()))
                            .collect(),
                    ),
                );
            }
            LayoutNode::Component { component } => {
                map.insert("component".into(), Value::String(component.clone()));
            }
            LayoutNode::Command {
                command,
                script,
                defaults,
            } => {
                map.insert("command".into(), Value::String(command.clone()));
                if let Some(script) = script {
                    map.insert("script".into(), Value::String(script.clone()));
                }
                if !defaults.is_empty() {
                    map.insert(
                        "defaults".into(),
                        Value::Object(defaults.clone().into_iter().collect()),
                    );
                }
            }
            LayoutNode::Split {
                split,
                at,
                first,
                second,
            } => {
                map.insert("split".into(), Value::String(split.as_str().to_string()));
                map.insert("at".into(), Value::String(at.as_str().to_string()));
                map.insert("first".into(), first.to_value());
                map.insert("second".into(), second.to_value());
            }
            LayoutNode::EvenSplit {
                n,
                direction,
                items,
            } => {
                map.insert("split".into(), Value::String(format!("even-{n}")));
                map.insert(
                    "direction".into(),
                    Value::String(direction.as_str().to_string()),
                );
                map.insert(
                    "items".into(),
                    Value::Array(items.iter().map(LayoutNode::to_value).collect()),
                );
            }
        }
        Value::Object(map)
    }

    pub fn from_value(v: &Value) -> Result<Self, SwitchboardError> {
        let obj = v
            .as_object()
            .ok_or_else(|| SwitchboardError::Validation("layout node must be an object".into()))?;

        const DISCRIMINATING_KEYS: [&str; 5] =
            ["split", "subscription", "document_paths", "command", "component"];
        let present: Vec<&str> = DISCRIMINATING_KEYS
            .iter()
            .filter(|key| obj.contains_key(**key))
            .copied()
            .collect();
        if present.len() != 1 {
            return Err(SwitchboardError::Validation(format!(
                "layout node must match exactly one variant, found {present:?}"
            )));
        }

        if let Some(split) = obj.get("split").and_then(Value::as_str) {
            if let Some(n_str) = split.strip_prefix("even-") {
                let n: usize = n_str.parse().map_err(|_| {
                    SwitchboardError::Validation(format!("invalid even split tag '{split}'"))
                })?;
                let direction = SplitAxis::parse(
                    obj.get("direction")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            SwitchboardError::Validation("even split requires 'direction'".into())
                        })?,
                )?;
                let items: Vec<LayoutNode> = obj
                    .get("items")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SwitchboardError::Validation("even split requires 'items'".into())
                    })?
                    .iter()
                    .map(LayoutNode::from_value)
                    .collect::<Result<_, _>>()?;
                let node = LayoutNode::EvenSplit { n, direction, items };
                node.validate()?;
                return Ok(node);
            }
            let axis = SplitAxis::parse(split)?;
            let at = Fraction::parse(obj.get("at").and_then(Value::as_str).ok_or_else(|| {
                SwitchboardError::Validation("binary split requires 'at'".into())
            })?)?;
            let first = Box::new(LayoutNode::from_value(obj.get("first").ok_or_else(
                || SwitchboardError::Validation("binary split requires 'first'".into()),
            )?)?);
            let second = Box::new(LayoutNode::from_value(obj.get("second").ok_or_else(
                || SwitchboardError::Validation("binary split requires 'second'".into()),
            )?)?);
            let node = LayoutNode::Split {
                split: axis,
                at,
                first,
                second,
            };
            node.validate()?;
            return Ok(node);
        }

        if let Some(subscription) = obj.get("subscription").and_then(Value::as_str) {
            let node = LayoutNode::Leaf {
                subscription: subscription.to_string(),
            };
            node.validate()?;
            return Ok(node);
        }

        if let Some(paths) = obj.get("document_paths").and_then(Value::as_array) {
            let document_paths = paths
                .iter()
                .map(|p| {
                    p.as_str().map(str::to_string).ok_or_else(|| {
                        SwitchboardError::Validation("document_paths entries must be strings".into())
                    })
                })
                .collect::<Result<_, _>>()?;
            let node = LayoutNode::Document { document_paths };
            node.validate()?;
            return Ok(node);
        }

        if let Some(command) = obj.get("command").and_then(Value::as_str) {
            let script = obj
                .get("script")
                .and_then(Value::as_str)
                .map(str::to_string);
            let defaults = obj
                .get("defaults")
                .and_then(Value::as_object)
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default();
            let node = LayoutNode::Command {
                command: command.to_string(),
                script,
                defaults,
            };
            node.validate()?;
            return Ok(node);
        }

        if let Some(component) = obj.get("component").and_then(Value::as_str) {
            let node = LayoutNode::Component {
                component: component.to_string(),
            };
            node.validate()?;
            return Ok(node);
        }

        Err(SwitchboardError::Validation(
            "layout node matches no known variant".into(),
        ))
    }
}

impl Serialize for LayoutNode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LayoutNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        LayoutNode::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PanelLayout {
    #[serde(flatten)]
    pub panels: BTreeMap<String, LayoutNode>,
}

impl PanelLayout {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        for (panel, node) in &self.panels {
            validate_panel_name(panel)?;
            node.validate()?;
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.panels
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }

    /// Deduplicated, lexicographically sorted subjects gathered by walking
    /// every panel's node tree; `component == "terminal"` leaves additionally
    /// depend on `session_id`.
    pub fn required_subscriptions(&self, session_id: &str) -> Vec<String> {
        let mut subs = Vec::new();
        for node in self.panels.values() {
            node.collect_subscriptions(session_id, &mut subs);
        }
        subs.sort();
        subs.dedup();
        subs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips() {
        let node = LayoutNode::Leaf {
            subscription: "event.orders.*".into(),
        };
        let value = node.to_value();
        let parsed = LayoutNode::from_value(&value).unwrap();
        assert_eq!(node, parsed);
    }

    #[test]
    fn binary_split_round_trips() {
        let node = LayoutNode::Split {
            split: SplitAxis::Horizontal,
            at: Fraction::OneThird,
            first: Box::new(LayoutNode::Component {
                component: "terminal".into(),
            }),
            second: Box::new(LayoutNode::Leaf {
                subscription: "event.orders.*".into(),
            }),
        };
        let parsed = LayoutNode::from_value(&node.to_value()).unwrap();
        assert_eq!(node, parsed);
    }

    #[test]
    fn even_split_requires_matching_item_count() {
        let bad = serde_json::json!({
            "split": "even-3",
            "direction": "vertical",
            "items": [
                {"component": "terminal"},
                {"component": "terminal"},
            ]
        });
        assert!(LayoutNode::from_value(&bad).is_err());
    }

    #[test]
    fn even_split_n_out_of_range_rejected() {
        let bad = serde_json::json!({
            "split": "even-6",
            "direction": "vertical",
            "items": (0..6).map(|_| serde_json::json!({"component": "terminal"})).collect::<Vec<_>>(),
        });
        assert!(LayoutNode::from_value(&bad).is_err());
    }

    #[test]
    fn script_run_command_requires_script_field() {
        let bad = serde_json::json!({"command": "ScriptRunCommand"});
        assert!(LayoutNode::from_value(&bad).is_err());

        let good = serde_json::json!({"command": "ScriptRunCommand", "script": "foo"});
        assert!(LayoutNode::from_value(&good).is_ok());
    }

    #[test]
    fn required_subscriptions_sorted_deduplicated() {
        let mut panels = BTreeMap::new();
        panels.insert(
            "left".into(),
            LayoutNode::Leaf {
                subscription: "event.b".into(),
            },
        );
        panels.insert(
            "main".into(),
            LayoutNode::Split {
                split: SplitAxis::Vertical,
                at: Fraction::Half,
                first: Box::new(LayoutNode::Leaf {
                    subscription: "event.a".into(),
                }),
                second: Box::new(LayoutNode::Leaf {
                    subscription: "event.b".into(),
                }),
            },
        );
        let layout = PanelLayout { panels };
        let subs = layout.required_subscriptions("S");
        assert_eq!(subs, vec!["event.a".to_string(), "event.b".to_string()]);
    }

    #[test]
    fn terminal_component_depends_on_session_id() {
        let mut panels = BTreeMap::new();
        panels.insert(
            "main".into(),
            LayoutNode::Component {
                component: "terminal".into(),
            },
        );
        let layout = PanelLayout { panels };
        assert_eq!(
            layout.required_subscriptions("abc"),
            vec!["event.terminal.session.abc.freeze".to_string()]
        );
        assert_eq!(
            layout.required_subscriptions("xyz"),
            vec!["event.terminal.session.xyz.freeze".to_string()]
        );
    }

    #[test]
    fn invalid_panel_name_rejected() {
        let mut panels = BTreeMap::new();
        panels.insert(
            "center".into(),
            LayoutNode::Component {
                component: "terminal".into(),
            },
        );
        let layout = PanelLayout { panels };
        assert!(layout.validate().is_err());
    }
}
