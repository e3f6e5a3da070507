//! Preset templates: named, parameterized `{subscriptions, layout, commands}`
//! bundles loaded once from embedded files, overlaid by anything stored
//! dynamically in the `layouts` KV bucket.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::client::BrokerClient;
use crate::error::SwitchboardError;
use crate::session::layout::PanelLayout;

const BUILTIN_PRESETS: &[&str] = &[
    include_str!("builtin/default.json"),
    include_str!("builtin/scriptsubs.json"),
];

pub const DEFAULT_PRESET_ID: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub commands: Vec<Value>,
    pub layout: Value,
}

fn substitute_string(template: &str, args: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i..].find('}') {
                let name = &template[i + 1..i + end];
                let replacement = args.get(name).map(String::as_str).unwrap_or("*");
                out.push_str(replacement);
                i += end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn substitute_value(value: &Value, args: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, args)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute_value(v, args)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, args)))
                .collect(),
        ),
        other => other.clone(),
    }
}

impl Preset {
    pub fn parse(raw: &str) -> Result<Self, SwitchboardError> {
        serde_json::from_str(raw)
            .map_err(|e| SwitchboardError::Validation(format!("invalid preset file: {e}")))
    }

    /// `{param}` → `args[param]`, or `"*"` for an unsupplied one. Structural
    /// substitution over the parsed value tree, not string replacement on
    /// the serialized JSON.
    pub fn build(&self, args: &BTreeMap<String, String>) -> Result<PanelLayout, SwitchboardError> {
        let substituted = substitute_value(&self.layout, args);
        let layout: PanelLayout = serde_json::from_value(substituted).map_err(|e| {
            SwitchboardError::Validation(format!("preset '{}' layout invalid: {e}", self.id))
        })?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn expand_subscriptions(&self, args: &BTreeMap<String, String>) -> Vec<String> {
        self.subscriptions
            .iter()
            .map(|s| substitute_string(s, args))
            .collect()
    }
}

/// Builtin presets loaded once at startup, overlaid by whatever the
/// `layouts` KV bucket holds for the same id.
pub struct PresetRegistry {
    builtin: HashMap<String, Preset>,
    broker: Option<BrokerClient>,
}

impl PresetRegistry {
    pub fn load_builtin() -> Result<Self, SwitchboardError> {
        let mut builtin = HashMap::new();
        for raw in BUILTIN_PRESETS {
            let preset = Preset::parse(raw)?;
            builtin.insert(preset.id.clone(), preset);
        }
        Ok(Self {
            builtin,
            broker: None,
        })
    }

    pub fn with_broker(mut self, broker: BrokerClient) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.builtin.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, id: &str) -> Result<Preset, SwitchboardError> {
        if let Some(broker) = &self.broker {
            let kv = broker
                .layouts_kv()
                .await
                .map_err(SwitchboardError::BrokerTransient)?;
            if let Some(bytes) = kv
                .get(id)
                .await
                .map_err(|e| SwitchboardError::BrokerTransient(e.into()))?
            {
                return Preset::parse(std::str::from_utf8(&bytes).map_err(|e| {
                    SwitchboardError::Validation(format!("layouts/{id} is not utf-8: {e}"))
                })?);
            }
        }
        self.builtin
            .get(id)
            .cloned()
            .ok_or_else(|| SwitchboardError::NotFound(format!("preset '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_presets_parse() {
        let reg = PresetRegistry::load_builtin().unwrap();
        assert_eq!(reg.ids(), vec!["default", "scriptsubs"]);
    }

    #[test]
    fn missing_param_substitutes_wildcard() {
        let reg = PresetRegistry::load_builtin().unwrap();
        let preset = reg.builtin.get("scriptsubs").unwrap();
        let args = BTreeMap::new();
        let subs = preset.expand_subscriptions(&args);
        assert!(subs.iter().all(|s| s.contains(".*.job.*.")));
    }

    #[test]
    fn substitution_fills_supplied_params() {
        let reg = PresetRegistry::load_builtin().unwrap();
        let preset = reg.builtin.get("scriptsubs").unwrap();
        let mut args = BTreeMap::new();
        args.insert("script".to_string(), "foo".to_string());
        args.insert("job".to_string(), "42".to_string());
        let subs = preset.expand_subscriptions(&args);
        assert!(subs.contains(&"event.script.foo.job.42.started".to_string()));
        assert!(subs.contains(&"event.script.foo.job.42.exit".to_string()));
    }

    #[test]
    fn build_produces_valid_layout_matching_scenario_d() {
        let reg = PresetRegistry::load_builtin().unwrap();
        let preset = reg.builtin.get("scriptsubs").unwrap();
        let mut args = BTreeMap::new();
        args.insert("script".to_string(), "foo".to_string());
        args.insert("job".to_string(), "42".to_string());
        let layout = preset.build(&args).unwrap();
        let subs = layout.required_subscriptions("S");
        assert!(subs.contains(&"event.script.foo.job.42.started".to_string()));
        assert!(subs.contains(&"event.script.foo.job.42.stdout".to_string()));
        assert!(subs.contains(&"event.script.foo.job.42.stderr".to_string()));
        assert!(subs.contains(&"event.script.foo.job.42.exit".to_string()));
    }

    #[test]
    fn default_preset_builds_empty_layout_with_terminal() {
        let reg = PresetRegistry::load_builtin().unwrap();
        let preset = reg.builtin.get("default").unwrap();
        let layout = preset.build(&BTreeMap::new()).unwrap();
        assert!(layout.panels.contains_key("main"));
    }

    #[test]
    fn unknown_preset_is_not_found() {
        let reg = PresetRegistry::load_builtin().unwrap();
        assert!(reg.builtin.get("nope").is_none());
    }
}
