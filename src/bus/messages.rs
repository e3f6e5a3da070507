//! Typed command/event payloads and the validation every publisher runs
//! before handing a message to the broker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SwitchboardError;
use crate::session::layout::LayoutNode;

fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Python,
    Typescript,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptCreateCommand {
    pub script_name: String,
    pub script_type: ScriptType,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl ScriptCreateCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if !valid_identifier(&self.script_name) {
            return Err(SwitchboardError::Validation(format!(
                "script_name '{}' must match [A-Za-z0-9_-]+",
                self.script_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptRunCommand {
    pub script_name: String,
    #[serde(default = "default_input")]
    pub input: Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_input() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ScriptRunCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if !valid_identifier(&self.script_name) {
            return Err(SwitchboardError::Validation(format!(
                "script_name '{}' must match [A-Za-z0-9_-]+",
                self.script_name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresetApplyMode {
    ReplaceAll,
    Merge,
    PanelOnly,
}

impl Default for PresetApplyMode {
    fn default() -> Self {
        PresetApplyMode::Merge
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PanelSetCommand {
    pub session_id: String,
    pub panel: String,
    pub node: LayoutNode,
}

impl PanelSetCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if self.session_id.is_empty() {
            return Err(SwitchboardError::Validation("session_id is empty".into()));
        }
        crate::session::layout::validate_panel_name(&self.panel)?;
        self.node.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PresetApplyCommand {
    pub session_id: String,
    pub preset_id: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub panel: Option<String>,
    #[serde(default)]
    pub mode: PresetApplyMode,
}

impl PresetApplyCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if self.session_id.is_empty() {
            return Err(SwitchboardError::Validation("session_id is empty".into()));
        }
        if self.mode == PresetApplyMode::PanelOnly && self.panel.is_none() {
            return Err(SwitchboardError::Validation(
                "panel-only mode requires panel".into(),
            ));
        }
        if let Some(panel) = &self.panel {
            crate::session::layout::validate_panel_name(panel)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Merge,
    Jsonpatch,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LayoutPatchCommand {
    pub session_id: String,
    pub patch: Value,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
}

impl LayoutPatchCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if self.session_id.is_empty() {
            return Err(SwitchboardError::Validation("session_id is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalCommand {
    pub session_id: String,
    pub cmd: String,
}

impl TerminalCommand {
    pub fn validate(&self) -> Result<(), SwitchboardError> {
        if self.session_id.is_empty() {
            return Err(SwitchboardError::Validation("session_id is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_create_rejects_bad_name() {
        let cmd = ScriptCreateCommand {
            script_name: "bad name!".into(),
            script_type: ScriptType::Python,
            correlation_id: None,
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn script_create_accepts_identifier() {
        let cmd = ScriptCreateCommand {
            script_name: "foo-bar_2".into(),
            script_type: ScriptType::Typescript,
            correlation_id: Some("c1".into()),
        };
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn preset_apply_panel_only_requires_panel() {
        let cmd = PresetApplyCommand {
            session_id: "s".into(),
            preset_id: "default".into(),
            args: BTreeMap::new(),
            panel: None,
            mode: PresetApplyMode::PanelOnly,
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn run_command_defaults_input_to_empty_object() {
        let cmd: ScriptRunCommand =
            serde_json::from_str(r#"{"script_name":"foo"}"#).unwrap();
        assert_eq!(cmd.input, Value::Object(serde_json::Map::new()));
    }
}
