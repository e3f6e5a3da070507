//! Language adapters: the `init`/`detect`/`run`/codegen conventions for
//! each supported script language. Adding a language means adding one
//! `ScriptAdapter` impl, not touching the runner.

use std::path::Path;

use crate::bus::messages::ScriptType;

pub trait ScriptAdapter: Send + Sync {
    fn script_type(&self) -> ScriptType;

    /// Canonical entrypoint filename used for language detection.
    fn entrypoint_filename(&self) -> &'static str;

    /// Project scaffolding command, run inside the new script directory.
    fn init_command(&self) -> (&'static str, &'static [&'static str]);

    /// Command and argv used to run the script against a staged input
    /// file; callers append the input path themselves.
    fn run_command(&self) -> (&'static str, Vec<String>);

    /// Schema-to-type codegen command for one schema file, or `None` if
    /// this language has no codegen step. `out_dir` is `<script-dir>/types`.
    fn codegen_command(&self, schema_path: &Path, out_dir: &Path) -> Option<(String, Vec<String>)>;
}

pub struct PythonAdapter;

impl ScriptAdapter for PythonAdapter {
    fn script_type(&self) -> ScriptType {
        ScriptType::Python
    }

    fn entrypoint_filename(&self) -> &'static str {
        "main.py"
    }

    fn init_command(&self) -> (&'static str, &'static [&'static str]) {
        ("uv", &["init"])
    }

    fn run_command(&self) -> (&'static str, Vec<String>) {
        ("uv", vec!["run".to_string(), "python".to_string(), "main.py".to_string()])
    }

    fn codegen_command(&self, schema_path: &Path, out_dir: &Path) -> Option<(String, Vec<String>)> {
        Some((
            "datamodel-codegen".to_string(),
            vec![
                "--input".to_string(),
                schema_path.display().to_string(),
                "--output".to_string(),
                out_dir.display().to_string(),
            ],
        ))
    }
}

pub struct TypescriptAdapter;

impl ScriptAdapter for TypescriptAdapter {
    fn script_type(&self) -> ScriptType {
        ScriptType::Typescript
    }

    fn entrypoint_filename(&self) -> &'static str {
        "index.ts"
    }

    fn init_command(&self) -> (&'static str, &'static [&'static str]) {
        ("bun", &["init", "-y"])
    }

    fn run_command(&self) -> (&'static str, Vec<String>) {
        ("bun", vec!["run".to_string(), "index.ts".to_string()])
    }

    fn codegen_command(&self, schema_path: &Path, out_dir: &Path) -> Option<(String, Vec<String>)> {
        Some((
            "json-schema-to-typescript".to_string(),
            vec![
                schema_path.display().to_string(),
                "-o".to_string(),
                out_dir.display().to_string(),
            ],
        ))
    }
}

pub fn adapter_for(script_type: ScriptType) -> Box<dyn ScriptAdapter> {
    match script_type {
        ScriptType::Python => Box::new(PythonAdapter),
        ScriptType::Typescript => Box::new(TypescriptAdapter),
    }
}

/// Detect a script directory's language by canonical entrypoint presence.
pub fn detect_language(dir: &Path) -> Option<ScriptType> {
    if dir.join(PythonAdapter.entrypoint_filename()).is_file() {
        Some(ScriptType::Python)
    } else if dir.join(TypescriptAdapter.entrypoint_filename()).is_file() {
        Some(ScriptType::Typescript)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_language_prefers_python_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some(ScriptType::Python));
    }

    #[test]
    fn detect_language_finds_typescript_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.ts"), "").unwrap();
        assert_eq!(detect_language(dir.path()), Some(ScriptType::Typescript));
    }

    #[test]
    fn detect_language_none_when_no_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_language(dir.path()), None);
    }
}
