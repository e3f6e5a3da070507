//! Renderer Registry — turns a bus message into an HTML fragment addressed
//! at a DOM selector. Renderers are the only component allowed to write to
//! an SSE sink; the registry itself never touches the sink.

use serde_json::Value;

use crate::bus::matches;

/// Merge strategy the browser applies when it receives a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Replace,
    Append,
}

/// Opaque HTML bytes targeted at one DOM selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub selector: String,
    pub strategy: MergeStrategy,
    pub html: String,
}

impl Fragment {
    pub fn replace(selector: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            strategy: MergeStrategy::Replace,
            html: html.into(),
        }
    }

    pub fn append(selector: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            strategy: MergeStrategy::Append,
            html: html.into(),
        }
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Derive the fallback renderer's DOM id from a concrete subject:
/// `.` → `-`, `*` → `"wild"`, `>` → `"fullwild"`, prefixed `sub-`.
pub fn fallback_dom_id(subject: &str) -> String {
    let tokens: Vec<String> = subject
        .split('.')
        .map(|tok| match tok {
            "*" => "wild".to_string(),
            ">" => "fullwild".to_string(),
            other => other.to_string(),
        })
        .collect();
    format!("sub-{}", tokens.join("-"))
}

/// A materialised renderer bound to one concrete subject or, for a literal
/// wildcard leaf subscription, the wildcard pattern itself.
#[derive(Clone)]
pub struct Renderer {
    subject: String,
    render_fn: fn(subject: &str, payload: &Value) -> Fragment,
}

impl Renderer {
    /// Wildcard-aware: `self.subject` may itself carry `*`/`>` when it was
    /// materialized from a wildcard leaf subscription rather than a spec.
    pub fn matches(&self, subject: &str) -> bool {
        crate::bus::matches(&self.subject, subject)
    }

    pub fn render(&self, payload: &Value) -> Fragment {
        (self.render_fn)(&self.subject, payload)
    }
}

/// A pattern paired with the factory that binds it to one concrete subject.
pub struct RendererSpec {
    pub pattern: &'static str,
    factory: fn(subject: &str) -> Renderer,
}

fn str_field<'a>(payload: &'a Value, key: &str) -> &'a str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}

fn terminal_freeze_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let cmd = escape_html(str_field(payload, "cmd"));
            let output = escape_html(str_field(payload, "output"));
            Fragment::append(
                "#terminal-frozen",
                format!("<div class=\"frozen\"><pre class=\"cmd\">{cmd}</pre><pre class=\"output\">{output}</pre></div>"),
            )
        },
    }
}

fn terminal_viewdoc_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let paths: Vec<String> = payload
                .get("paths")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(escape_html)
                        .collect()
                })
                .unwrap_or_default();
            let list = paths
                .iter()
                .map(|p| format!("<li>{p}</li>"))
                .collect::<Vec<_>>()
                .join("");
            Fragment::replace("#left-panel-content", format!("<ul class=\"viewdoc\">{list}</ul>"))
        },
    }
}

fn script_created_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, _payload| {
            Fragment::append("#script-status", "<div class=\"status\">created</div>".to_string())
        },
    }
}

fn script_create_error_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let error = escape_html(str_field(payload, "error"));
            Fragment::append(
                "#script-status",
                format!("<div class=\"status error\">{error}</div>"),
            )
        },
    }
}

fn job_started_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let pid = payload.get("pid").map(|v| v.to_string()).unwrap_or_default();
            Fragment::append(
                "#script-status",
                format!("<div class=\"status\">job started pid={pid}</div>"),
            )
        },
    }
}

fn job_stdout_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let line = escape_html(str_field(payload, "line"));
            Fragment::append("#script-output", format!("<div class=\"line\">{line}</div>"))
        },
    }
}

fn job_stderr_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let line = escape_html(str_field(payload, "line"));
            Fragment::append(
                "#script-output",
                format!("<div class=\"line stderr\">{line}</div>"),
            )
        },
    }
}

fn job_exit_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            let code = payload
                .get("exit_code")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            Fragment::append("#script-status", format!("<div class=\"status\">exit {code}</div>"))
        },
    }
}

fn job_data_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |_subject, payload| {
            Fragment::append(
                "#script-output",
                format!(
                    "<pre class=\"data\">{}</pre>",
                    escape_html(&payload.to_string())
                ),
            )
        },
    }
}

fn fallback_renderer(subject: &str) -> Renderer {
    Renderer {
        subject: subject.to_string(),
        render_fn: |subject, payload| {
            let dom_id = fallback_dom_id(subject);
            Fragment::append(
                format!("#{dom_id}"),
                format!(
                    "<pre>{}: {}</pre>",
                    escape_html(subject),
                    escape_html(&payload.to_string())
                ),
            )
        },
    }
}

/// Specs registered at startup, in dispatch order; the fallback spec
/// matching `>` is appended last by `ForSubjects` and is never listed here.
fn builtin_specs() -> Vec<RendererSpec> {
    vec![
        RendererSpec {
            pattern: "event.terminal.session.*.freeze",
            factory: terminal_freeze_renderer,
        },
        RendererSpec {
            pattern: "event.terminal.session.*.viewdoc",
            factory: terminal_viewdoc_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.created",
            factory: script_created_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.create.error",
            factory: script_create_error_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.job.*.started",
            factory: job_started_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.job.*.stdout",
            factory: job_stdout_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.job.*.stderr",
            factory: job_stderr_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.job.*.exit",
            factory: job_exit_renderer,
        },
        RendererSpec {
            pattern: "event.script.*.job.*.data",
            factory: job_data_renderer,
        },
    ]
}

/// Immutable array populated once at startup; `ForSubjects` is the only
/// hot-path operation and does no reflection.
pub struct RendererRegistry {
    specs: Vec<RendererSpec>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        Self {
            specs: builtin_specs(),
        }
    }

    /// One materialised renderer per `(subject, spec)` pair that matches,
    /// in spec-registration order, followed by the fallback renderer for
    /// every subject (so it always has a final catch-all).
    pub fn for_subjects(&self, subjects: &[String]) -> Vec<Renderer> {
        let mut renderers = Vec::new();
        for subject in subjects {
            for spec in &self.specs {
                if matches(spec.pattern, subject) {
                    renderers.push((spec.factory)(subject));
                }
            }
        }
        for subject in subjects {
            renderers.push(fallback_renderer(subject));
        }
        renderers
    }

    /// Dispatch a message to the first matching renderer in `renderers`
    /// and render it; `None` if nothing matched (should not happen once
    /// the fallback is included).
    pub fn dispatch(renderers: &[Renderer], subject: &str, payload: &Value) -> Option<Fragment> {
        renderers
            .iter()
            .find(|r| r.matches(subject))
            .map(|r| r.render(payload))
    }
}

impl Default for RendererRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_dom_id_escapes_wildcards() {
        assert_eq!(fallback_dom_id("event.orders.created"), "sub-event-orders-created");
        assert_eq!(fallback_dom_id("event.*.created"), "sub-event-wild-created");
        assert_eq!(fallback_dom_id("command.>"), "sub-command-fullwild");
    }

    #[test]
    fn for_subjects_materializes_matching_spec_then_fallback() {
        let registry = RendererRegistry::new();
        let renderers = registry.for_subjects(&["event.script.foo.created".to_string()]);
        assert_eq!(renderers.len(), 2);
        assert!(renderers[0].matches("event.script.foo.created"));
        assert!(renderers[1].matches("event.script.foo.created"));
    }

    #[test]
    fn dispatch_picks_first_match() {
        let registry = RendererRegistry::new();
        let renderers = registry.for_subjects(&["event.script.foo.created".to_string()]);
        let fragment = RendererRegistry::dispatch(
            &renderers,
            "event.script.foo.created",
            &serde_json::json!({}),
        )
        .unwrap();
        assert_eq!(fragment.selector, "#script-status");
        assert!(fragment.html.contains("created"));
    }

    #[test]
    fn terminal_freeze_renders_escaped_cmd_and_output() {
        let registry = RendererRegistry::new();
        let renderers = registry.for_subjects(&["event.terminal.session.s1.freeze".to_string()]);
        let fragment = RendererRegistry::dispatch(
            &renderers,
            "event.terminal.session.s1.freeze",
            &serde_json::json!({"cmd": "echo <hi>", "output": "<hi>"}),
        )
        .unwrap();
        assert_eq!(fragment.selector, "#terminal-frozen");
        assert!(fragment.html.contains("&lt;hi&gt;"));
    }

    #[test]
    fn unmatched_subject_falls_through_to_fallback() {
        let registry = RendererRegistry::new();
        let renderers = registry.for_subjects(&["event.orders.created".to_string()]);
        let fragment = RendererRegistry::dispatch(
            &renderers,
            "event.orders.created",
            &serde_json::json!({"id": 1}),
        )
        .unwrap();
        assert_eq!(fragment.selector, "#sub-event-orders-created");
    }
}
