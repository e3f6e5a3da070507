//! Subject taxonomy: canonical subject strings and the wildcard matcher
//! every durable/ephemeral consumer filter is built from.

pub mod client;
pub mod messages;

/// Tokenize a subject or pattern on `.`. Neither wildcards nor concrete
/// subjects may contain an empty token (`a..b`), but we don't enforce that
/// here — callers construct subjects via the builders below, which can't
/// produce one.
fn tokens(s: &str) -> Vec<&str> {
    s.split('.').collect()
}

/// `*` matches exactly one token; `>` matches one or more trailing tokens
/// and must be the last token in `pattern`. A concrete subject contains
/// neither wildcard.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern_tokens = tokens(pattern);
    let subject_tokens = tokens(subject);

    for (i, ptok) in pattern_tokens.iter().enumerate() {
        if *ptok == ">" {
            // Matches the remainder, which must be non-empty.
            return i < subject_tokens.len();
        }
        if i >= subject_tokens.len() {
            return false;
        }
        if *ptok == "*" {
            continue;
        }
        if *ptok != subject_tokens[i] {
            return false;
        }
    }
    subject_tokens.len() == pattern_tokens.len()
}

// ---------------------------------------------------------------------
// Canonical subject builders — every publisher goes through these so no
// subject string is hand-formatted more than once.
// ---------------------------------------------------------------------

pub const COMMAND_SCRIPT_CREATE: &str = "command.script.create";
pub const COMMAND_SCRIPT_RUN: &str = "command.script.run";
pub const COMMAND_LAYOUT_PANEL_SET: &str = "command.layout.panel.set";
pub const COMMAND_LAYOUT_PRESET_APPLY: &str = "command.layout.preset.apply";
pub const COMMAND_LAYOUT_PATCH: &str = "command.layout.patch";
pub const TERMINAL_COMMAND: &str = "terminal.command";

pub const STREAM_COMMAND: &str = "COMMAND";
pub const STREAM_EVENT: &str = "EVENT";
pub const STREAM_TERMINAL: &str = "TERMINAL";

pub fn event_terminal_freeze(session_id: &str) -> String {
    format!("event.terminal.session.{session_id}.freeze")
}

pub fn event_terminal_viewdoc(session_id: &str) -> String {
    format!("event.terminal.session.{session_id}.viewdoc")
}

pub fn event_script_created(name: &str) -> String {
    format!("event.script.{name}.created")
}

pub fn event_script_create_error(name: &str) -> String {
    format!("event.script.{name}.create.error")
}

pub fn event_script_job_error(name: &str) -> String {
    format!("event.script.{name}.job.error")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Started,
    Stdout,
    Stderr,
    Exit,
    Data,
}

impl JobEventKind {
    fn as_token(self) -> &'static str {
        match self {
            JobEventKind::Started => "started",
            JobEventKind::Stdout => "stdout",
            JobEventKind::Stderr => "stderr",
            JobEventKind::Exit => "exit",
            JobEventKind::Data => "data",
        }
    }
}

pub fn event_script_job(name: &str, job_id: &str, kind: JobEventKind) -> String {
    format!("event.script.{name}.job.{job_id}.{}", kind.as_token())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_exactly_one_token() {
        assert!(matches("event.script.*.created", "event.script.foo.created"));
        assert!(!matches(
            "event.script.*.created",
            "event.script.foo.bar.created"
        ));
    }

    #[test]
    fn gt_matches_one_or_more_trailing_tokens() {
        assert!(matches("command.>", "command.script.create"));
        assert!(matches("command.>", "command.x"));
        assert!(!matches("command.>", "command"));
    }

    #[test]
    fn gt_must_have_at_least_one_remaining_token() {
        assert!(!matches("event.script.foo.job.>", "event.script.foo.job"));
        assert!(matches(
            "event.script.foo.job.>",
            "event.script.foo.job.42.started"
        ));
    }

    #[test]
    fn concrete_subjects_require_exact_length() {
        assert!(matches("terminal.command", "terminal.command"));
        assert!(!matches("terminal.command", "terminal.command.extra"));
        assert!(!matches("terminal.command.extra", "terminal.command"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(matches(
            "event.script.*.job.*.stdout",
            "event.script.foo.job.01J.stdout"
        ));
        assert!(!matches(
            "event.script.*.job.*.stdout",
            "event.script.foo.job.01J.stderr"
        ));
    }

    #[test]
    fn builders_are_stable() {
        assert_eq!(
            event_terminal_freeze("S"),
            "event.terminal.session.S.freeze"
        );
        assert_eq!(
            event_script_job("foo", "42", JobEventKind::Started),
            "event.script.foo.job.42.started"
        );
    }
}
