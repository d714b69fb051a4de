use serde::{Deserialize, Serialize};

use crate::core::jobs::Job;

const DEFAULT_HANDSHAKE: &str = "On it! Running `{{command}}` as job #{{job_id}}.";
const DEFAULT_SUCCESS: &str = "`{{command}}` finished.\n```\n{{output}}\n```";
const DEFAULT_FAILURE: &str = "`{{command}}` failed: {{error}}\n```\n{{output}}\n```";

/// Per-command overrides for the replies the executor sends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Templates {
    #[serde(default)]
    pub handshake: Option<String>,
    #[serde(default)]
    pub success: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl Templates {
    pub fn handshake(&self, job: &Job) -> String {
        render(
            self.handshake.as_deref().unwrap_or(DEFAULT_HANDSHAKE),
            job,
            "",
            "",
        )
    }

    pub fn success(&self, job: &Job, output: &str) -> String {
        render(
            self.success.as_deref().unwrap_or(DEFAULT_SUCCESS),
            job,
            output,
            "",
        )
    }

    pub fn failure(&self, job: &Job, output: &str, error: &str) -> String {
        render(
            self.failure.as_deref().unwrap_or(DEFAULT_FAILURE),
            job,
            output,
            error,
        )
    }
}

/// Substitutes placeholders in one pass, so text coming from the request or
/// the command is never expanded again. Unknown placeholders are kept.
fn render(template: &str, job: &Job, output: &str, error: &str) -> String {
    let mut out = String::with_capacity(template.len() + output.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match &tail[..end] {
            "job_id" => out.push_str(&job.id.to_string()),
            "command" => out.push_str(&job.request.command_line()),
            "user" => out.push_str(&job.request.username),
            "error" => out.push_str(error),
            "output" => out.push_str(output.trim_end()),
            other => {
                out.push_str("{{");
                out.push_str(other);
                out.push_str("}}");
            }
        }
        rest = &tail[end + 2..];
    }
    out.push_str(rest);
    out
}

pub fn unknown_command(command: &str) -> String {
    format!("I don't know how to do \"{}\"", command)
}

pub fn not_allowed(command: &str) -> String {
    format!("You are not allowed to do \"{}\"", command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::JobStatus;
    use crate::core::request::Request;

    fn job() -> Job {
        Job {
            id: 7,
            request: Request::new("echo", "alice").with_args(["hi"]),
            status: JobStatus::Running,
            start_time: chrono::Utc::now(),
            end_time: None,
        }
    }

    #[test]
    fn defaults_include_output_and_error() {
        let t = Templates::default();
        assert!(t.success(&job(), "hi\n").contains("hi\n```"));
        let failed = t.failure(&job(), "partial", "exit status 2");
        assert!(failed.contains("exit status 2"));
        assert!(failed.contains("partial"));
        assert!(t.handshake(&job()).contains("#7"));
    }

    #[test]
    fn overrides_replace_placeholders() {
        let t = Templates {
            success: Some("{{user}} ran {{command}}: {{output}}".into()),
            ..Default::default()
        };
        assert_eq!(t.success(&job(), "hi"), "alice ran echo hi: hi");
    }

    #[test]
    fn substituted_text_is_not_expanded_again() {
        let mut job = job();
        job.request = Request::new("echo", "alice").with_args(["{{error}}"]);
        let t = Templates::default();
        let failed = t.failure(&job, "{{user}}", "boom {{output}}");
        assert!(failed.starts_with("`echo {{error}}` failed: boom {{output}}"));
        assert!(failed.contains("{{user}}"));
        assert!(!failed.contains("alice"));
    }

    #[test]
    fn unknown_and_unclosed_placeholders_are_kept() {
        let t = Templates {
            handshake: Some("{{nope}} #{{job_id}} {{open".into()),
            ..Default::default()
        };
        assert_eq!(t.handshake(&job()), "{{nope}} #7 {{open");
    }
}
