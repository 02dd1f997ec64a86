//! Trace command templating

use std::time::Duration;

/// The only placeholder recognized in a command template
pub const TARGET_PID_PLACEHOLDER: &str = "{target_pid}";

/// Substitute `pid` for every `{target_pid}` in `template`.
///
/// Plain text replacement: the result is handed to `sh -c` as-is, so the
/// template is trusted operator input and is not quoted or escaped.
pub fn render_command(template: &str, pid: u32) -> String {
    template.replace(TARGET_PID_PLACEHOLDER, &pid.to_string())
}

/// Bound `command` with coreutils `timeout`, sending SIGINT on expiry so the
/// trace tool can flush and detach. Zero or no duration leaves it unbounded.
pub fn with_timeout(command: &str, timeout: Option<Duration>) -> String {
    match timeout {
        Some(limit) if !limit.is_zero() => format!(
            "timeout -s 2 --preserve-status {:.6} {}",
            limit.as_secs_f64(),
            command
        ),
        _ => command.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_default_template() {
        assert_eq!(render_command("strace -fp {target_pid}", 4821), "strace -fp 4821");
    }

    #[test]
    fn test_template_without_placeholder_is_unchanged() {
        assert_eq!(render_command("perf top", 4821), "perf top");
    }

    #[test]
    fn test_every_placeholder_is_replaced() {
        assert_eq!(
            render_command("nsenter -t {target_pid} -n ss -p; echo {target_pid}", 7),
            "nsenter -t 7 -n ss -p; echo 7"
        );
    }

    #[test]
    fn test_substitution_is_literal() {
        // Shell metacharacters pass straight through
        assert_eq!(
            render_command("strace -fp {target_pid} 2>&1 | head -n 50", 1),
            "strace -fp 1 2>&1 | head -n 50"
        );
        assert_eq!(render_command("{TARGET_PID} {target_pid", 1), "{TARGET_PID} {target_pid");
    }

    #[test]
    fn test_with_timeout() {
        assert_eq!(
            with_timeout("strace -fp 1", Some(Duration::from_secs(30))),
            "timeout -s 2 --preserve-status 30.000000 strace -fp 1"
        );
        assert_eq!(
            with_timeout("strace -fp 1", Some(Duration::from_millis(1500))),
            "timeout -s 2 --preserve-status 1.500000 strace -fp 1"
        );
        assert_eq!(with_timeout("strace -fp 1", Some(Duration::ZERO)), "strace -fp 1");
        assert_eq!(with_timeout("strace -fp 1", None), "strace -fp 1");
    }
}
