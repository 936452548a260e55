//! Gate command execution.
//!
//! Commands with shell operators run through `sh -c`; plain commands are
//! split into argv and exec'd directly. Output is captured as bounded tails.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::process::{Command, Stdio};

use crate::contracts::tail_chars;

const TAIL_LIMIT: usize = 1000;
const SHELL_OPERATORS: [&str; 8] = ["|", "&&", "||", ";", "<", ">", "`", "$("];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub used_shell: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Gate artifact form, tagged for status displays.
    pub fn artifact(&self) -> Value {
        json!({
            "type": "command",
            "command": self.command,
            "exit_code": self.exit_code,
            "stdout_tail": self.stdout_tail,
            "stderr_tail": self.stderr_tail,
            "used_shell": self.used_shell,
        })
    }
}

fn needs_shell(command: &str) -> bool {
    SHELL_OPERATORS.iter().any(|op| command.contains(op))
}

/// Run `command` in `cwd`, capturing the last 1000 characters of each stream.
/// A command that cannot be launched reports exit code -1 with the error in
/// the stderr tail.
pub fn run_command(command: &str, cwd: &Path) -> CommandResult {
    let use_shell = needs_shell(command);
    let argv: Option<Vec<String>> = if use_shell {
        None
    } else {
        shlex::split(command).filter(|parts| !parts.is_empty())
    };
    // Unsplittable commands (unbalanced quotes) go through the shell too.
    let used_shell = argv.is_none();

    let mut process = if let Some(parts) = &argv {
        let mut process = Command::new(&parts[0]);
        process.args(&parts[1..]);
        process
    } else {
        let mut process = Command::new("sh");
        process.args(["-c", command]);
        process
    };

    let output = process
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) => CommandResult {
            command: command.to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout_tail: tail_chars(
                String::from_utf8_lossy(&output.stdout).trim(),
                TAIL_LIMIT,
            ),
            stderr_tail: tail_chars(
                String::from_utf8_lossy(&output.stderr).trim(),
                TAIL_LIMIT,
            ),
            used_shell,
        },
        Err(err) => CommandResult {
            command: command.to_string(),
            exit_code: -1,
            stdout_tail: String::new(),
            stderr_tail: format!("failed to launch: {err}"),
            used_shell,
        },
    }
}
