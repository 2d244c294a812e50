//! Line protocol between the lifecycle manager and an agent program
//!
//! A task goes out as one instruction line starting with a header:
//!
//! ```text
//! [atelier task <id>] <type>: <description> ...
//! ```
//!
//! and the agent reports back with a line that is exactly `@@done <id>` or
//! `@@failed <id>`. Markers only count as whole lines, so the terminal echo
//! of the instruction (which mentions both) never completes a task.

use super::Task;

const HEADER_PREFIX: &str = "[atelier task ";
const DONE: &str = "@@done";
const FAILED: &str = "@@failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    Failed,
}

pub fn task_header(task_id: &str, task_type: &str) -> String {
    format!("{}{}] {}", HEADER_PREFIX, task_id, task_type)
}

/// Extract `(task_id, task_type)` from an instruction line
pub fn parse_task_header(line: &str) -> Option<(&str, &str)> {
    let start = line.find(HEADER_PREFIX)? + HEADER_PREFIX.len();
    let rest = &line[start..];
    let end = rest.find(']')?;
    let task_id = rest[..end].trim();
    if task_id.is_empty() {
        return None;
    }
    let task_type = rest[end + 1..]
        .trim_start()
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .unwrap_or_default();
    Some((task_id, task_type))
}

pub fn done_marker(task_id: &str) -> String {
    format!("{} {}", DONE, task_id)
}

pub fn failed_marker(task_id: &str) -> String {
    format!("{} {}", FAILED, task_id)
}

/// Render a task as a single instruction line
pub fn render_instruction(task: &Task) -> String {
    let mut line = task_header(&task.id, &task.task_type);
    if !task.description.trim().is_empty() {
        line.push_str(": ");
        line.push_str(&task.description.replace('\n', " "));
    }
    if !task.payload.is_null() {
        line.push_str(&format!(" (payload: {})", task.payload));
    }
    line.push_str(&format!(
        " -- reply with a line \"{}\" when finished or \"{}\" on failure",
        done_marker(&task.id),
        failed_marker(&task.id)
    ));
    line
}

/// First completion marker for `task_id` in `text`
pub fn find_outcome(text: &str, task_id: &str) -> Option<TaskOutcome> {
    let done = done_marker(task_id);
    let failed = failed_marker(task_id);
    text.lines().map(str::trim).find_map(|line| {
        if line == done {
            Some(TaskOutcome::Done)
        } else if line == failed {
            Some(TaskOutcome::Failed)
        } else {
            None
        }
    })
}

/// The agent's reply: lines before the marker, minus the echoed instruction
pub fn extract_output(text: &str, task_id: &str) -> String {
    let done = done_marker(task_id);
    let failed = failed_marker(task_id);
    let header = task_header(task_id, "");
    let header = header.trim_end();
    text.lines()
        .take_while(|line| {
            let line = line.trim();
            line != done && line != failed
        })
        .filter(|line| !line.contains(header))
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
