//! Prompt templates for agent invocations.
//!
//! - **Iteration prompts**: the operator's `PROMPT.md` plus the ledger protocol
//!   (which task is next, how to record completion, how to signal the end)
//! - **Replanning prompts**: review the finished cycle and regenerate `TASKS.md`

use std::fmt::Write;
use std::path::Path;

use crate::fs::Ledger;

/// Literal the agent prints when every declared task is finished.
pub const COMPLETION_TOKEN: &str = "<promise>COMPLETE</promise>";

/// Guideline files the agent is pointed at when present in the project root.
const GUIDELINE_FILES: [&str; 5] = [
    "AGENTS.md",
    "CLAUDE.md",
    "CLAUDE.local.md",
    ".cursorrules",
    ".github/copilot-instructions.md",
];

/// Lists guideline files that exist under `root`, in a fixed order.
#[must_use]
pub fn discover_guideline_files(root: &Path) -> Vec<&'static str> {
    GUIDELINE_FILES
        .into_iter()
        .filter(|name| root.join(name).is_file())
        .collect()
}

/// Protocol appended to every iteration prompt.
///
/// `{{NEXT_TASK}}`, `{{PROGRESS}}` and `{{GUIDELINES}}` are substituted at render time.
pub const ITERATION_PROTOCOL_TEMPLATE: &str = r"

---

# Loop protocol

You are one iteration of an automated loop. You have no memory of previous
iterations; the files in this repository are the only shared state.

- Task list: `TASKS.md` (lines of the form `- [ ] <task>`).
- Completion log: `progress.txt`.
- Current progress: {{PROGRESS}}.

## This iteration

Work on exactly ONE task. The next pending task is:

{{NEXT_TASK}}

When it is finished and verified, append one line to `progress.txt` that is
`[DONE] ` followed by the task text copied EXACTLY as written in `TASKS.md`.
Do not edit or remove existing lines in `progress.txt`.

If, after your work, every task in `TASKS.md` has a matching `[DONE]` line,
print the following on its own line and stop:

<promise>COMPLETE</promise>

## Project guidelines

{{GUIDELINES}}
";

/// Built-in prompt for the replanning sub-cycle.
pub const REPLAN_PROMPT: &str = r"# Replanning

All tasks in `TASKS.md` have been completed (see the `[DONE]` lines in
`progress.txt`).

1. Review the current state of the repository against the goals described in
   `PROMPT.md`.
2. Rewrite `TASKS.md` with the next set of small, independently verifiable
   tasks, one per line as `- [ ] <task>`. Keep each task's text unique.
3. If nothing meaningful remains, leave `TASKS.md` with no unchecked tasks.

Do not modify `progress.txt`; it is archived and reset after you finish.
Do not print <promise>COMPLETE</promise>.
";

/// Builds the prompt for one iteration from the operator prompt and a fresh ledger.
#[must_use]
pub fn wrap_for_iteration(prompt: &str, ledger: &Ledger, root: &Path) -> String {
    let counts = ledger.counts();
    let progress = format!(
        "{} of {} task(s) done, {} remaining",
        counts.completed, counts.total, counts.remaining
    );
    let next_task = ledger.next_pending_task().map_or_else(
        || format!("(none: all tasks are recorded as done; print {COMPLETION_TOKEN})"),
        |task| format!("    {}", task.text),
    );

    let mut out = String::with_capacity(prompt.len() + ITERATION_PROTOCOL_TEMPLATE.len());
    out.push_str(prompt.trim_end());
    out.push_str(
        &ITERATION_PROTOCOL_TEMPLATE
            .replace("{{PROGRESS}}", &progress)
            .replace("{{NEXT_TASK}}", &next_task)
            .replace("{{GUIDELINES}}", &render_guidelines_block(&discover_guideline_files(root))),
    );
    out
}

/// Returns the replanning prompt, honoring an operator override.
#[must_use]
pub fn replan_prompt(override_text: Option<&str>) -> String {
    override_text.map_or_else(|| REPLAN_PROMPT.to_string(), str::to_string)
}

/// Returns true if agent output contains the completion token anywhere.
#[must_use]
pub fn contains_completion_token(output: &str) -> bool {
    output.contains(COMPLETION_TOKEN)
}

fn render_guidelines_block(files: &[&str]) -> String {
    if files.is_empty() {
        return "- No project guideline files found.".to_string();
    }
    let mut s = String::new();
    for f in files {
        let _ = writeln!(s, "- Read `{f}` before changing code.");
    }
    s.trim_end().to_string()
}
