//! Prompt assembly for engine sessions.
//!
//! A new session gets the base system prompt plus one fragment per known
//! task tag. Tags not in [`TAG_PROFILES`] are ignored. The first tag that
//! carries a command directive prefixes the task prompt with it.

use std::collections::{BTreeSet, HashMap};

use ap_core::types::Task;

// ---------------------------------------------------------------------------
// Tag profiles
// ---------------------------------------------------------------------------

/// Behavior attached to a task tag.
#[derive(Debug, Clone, Copy)]
pub struct TagProfile {
    pub tag: &'static str,
    /// Appended to the system prompt.
    pub fragment: &'static str,
    /// Optional command placed in front of the task prompt.
    pub directive: Option<&'static str>,
}

pub const TAG_PROFILES: &[TagProfile] = &[
    TagProfile {
        tag: "bug",
        fragment: "This task is a bug report. Reproduce the failure first, write a \
                   regression test that captures it, then make the smallest fix that \
                   turns the test green.",
        directive: Some("/fix"),
    },
    TagProfile {
        tag: "feature",
        fragment: "This task is a feature request. Read the surrounding code before \
                   writing any, follow its conventions, and cover the new behavior \
                   with tests.",
        directive: None,
    },
    TagProfile {
        tag: "refactor",
        fragment: "This task is a refactor. Behavior must not change. Run the existing \
                   test suite before and after each step.",
        directive: None,
    },
    TagProfile {
        tag: "tests",
        fragment: "This task is about test coverage. Add focused tests for the described \
                   behavior; do not change production code unless a test exposes a bug.",
        directive: Some("/test"),
    },
    TagProfile {
        tag: "docs",
        fragment: "This task is documentation work. Keep examples runnable and in sync \
                   with the code they describe.",
        directive: None,
    },
    TagProfile {
        tag: "security",
        fragment: "This task is security-sensitive. Treat all external input as hostile, \
                   never log secrets, and note any residual risk in your summary.",
        directive: Some("/security-review"),
    },
    TagProfile {
        tag: "performance",
        fragment: "This task is about performance. Measure before and after, and report \
                   the numbers in your summary.",
        directive: None,
    },
];

/// Look up the profile for a tag, case-insensitively.
pub fn profile_for(tag: &str) -> Option<&'static TagProfile> {
    TAG_PROFILES.iter().find(|p| p.tag.eq_ignore_ascii_case(tag))
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub const DEFAULT_BASE_PROMPT: &str = "\
You are an autonomous software engineer working on a tracked issue without a \
human in the loop. Work in the current repository. Make focused changes, run \
the relevant tests, and commit when they pass. If you cannot finish, leave the \
work in a state another session can pick up and explain what remains. End with \
a short summary of what you changed and why.";

pub const DEFAULT_TASK_TEMPLATE: &str = "\
Issue {issue_id}: {title}

{description}";

pub const DEFAULT_CONTINUATION_TEMPLATE: &str = "\
Continue working on issue {issue_id} ({title}) from where you left off. Check \
the current state of the repository first, then finish the remaining work and \
summarize the outcome.";

/// Replace `{key}` placeholders in `template` in one left-to-right pass.
/// Substituted values are never scanned again, so braces inside a title or
/// description come through verbatim. Unknown placeholders are left as is.
pub fn render(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}').and_then(|close| {
            vars.get(&after[..close]).map(|value| (close, value))
        }) {
            Some((close, value)) => {
                output.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                output.push('{');
                rest = after;
            }
        }
    }
    output.push_str(rest);
    output
}

fn task_vars(task: &Task) -> HashMap<&str, &str> {
    let description = if task.description.trim().is_empty() {
        "(no description provided)"
    } else {
        task.description.as_str()
    };
    HashMap::from([
        ("issue_id", task.issue_id.as_str()),
        ("title", task.title.as_str()),
        ("description", description),
    ])
}

// ---------------------------------------------------------------------------
// PromptSet
// ---------------------------------------------------------------------------

/// The three prompts an orchestrator needs, with overridable templates.
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub base: String,
    pub task_template: String,
    pub continuation_template: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_PROMPT.to_string(),
            task_template: DEFAULT_TASK_TEMPLATE.to_string(),
            continuation_template: DEFAULT_CONTINUATION_TEMPLATE.to_string(),
        }
    }
}

impl PromptSet {
    /// Base prompt followed by the fragment of every known tag, in table
    /// order so the output does not depend on tag insertion order.
    pub fn system_prompt(&self, tags: &BTreeSet<String>) -> String {
        let mut prompt = self.base.clone();
        for profile in TAG_PROFILES {
            if tags.iter().any(|t| t.eq_ignore_ascii_case(profile.tag)) {
                prompt.push_str("\n\n");
                prompt.push_str(profile.fragment);
            }
        }
        prompt
    }

    /// Initial prompt for a new session.
    pub fn task_prompt(&self, task: &Task, tags: &BTreeSet<String>) -> String {
        let body = render(&self.task_template, &task_vars(task));
        match directive_for(tags) {
            Some(directive) => format!("{directive} {body}"),
            None => body,
        }
    }

    /// Short prompt for resuming an existing session.
    pub fn continuation_prompt(&self, task: &Task) -> String {
        render(&self.continuation_template, &task_vars(task))
    }
}

/// Directive of the first tag, in table order, that has one.
pub fn directive_for(tags: &BTreeSet<String>) -> Option<&'static str> {
    TAG_PROFILES
        .iter()
        .filter(|p| tags.iter().any(|t| t.eq_ignore_ascii_case(p.tag)))
        .find_map(|p| p.directive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_tags_are_ignored() {
        let prompts = PromptSet::default();
        assert_eq!(prompts.system_prompt(&tags(&["frontend", "p1"])), DEFAULT_BASE_PROMPT);
    }

    #[test]
    fn known_tags_append_fragments() {
        let prompts = PromptSet::default();
        let system = prompts.system_prompt(&tags(&["Security", "bug"]));
        assert!(system.starts_with(DEFAULT_BASE_PROMPT));
        let bug = system.find("bug report").unwrap();
        let security = system.find("security-sensitive").unwrap();
        assert!(bug < security, "fragments follow table order");
    }

    #[test]
    fn directive_prefixes_task_prompt() {
        let prompts = PromptSet::default();
        let task = Task::new("ENG-1", "Crash on save").with_description("Stack trace attached");
        let prompt = prompts.task_prompt(&task, &tags(&["security", "bug"]));
        assert!(prompt.starts_with("/fix Issue ENG-1: Crash on save"));
        assert!(prompt.contains("Stack trace attached"));

        let plain = prompts.task_prompt(&task, &tags(&["feature"]));
        assert!(plain.starts_with("Issue ENG-1"));
    }

    #[test]
    fn braces_in_task_text_are_not_expanded() {
        let prompts = PromptSet::default();
        let task = Task::new("ENG-1", "Document {description} syntax").with_description("SECRET BODY");
        let prompt = prompts.task_prompt(&task, &BTreeSet::new());
        assert_eq!(prompt, "Issue ENG-1: Document {description} syntax\n\nSECRET BODY");
        for _ in 0..20 {
            assert_eq!(prompts.task_prompt(&task, &BTreeSet::new()), prompt);
        }
    }

    #[test]
    fn render_leaves_unknown_and_unclosed_braces() {
        let vars = HashMap::from([("a", "1")]);
        assert_eq!(render("{a} {b} {a", &vars), "1 {b} {a");
        assert_eq!(render("{{a}}", &vars), "{1}");
        assert_eq!(render("", &vars), "");
    }

    #[test]
    fn empty_description_gets_placeholder() {
        let prompts = PromptSet::default();
        let prompt = prompts.task_prompt(&Task::new("ENG-2", "t"), &BTreeSet::new());
        assert!(prompt.contains("(no description provided)"));
    }

    #[test]
    fn continuation_mentions_issue() {
        let prompts = PromptSet::default();
        let prompt = prompts.continuation_prompt(&Task::new("ENG-3", "Retry me"));
        assert!(prompt.contains("ENG-3"));
        assert!(prompt.contains("Retry me"));
    }
}
