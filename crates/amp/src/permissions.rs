//! Static permission rules handed to the agent.
//!
//! The rule list bounds the agent to read-only access of the working tree.
//! Rules follow the grammar `allow|reject <ToolName>[ --cmd "<glob>"]` and
//! are evaluated first-match by the agent; the final `reject Bash` is the
//! catch-all for any shell invocation not explicitly allowed. Callers never
//! compose rules dynamically.

use serde::Serialize;

/// One allow/reject rule in settings-file form.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRule {
    pub rule: String,
}

impl PermissionRule {
    fn new(rule: &str) -> Self {
        Self {
            rule: rule.to_string(),
        }
    }
}

/// Read-only shell commands the agent may run.
const ALLOWED_COMMANDS: &[&str] = &[
    "cat", "head", "tail", "grep", "ls", "find", "wc", "tree", "file",
];

/// Read-only source-control queries.
const ALLOWED_GIT_QUERIES: &[&str] = &["log", "show", "diff", "blame", "status", "branch", "tag"];

/// Source-control mutations, always rejected.
const REJECTED_GIT_WRITES: &[&str] = &[
    "commit", "push", "add", "checkout", "reset", "merge", "rebase", "stash",
];

/// Filesystem mutations, always rejected.
const REJECTED_MUTATIONS: &[&str] = &[
    "rm", "mv", "cp", "chmod", "chown", "sed", "awk", "dd", "tee", "truncate",
];

/// The static permission set for diagnosis runs.
#[must_use]
pub fn default_rules() -> Vec<PermissionRule> {
    let mut rules = vec![
        PermissionRule::new("allow Read"),
        PermissionRule::new("allow Grep"),
        PermissionRule::new("allow glob"),
        PermissionRule::new("allow list_directory"),
    ];

    for cmd in ALLOWED_COMMANDS {
        rules.push(PermissionRule::new(&format!("allow Bash --cmd \"{cmd} *\"")));
    }
    for query in ALLOWED_GIT_QUERIES {
        rules.push(PermissionRule::new(&format!(
            "allow Bash --cmd \"git {query}*\""
        )));
    }

    // Explicit rejects ahead of the catch-all keep audit output readable.
    rules.push(PermissionRule::new("reject edit_file"));
    rules.push(PermissionRule::new("reject create_file"));
    rules.push(PermissionRule::new("reject undo_edit"));
    rules.push(PermissionRule::new("reject Task"));

    for write in REJECTED_GIT_WRITES {
        rules.push(PermissionRule::new(&format!(
            "reject Bash --cmd \"git {write}*\""
        )));
    }
    for cmd in REJECTED_MUTATIONS {
        rules.push(PermissionRule::new(&format!(
            "reject Bash --cmd \"{cmd} *\""
        )));
    }
    for verb in ["PUT", "POST", "DELETE", "PATCH"] {
        rules.push(PermissionRule::new(&format!(
            "reject Bash --cmd \"curl -X {verb}*\""
        )));
    }
    rules.push(PermissionRule::new("reject Bash --cmd \"wget *\""));

    // Catch-all: any shell invocation not matched above.
    rules.push(PermissionRule::new("reject Bash"));

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_all_is_last() {
        let rules = default_rules();
        assert_eq!(rules.last().unwrap().rule, "reject Bash");
    }

    #[test]
    fn test_no_write_tool_is_allowed() {
        for rule in default_rules() {
            if rule.rule.starts_with("allow") {
                assert!(!rule.rule.contains("edit"), "write rule allowed: {}", rule.rule);
                assert!(!rule.rule.contains("rm "), "write rule allowed: {}", rule.rule);
                assert!(
                    !rule.rule.contains("git commit") && !rule.rule.contains("git push"),
                    "scm write allowed: {}",
                    rule.rule
                );
            }
        }
    }

    #[test]
    fn test_read_only_git_queries_allowed() {
        let rules = default_rules();
        let has = |needle: &str| rules.iter().any(|r| r.rule == needle);
        assert!(has("allow Bash --cmd \"git log*\""));
        assert!(has("allow Bash --cmd \"git blame*\""));
        assert!(has("reject Bash --cmd \"git reset*\""));
    }
}
