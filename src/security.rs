/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: security.rs
 */

use serde::Deserialize;
use std::collections::HashSet;

/// Why a command was denied. Order of evaluation in [`SecurityPolicy::decide`]
/// matters: unknown sender, then length, then deny-substring, then
/// missing-allow-prefix — deny short-circuits allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownSender,
    CommandTooLong,
    DeniedSubstring,
    NoMatchingAllowPrefix,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::UnknownSender => write!(f, "UNKNOWN_SENDER"),
            DenyReason::CommandTooLong => write!(f, "COMMAND_TOO_LONG"),
            DenyReason::DeniedSubstring => write!(f, "DENIED_SUBSTRING"),
            DenyReason::NoMatchingAllowPrefix => write!(f, "NO_MATCHING_ALLOW_PREFIX"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason, String),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

fn default_max_command_length() -> usize {
    4096
}

/// Immutable, stateless command-level policy. Loaded once at startup and
/// shared read-only by every component that needs to gate a command.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityPolicy {
    sender_allowlist: HashSet<String>,
    command_allow_prefixes: Vec<String>,
    command_deny_substrings: Vec<String>,
    #[serde(default = "default_max_command_length")]
    max_command_length: usize,
}

impl SecurityPolicy {
    pub fn new(
        sender_allowlist: impl IntoIterator<Item = String>,
        command_allow_prefixes: Vec<String>,
        command_deny_substrings: Vec<String>,
        max_command_length: usize,
    ) -> Self {
        Self {
            sender_allowlist: sender_allowlist
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            command_allow_prefixes,
            command_deny_substrings,
            max_command_length,
        }
    }

    /// The canonical default deny-substring list from the design rationale:
    /// ten patterns that catch the common destructive idioms without a full
    /// shell-grammar parser.
    pub fn default_deny_substrings() -> Vec<String> {
        vec![
            "rm -rf".to_string(),
            "sudo ".to_string(),
            ":(){".to_string(),
            "| sh".to_string(),
            " curl ".to_string(),
            "dd if=".to_string(),
            "mkfs".to_string(),
            "> /dev/".to_string(),
            "chmod 777".to_string(),
            "wget ".to_string(),
        ]
    }

    /// `decide(sender, command) -> Allow | Deny(reason)`.
    ///
    /// Sender comparison is case-insensitive; command matching (length,
    /// prefix, substring) is byte-exact and case-sensitive. Prefix matching
    /// is anchored at character 0 of the trimmed command, not a substring
    /// search anywhere in it.
    pub fn decide(&self, sender: &str, command: &str) -> Decision {
        let sender_lower = sender.to_lowercase();
        if !self.sender_allowlist.contains(&sender_lower) {
            return Decision::Deny(DenyReason::UnknownSender, sender.to_string());
        }

        if command.len() > self.max_command_length {
            return Decision::Deny(
                DenyReason::CommandTooLong,
                format!("{} > {}", command.len(), self.max_command_length),
            );
        }

        if let Some(hit) = self
            .command_deny_substrings
            .iter()
            .find(|pattern| command.contains(pattern.as_str()))
        {
            return Decision::Deny(DenyReason::DeniedSubstring, hit.clone());
        }

        let trimmed = command.trim_start();
        if self
            .command_allow_prefixes
            .iter()
            .any(|prefix| trimmed.starts_with(prefix.as_str()))
        {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::NoMatchingAllowPrefix, trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::new(
            ["alice@example.com".to_string()],
            vec!["npm ".into(), "git status".into(), "pnpm ".into(), "echo ".into()],
            SecurityPolicy::default_deny_substrings(),
            4096,
        )
    }

    #[test]
    fn allows_known_sender_with_allow_prefix() {
        assert_eq!(policy().decide("alice@example.com", "echo hi"), Decision::Allow);
    }

    #[test]
    fn sender_match_is_case_insensitive() {
        assert_eq!(policy().decide("Alice@Example.com", "echo hi"), Decision::Allow);
    }

    #[test]
    fn unknown_sender_is_denied_before_anything_else() {
        let d = policy().decide("mallory@example.com", "rm -rf /");
        assert_eq!(d, Decision::Deny(DenyReason::UnknownSender, "mallory@example.com".into()));
    }

    #[test]
    fn deny_substring_wins_over_allow_prefix() {
        // "npm " is a valid allow prefix but the deny substring still wins.
        let d = policy().decide("alice@example.com", "npm run; rm -rf /tmp");
        assert_eq!(
            d,
            Decision::Deny(DenyReason::DeniedSubstring, "rm -rf".into())
        );
    }

    #[test]
    fn prefix_must_anchor_at_start_of_trimmed_command() {
        // "echo " appears but not at position 0 -> no matching allow prefix.
        let d = policy().decide("alice@example.com", "cat file && echo done");
        assert_eq!(
            d,
            Decision::Deny(DenyReason::NoMatchingAllowPrefix, "cat file && echo done".into())
        );
    }

    #[test]
    fn leading_whitespace_is_trimmed_before_prefix_match() {
        assert_eq!(policy().decide("alice@example.com", "   echo hi"), Decision::Allow);
    }

    #[test]
    fn command_too_long_is_denied() {
        let long_cmd = format!("echo {}", "a".repeat(4100));
        let d = policy().decide("alice@example.com", &long_cmd);
        assert!(matches!(d, Decision::Deny(DenyReason::CommandTooLong, _)));
    }

    #[test]
    fn adding_a_deny_substring_flips_an_otherwise_allowed_command() {
        assert_eq!(policy().decide("alice@example.com", "git status"), Decision::Allow);
        let d = policy().decide("alice@example.com", "git status; sudo reboot");
        assert!(matches!(d, Decision::Deny(DenyReason::DeniedSubstring, _)));
    }

    #[test]
    fn decide_is_deterministic() {
        let p = policy();
        let a = p.decide("alice@example.com", "pnpm run build");
        let b = p.decide("alice@example.com", "pnpm run build");
        assert_eq!(a, b);
    }

    #[test]
    fn fork_bomb_pattern_is_denied() {
        let d = policy().decide("alice@example.com", "echo start; :(){ :|:& };:");
        assert!(matches!(d, Decision::Deny(DenyReason::DeniedSubstring, _)));
    }
}
