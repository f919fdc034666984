//! Prompt matchers
//!
//! A prompt matcher decides when a command's output is complete by
//! locating the prompt that follows it in the accumulated plain text.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use crate::config::{PromptRule, PromptsConfig};

/// Default shell prompt: a line ending in `>`, `$` or `#`
pub const SHELL_PROMPT: &str = r"^.*[>$#]\s*$";
/// Default SFTP client prompt
pub const SFTP_PROMPT: &str = r"sftp>\s*$";
/// Reply to an SFTP `pwd`
pub const PWD_PATTERN: &str = r"(?m)^Remote working directory: (.*)$";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("invalid prompt matcher type: {0:?}")]
    InvalidPromptMatcherType(String),
    #[error("invalid prompt pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type PromptPredicate = Arc<dyn Fn(&str) -> Option<usize> + Send + Sync>;

/// How a command recognises the end of its output
#[derive(Clone)]
pub enum PromptMatcher {
    /// Tested against the last line of the trimmed text only
    Regex(Regex),
    /// Trimmed text ends with this string
    Suffix(String),
    /// Arbitrary test over the whole text, returning the match offset
    Predicate(PromptPredicate),
    /// Matches at once; the whole accumulation is the output
    MatchImmediately,
}

impl PromptMatcher {
    pub fn regex(pattern: &str) -> Result<Self, PromptError> {
        Regex::new(pattern)
            .map(PromptMatcher::Regex)
            .map_err(|source| PromptError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&str) -> Option<usize> + Send + Sync + 'static,
    {
        PromptMatcher::Predicate(Arc::new(f))
    }

    /// Build from a configured `{ kind, pattern }` rule
    pub fn from_rule(rule: &PromptRule) -> Result<Self, PromptError> {
        match rule.kind.as_str() {
            "regex" => Self::regex(&rule.pattern),
            "suffix" => Ok(PromptMatcher::Suffix(rule.pattern.clone())),
            other => Err(PromptError::InvalidPromptMatcherType(other.to_string())),
        }
    }

    /// Byte offset in `text` where the prompt starts
    pub fn find(&self, text: &str) -> Option<usize> {
        match self {
            PromptMatcher::Regex(re) => {
                let trimmed = text.trim_end();
                let (prefix_len, last_line) = match trimmed.rfind('\n') {
                    Some(pos) => (pos + 1, &trimmed[pos + 1..]),
                    None => (0, trimmed),
                };
                re.find(last_line).map(|m| prefix_len + m.start())
            }
            PromptMatcher::Suffix(suffix) => {
                let trimmed = text.trim_end();
                trimmed
                    .ends_with(suffix.as_str())
                    .then(|| trimmed.len() - suffix.len())
            }
            PromptMatcher::Predicate(f) => f(text),
            PromptMatcher::MatchImmediately => Some(text.len()),
        }
    }
}

impl fmt::Debug for PromptMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptMatcher::Regex(re) => write!(f, "Regex({})", re.as_str()),
            PromptMatcher::Suffix(s) => write!(f, "Suffix({:?})", s),
            PromptMatcher::Predicate(_) => write!(f, "Predicate"),
            PromptMatcher::MatchImmediately => write!(f, "MatchImmediately"),
        }
    }
}

/// Prompt rules in effect for a session
#[derive(Debug, Clone)]
pub struct PromptRules {
    pub shell: PromptMatcher,
    pub sftp: PromptMatcher,
    /// Extracts the directory from a `pwd` reply (first capture group)
    pub pwd: Regex,
    /// Last-line markers meaning the remote side went away
    pub end_of_session: Vec<String>,
}

impl PromptRules {
    pub fn from_config(config: &PromptsConfig) -> Result<Self, PromptError> {
        let pwd = Regex::new(&config.pwd_pattern).map_err(|source| PromptError::InvalidPattern {
            pattern: config.pwd_pattern.clone(),
            source,
        })?;
        Ok(Self {
            shell: PromptMatcher::from_rule(&config.shell)?,
            sftp: PromptMatcher::from_rule(&config.sftp)?,
            pwd,
            end_of_session: config.end_of_session.clone(),
        })
    }

    /// Matcher for the idle sentinel: fires when the last line mentions
    /// one of the end-of-session markers
    pub fn end_of_session_matcher(&self) -> PromptMatcher {
        let markers = self.end_of_session.clone();
        PromptMatcher::predicate(move |text| {
            let last_line = text.trim_end().rsplit('\n').next().unwrap_or("");
            markers
                .iter()
                .any(|m| !m.is_empty() && last_line.contains(m.as_str()))
                .then_some(text.len())
        })
    }

    /// Directory named by a `pwd` reply
    pub fn parse_pwd(&self, text: &str) -> Option<String> {
        self.pwd
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end().to_string())
    }
}

impl Default for PromptRules {
    fn default() -> Self {
        Self::from_config(&PromptsConfig::default()).expect("built-in prompt patterns are valid")
    }
}
