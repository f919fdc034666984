//! Transition conditions

use std::fmt;
use std::rc::Rc;

use regex::Regex;

pub type PredicateFn = Rc<dyn Fn(Option<&str>) -> bool>;

/// Test applied to an input symbol's text
#[derive(Clone)]
pub enum Condition {
    /// Epsilon: taken without input, lowest priority
    Always,
    /// Text contains the substring (the empty string matches any text)
    Contains(String),
    Pattern(Regex),
    /// Every condition holds
    All(Vec<Condition>),
    Predicate {
        name: String,
        test: PredicateFn,
        consumes: bool,
    },
}

impl Condition {
    /// Non-consuming predicate; `name` identifies it among a state's
    /// transitions
    pub fn predicate<F>(name: &str, test: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + 'static,
    {
        Condition::Predicate {
            name: name.to_string(),
            test: Rc::new(test),
            consumes: false,
        }
    }

    pub fn consuming_predicate<F>(name: &str, test: F) -> Self
    where
        F: Fn(Option<&str>) -> bool + 'static,
    {
        Condition::Predicate {
            name: name.to_string(),
            test: Rc::new(test),
            consumes: true,
        }
    }

    pub fn is_epsilon(&self) -> bool {
        matches!(self, Condition::Always)
    }

    /// Taking the transition uses up the symbol
    pub fn consumes(&self) -> bool {
        match self {
            Condition::Always => false,
            Condition::Contains(_) | Condition::Pattern(_) => true,
            Condition::All(conditions) => conditions.iter().any(Condition::consumes),
            Condition::Predicate { consumes, .. } => *consumes,
        }
    }

    pub fn matches(&self, text: Option<&str>) -> bool {
        match self {
            Condition::Always => true,
            Condition::All(conditions) => conditions.iter().all(|c| c.matches(text)),
            Condition::Predicate { test, .. } => test(text),
            Condition::Contains(needle) => text.is_some_and(|t| t.contains(needle.as_str())),
            Condition::Pattern(re) => text.is_some_and(|t| re.is_match(t)),
        }
    }

    /// Identity used to detect duplicate transitions
    pub fn key(&self) -> String {
        match self {
            Condition::Always => "null".to_string(),
            Condition::Contains(needle) => needle.clone(),
            Condition::Pattern(re) => format!("/{}/", re.as_str()),
            Condition::All(conditions) => conditions
                .iter()
                .map(Condition::key)
                .collect::<Vec<_>>()
                .join(","),
            Condition::Predicate { name, .. } => format!("fn:{}", name),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.key())
    }
}

impl From<&str> for Condition {
    fn from(needle: &str) -> Self {
        Condition::Contains(needle.to_string())
    }
}

impl From<String> for Condition {
    fn from(needle: String) -> Self {
        Condition::Contains(needle)
    }
}

impl From<Regex> for Condition {
    fn from(re: Regex) -> Self {
        Condition::Pattern(re)
    }
}

impl From<Vec<Condition>> for Condition {
    fn from(conditions: Vec<Condition>) -> Self {
        Condition::All(conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching() {
        assert!(Condition::from("ok").matches(Some("it is ok")));
        assert!(!Condition::from("ok").matches(None));
        assert!(Condition::from("").matches(Some("")));
        let re = Regex::new(r"\d+ files").unwrap();
        assert!(Condition::from(re).matches(Some("3 files")));
        let both = Condition::from(vec!["a".into(), "b".into()]);
        assert!(both.matches(Some("ab")));
        assert!(!both.matches(Some("a")));
        assert!(Condition::Always.matches(None));
    }

    #[test]
    fn test_consumption() {
        assert!(!Condition::Always.consumes());
        assert!(Condition::from("x").consumes());
        assert!(!Condition::predicate("p", |_| true).consumes());
        assert!(Condition::consuming_predicate("p", |_| true).consumes());
        let mixed = Condition::All(vec![Condition::predicate("p", |_| true), "x".into()]);
        assert!(mixed.consumes());
    }

    #[test]
    fn test_keys() {
        assert_eq!(Condition::Always.key(), "null");
        assert_eq!(Condition::from("abc").key(), "abc");
        assert_eq!(
            Condition::from(Regex::new("a+").unwrap()).key(),
            "/a+/"
        );
        assert_eq!(Condition::predicate("ready", |_| true).key(), "fn:ready");
    }
}
