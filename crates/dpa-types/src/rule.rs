//! Policy routing rules.

use crate::ip::IpPrefix;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a rule for diffing desired against programmed state.
///
/// Two rules with the same key are the same rule regardless of priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleKey {
    pub src: Option<IpPrefix>,
    pub fwmark: Option<u32>,
    pub table: u32,
}

/// An `ip rule` entry: `from <src> fwmark <mark>/<mark> lookup <table>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub priority: u32,
    pub src: Option<IpPrefix>,
    pub fwmark: Option<u32>,
    pub table: u32,
}

impl Rule {
    pub fn new(priority: u32) -> Self {
        Rule {
            priority,
            src: None,
            fwmark: None,
            table: 0,
        }
    }

    pub fn match_src(mut self, src: IpPrefix) -> Self {
        self.src = Some(src);
        self
    }

    pub fn match_fwmark(mut self, mark: u32) -> Self {
        self.fwmark = Some(mark);
        self
    }

    pub fn go_to_table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn key(&self) -> RuleKey {
        RuleKey {
            src: self.src,
            fwmark: self.fwmark,
            table: self.table,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.priority)?;
        match &self.src {
            Some(src) => write!(f, " from {}", src)?,
            None => f.write_str(" from all")?,
        }
        if let Some(mark) = self.fwmark {
            write!(f, " fwmark {:#x}/{:#x}", mark, mark)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builder_and_display() {
        let rule = Rule::new(100)
            .match_src("10.0.240.0/24".parse().unwrap())
            .match_fwmark(0x200)
            .go_to_table(3);
        assert_eq!(rule.to_string(), "100: from 10.0.240.0/24 fwmark 0x200/0x200 lookup 3");
    }

    #[test]
    fn test_key_ignores_priority() {
        let a = Rule::new(100).match_fwmark(0x200).go_to_table(3);
        let b = Rule::new(200).match_fwmark(0x200).go_to_table(3);
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }
}
