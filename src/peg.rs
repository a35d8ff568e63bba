//! PEG matching primitives
//!
//! Small combinator set used by the streaming tool-call parser to match
//! marker-delimited blocks in model output: literals, until-delimiter
//! scans, sequences, ordered choice, bounded repetition, and named
//! captures. Rules are plain values; parsing is a recursive walk with no
//! backtracking beyond ordered choice.
//!
//! ```
//! use fastllm_server::peg::Rule;
//!
//! let rule = Rule::seq(vec![
//!     Rule::literal("<tool_call>"),
//!     Rule::capture("json", Rule::until("</tool_call>", false)),
//!     Rule::literal("</tool_call>"),
//! ]);
//! let m = rule.parse("<tool_call>{\"name\":\"f\"}</tool_call>", 0).unwrap();
//! assert_eq!(m.captures["json"], "{\"name\":\"f\"}");
//! ```

use std::collections::HashMap;

/// A successful match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Matched text (capture groups may differ from the raw input span,
    /// e.g. `until` excludes its delimiter even when it consumes it)
    pub matched: String,
    /// Byte offset where the match began
    pub start: usize,
    /// Byte offset one past the last consumed byte
    pub end: usize,
    /// Named captures collected by [`Rule::capture`] rules
    pub captures: HashMap<String, String>,
}

impl Match {
    fn empty(pos: usize) -> Self {
        Self {
            matched: String::new(),
            start: pos,
            end: pos,
            captures: HashMap::new(),
        }
    }
}

/// A parsing rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    /// Exact literal text
    Literal(String),
    /// Literal text, ASCII case-insensitive
    LiteralNoCase(String),
    /// Everything up to a delimiter; fails if the delimiter is absent.
    /// `inclusive` controls whether the delimiter is consumed (it is never
    /// part of the matched text).
    Until {
        /// Delimiter to scan for
        delimiter: String,
        /// Consume the delimiter when true
        inclusive: bool,
    },
    /// All rules in order
    Seq(Vec<Rule>),
    /// First matching alternative
    Choice(Vec<Rule>),
    /// Zero or one occurrence
    Opt(Box<Rule>),
    /// Between `min` and `max` occurrences
    Repeat {
        /// Repeated rule
        rule: Box<Rule>,
        /// Minimum occurrences for success
        min: usize,
        /// Maximum occurrences to consume
        max: usize,
    },
    /// Tag the inner rule's matched text with a name
    Capture {
        /// Capture name
        name: String,
        /// Inner rule
        rule: Box<Rule>,
    },
    /// Any `n` characters
    AnyChar(usize),
}

impl Rule {
    /// Exact literal
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    /// ASCII case-insensitive literal
    pub fn literal_no_case(text: impl Into<String>) -> Self {
        Self::LiteralNoCase(text.into())
    }

    /// Match until `delimiter`
    pub fn until(delimiter: impl Into<String>, inclusive: bool) -> Self {
        Self::Until {
            delimiter: delimiter.into(),
            inclusive,
        }
    }

    /// Sequence of rules
    #[must_use]
    pub fn seq(rules: Vec<Rule>) -> Self {
        Self::Seq(rules)
    }

    /// Ordered choice
    #[must_use]
    pub fn choice(rules: Vec<Rule>) -> Self {
        Self::Choice(rules)
    }

    /// Optional rule
    #[must_use]
    pub fn optional(rule: Rule) -> Self {
        Self::Opt(Box::new(rule))
    }

    /// Zero or more occurrences
    #[must_use]
    pub fn zero_or_more(rule: Rule) -> Self {
        Self::Repeat {
            rule: Box::new(rule),
            min: 0,
            max: usize::MAX,
        }
    }

    /// One or more occurrences
    #[must_use]
    pub fn one_or_more(rule: Rule) -> Self {
        Self::Repeat {
            rule: Box::new(rule),
            min: 1,
            max: usize::MAX,
        }
    }

    /// Between `min` and `max` occurrences
    #[must_use]
    pub fn repeat(rule: Rule, min: usize, max: usize) -> Self {
        Self::Repeat {
            rule: Box::new(rule),
            min,
            max,
        }
    }

    /// Named capture around `rule`
    pub fn capture(name: impl Into<String>, rule: Rule) -> Self {
        Self::Capture {
            name: name.into(),
            rule: Box::new(rule),
        }
    }

    /// Any `n` characters
    #[must_use]
    pub fn any_char(count: usize) -> Self {
        Self::AnyChar(count)
    }

    /// Try to match this rule at byte offset `pos`
    #[must_use]
    pub fn parse(&self, input: &str, pos: usize) -> Option<Match> {
        match self {
            Self::Literal(text) => {
                let end = pos.checked_add(text.len())?;
                if input.get(pos..end)? == text {
                    Some(Match {
                        matched: text.clone(),
                        start: pos,
                        end,
                        captures: HashMap::new(),
                    })
                } else {
                    None
                }
            }
            Self::LiteralNoCase(text) => {
                let end = pos.checked_add(text.len())?;
                let slice = input.get(pos..end)?;
                if slice.eq_ignore_ascii_case(text) {
                    Some(Match {
                        matched: slice.to_string(),
                        start: pos,
                        end,
                        captures: HashMap::new(),
                    })
                } else {
                    None
                }
            }
            Self::Until {
                delimiter,
                inclusive,
            } => {
                let rest = input.get(pos..)?;
                let found = rest.find(delimiter.as_str())?;
                Some(Match {
                    matched: rest[..found].to_string(),
                    start: pos,
                    end: pos + found + if *inclusive { delimiter.len() } else { 0 },
                    captures: HashMap::new(),
                })
            }
            Self::Seq(rules) => {
                let mut m = Match::empty(pos);
                for rule in rules {
                    let r = rule.parse(input, m.end)?;
                    m.matched.push_str(&r.matched);
                    m.end = r.end;
                    m.captures.extend(r.captures);
                }
                Some(m)
            }
            Self::Choice(rules) => rules.iter().find_map(|rule| rule.parse(input, pos)),
            Self::Opt(rule) => Some(rule.parse(input, pos).unwrap_or_else(|| Match::empty(pos))),
            Self::Repeat { rule, min, max } => {
                let mut m = Match::empty(pos);
                let mut count = 0;
                while count < *max {
                    match rule.parse(input, m.end) {
                        // Zero-width matches would loop forever.
                        Some(r) if r.end > m.end => {
                            m.matched.push_str(&r.matched);
                            m.end = r.end;
                            m.captures.extend(r.captures);
                            count += 1;
                        }
                        _ => break,
                    }
                }
                (count >= *min).then_some(m)
            }
            Self::Capture { name, rule } => {
                let mut m = rule.parse(input, pos)?;
                m.captures.insert(name.clone(), m.matched.clone());
                Some(m)
            }
            Self::AnyChar(count) => {
                let rest = input.get(pos..)?;
                let mut end = pos;
                let mut taken = 0;
                for (idx, c) in rest.char_indices() {
                    if taken == *count {
                        break;
                    }
                    end = pos + idx + c.len_utf8();
                    taken += 1;
                }
                (taken == *count).then(|| Match {
                    matched: input[pos..end].to_string(),
                    start: pos,
                    end,
                    captures: HashMap::new(),
                })
            }
        }
    }

    /// All non-overlapping matches, scanning forward one character at a
    /// time past positions where the rule does not apply
    #[must_use]
    pub fn parse_all(&self, input: &str) -> Vec<Match> {
        let mut results = Vec::new();
        let mut pos = 0;
        while pos < input.len() {
            match self.parse(input, pos) {
                Some(m) if m.end > pos => {
                    pos = m.end;
                    results.push(m);
                }
                _ => {
                    pos += input[pos..]
                        .chars()
                        .next()
                        .map_or(1, char::len_utf8);
                }
            }
        }
        results
    }
}
