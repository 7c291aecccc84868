use crate::error::{Error, Result};
use regex::Regex;

fn compile(expr: &str) -> Result<Regex> {
    Regex::new(&format!("(?i:{expr})"))
        .map_err(|e| Error::Config(format!("invalid test pattern {expr:?}: {e}")))
}

#[derive(Clone, Debug)]
pub struct TestMatcher {
    pub suite: Regex,
    pub test: Regex,
    pub pattern: String,
}

impl TestMatcher {
    /// Compiles a `suite/test` pattern. Both halves match case-insensitively
    /// and an absent test half matches every test.
    pub fn new(pattern: &str) -> Result<Self> {
        let parts = Self::split_regexp(pattern);
        let suite = compile(parts[0])?;
        let test = if parts.len() > 1 {
            compile(&parts[1..].join("/"))?
        } else {
            Regex::new("").map_err(|e| Error::Config(e.to_string()))?
        };
        Ok(Self {
            suite,
            test,
            pattern: pattern.to_string(),
        })
    }

    pub fn match_suite(&self, suite: &str) -> bool {
        self.suite.is_match(suite)
    }

    pub fn match_test(&self, suite: &str, test: &str) -> bool {
        if !self.suite.is_match(suite) {
            return false;
        }

        if !test.is_empty() && !self.test.is_match(test) {
            return false;
        }

        true
    }

    /// Splits the pattern into /-separated parts, ignoring slashes inside
    /// brackets, groups and escapes.
    fn split_regexp(pattern: &str) -> Vec<&str> {
        let mut pattern = pattern;
        let mut parts = Vec::with_capacity(pattern.matches('/').count() + 1);
        let mut square_bracket_counter = 0;
        let mut parenthesis_counter = 0;
        let mut index = 0;
        while index < pattern.len() {
            match pattern.as_bytes()[index] {
                b'[' => square_bracket_counter += 1,
                b']' => {
                    if square_bracket_counter > 0 {
                        square_bracket_counter -= 1;
                    }
                }
                b'(' => {
                    if square_bracket_counter == 0 {
                        parenthesis_counter += 1;
                    }
                }
                b')' => {
                    if square_bracket_counter == 0 && parenthesis_counter > 0 {
                        parenthesis_counter -= 1;
                    }
                }
                b'\\' => {
                    index += 1;
                }
                b'/' => {
                    if square_bracket_counter == 0 && parenthesis_counter == 0 {
                        parts.push(&pattern[..index]);
                        pattern = &pattern[index + 1..];
                        index = 0;
                        continue;
                    }
                }
                _ => {}
            }
            index += 1;
        }
        parts.push(pattern);
        parts
    }
}
