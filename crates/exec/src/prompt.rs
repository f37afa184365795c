use crate::Result;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptResponse {
    /// Write this line to the child's stdin.
    Reply(String),
    /// Terminate the child; the prompt cannot be answered programmatically.
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct PromptRule {
    pattern: Regex,
    response: PromptResponse,
}

impl PromptRule {
    pub fn new(pattern: &str, response: PromptResponse) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            response,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    pub fn response(&self) -> &PromptResponse {
        &self.response
    }
}

/// Ordered pattern → response table. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct ResponseTable {
    rules: Vec<PromptRule>,
}

impl ResponseTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, pattern: &str, answer: &str) -> Result<Self> {
        self.rule(PromptRule::new(
            pattern,
            PromptResponse::Reply(answer.to_string()),
        )?)
    }

    pub fn fail(self, pattern: &str, reason: &str) -> Result<Self> {
        self.rule(PromptRule::new(
            pattern,
            PromptResponse::Fail(reason.to_string()),
        )?)
    }

    pub fn rule(mut self, rule: PromptRule) -> Result<Self> {
        self.rules.push(rule);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn respond(&self, text: &str) -> Option<&PromptResponse> {
        self.rules
            .iter()
            .find(|rule| rule.matches(text))
            .map(PromptRule::response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_rule_wins() {
        let table = ResponseTable::new()
            .reply(r"\(y/N\)\?", "n")
            .unwrap()
            .fail(r"\?", "unexpected question")
            .unwrap();
        assert_eq!(
            table.respond("allow setting 'substituters'? (y/N)?"),
            Some(&PromptResponse::Reply("n".into()))
        );
        assert_eq!(
            table.respond("Username for 'https://github.com'?"),
            Some(&PromptResponse::Fail("unexpected question".into()))
        );
        assert_eq!(table.respond("building '/nix/store/x.drv'"), None);
    }

    #[test]
    fn invalid_patterns_are_reported() {
        assert!(ResponseTable::new().reply("(", "n").is_err());
    }
}
