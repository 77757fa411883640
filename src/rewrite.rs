use regex::Regex;
use serde::Deserialize;

use crate::error::ScanRelayError;

/// A single path rewrite rule: a regex to match and a replacement template.
/// Capture groups are referenced in `to` as `$1`, `$2`, ...
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

/// An ordered list of compiled rewrite rules. The first matching rule wins;
/// input that matches no rule passes through unchanged.
#[derive(Clone, Debug)]
pub struct Rewriter {
    rules: Vec<(Regex, String)>,
}

impl Rewriter {
    pub fn new(rules: &[RewriteRule]) -> Result<Self, ScanRelayError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let re = Regex::new(&rule.from)?;
            compiled.push((re, rule.to.clone()));
        }

        Ok(Self { rules: compiled })
    }

    pub fn rewrite(&self, input: &str) -> String {
        for (re, to) in &self.rules {
            if re.is_match(input) {
                return re.replace_all(input, to.as_str()).into_owned();
            }
        }

        input.to_string()
    }
}
