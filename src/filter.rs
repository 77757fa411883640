use regex::Regex;

use crate::error::ScanRelayError;

/// Include/exclude admission filter over path strings.
///
/// A path is admitted iff no exclude pattern matches and either no include
/// patterns exist or at least one include matches.
#[derive(Clone, Debug)]
pub struct Filter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl Filter {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, ScanRelayError> {
        let mut inc = Vec::with_capacity(includes.len());
        for pattern in includes {
            inc.push(Regex::new(pattern)?);
        }

        let mut exc = Vec::with_capacity(excludes.len());
        for pattern in excludes {
            exc.push(Regex::new(pattern)?);
        }

        Ok(Self {
            includes: inc,
            excludes: exc,
        })
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(path)) {
            return false;
        }

        if self.includes.is_empty() {
            return true;
        }

        self.includes.iter().any(|re| re.is_match(path))
    }
}
