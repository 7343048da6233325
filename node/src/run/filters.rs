//! Collection-name patterns that scope each query.

use eyre::{Result, WrapErr};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryScope {
    /// One query matching every collection.
    All,
    /// One query per leading letter and digit, keeping each result tree small.
    Selective,
    /// One query per non-blank line of a file; `#` starts a comment.
    PatternFile(PathBuf),
}

impl QueryScope {
    pub fn patterns(&self) -> Result<Vec<String>> {
        match self {
            QueryScope::All => Ok(vec!["*".to_string()]),
            QueryScope::Selective => Ok(('A'..='Z')
                .chain('0'..='9')
                .map(|lead| format!("{lead}*"))
                .collect()),
            QueryScope::PatternFile(path) => {
                let text = fs::read_to_string(path)
                    .wrap_err_with(|| format!("failed to read pattern file {}", path.display()))?;
                Ok(parse_patterns(&text))
            }
        }
    }
}

fn parse_patterns(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
