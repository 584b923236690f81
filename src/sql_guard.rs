//! Single-SELECT validation
//!
//! SQL reaching the store may come from an LLM, so it is treated as
//! adversarial input. A small lexer (aware of string literals and quoted
//! identifiers) accepts exactly one read-only `SELECT` statement.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlViolation {
    #[error("statement is empty")]
    Empty,

    #[error("comments are not allowed")]
    Comment,

    #[error("unterminated string literal or quoted identifier")]
    UnterminatedLiteral,

    #[error("only a single statement is allowed")]
    MultipleStatements,

    #[error("only SELECT statements are allowed, found {0}")]
    NotSelect(String),

    #[error("forbidden keyword {0}")]
    ForbiddenKeyword(String),
}

/// Keywords that must never appear outside literals
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "UPSERT", "MERGE",
    "DROP", "CREATE", "ALTER", "TRUNCATE", "RENAME",
    "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE",
    "BEGIN", "COMMIT", "ROLLBACK", "SAVEPOINT", "RELEASE", "TRANSACTION",
    "GRANT", "REVOKE", "EXEC", "EXECUTE", "CALL", "COPY", "INTO",
    "LOAD_EXTENSION", "READFILE", "WRITEFILE",
];

/// Forbidden as statements but legitimate as scalar functions
const FUNCTION_EXCEPTIONS: &[&str] = &["REPLACE"];

#[derive(Debug, PartialEq, Eq)]
enum Token {
    Word(String),
    Semicolon,
    Other,
}

/// Validate `sql` and return it trimmed, without a trailing semicolon
pub fn validate_single_select(sql: &str) -> Result<String, SqlViolation> {
    let tokens = tokenize(sql)?;

    if !tokens.iter().any(|(t, _)| *t != Token::Semicolon) {
        return Err(SqlViolation::Empty);
    }

    // At most one semicolon, and only as the final token
    let semicolons: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, (t, _))| *t == Token::Semicolon)
        .map(|(i, _)| i)
        .collect();
    match semicolons.as_slice() {
        [] => {}
        [last] if *last == tokens.len() - 1 => {}
        _ => return Err(SqlViolation::MultipleStatements),
    }

    let first_word = match tokens.first() {
        Some((Token::Word(w), _)) => w.clone(),
        _ => return Err(SqlViolation::NotSelect("non-keyword".to_string())),
    };
    if first_word != "SELECT" && first_word != "WITH" {
        return Err(SqlViolation::NotSelect(first_word));
    }

    let mut saw_select = false;
    for (i, (token, _)) in tokens.iter().enumerate() {
        let Token::Word(word) = token else {
            continue;
        };
        if word == "SELECT" {
            saw_select = true;
        }
        if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
            let is_call = tokens.get(i + 1).map_or(false, |(_, c)| *c == Some('('));
            if !(is_call && FUNCTION_EXCEPTIONS.contains(&word.as_str())) {
                return Err(SqlViolation::ForbiddenKeyword(word.clone()));
            }
        }
    }
    if !saw_select {
        return Err(SqlViolation::NotSelect(first_word));
    }

    Ok(sql.trim().trim_end_matches(';').trim_end().to_string())
}

/// Tokens paired with the first non-whitespace char that follows them
fn tokenize(sql: &str) -> Result<Vec<(Token, Option<char>)>, SqlViolation> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens: Vec<(Token, usize)> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let token = match c {
            '-' if chars.get(i + 1) == Some(&'-') => return Err(SqlViolation::Comment),
            '/' if chars.get(i + 1) == Some(&'*') => return Err(SqlViolation::Comment),
            '#' => return Err(SqlViolation::Comment),
            ';' => {
                i += 1;
                Token::Semicolon
            }
            '\'' | '"' | '`' | '[' => {
                let close = if c == '[' { ']' } else { c };
                i = skip_quoted(&chars, i + 1, close)?;
                Token::Other
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                Token::Word(word.to_uppercase())
            }
            _ => {
                i += 1;
                Token::Other
            }
        };
        tokens.push((token, i));
    }

    Ok(tokens
        .into_iter()
        .map(|(token, end)| {
            let follower = chars[end..].iter().copied().find(|c| !c.is_whitespace());
            (token, follower)
        })
        .collect())
}

/// Returns the index just past the closing quote; doubled quotes are escapes
fn skip_quoted(chars: &[char], mut i: usize, close: char) -> Result<usize, SqlViolation> {
    while i < chars.len() {
        if chars[i] == close {
            if close != ']' && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(SqlViolation::UnterminatedLiteral)
}
