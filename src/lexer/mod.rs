//! Tokenizer and classifier for Katalyn source text.
//!
//! Tokenization is a stateful character scan (string mode, `{}` access-string
//! mode, nested `(* *)` comments, `#` line comments), so it is hand-rolled
//! rather than table-driven. The classifier then assigns a [`LexKind`] to
//! every raw token and rejects malformed literals.

/// Operators ordered tightest-binding first. The expression compiler uses the
/// index in this table as the precedence rank.
pub const OPERATOR_PRECEDENCE: &[&str] = &[
    "*", "^", "/", "%", "//", "+", "&", "-", "!", "<", ">", "<=", ">=", "<>", "!=", "=", "::",
    "&&", "||",
];

/// Two-character operators, matched greedily before single glyphs.
const BIGLYPHS: &[&str] = &[">=", "<=", "<>", "!=", "//", "&&", "||", "::"];

/// Single-character glyphs that always stand alone as tokens.
const GLYPHS: &str = "(){}[]=<>!+-/&%^*:,";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LexKind {
    Word,
    Integer,
    Float,
    StringLit,
    Operator,
    Variable,
    TableKw,
    ParOpen,
    ParClose,
    AccessOpen,
    AccessClose,
    Decoration,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub text: String,
    pub line: u32,
    pub file: String,
    pub kind: LexKind,
}

impl Token {
    fn new(text: impl Into<String>, line: u32, file: &str) -> Self {
        Token { text: text.into(), line, file: file.to_string(), kind: LexKind::Unknown }
    }

    /// The variable slot this token resolves to (the name without `$`).
    pub fn var_name(&self) -> &str {
        debug_assert_eq!(self.kind, LexKind::Variable);
        &self.text[1..]
    }

    /// Escapes this token's text so it can be embedded in a quoted Nambly
    /// operand.
    pub fn nambly_string(&self) -> String {
        escape_nambly(&self.text)
    }
}

/// Escapes a string for a double-quoted Nambly operand. The backslash must be
/// handled first so later escapes are not doubled up.
pub fn escape_nambly(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum LexError {
    #[error("Tokenization error in '{file}', line {line}: open string, missing '\"'")]
    OpenString { file: String, line: u32 },
    #[error("Tokenization error in '{file}', line {line}: open access string, missing '}}'")]
    OpenAccessString { file: String, line: u32 },
    #[error("Tokenization error in '{file}', line {line}: missing ';'")]
    MissingSemicolon { file: String, line: u32 },
    #[error("Lexing error in '{file}', line {line}: '{token}' is not a valid variable name")]
    InvalidVariable { token: String, file: String, line: u32 },
    #[error("Lexing error in '{file}', line {line}: '{token}' is not a valid number")]
    InvalidNumber { token: String, file: String, line: u32 },
    #[error("Lexing error in '{file}', line {line}: '{token}' is not a valid identifier")]
    InvalidIdentifier { token: String, file: String, line: u32 },
}

/// Splits source text into statement-lines of raw tokens. Statement
/// boundaries are `;`. String tokens keep their surrounding quotes so the
/// classifier can tell `"5"` apart from `5`.
pub fn tokenize_source(code: &str, filename: &str) -> Result<Vec<Vec<Token>>, LexError> {
    let chars: Vec<char> = code.chars().chain(std::iter::once(' ')).collect();
    let mut lines: Vec<Vec<Token>> = Vec::new();
    let mut current_line: Vec<Token> = Vec::new();
    let mut current_token = String::new();
    let mut line_num: u32 = 1;
    let mut last_string_open_line: u32 = 1;
    let mut in_string = false;
    let mut in_access_string = false;
    let mut comment_depth: usize = 0;
    let mut in_line_comment = false;

    let flush = |token: &mut String, line: &mut Vec<Token>, at: u32| {
        if !token.is_empty() {
            line.push(Token::new(std::mem::take(token), at, filename));
        }
    };

    let mut i = 0;
    while i < chars.len() - 1 {
        let cur = chars[i];
        let next = chars[i + 1];
        let in_text = in_string || in_access_string;

        if in_line_comment {
            if cur == '\n' {
                in_line_comment = false;
            }
        } else if !in_text && cur == '(' && next == '*' {
            comment_depth += 1;
            i += 1;
        } else if comment_depth > 0 && !in_text && cur == '*' && next == ')' {
            comment_depth -= 1;
            i += 1;
        } else if comment_depth > 0 {
            // Swallowed by the block comment.
        } else if in_text && cur == '\\' {
            // Escape handling must run before the quote and brace matchers.
            if next == 'n' {
                current_token.push('\n');
                i += 1;
            } else if next == 't' {
                current_token.push('\t');
                i += 1;
            } else if next == '"' {
                current_token.push('"');
                i += 1;
            } else if next.is_whitespace() {
                // Line continuation: swallow the backslash and all whitespace
                // up to the next non-space character.
                let mut idx = i + 1;
                while idx < chars.len() && chars[idx].is_whitespace() {
                    if chars[idx] == '\n' {
                        line_num += 1;
                    }
                    idx += 1;
                }
                i = idx;
                continue;
            } else {
                current_token.push(next);
                i += 1;
            }
        } else if !in_text && cur == '#' {
            flush(&mut current_token, &mut current_line, line_num);
            in_line_comment = true;
        } else if !in_text && cur == '"' {
            flush(&mut current_token, &mut current_line, line_num);
            current_token.push('"');
            in_string = true;
            last_string_open_line = line_num;
        } else if in_string && cur == '"' {
            current_token.push('"');
            in_string = false;
            current_line.push(Token::new(
                std::mem::take(&mut current_token),
                last_string_open_line,
                filename,
            ));
        } else if !in_text && cur == '{' {
            // `{expr}` is sugar for `[ "expr" ]`.
            flush(&mut current_token, &mut current_line, line_num);
            current_line.push(Token::new("[", line_num, filename));
            current_token.push('"');
            in_access_string = true;
            last_string_open_line = line_num;
        } else if in_access_string && cur == '}' {
            current_token.push('"');
            in_access_string = false;
            current_line.push(Token::new(
                std::mem::take(&mut current_token),
                last_string_open_line,
                filename,
            ));
            current_line.push(Token::new("]", line_num, filename));
        } else if !in_text && cur == ';' {
            flush(&mut current_token, &mut current_line, line_num);
            if !current_line.is_empty() {
                lines.push(std::mem::take(&mut current_line));
            }
        } else if !in_text && is_biglyph(cur, next) {
            flush(&mut current_token, &mut current_line, line_num);
            current_line.push(Token::new(format!("{cur}{next}"), line_num, filename));
            i += 1;
        } else if !in_text && GLYPHS.contains(cur) {
            flush(&mut current_token, &mut current_line, line_num);
            current_line.push(Token::new(cur, line_num, filename));
        } else if !in_text && cur.is_whitespace() {
            flush(&mut current_token, &mut current_line, line_num);
        } else {
            current_token.push(cur);
        }

        if cur == '\n' {
            line_num += 1;
        }
        i += 1;
    }

    // Block comments may run to the end of the file; everything else must be
    // closed.
    if in_string {
        return Err(LexError::OpenString {
            file: filename.to_string(),
            line: last_string_open_line,
        });
    }
    if in_access_string {
        return Err(LexError::OpenAccessString {
            file: filename.to_string(),
            line: last_string_open_line,
        });
    }
    if let Some(last) = current_line.last() {
        return Err(LexError::MissingSemicolon { file: filename.to_string(), line: last.line });
    }
    if !current_token.is_empty() {
        return Err(LexError::MissingSemicolon { file: filename.to_string(), line: line_num });
    }
    Ok(lines)
}

fn is_biglyph(a: char, b: char) -> bool {
    let mut s = String::with_capacity(2);
    s.push(a);
    s.push(b);
    BIGLYPHS.contains(&s.as_str())
}

fn is_integer(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit())
}

fn is_float(text: &str) -> bool {
    if text.is_empty() || text.starts_with('.') || text.ends_with('.') {
        return false;
    }
    let mut found_point = false;
    for c in text.chars() {
        if c == '.' {
            if found_point {
                return false;
            }
            found_point = true;
        } else if !c.is_ascii_digit() {
            return false;
        }
    }
    found_point
}

fn is_valid_variable(text: &str) -> bool {
    text.len() >= 2
        && text.starts_with('$')
        && text[1..].chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_valid_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_almost_number(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Assigns a [`LexKind`] to every raw token and rejects anything that matches
/// no form. String tokens lose their surrounding quotes here.
pub fn classify_tokens(lines: &mut [Vec<Token>]) -> Result<(), LexError> {
    for line in lines.iter_mut() {
        for token in line.iter_mut() {
            token.kind = classify(token)?;
            if token.kind == LexKind::StringLit {
                token.text = token.text[1..token.text.len() - 1].to_string();
            }
        }
    }
    Ok(())
}

fn classify(token: &Token) -> Result<LexKind, LexError> {
    let text = token.text.as_str();
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Ok(LexKind::StringLit);
    }
    if is_valid_variable(text) {
        return Ok(LexKind::Variable);
    }
    Ok(match text {
        "(" => LexKind::ParOpen,
        ")" => LexKind::ParClose,
        "[" => LexKind::AccessOpen,
        "]" => LexKind::AccessClose,
        ":" | "," => LexKind::Decoration,
        "table" => LexKind::TableKw,
        _ if is_integer(text) => LexKind::Integer,
        _ if is_float(text) => LexKind::Float,
        _ if OPERATOR_PRECEDENCE.contains(&text) => LexKind::Operator,
        _ if is_valid_identifier(text) => LexKind::Word,
        _ => {
            return Err(if text.starts_with('$') {
                LexError::InvalidVariable {
                    token: text.to_string(),
                    file: token.file.clone(),
                    line: token.line,
                }
            } else if is_almost_number(text) {
                LexError::InvalidNumber {
                    token: text.to_string(),
                    file: token.file.clone(),
                    line: token.line,
                }
            } else {
                LexError::InvalidIdentifier {
                    token: text.to_string(),
                    file: token.file.clone(),
                    line: token.line,
                }
            });
        }
    })
}

/// Tokenize and classify in one step.
pub fn lex(code: &str, filename: &str) -> Result<Vec<Vec<Token>>, LexError> {
    let mut lines = tokenize_source(code, filename)?;
    classify_tokens(&mut lines)?;
    Ok(lines)
}
