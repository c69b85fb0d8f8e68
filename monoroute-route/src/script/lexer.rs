//! Hand-rolled lexer for the route script grammar.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    String(String),
    Number(f64),
    Regex(String),
    Colon,
    Arrow,
    And,
    Star,
    Comma,
    LParen,
    RParen,
    Semi,
    Lt,
    Gt,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lex error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for LexError {}

/// A token together with the byte offset it started at, for error
/// reporting in the parser.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    /// Tokenize the whole input into a vector, terminated by `Token::Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, LexError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let offset = self.pos;
            let Some(c) = self.peek() else {
                out.push(Spanned { token: Token::Eof, offset });
                break;
            };
            let token = match c {
                b':' => {
                    self.bump();
                    Token::Colon
                }
                b';' => {
                    self.bump();
                    Token::Semi
                }
                b',' => {
                    self.bump();
                    Token::Comma
                }
                b'(' => {
                    self.bump();
                    Token::LParen
                }
                b')' => {
                    self.bump();
                    Token::RParen
                }
                b'*' => {
                    self.bump();
                    Token::Star
                }
                b'&' if self.peek2() == Some(b'&') => {
                    self.pos += 2;
                    Token::And
                }
                b'-' if self.peek2() == Some(b'>') => {
                    self.pos += 2;
                    Token::Arrow
                }
                b'<' => {
                    self.bump();
                    Token::Lt
                }
                b'>' => {
                    self.bump();
                    Token::Gt
                }
                b'"' => self.lex_string(offset)?,
                b'/' => self.lex_regex(offset)?,
                c if c.is_ascii_digit() || (c == b'-' && self.peek2().is_some_and(|d| d.is_ascii_digit())) => {
                    self.lex_number(offset)?
                }
                c if c.is_ascii_alphabetic() || c == b'_' => self.lex_ident(),
                other => {
                    return Err(LexError {
                        offset,
                        message: format!("unexpected byte {:?}", other as char),
                    })
                }
            };
            out.push(Spanned { token, offset });
        }
        Ok(out)
    }

    fn lex_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Token::Ident(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn lex_number(&mut self, offset: usize) -> Result<Token, LexError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == b'.' || c == b'e' || c == b'E' || c == b'+' || c == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|e| LexError { offset, message: format!("invalid number: {e}") })
    }

    fn lex_string(&mut self, offset: usize) -> Result<Token, LexError> {
        self.bump(); // opening quote
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(other) => out.push(other as char),
                    None => return Err(LexError { offset, message: "unterminated string".into() }),
                },
                Some(c) => out.push(c as char),
                None => return Err(LexError { offset, message: "unterminated string".into() }),
            }
        }
        Ok(Token::String(out))
    }

    fn lex_regex(&mut self, offset: usize) -> Result<Token, LexError> {
        self.bump(); // opening slash
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'/') => break,
                Some(b'\\') => {
                    out.push('\\');
                    match self.bump() {
                        Some(c) => out.push(c as char),
                        None => return Err(LexError { offset, message: "unterminated regex".into() }),
                    }
                }
                Some(c) => out.push(c as char),
                None => return Err(LexError { offset, message: "unterminated regex".into() }),
            }
        }
        Ok(Token::Regex(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_simple_route() {
        let tokens = Lexer::new(r#"r: Path("/x") -> "http://a";"#).tokenize().unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|s| s.token).collect();
        assert_eq!(
            kinds,
            vec![
                Token::Ident("r".into()),
                Token::Colon,
                Token::Ident("Path".into()),
                Token::LParen,
                Token::String("/x".into()),
                Token::RParen,
                Token::Arrow,
                Token::String("http://a".into()),
                Token::Semi,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn tokenizes_regex_and_comment() {
        let tokens = Lexer::new("Host(/^www\\.example\\.org$/) // trailing\n").tokenize().unwrap();
        assert_eq!(tokens[2].token, Token::Regex("^www\\.example\\.org$".into()));
    }
}
