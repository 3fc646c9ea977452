//! Query DSL lexer
//!
//! Converts query text into tokens, each tagged with the byte offset it
//! starts at so that syntax errors can point into the original text.

use super::token::{Spanned, Token};
use crate::error::{Error, Result};

/// Query lexer
pub struct Lexer {
    /// Input characters with their byte offsets
    input: Vec<(usize, char)>,
    /// Byte length of the input
    len: usize,
    /// Current index into `input`
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.char_indices().collect(),
            len: input.len(),
            position: 0,
        }
    }

    /// Tokenize the entire input; the last token is always `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    /// Get the next token from the input
    pub fn next_token(&mut self) -> Result<Spanned> {
        self.skip_whitespace_and_comments();

        let position = self.offset();
        if self.is_at_end() {
            return Ok(Spanned {
                token: Token::Eof,
                position,
            });
        }

        let token = self.read_token()?;
        Ok(Spanned { token, position })
    }

    fn read_token(&mut self) -> Result<Token> {
        let ch = self.current_char();

        let single = match ch {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            ',' => Some(Token::Comma),
            ';' => Some(Token::Semicolon),
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '=' => Some(Token::Eq),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        match ch {
            '<' => {
                self.advance();
                match self.peek_current() {
                    Some('=') => {
                        self.advance();
                        Ok(Token::LtEq)
                    }
                    Some('>') => {
                        self.advance();
                        Ok(Token::NotEq)
                    }
                    _ => Ok(Token::Lt),
                }
            }
            '>' => {
                self.advance();
                if self.peek_current() == Some('=') {
                    self.advance();
                    return Ok(Token::GtEq);
                }
                Ok(Token::Gt)
            }
            '!' => {
                let start = self.offset();
                self.advance();
                if self.peek_current() == Some('=') {
                    self.advance();
                    return Ok(Token::NotEq);
                }
                Err(syntax(start, "'!='", "'!'"))
            }
            '\'' => self.read_string(),
            '"' => self.read_quoted_identifier(),
            c if c.is_ascii_digit() => self.read_number(),
            c if c.is_alphabetic() || c == '_' => Ok(self.read_identifier()),
            other => Err(syntax(self.offset(), "a token", &format!("'{}'", other))),
        }
    }

    fn is_at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn current_char(&self) -> char {
        self.input[self.position].1
    }

    fn peek_current(&self) -> Option<char> {
        self.input.get(self.position).map(|(_, c)| *c)
    }

    fn peek_char(&self) -> Option<char> {
        self.input.get(self.position + 1).map(|(_, c)| *c)
    }

    /// Byte offset of the current character
    fn offset(&self) -> usize {
        self.input.get(self.position).map_or(self.len, |(o, _)| *o)
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    /// Skip whitespace, `--` line comments and `/* */` block comments
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while !self.is_at_end() && self.current_char().is_whitespace() {
                self.advance();
            }
            match (self.peek_current(), self.peek_char()) {
                (Some('-'), Some('-')) => {
                    while !self.is_at_end() && self.current_char() != '\n' {
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    while !self.is_at_end() {
                        if self.current_char() == '*' && self.peek_char() == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    /// Read a single-quoted string; `''` is an escaped quote
    fn read_string(&mut self) -> Result<Token> {
        self.read_quoted('\'').map(Token::Text)
    }

    /// Read a double-quoted identifier; never a keyword
    fn read_quoted_identifier(&mut self) -> Result<Token> {
        self.read_quoted('"').map(Token::Identifier)
    }

    fn read_quoted(&mut self, quote: char) -> Result<String> {
        self.advance(); // opening quote
        let mut value = String::new();

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch == quote {
                if self.peek_char() == Some(quote) {
                    value.push(quote);
                    self.advance();
                    self.advance();
                } else {
                    self.advance();
                    return Ok(value);
                }
            } else {
                value.push(ch);
                self.advance();
            }
        }

        Err(syntax(self.len, &format!("closing {}", quote), "end of input"))
    }

    /// Read an integer or float literal
    fn read_number(&mut self) -> Result<Token> {
        let start = self.offset();
        let mut value = String::new();
        let mut is_float = false;

        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_ascii_digit() {
                value.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && self.peek_char().is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                value.push(ch);
                self.advance();
            } else if ch == 'e' || ch == 'E' {
                is_float = true;
                value.push(ch);
                self.advance();
                if let Some(sign @ ('+' | '-')) = self.peek_current() {
                    value.push(sign);
                    self.advance();
                }
            } else {
                break;
            }
        }

        if is_float {
            value
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| syntax(start, "a number", &value))
        } else {
            value
                .parse::<i64>()
                .map(Token::Integer)
                .map_err(|_| syntax(start, "an int64 literal", &value))
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut value = String::new();
        while !self.is_at_end() {
            let ch = self.current_char();
            if ch.is_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        Token::from_keyword(&value).unwrap_or(Token::Identifier(value))
    }
}

fn syntax(position: usize, expected: &str, found: &str) -> Error {
    Error::Syntax {
        position,
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_simple_query() {
        assert_eq!(
            tokens("select id from events where id >= 10"),
            vec![
                Token::Select,
                Token::Identifier("id".into()),
                Token::From,
                Token::Identifier("events".into()),
                Token::Where,
                Token::Identifier("id".into()),
                Token::GtEq,
                Token::Integer(10),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_positions_are_byte_offsets() {
        let spanned = Lexer::new("select 'é', x").tokenize().unwrap();
        let positions: Vec<usize> = spanned.iter().map(|s| s.position).collect();
        // 'é' is two bytes, so the comma starts at byte 11
        assert_eq!(positions, vec![0, 7, 11, 13, 14]);
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            tokens("1 2.5 1e3 'it''s' \"order\""),
            vec![
                Token::Integer(1),
                Token::Float(2.5),
                Token::Float(1000.0),
                Token::Text("it's".into()),
                Token::Identifier("order".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_minus_is_always_an_operator() {
        assert_eq!(
            tokens("a-1"),
            vec![
                Token::Identifier("a".into()),
                Token::Minus,
                Token::Integer(1),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            tokens("-- leading\nselect /* inline */ *"),
            vec![Token::Select, Token::Star, Token::Eof]
        );
    }

    #[test]
    fn test_errors_carry_position() {
        match Lexer::new("select #").tokenize() {
            Err(Error::Syntax { position, .. }) => assert_eq!(position, 7),
            other => panic!("unexpected {:?}", other),
        }
        match Lexer::new("select 'open").tokenize() {
            Err(Error::Syntax {
                position, found, ..
            }) => {
                assert_eq!(position, 12);
                assert_eq!(found, "end of input");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Lexer::new("99999999999999999999").tokenize().is_err());
    }
}
