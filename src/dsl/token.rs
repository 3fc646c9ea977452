//! Tokens of the query language

use std::fmt;

use super::ast::AggregateFunc;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // ========== Keywords ==========
    Select,
    From,
    Where,
    As,
    And,
    Or,
    Not,
    Is,
    In,
    Between,
    Group,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    Offset,
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Null,
    True,
    False,

    // ========== Values ==========
    Integer(i64),
    Float(f64),
    /// Single-quoted, with `''` already unescaped
    Text(String),
    Identifier(String),

    // ========== Symbols ==========
    Eq,
    /// `<>` or `!=`
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Semicolon,

    Eof,
}

const KEYWORDS: [Token; 25] = [
    Token::Select,
    Token::From,
    Token::Where,
    Token::As,
    Token::And,
    Token::Or,
    Token::Not,
    Token::Is,
    Token::In,
    Token::Between,
    Token::Group,
    Token::Order,
    Token::By,
    Token::Asc,
    Token::Desc,
    Token::Limit,
    Token::Offset,
    Token::Count,
    Token::Sum,
    Token::Avg,
    Token::Min,
    Token::Max,
    Token::Null,
    Token::True,
    Token::False,
];

impl Token {
    /// Keyword for a word, ignoring case
    pub fn from_keyword(word: &str) -> Option<Token> {
        KEYWORDS
            .iter()
            .find(|k| k.text().is_some_and(|t| t.eq_ignore_ascii_case(word)))
            .cloned()
    }

    /// Fixed spelling of keywords and symbols; None for value tokens
    fn text(&self) -> Option<&'static str> {
        let text = match self {
            Token::Select => "SELECT",
            Token::From => "FROM",
            Token::Where => "WHERE",
            Token::As => "AS",
            Token::And => "AND",
            Token::Or => "OR",
            Token::Not => "NOT",
            Token::Is => "IS",
            Token::In => "IN",
            Token::Between => "BETWEEN",
            Token::Group => "GROUP",
            Token::Order => "ORDER",
            Token::By => "BY",
            Token::Asc => "ASC",
            Token::Desc => "DESC",
            Token::Limit => "LIMIT",
            Token::Offset => "OFFSET",
            Token::Count => "COUNT",
            Token::Sum => "SUM",
            Token::Avg => "AVG",
            Token::Min => "MIN",
            Token::Max => "MAX",
            Token::Null => "NULL",
            Token::True => "TRUE",
            Token::False => "FALSE",
            Token::Eq => "=",
            Token::NotEq => "<>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::Comma => ",",
            Token::Semicolon => ";",
            Token::Eof => "end of input",
            Token::Integer(_) | Token::Float(_) | Token::Text(_) | Token::Identifier(_) => {
                return None
            }
        };
        Some(text)
    }

    /// The aggregate this keyword names, if any
    pub fn aggregate(&self) -> Option<AggregateFunc> {
        match self {
            Token::Count => Some(AggregateFunc::Count),
            Token::Sum => Some(AggregateFunc::Sum),
            Token::Avg => Some(AggregateFunc::Avg),
            Token::Min => Some(AggregateFunc::Min),
            Token::Max => Some(AggregateFunc::Max),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = self.text() {
            return f.write_str(text);
        }
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Token::Identifier(s) => f.write_str(s),
            _ => Ok(()),
        }
    }
}

/// A token and the byte offset where it starts
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}
