//! Query DSL parser
//!
//! Recursive descent over the token stream produced by the lexer. Every
//! failure is a `SyntaxError` naming the byte position, what was expected
//! and what was found.

use super::ast::*;
use super::lexer::Lexer;
use super::token::{Spanned, Token};
use crate::error::{Error, Result};

/// Deepest expression tree the parser builds. Parenthesized groups, NOT,
/// unary minus, chained binary operators and IN list entries each count one
/// level, since every later pass walks the tree recursively.
pub const MAX_NESTING: usize = 128;

/// Query parser
pub struct Parser {
    tokens: Vec<Spanned>,
    position: usize,
    end: Spanned,
    depth: usize,
}

impl Parser {
    /// Create a new parser from query text
    pub fn new(text: &str) -> Result<Self> {
        let tokens = Lexer::new(text).tokenize()?;
        Ok(Self {
            tokens,
            position: 0,
            end: Spanned {
                token: Token::Eof,
                position: text.len(),
            },
            depth: 0,
        })
    }

    /// Parse exactly one query, with an optional trailing semicolon
    pub fn parse(&mut self) -> Result<Query> {
        let query = self.parse_query()?;
        if self.check(&Token::Semicolon) {
            self.advance();
        }
        if !self.is_at_end() {
            return Err(self.error("end of input"));
        }
        Ok(query)
    }

    fn parse_query(&mut self) -> Result<Query> {
        self.expect(&Token::Select)?;
        let mut query = Query {
            projection: self.parse_select_list()?,
            ..Query::default()
        };

        self.expect(&Token::From)?;
        query.source = self.expect_identifier()?;

        if self.check(&Token::Where) {
            self.advance();
            query.selection = Some(self.parse_expr()?);
        }

        if self.check(&Token::Group) {
            self.advance();
            self.expect(&Token::By)?;
            query.group_by = self.parse_identifier_list()?;
        }

        if self.check(&Token::Order) {
            self.advance();
            self.expect(&Token::By)?;
            query.order_by = self.parse_order_by_list()?;
        }

        if self.check(&Token::Limit) {
            self.advance();
            query.limit = Some(self.expect_count()?);
            if self.check(&Token::Offset) {
                self.advance();
                query.offset = Some(self.expect_count()?);
            }
        }

        Ok(query)
    }

    fn parse_select_list(&mut self) -> Result<Vec<SelectItem>> {
        if self.check(&Token::Star) {
            self.advance();
            return Ok(vec![SelectItem::Wildcard]);
        }

        let mut items = vec![self.parse_select_item()?];
        while self.check(&Token::Comma) {
            self.advance();
            items.push(self.parse_select_item()?);
        }
        Ok(items)
    }

    fn parse_select_item(&mut self) -> Result<SelectItem> {
        let func = self.current().aggregate();
        let call = self.peek() == Some(&Token::LParen);
        if let (Some(func), true) = (func, call) {
            self.advance();
            self.expect(&Token::LParen)?;
            let arg = if self.check(&Token::Star) && func == AggregateFunc::Count {
                self.advance();
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(&Token::RParen)?;
            let alias = self.parse_alias()?;
            return Ok(SelectItem::Aggregate { func, arg, alias });
        }

        let expr = self.parse_expr()?;
        let alias = self.parse_alias()?;
        Ok(SelectItem::Expr { expr, alias })
    }

    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.check(&Token::As) {
            self.advance();
            return self.expect_identifier().map(Some);
        }
        Ok(None)
    }

    fn parse_order_by_list(&mut self) -> Result<Vec<OrderByItem>> {
        let mut items = Vec::new();
        loop {
            let column = self.expect_identifier()?;
            let ascending = match self.current() {
                Token::Asc => {
                    self.advance();
                    true
                }
                Token::Desc => {
                    self.advance();
                    false
                }
                _ => true,
            };
            items.push(OrderByItem { column, ascending });

            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(items)
    }

    // ========== Expressions ==========

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or_expr()
    }

    fn parse_or_expr(&mut self) -> Result<Expr> {
        let depth = self.depth;
        let mut left = self.parse_and_expr()?;
        while self.check(&Token::Or) {
            self.nest()?;
            self.advance();
            let right = self.parse_and_expr()?;
            left = Expr::binary(left, BinaryOperator::Or, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_and_expr(&mut self) -> Result<Expr> {
        let depth = self.depth;
        let mut left = self.parse_not_expr()?;
        while self.check(&Token::And) {
            self.nest()?;
            self.advance();
            let right = self.parse_not_expr()?;
            left = Expr::binary(left, BinaryOperator::And, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_not_expr(&mut self) -> Result<Expr> {
        if !self.check(&Token::Not) {
            return self.parse_predicate();
        }
        self.nest()?;
        self.advance();
        let expr = self.parse_not_expr()?;
        self.depth -= 1;
        Ok(Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: Box::new(expr),
        })
    }

    fn parse_predicate(&mut self) -> Result<Expr> {
        let left = self.parse_additive_expr()?;

        // IS [NOT] NULL
        if self.check(&Token::Is) {
            self.advance();
            let negated = self.check(&Token::Not);
            if negated {
                self.advance();
            }
            self.expect(&Token::Null)?;
            return Ok(Expr::IsNull {
                expr: Box::new(left),
                negated,
            });
        }

        // [NOT] BETWEEN, [NOT] IN
        let negated = self.check(&Token::Not);
        if negated {
            self.advance();
        }
        if self.check(&Token::Between) {
            self.advance();
            let low = self.parse_additive_expr()?;
            self.expect(&Token::And)?;
            let high = self.parse_additive_expr()?;
            return Ok(Expr::Between {
                expr: Box::new(left),
                low: Box::new(low),
                high: Box::new(high),
                negated,
            });
        }
        if self.check(&Token::In) {
            self.advance();
            self.expect(&Token::LParen)?;
            // lowered to a chain of ORs
            let depth = self.depth;
            let mut list = vec![self.parse_additive_expr()?];
            while self.check(&Token::Comma) {
                self.nest()?;
                self.advance();
                list.push(self.parse_additive_expr()?);
            }
            self.depth = depth;
            self.expect(&Token::RParen)?;
            return Ok(Expr::InList {
                expr: Box::new(left),
                list,
                negated,
            });
        }
        if negated {
            return Err(self.error("BETWEEN or IN"));
        }

        let op = match self.current() {
            Token::Eq => BinaryOperator::Eq,
            Token::NotEq => BinaryOperator::Neq,
            Token::Lt => BinaryOperator::Lt,
            Token::Gt => BinaryOperator::Gt,
            Token::LtEq => BinaryOperator::Lte,
            Token::GtEq => BinaryOperator::Gte,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive_expr()?;
        Ok(Expr::binary(left, op, right))
    }

    fn parse_additive_expr(&mut self) -> Result<Expr> {
        let depth = self.depth;
        let mut left = self.parse_multiplicative_expr()?;
        loop {
            let op = match self.current() {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Sub,
                _ => break,
            };
            self.nest()?;
            self.advance();
            let right = self.parse_multiplicative_expr()?;
            left = Expr::binary(left, op, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_multiplicative_expr(&mut self) -> Result<Expr> {
        let depth = self.depth;
        let mut left = self.parse_unary_expr()?;
        loop {
            let op = match self.current() {
                Token::Star => BinaryOperator::Mul,
                Token::Slash => BinaryOperator::Div,
                Token::Percent => BinaryOperator::Mod,
                _ => break,
            };
            self.nest()?;
            self.advance();
            let right = self.parse_unary_expr()?;
            left = Expr::binary(left, op, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        if !self.check(&Token::Minus) {
            return self.parse_primary_expr();
        }
        self.nest()?;
        self.advance();
        let operand = self.parse_unary_expr()?;
        self.depth -= 1;
        // fold negative numeric literals so they stay literals
        Ok(match operand {
            Expr::Literal(Literal::Integer(n)) => Expr::Literal(Literal::Integer(-n)),
            Expr::Literal(Literal::Float(n)) => Expr::Literal(Literal::Float(-n)),
            expr => Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: Box::new(expr),
            },
        })
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        let literal = match self.current().clone() {
            Token::Integer(n) => Literal::Integer(n),
            Token::Float(n) => Literal::Float(n),
            Token::Text(s) => Literal::String(s),
            Token::True => Literal::Boolean(true),
            Token::False => Literal::Boolean(false),
            Token::Null => Literal::Null,
            Token::Identifier(name) => {
                self.advance();
                return Ok(Expr::Column(name));
            }
            Token::LParen => {
                self.nest()?;
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                return Ok(expr);
            }
            _ => return Err(self.error("an expression")),
        };
        self.advance();
        Ok(Expr::Literal(literal))
    }

    fn parse_identifier_list(&mut self) -> Result<Vec<String>> {
        let mut identifiers = vec![self.expect_identifier()?];
        while self.check(&Token::Comma) {
            self.advance();
            identifiers.push(self.expect_identifier()?);
        }
        Ok(identifiers)
    }

    // ========== Helpers ==========

    fn current_spanned(&self) -> &Spanned {
        self.tokens.get(self.position).unwrap_or(&self.end)
    }

    fn current(&self) -> &Token {
        &self.current_spanned().token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position + 1).map(|s| &s.token)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn is_at_end(&self) -> bool {
        matches!(self.current(), Token::Eof)
    }

    /// Enter one more level of expression nesting
    fn nest(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("shallower nesting"));
        }
        self.depth += 1;
        Ok(())
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.current()) == std::mem::discriminant(token)
    }

    fn error(&self, expected: &str) -> Error {
        let current = self.current_spanned();
        Error::Syntax {
            position: current.position,
            expected: expected.to_string(),
            found: current.token.to_string(),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<()> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&token.to_string()))
        }
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.current().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("identifier")),
        }
    }

    fn expect_count(&mut self) -> Result<u64> {
        match self.current() {
            Token::Integer(n) if *n >= 0 => {
                let n = *n as u64;
                self.advance();
                Ok(n)
            }
            _ => Err(self.error("non-negative integer")),
        }
    }
}

/// Parse query text into an AST
pub fn parse(text: &str) -> Result<Query> {
    Parser::new(text)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str) -> Expr {
        Expr::Column(name.to_string())
    }

    fn int(n: i64) -> Expr {
        Expr::Literal(Literal::Integer(n))
    }

    #[test]
    fn test_parse_simple_select() {
        let query = parse("select id, payload from events where id = 1").unwrap();
        assert_eq!(query.source, "events");
        assert_eq!(query.projection.len(), 2);
        assert_eq!(
            query.selection,
            Some(Expr::binary(col("id"), BinaryOperator::Eq, int(1)))
        );
        assert!(!query.is_aggregate());
    }

    #[test]
    fn test_parse_full_query() {
        let query = parse(
            "SELECT region, count(*) AS n, avg(ts) FROM events \
             WHERE ts BETWEEN 1 AND 10 AND payload IS NOT NULL \
             GROUP BY region ORDER BY n DESC, region LIMIT 5 OFFSET 2;",
        )
        .unwrap();
        assert!(query.is_aggregate());
        assert_eq!(query.group_by, vec!["region".to_string()]);
        assert_eq!(query.projection[1].output_name(), "n");
        assert_eq!(query.projection[2].output_name(), "avg(ts)");
        assert_eq!(query.order_by.len(), 2);
        assert!(!query.order_by[0].ascending);
        assert!(query.order_by[1].ascending);
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.offset, Some(2));
    }

    #[test]
    fn test_precedence() {
        let query = parse("select * from t where a = 1 or b = 2 and c + 2 * 3 > -4").unwrap();
        let expected = Expr::binary(
            Expr::binary(col("a"), BinaryOperator::Eq, int(1)),
            BinaryOperator::Or,
            Expr::binary(
                Expr::binary(col("b"), BinaryOperator::Eq, int(2)),
                BinaryOperator::And,
                Expr::binary(
                    Expr::binary(
                        col("c"),
                        BinaryOperator::Add,
                        Expr::binary(int(2), BinaryOperator::Mul, int(3)),
                    ),
                    BinaryOperator::Gt,
                    int(-4),
                ),
            ),
        );
        assert_eq!(query.selection, Some(expected));
        assert_eq!(query.projection, vec![SelectItem::Wildcard]);
    }

    #[test]
    fn test_not_in_and_not_between() {
        let query = parse("select * from t where a not in (1, 2) and not b between 1 and 2")
            .unwrap();
        match query.selection {
            Some(Expr::BinaryOp { left, right, .. }) => {
                assert!(matches!(*left, Expr::InList { negated: true, .. }));
                assert!(matches!(
                    *right,
                    Expr::UnaryOp {
                        op: UnaryOperator::Not,
                        ..
                    }
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_syntax_error_positions() {
        match parse("select id events") {
            Err(Error::Syntax {
                position,
                expected,
                found,
            }) => {
                assert_eq!(position, 10);
                assert_eq!(expected, "FROM");
                assert_eq!(found, "events");
            }
            other => panic!("unexpected {:?}", other),
        }

        match parse("select * from events where") {
            Err(Error::Syntax {
                position, found, ..
            }) => {
                assert_eq!(position, 26);
                assert_eq!(found, "end of input");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            parse("select * from events limit 1 garbage"),
            Err(Error::Syntax { position: 29, .. })
        ));
        assert!(matches!(
            parse("select * from events limit -1"),
            Err(Error::Syntax { .. })
        ));
    }

    fn assert_too_deep(text: &str) {
        match parse(text) {
            Err(Error::Syntax { expected, .. }) => assert_eq!(expected, "shallower nesting"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_nesting_limit() {
        let n = 50_000;
        assert_too_deep(&format!(
            "select id from events where {}id = 1{}",
            "(".repeat(n),
            ")".repeat(n)
        ));
        assert_too_deep(&format!("select id from events where {}id = 1", "not ".repeat(n)));
        assert_too_deep(&format!("select {}1 from events", "- ".repeat(n)));
        assert_too_deep(&format!("select id from events where id = 1{}", " + 1".repeat(n)));
        assert_too_deep(&format!("select id from events where id = 1{}", " or id = 2".repeat(n)));
        let list: Vec<String> = (0..n).map(|i| i.to_string()).collect();
        assert_too_deep(&format!("select id from events where id in ({})", list.join(", ")));

        // just under the limit still parses
        let depth = MAX_NESTING - 1;
        assert!(parse(&format!(
            "select id from events where {}id = 1{}",
            "(".repeat(depth),
            ")".repeat(depth)
        ))
        .is_ok());
        assert!(parse(&format!("select id from events where id = 1{}", " and id = 1".repeat(100))).is_ok());
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let text = "select * from t where (a + 1) * 2 >= 3 and name in ('x', 'y''s')";
        let first = parse(text).unwrap().selection.unwrap();
        let again = parse(&format!("select * from t where {}", first))
            .unwrap()
            .selection
            .unwrap();
        assert_eq!(first, again);
    }
}
