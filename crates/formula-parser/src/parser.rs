//! Formula parser
//!
//! A recursive descent parser with operator precedence. From loosest to
//! tightest binding:
//!
//! 1. Addition/Subtraction: `+`, `-` (left associative)
//! 2. Multiplication/Division: `*`, `/` (left associative)
//! 3. Exponentiation: `^` (right associative)
//! 4. Unary minus
//! 5. Primary: literals, variables, function calls, parentheses
//!
//! Variables are written `[Any name]` or as a bare identifier, optionally
//! followed by a range qualifier `|lower:upper|`.

use crate::ast::{BinaryOperator, Bound, FormulaExpr, RangeQualifier};
use crate::error::SyntaxError;
use crate::stack::ensure_sufficient_stack;
use crate::value::Value;
use std::fmt;

type ParseResult<T> = Result<T, SyntaxError>;

/// Parse a formula string into an AST
///
/// Unknown variable and function names are accepted here; they are only
/// resolved at evaluation time.
///
/// # Example
/// ```rust
/// use formula_parser::parse_formula;
///
/// let ast = parse_formula("1+2").unwrap();
/// let ast = parse_formula("SUM([A]|-1:0|, SQRT(4))").unwrap();
/// assert!(parse_formula("(1+2").is_err());
/// ```
pub fn parse_formula(formula: &str) -> ParseResult<FormulaExpr> {
    let mut parser = FormulaParser::new(formula)?;
    let expr = parser.parse_expression()?;

    // Make sure we consumed all input
    if parser.current_token != Token::Eof {
        return Err(SyntaxError::new(
            parser.token_start,
            format!("Unexpected {} after expression", parser.current_token),
        ));
    }

    tracing::trace!(formula, "parsed formula");
    Ok(expr)
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
enum Token {
    // Literals
    Number(f64),
    Text(String),

    // Names
    Identifier(String),
    Variable(String),

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Comma,
    Colon,
    Pipe,

    // Delimiters
    LeftParen,
    RightParen,

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "number {}", n),
            Token::Text(s) => write!(f, "text \"{}\"", s),
            Token::Identifier(name) => write!(f, "identifier '{}'", name),
            Token::Variable(name) => write!(f, "variable [{}]", name),
            Token::Plus => f.write_str("'+'"),
            Token::Minus => f.write_str("'-'"),
            Token::Star => f.write_str("'*'"),
            Token::Slash => f.write_str("'/'"),
            Token::Caret => f.write_str("'^'"),
            Token::Comma => f.write_str("','"),
            Token::Colon => f.write_str("':'"),
            Token::Pipe => f.write_str("'|'"),
            Token::LeftParen => f.write_str("'('"),
            Token::RightParen => f.write_str("')'"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

/// Formula parser
struct FormulaParser<'a> {
    input: &'a str,
    pos: usize,
    current_token: Token,
    /// Byte offset where `current_token` starts
    token_start: usize,
}

impl<'a> FormulaParser<'a> {
    fn new(input: &'a str) -> ParseResult<Self> {
        let mut parser = Self {
            input,
            pos: 0,
            current_token: Token::Eof,
            token_start: 0,
        };
        parser.advance_token()?;
        Ok(parser)
    }

    // === Token scanning ===

    fn advance_token(&mut self) -> ParseResult<()> {
        self.skip_whitespace();
        self.token_start = self.pos;
        self.current_token = self.scan_token()?;
        Ok(())
    }

    fn scan_token(&mut self) -> ParseResult<Token> {
        let c = match self.peek_char() {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };

        // Single-character tokens
        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '^' => Some(Token::Caret),
            ',' => Some(Token::Comma),
            ':' => Some(Token::Colon),
            '|' => Some(Token::Pipe),
            '(' => Some(Token::LeftParen),
            ')' => Some(Token::RightParen),
            _ => None,
        };
        if let Some(token) = single {
            self.advance();
            return Ok(token);
        }

        if c == '"' {
            return self.scan_text();
        }

        if c == '[' {
            return self.scan_variable();
        }

        if c.is_ascii_digit()
            || (c == '.' && self.peek_char_at(1).map_or(false, |c| c.is_ascii_digit()))
        {
            return self.scan_number();
        }

        if c.is_alphabetic() || c == '_' {
            return Ok(self.scan_identifier());
        }

        Err(SyntaxError::new(
            self.pos,
            format!("Unknown character '{}'", c),
        ))
    }

    fn scan_text(&mut self) -> ParseResult<Token> {
        let start = self.pos;
        self.advance(); // Skip opening quote

        let mut s = String::new();
        loop {
            match self.peek_char() {
                Some('"') => {
                    // Check for escaped quote ("")
                    if self.peek_char_at(1) == Some('"') {
                        s.push('"');
                        self.advance();
                        self.advance();
                    } else {
                        self.advance();
                        return Ok(Token::Text(s));
                    }
                }
                Some(c) => {
                    s.push(c);
                    self.advance();
                }
                None => return Err(SyntaxError::new(start, "Unterminated text literal")),
            }
        }
    }

    fn scan_variable(&mut self) -> ParseResult<Token> {
        let start = self.pos;
        self.advance(); // Skip '['

        let input = self.input;
        let name_start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == ']' {
                let name = &input[name_start..self.pos];
                self.advance();
                if name.is_empty() {
                    return Err(SyntaxError::new(start, "Empty variable name"));
                }
                return Ok(Token::Variable(name.to_string()));
            }
            self.advance();
        }

        Err(SyntaxError::new(
            start,
            "Unterminated variable reference, expected ']'",
        ))
    }

    fn scan_number(&mut self) -> ParseResult<Token> {
        let start = self.pos;

        // Integer part
        self.skip_digits();

        // Decimal part
        if self.peek_char() == Some('.') {
            self.advance();
            if !self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
                return Err(self.malformed_number(start));
            }
            self.skip_digits();
        }

        // Exponent part
        if self.peek_char().map_or(false, |c| c == 'e' || c == 'E') {
            self.advance();
            if self.peek_char().map_or(false, |c| c == '+' || c == '-') {
                self.advance();
            }
            if !self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
                return Err(self.malformed_number(start));
            }
            self.skip_digits();
        }

        // Numbers must not run into names or further dots, e.g. `2x` or `1.2.3`
        if self
            .peek_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            return Err(self.malformed_number(start));
        }

        let input = self.input;
        input[start..self.pos]
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.malformed_number(start))
    }

    fn malformed_number(&mut self, start: usize) -> SyntaxError {
        while self
            .peek_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.advance();
        }
        SyntaxError::new(
            start,
            format!("Malformed number '{}'", &self.input[start..self.pos]),
        )
    }

    fn scan_identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek_char()
            .map_or(false, |c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            self.advance();
        }
        Token::Identifier(self.input[start..self.pos].to_string())
    }

    // === Helper methods ===

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_char_at(&self, offset: usize) -> Option<char> {
        self.input[self.pos..].chars().nth(offset)
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_digits(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_char().map_or(false, |c| c.is_whitespace()) {
            self.advance();
        }
    }

    fn consume(&mut self) -> ParseResult<Token> {
        let token = std::mem::replace(&mut self.current_token, Token::Eof);
        self.advance_token()?;
        Ok(token)
    }

    fn unexpected(&self, expected: &str) -> SyntaxError {
        SyntaxError::new(
            self.token_start,
            format!("Expected {}, got {}", expected, self.current_token),
        )
    }

    // === Expression parsing with precedence ===

    fn parse_expression(&mut self) -> ParseResult<FormulaExpr> {
        ensure_sufficient_stack(|| self.parse_additive())
    }

    fn parse_additive(&mut self) -> ParseResult<FormulaExpr> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.current_token {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Subtract,
                _ => break,
            };

            self.consume()?;
            let right = self.parse_multiplicative()?;
            left = FormulaExpr::binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<FormulaExpr> {
        let mut left = self.parse_power()?;

        loop {
            let op = match self.current_token {
                Token::Star => BinaryOperator::Multiply,
                Token::Slash => BinaryOperator::Divide,
                _ => break,
            };

            self.consume()?;
            let right = self.parse_power()?;
            left = FormulaExpr::binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_power(&mut self) -> ParseResult<FormulaExpr> {
        let left = self.parse_unary()?;

        if self.current_token == Token::Caret {
            self.consume()?;
            let right = ensure_sufficient_stack(|| self.parse_power())?; // Right associative
            return Ok(FormulaExpr::binary(BinaryOperator::Power, left, right));
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<FormulaExpr> {
        if self.current_token == Token::Minus {
            self.consume()?;
            let operand = self.parse_primary()?;
            return Ok(negate(operand));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult<FormulaExpr> {
        match self.current_token {
            Token::Number(_) | Token::Text(_) => match self.consume()? {
                Token::Number(n) => Ok(FormulaExpr::number(n)),
                Token::Text(s) => Ok(FormulaExpr::text(s)),
                _ => unreachable!("matched a literal token"),
            },

            Token::LeftParen => {
                let open = self.token_start;
                self.consume()?;
                let expr = self.parse_expression()?;
                if self.current_token != Token::RightParen {
                    return Err(SyntaxError::new(
                        self.token_start,
                        format!(
                            "Expected ')' to close '(' at position {}, got {}",
                            open, self.current_token
                        ),
                    ));
                }
                self.consume()?;
                Ok(expr)
            }

            Token::Identifier(_) | Token::Variable(_) => {
                let bracketed = matches!(self.current_token, Token::Variable(_));
                let name = match self.consume()? {
                    Token::Identifier(name) | Token::Variable(name) => name,
                    _ => unreachable!("matched a name token"),
                };

                // Check if it's a function call
                if !bracketed && self.current_token == Token::LeftParen {
                    return self.parse_function_call(name);
                }

                let range = self.parse_range()?;
                Ok(FormulaExpr::Variable { name, range })
            }

            _ => Err(self.unexpected("an expression")),
        }
    }

    fn parse_function_call(&mut self, name: String) -> ParseResult<FormulaExpr> {
        let open = self.token_start;
        self.consume()?; // '('

        let mut args = Vec::new();

        if self.current_token == Token::RightParen {
            self.consume()?;
            return Ok(FormulaExpr::Call { name, args });
        }

        loop {
            if matches!(self.current_token, Token::Comma | Token::RightParen) {
                return Err(SyntaxError::new(
                    self.token_start,
                    format!("Empty argument in call to {}", name),
                ));
            }
            args.push(self.parse_expression()?);

            match self.current_token {
                Token::Comma => {
                    self.consume()?;
                }
                Token::RightParen => {
                    self.consume()?;
                    break;
                }
                Token::Eof => {
                    return Err(SyntaxError::new(
                        open,
                        format!("Unterminated argument list for {}", name),
                    ))
                }
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }

        Ok(FormulaExpr::Call { name, args })
    }

    /// Optional `|lower:upper|` suffix of a variable reference
    fn parse_range(&mut self) -> ParseResult<Option<RangeQualifier>> {
        if self.current_token != Token::Pipe {
            return Ok(None);
        }
        let open = self.token_start;
        self.consume()?;

        let lower = self.parse_bound()?;
        let range = if self.current_token == Token::Colon {
            self.consume()?;
            let upper = self.parse_bound()?;
            RangeQualifier::new(lower, upper)
        } else {
            RangeQualifier::single(lower)
        };

        if self.current_token != Token::Pipe {
            return Err(SyntaxError::new(
                self.token_start,
                format!(
                    "Expected '|' to close range qualifier at position {}, got {}",
                    open, self.current_token
                ),
            ));
        }
        self.consume()?;

        Ok(Some(range))
    }

    fn parse_bound(&mut self) -> ParseResult<Bound> {
        match self.current_token {
            Token::Colon | Token::Pipe => Ok(Bound::Unspecified),
            Token::Minus => {
                self.consume()?;
                let n = self.parse_integer_bound()?;
                Ok(Bound::Literal(Value::Number(-n)))
            }
            Token::Number(_) => {
                let n = self.parse_integer_bound()?;
                Ok(Bound::Literal(Value::Number(n)))
            }
            Token::Text(_) | Token::Identifier(_) | Token::Variable(_) => match self.consume()? {
                Token::Text(s) => Ok(Bound::Literal(Value::Text(s))),
                Token::Identifier(name) | Token::Variable(name) => Ok(Bound::Dynamic(name)),
                _ => unreachable!("matched a bound token"),
            },
            _ => Err(self.unexpected("a range bound")),
        }
    }

    fn parse_integer_bound(&mut self) -> ParseResult<f64> {
        let start = self.token_start;
        match self.current_token {
            Token::Number(n) if n.fract() == 0.0 && n.is_finite() => {
                self.consume()?;
                Ok(n)
            }
            Token::Number(n) => Err(SyntaxError::new(
                start,
                format!("Range bound must be an integer, got {}", n),
            )),
            _ => Err(self.unexpected("an integer range bound")),
        }
    }
}

/// Unary minus: folded into numeric literals, otherwise multiplication by -1
fn negate(operand: FormulaExpr) -> FormulaExpr {
    match operand {
        FormulaExpr::Constant(Value::Number(n)) => FormulaExpr::number(-n),
        other => FormulaExpr::binary(BinaryOperator::Multiply, FormulaExpr::number(-1.0), other),
    }
}
