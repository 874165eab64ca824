//! Recursive-descent parser producing the expression tree.
//!
//! Precedence, lowest first: `?:`, `||`, `&&`, comparisons, `+ -`,
//! `* / %`, unary `- !`, `**` (right associative). Unary minus applies to
//! the whole power, so `-2 ** 2` is `-4`.

use super::lexer::{tokenize, Operator, Spanned, Token};
use super::{CompileError, Function, Value};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Literal(Value),
    Variable(String),
    Call { function: Function, args: Vec<Node> },
    Unary { op: Operator, operand: Box<Node> },
    Binary { op: Operator, lhs: Box<Node>, rhs: Box<Node> },
    Ternary { condition: Box<Node>, then: Box<Node>, otherwise: Box<Node> },
}

pub(crate) fn parse(source: &str) -> Result<Node, CompileError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(CompileError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.ternary()?;
    match parser.tokens.get(parser.pos) {
        None => Ok(node),
        Some((position, token)) => Err(CompileError::UnexpectedToken {
            position: *position,
            found: token.describe(),
        }),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), CompileError> {
        match self.advance() {
            Some((_, token)) if token == expected => Ok(()),
            Some((position, token)) => Err(CompileError::UnexpectedToken {
                position,
                found: token.describe(),
            }),
            None => Err(CompileError::UnexpectedEnd),
        }
    }

    fn eat_operator(&mut self, candidates: &[Operator]) -> Option<Operator> {
        match self.peek() {
            Some(Token::Op(op)) if candidates.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn ternary(&mut self) -> Result<Node, CompileError> {
        let condition = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.ternary()?;
        self.expect(Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Node::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn binary_level(
        &mut self,
        operators: &[Operator],
        next: fn(&mut Self) -> Result<Node, CompileError>,
    ) -> Result<Node, CompileError> {
        let mut lhs = next(self)?;
        while let Some(op) = self.eat_operator(operators) {
            let rhs = next(self)?;
            lhs = Node::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) };
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Node, CompileError> {
        self.binary_level(&[Operator::Or], Self::and)
    }

    fn and(&mut self) -> Result<Node, CompileError> {
        self.binary_level(&[Operator::And], Self::comparison)
    }

    fn comparison(&mut self) -> Result<Node, CompileError> {
        self.binary_level(
            &[Operator::Eq, Operator::Ne, Operator::Lt, Operator::Le, Operator::Gt, Operator::Ge],
            Self::additive,
        )
    }

    fn additive(&mut self) -> Result<Node, CompileError> {
        self.binary_level(&[Operator::Add, Operator::Sub], Self::multiplicative)
    }

    fn multiplicative(&mut self) -> Result<Node, CompileError> {
        self.binary_level(&[Operator::Mul, Operator::Div, Operator::Rem], Self::unary)
    }

    fn unary(&mut self) -> Result<Node, CompileError> {
        if let Some(op) = self.eat_operator(&[Operator::Sub, Operator::Not]) {
            let operand = self.unary()?;
            return Ok(Node::Unary { op, operand: Box::new(operand) });
        }
        self.power()
    }

    fn power(&mut self) -> Result<Node, CompileError> {
        let base = self.primary()?;
        if self.eat_operator(&[Operator::Pow]).is_some() {
            // the exponent may carry its own sign: `2 ** -1`
            let exponent = self.unary()?;
            return Ok(Node::Binary {
                op: Operator::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Node, CompileError> {
        let (position, token) = self.advance().ok_or(CompileError::UnexpectedEnd)?;
        match token {
            Token::Number(n) => Ok(Node::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Node::Literal(Value::Str(s))),
            Token::Bool(b) => Ok(Node::Literal(Value::Bool(b))),
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if !self.eat(&Token::LParen) {
                    return Ok(Node::Variable(name));
                }
                let function = Function::lookup(&name).ok_or(CompileError::UnknownFunction(name))?;
                let args = self.arguments()?;
                Ok(Node::Call { function, args })
            }
            other => Err(CompileError::UnexpectedToken {
                position,
                found: other.describe(),
            }),
        }
    }

    fn arguments(&mut self) -> Result<Vec<Node>, CompileError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(Token::RParen)?;
            return Ok(args);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Box<Node> {
        Box::new(Node::Literal(Value::Number(n)))
    }

    #[test]
    fn test_multiplication_binds_tighter() {
        assert_eq!(
            parse("1 + 2 * 3").unwrap(),
            Node::Binary {
                op: Operator::Add,
                lhs: num(1.0),
                rhs: Box::new(Node::Binary { op: Operator::Mul, lhs: num(2.0), rhs: num(3.0) }),
            }
        );
    }

    #[test]
    fn test_power_is_right_associative() {
        assert_eq!(
            parse("2 ** 3 ** 2").unwrap(),
            Node::Binary {
                op: Operator::Pow,
                lhs: num(2.0),
                rhs: Box::new(Node::Binary { op: Operator::Pow, lhs: num(3.0), rhs: num(2.0) }),
            }
        );
    }

    #[test]
    fn test_unary_minus_applies_to_power() {
        assert_eq!(
            parse("-2 ** 2").unwrap(),
            Node::Unary {
                op: Operator::Sub,
                operand: Box::new(Node::Binary { op: Operator::Pow, lhs: num(2.0), rhs: num(2.0) }),
            }
        );
        assert_eq!(
            parse("2 ** -1").unwrap(),
            Node::Binary {
                op: Operator::Pow,
                lhs: num(2.0),
                rhs: Box::new(Node::Unary { op: Operator::Sub, operand: num(1.0) }),
            }
        );
    }

    #[test]
    fn test_function_call() {
        assert_eq!(
            parse("sin(t)").unwrap(),
            Node::Call {
                function: Function::Sin,
                args: vec![Node::Variable("t".into())],
            }
        );
        assert_eq!(parse("rand()").unwrap(), Node::Call { function: Function::Rand, args: vec![] });
    }

    #[test]
    fn test_unknown_function_fails_to_compile() {
        assert_eq!(parse("cos(1)"), Err(CompileError::UnknownFunction("cos".into())));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse(""), Err(CompileError::Empty));
        assert_eq!(parse("   "), Err(CompileError::Empty));
        assert_eq!(parse("1 +"), Err(CompileError::UnexpectedEnd));
        assert_eq!(parse("(1"), Err(CompileError::UnexpectedEnd));
        assert_eq!(
            parse("1 2"),
            Err(CompileError::UnexpectedToken { position: 2, found: "2".into() })
        );
        assert_eq!(
            parse("true ? 1"),
            Err(CompileError::UnexpectedEnd)
        );
        assert_eq!(
            parse("sin(1,)"),
            Err(CompileError::UnexpectedToken { position: 6, found: ")".into() })
        );
    }
}
