use super::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

impl Operator {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Rem => "%",
            Operator::Pow => "**",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::And => "&&",
            Operator::Or => "||",
            Operator::Not => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Op(Operator),
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("'{}'", s),
            Token::Bool(b) => b.to_string(),
            Token::Ident(name) => name.clone(),
            Token::Op(op) => op.symbol().to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
            Token::Question => "?".to_string(),
            Token::Colon => ":".to_string(),
        }
    }
}

/// A token and the byte offset it starts at.
pub(crate) type Spanned = (usize, Token);

pub(crate) fn tokenize(source: &str) -> Result<Vec<Spanned>, CompileError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'.') {
                pos += 1;
            }
            if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
                let mut lookahead = pos + 1;
                if lookahead < bytes.len() && (bytes[lookahead] == b'+' || bytes[lookahead] == b'-') {
                    lookahead += 1;
                }
                if lookahead < bytes.len() && bytes[lookahead].is_ascii_digit() {
                    pos = lookahead;
                    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                        pos += 1;
                    }
                }
            }
            let text = &source[start..pos];
            let number = text.parse::<f64>().map_err(|_| CompileError::InvalidNumber {
                position: start,
                text: text.to_string(),
            })?;
            tokens.push((start, Token::Number(number)));
            continue;
        }

        if c.is_ascii_alphabetic() || c == b'_' {
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            let token = match &source[start..pos] {
                "true" => Token::Bool(true),
                "false" => Token::Bool(false),
                ident => Token::Ident(ident.to_string()),
            };
            tokens.push((start, token));
            continue;
        }

        if c == b'\'' || c == b'"' {
            let (text, end) = read_string(source, start)?;
            tokens.push((start, Token::Str(text)));
            pos = end;
            continue;
        }

        let next = bytes.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            (b'*', Some(b'*')) => (Token::Op(Operator::Pow), 2),
            (b'=', Some(b'=')) => (Token::Op(Operator::Eq), 2),
            (b'!', Some(b'=')) => (Token::Op(Operator::Ne), 2),
            (b'<', Some(b'=')) => (Token::Op(Operator::Le), 2),
            (b'>', Some(b'=')) => (Token::Op(Operator::Ge), 2),
            (b'&', Some(b'&')) => (Token::Op(Operator::And), 2),
            (b'|', Some(b'|')) => (Token::Op(Operator::Or), 2),
            (b'+', _) => (Token::Op(Operator::Add), 1),
            (b'-', _) => (Token::Op(Operator::Sub), 1),
            (b'*', _) => (Token::Op(Operator::Mul), 1),
            (b'/', _) => (Token::Op(Operator::Div), 1),
            (b'%', _) => (Token::Op(Operator::Rem), 1),
            (b'<', _) => (Token::Op(Operator::Lt), 1),
            (b'>', _) => (Token::Op(Operator::Gt), 1),
            (b'!', _) => (Token::Op(Operator::Not), 1),
            (b'(', _) => (Token::LParen, 1),
            (b')', _) => (Token::RParen, 1),
            (b',', _) => (Token::Comma, 1),
            (b'?', _) => (Token::Question, 1),
            (b':', _) => (Token::Colon, 1),
            _ => {
                let found = source[start..].chars().next().unwrap_or('\u{fffd}');
                return Err(CompileError::UnexpectedCharacter { position: start, found });
            }
        };
        tokens.push((start, token));
        pos += width;
    }

    Ok(tokens)
}

/// Reads a quoted string starting at `start`, returning its unescaped text and
/// the offset just past the closing quote.
fn read_string(source: &str, start: usize) -> Result<(String, usize), CompileError> {
    let mut chars = source[start..].char_indices();
    let quote = match chars.next() {
        Some((_, q)) => q,
        None => return Err(CompileError::UnterminatedString { position: start }),
    };

    let mut text = String::new();
    let mut escaped = false;
    for (offset, ch) in chars {
        if escaped {
            text.push(match ch {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else if ch == quote {
            return Ok((text, start + offset + ch.len_utf8()));
        } else {
            text.push(ch);
        }
    }

    Err(CompileError::UnterminatedString { position: start })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(_, t)| t).collect()
    }

    #[test]
    fn test_tokenize_arithmetic() {
        assert_eq!(
            kinds("active_requests * 2.5 ** t"),
            vec![
                Token::Ident("active_requests".into()),
                Token::Op(Operator::Mul),
                Token::Number(2.5),
                Token::Op(Operator::Pow),
                Token::Ident("t".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_and_bools() {
        assert_eq!(
            kinds(r#"true ? 'CLOSE' : "it\"s""#),
            vec![
                Token::Bool(true),
                Token::Question,
                Token::Str("CLOSE".into()),
                Token::Colon,
                Token::Str("it\"s".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_comparisons() {
        assert_eq!(
            kinds("a<=b>=c!=d==e<f>g&&!h||i"),
            vec![
                Token::Ident("a".into()),
                Token::Op(Operator::Le),
                Token::Ident("b".into()),
                Token::Op(Operator::Ge),
                Token::Ident("c".into()),
                Token::Op(Operator::Ne),
                Token::Ident("d".into()),
                Token::Op(Operator::Eq),
                Token::Ident("e".into()),
                Token::Op(Operator::Lt),
                Token::Ident("f".into()),
                Token::Op(Operator::Gt),
                Token::Ident("g".into()),
                Token::Op(Operator::And),
                Token::Op(Operator::Not),
                Token::Ident("h".into()),
                Token::Op(Operator::Or),
                Token::Ident("i".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_exponent_notation() {
        assert_eq!(kinds("1e3 + .5"), vec![Token::Number(1000.0), Token::Op(Operator::Add), Token::Number(0.5)]);
    }

    #[test]
    fn test_tokenize_errors() {
        assert_eq!(
            tokenize("1 # 2"),
            Err(CompileError::UnexpectedCharacter { position: 2, found: '#' })
        );
        assert_eq!(tokenize("'open"), Err(CompileError::UnterminatedString { position: 0 }));
        assert!(matches!(tokenize("1.2.3"), Err(CompileError::InvalidNumber { position: 0, .. })));
    }
}
