//! S-expression decoder

use thiserror::Error;

use super::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SexpError {
    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Unexpected ')' at offset {0}")]
    UnexpectedClose(usize),

    #[error("Unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("Trailing input at offset {0}")]
    TrailingInput(usize),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Decode exactly one value from `input`.
pub fn decode(input: &str) -> Result<Value, SexpError> {
    let mut reader = Reader::new(input);
    let value = reader.read()?;
    reader.skip_atmosphere();
    if reader.peek().is_some() {
        return Err(SexpError::TrailingInput(reader.pos));
    }
    Ok(value)
}

/// Decode a wire payload.
pub fn decode_bytes(input: &[u8]) -> Result<Value, SexpError> {
    let text = std::str::from_utf8(input).map_err(|_| SexpError::InvalidUtf8)?;
    decode(text)
}

struct Reader<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Skip whitespace and `;` line comments.
    fn skip_atmosphere(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Result<Value, SexpError> {
        self.skip_atmosphere();
        match self.peek() {
            None => Err(SexpError::UnexpectedEof),
            Some('(') => {
                self.bump();
                self.read_list()
            }
            Some(')') => Err(SexpError::UnexpectedClose(self.pos)),
            Some('"') => self.read_string(),
            Some('\'') => {
                self.bump();
                let quoted = self.read()?;
                Ok(Value::list([Value::symbol("quote"), quoted]))
            }
            Some(_) => Ok(self.read_atom()),
        }
    }

    fn read_list(&mut self) -> Result<Value, SexpError> {
        let mut items = Vec::new();
        loop {
            self.skip_atmosphere();
            match self.peek() {
                None => return Err(SexpError::UnexpectedEof),
                Some(')') => {
                    self.bump();
                    break;
                }
                Some(_) => items.push(self.read()?),
            }
        }
        if items.is_empty() {
            Ok(Value::Nil)
        } else {
            Ok(Value::List(items))
        }
    }

    fn read_string(&mut self) -> Result<Value, SexpError> {
        let start = self.pos;
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(SexpError::UnterminatedString(start)),
                Some('"') => return Ok(Value::String(text)),
                Some('\\') => match self.bump() {
                    None => return Err(SexpError::UnterminatedString(start)),
                    Some(escaped) => text.push(escaped),
                },
                Some(c) => text.push(c),
            }
        }
    }

    fn read_atom(&mut self) -> Value {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\'' | ';') {
                break;
            }
            self.bump();
        }
        parse_atom(&self.input[start..self.pos])
    }
}

fn parse_atom(token: &str) -> Value {
    if token.eq_ignore_ascii_case("nil") {
        return Value::Nil;
    }
    if token.eq_ignore_ascii_case("t") {
        return Value::T;
    }
    if looks_numeric(token) {
        // Lisp integers may carry a trailing decimal point: `42.`
        let integer = token.strip_suffix('.').unwrap_or(token);
        if let Ok(n) = integer.parse::<i64>() {
            return Value::Integer(n);
        }
        if let Ok(f) = token.parse::<f64>() {
            return Value::Float(f);
        }
    }
    Value::Symbol(token.to_string())
}

// Guards f64 parsing against symbols such as `inf`, `nan`, `+` or `1+`.
fn looks_numeric(token: &str) -> bool {
    let body = token.strip_prefix(['+', '-']).unwrap_or(token);
    let body = body.strip_prefix('.').unwrap_or(body);
    body.starts_with(|c: char| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
}
