//! Tokenizer for the kernel fragment language.

use crate::error::KernelError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    /// `@name`, e.g. `@out` or `@in0`.
    Macro(String),
    Int(i64),
    Float(f64),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

// Longest first so `<=` wins over `<`.
const PUNCTS: &[&str] = &[
    "++", "--", "+=", "-=", "*=", "/=", "%=", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "{",
    "}", "[", "]", ";", ",", "+", "-", "*", "/", "%", "=", "<", ">", "!", "?", ":",
];

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn skip_trivia(&mut self) -> Result<(), KernelError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        if self.starts_with("*/") {
                            self.bump();
                            self.bump();
                            break;
                        }
                        if self.bump().is_none() {
                            return Err(KernelError::syntax(line, column, "unterminated comment"));
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }
}

/// Split a fragment into tokens, always ending with [`TokenKind::Eof`].
pub fn tokenize(src: &str) -> Result<Vec<Token>, KernelError> {
    let mut cur = Cursor::new(src);
    let mut tokens = Vec::new();

    loop {
        cur.skip_trivia()?;
        let (line, column) = (cur.line, cur.column);
        let Some(c) = cur.peek() else {
            tokens.push(Token {
                kind: TokenKind::Eof,
                line,
                column,
            });
            return Ok(tokens);
        };

        let kind = if c.is_ascii_alphabetic() || c == '_' {
            TokenKind::Ident(take_word(&mut cur))
        } else if c == '@' {
            cur.bump();
            if !matches!(cur.peek(), Some(n) if n.is_ascii_alphabetic() || n == '_') {
                return Err(KernelError::syntax(line, column, "expected macro name after '@'"));
            }
            TokenKind::Macro(take_word(&mut cur))
        } else if c.is_ascii_digit() || (c == '.' && matches!(cur.peek_at(1), Some(d) if d.is_ascii_digit())) {
            number(&mut cur, line, column)?
        } else if let Some(p) = PUNCTS.iter().find(|p| cur.starts_with(p)) {
            for _ in 0..p.len() {
                cur.bump();
            }
            TokenKind::Punct(*p)
        } else {
            return Err(KernelError::syntax(line, column, format!("unexpected character '{c}'")));
        };

        tokens.push(Token { kind, line, column });
    }
}

fn take_word(cur: &mut Cursor) -> String {
    let mut word = String::new();
    while let Some(c) = cur.peek() {
        if c.is_ascii_alphanumeric() || c == '_' {
            word.push(c);
            cur.bump();
        } else {
            break;
        }
    }
    word
}

fn number(cur: &mut Cursor, line: usize, column: usize) -> Result<TokenKind, KernelError> {
    let mut text = String::new();
    let mut is_float = false;
    while let Some(c) = cur.peek() {
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '.' && !is_float {
            is_float = true;
            text.push(c);
        } else if (c == 'e' || c == 'E')
            && matches!(cur.peek_at(1), Some(n) if n.is_ascii_digit() || n == '-' || n == '+')
        {
            is_float = true;
            text.push(c);
            cur.bump();
            if let Some(sign) = cur.peek() {
                text.push(sign);
            }
        } else {
            break;
        }
        cur.bump();
    }

    // C suffixes: 1.0f, 2u, 3ll
    let mut float_suffix = false;
    while let Some(c) = cur.peek() {
        match c {
            'f' | 'F' => {
                float_suffix = true;
                cur.bump();
            }
            'u' | 'U' | 'l' | 'L' => {
                cur.bump();
            }
            _ => break,
        }
    }
    if matches!(cur.peek(), Some(c) if c.is_ascii_alphanumeric() || c == '_') {
        return Err(KernelError::syntax(line, column, format!("malformed number '{text}'")));
    }

    if is_float || float_suffix {
        text.parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| KernelError::syntax(line, column, format!("malformed number '{text}'")))
    } else {
        text.parse::<i64>()
            .map(TokenKind::Int)
            .map_err(|_| KernelError::syntax(line, column, format!("integer literal '{text}' out of range")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_loop_header() {
        let k = kinds("for (int i=0; i<in0shape0; i++)");
        assert_eq!(k[0], TokenKind::Ident("for".into()));
        assert_eq!(k[1], TokenKind::Punct("("));
        assert_eq!(k[5], TokenKind::Int(0));
        assert_eq!(k[7], TokenKind::Ident("i".into()));
        assert_eq!(k[8], TokenKind::Punct("<"));
        assert_eq!(k[9], TokenKind::Ident("in0shape0".into()));
        assert_eq!(k[12], TokenKind::Punct("++"));
        assert_eq!(*k.last().unwrap(), TokenKind::Eof);
    }

    #[test]
    fn test_macro_and_float() {
        let k = kinds("@out(i) = @in0(i) * 2.5f;");
        assert_eq!(k[0], TokenKind::Macro("out".into()));
        assert_eq!(k[5], TokenKind::Macro("in0".into()));
        assert_eq!(k[10], TokenKind::Float(2.5));
    }

    #[test]
    fn test_comments_and_positions() {
        let toks = tokenize("// header\n/* block\n */ x").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Ident("x".into()));
        assert_eq!(toks[0].line, 3);
        assert_eq!(toks[0].column, 5);
    }

    #[test]
    fn test_bad_character() {
        let err = tokenize("a = #;").unwrap_err();
        assert_eq!(
            err,
            KernelError::Syntax {
                line: 1,
                column: 5,
                message: "unexpected character '#'".into()
            }
        );
    }

    #[test]
    fn test_exponent() {
        assert_eq!(kinds("1e-3")[0], TokenKind::Float(1e-3));
    }
}
