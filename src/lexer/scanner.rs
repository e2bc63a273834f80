//! Scanner for Lua source code.

use crate::error::LexerError;
use crate::lexer::token::{Token, TokenKind};
use crate::span::Span;

/// The lexer transforms source text into a stream of tokens.
///
/// The token sequence is finite and recomputable: scanning the same source
/// twice yields the same tokens. There is no resume support; a failed scan
/// aborts the build.
pub struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    source_len: usize,
    current_pos: usize,
    line: usize,
    column: usize,
    start_pos: usize,
    start_line: usize,
    start_column: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            source_len: source.len(),
            current_pos: 0,
            line: 1,
            column: 1,
            start_pos: 0,
            start_line: 1,
            start_column: 1,
        }
    }

    /// Scan all tokens from the source.
    pub fn scan_tokens(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        loop {
            let token = self.scan_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    /// Scan the next token.
    pub fn scan_token(&mut self) -> Result<Token, LexerError> {
        self.skip_whitespace_and_comments()?;
        self.mark_start();

        let Some(c) = self.advance() else {
            return Ok(Token::eof(self.current_pos, self.line, self.column));
        };

        match c {
            '(' => Ok(self.make_token(TokenKind::LeftParen)),
            ')' => Ok(self.make_token(TokenKind::RightParen)),
            '{' => Ok(self.make_token(TokenKind::LeftBrace)),
            '}' => Ok(self.make_token(TokenKind::RightBrace)),
            ']' => Ok(self.make_token(TokenKind::RightBracket)),
            ';' => Ok(self.make_token(TokenKind::Semicolon)),
            ':' => Ok(self.make_token(TokenKind::Colon)),
            ',' => Ok(self.make_token(TokenKind::Comma)),
            '+' => Ok(self.make_token(TokenKind::Plus)),
            '-' => Ok(self.make_token(TokenKind::Minus)),
            '*' => Ok(self.make_token(TokenKind::Star)),
            '/' => Ok(self.make_token(TokenKind::Slash)),
            '%' => Ok(self.make_token(TokenKind::Percent)),
            '^' => Ok(self.make_token(TokenKind::Caret)),
            '#' => Ok(self.make_token(TokenKind::Hash)),

            '[' => {
                // `[[` or `[=*[` opens a long string; anything else is an
                // ordinary bracket.
                if let Some(level) = self.peek_long_bracket() {
                    self.consume_long_bracket_open(level);
                    self.scan_long_string(level)
                } else {
                    Ok(self.make_token(TokenKind::LeftBracket))
                }
            }

            '=' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::EqualEqual))
                } else {
                    Ok(self.make_token(TokenKind::Equal))
                }
            }
            '~' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::NotEqual))
                } else {
                    Err(LexerError::unexpected_char('~', self.current_span()))
                }
            }
            '<' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::LessEqual))
                } else {
                    Ok(self.make_token(TokenKind::Less))
                }
            }
            '>' => {
                if self.match_char('=') {
                    Ok(self.make_token(TokenKind::GreaterEqual))
                } else {
                    Ok(self.make_token(TokenKind::Greater))
                }
            }

            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        Ok(self.make_token(TokenKind::Ellipsis))
                    } else {
                        Ok(self.make_token(TokenKind::Concat))
                    }
                } else if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.scan_number('.')
                } else {
                    Ok(self.make_token(TokenKind::Dot))
                }
            }

            '"' | '\'' => self.scan_string(c),

            c if c.is_ascii_digit() => self.scan_number(c),

            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c),

            c => Err(LexerError::unexpected_char(c, self.current_span())),
        }
    }

    // ===== Character manipulation =====

    fn advance(&mut self) -> Option<char> {
        let (pos, c) = self.chars.next()?;
        self.current_pos = pos + c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.chars.clone().nth(n).map(|(_, c)| c)
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn mark_start(&mut self) {
        self.start_pos = self.current_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, self.current_span())
    }

    fn current_span(&self) -> Span {
        Span::new(
            self.start_pos,
            self.current_pos,
            self.start_line,
            self.start_column,
        )
    }

    // ===== Whitespace and comments =====

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexerError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('-') if self.peek_at(1) == Some('-') => {
                    self.mark_start();
                    self.advance();
                    self.advance();
                    // `--[[` (or `--[=[`) starts a block comment, otherwise
                    // the comment runs to end of line.
                    if self.peek() == Some('[') {
                        self.advance();
                        if let Some(level) = self.peek_long_bracket() {
                            self.consume_long_bracket_open(level);
                            self.skip_long_comment(level)?;
                            continue;
                        }
                    }
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Look ahead (without consuming) from just after a `[` for `=*[`.
    fn peek_long_bracket(&mut self) -> Option<usize> {
        let mut level = 0;
        while self.peek_at(level) == Some('=') {
            level += 1;
        }
        if self.peek_at(level) == Some('[') {
            Some(level)
        } else {
            None
        }
    }

    /// Consume the `=*[` remainder of a long-bracket opener.
    fn consume_long_bracket_open(&mut self, level: usize) {
        for _ in 0..level {
            self.advance();
        }
        self.advance(); // the second '['
    }

    /// Consume characters until the matching `]=*]` closer at `level`.
    /// Returns the enclosed content.
    fn consume_until_long_close(&mut self, level: usize) -> Option<String> {
        let mut content = String::new();
        loop {
            let c = self.advance()?;
            if c == ']' {
                let mut eq = 0;
                while eq < level && self.peek() == Some('=') {
                    self.advance();
                    eq += 1;
                }
                if eq == level && self.peek() == Some(']') {
                    self.advance();
                    return Some(content);
                }
                content.push(']');
                for _ in 0..eq {
                    content.push('=');
                }
            } else {
                content.push(c);
            }
        }
    }

    fn skip_long_comment(&mut self, level: usize) -> Result<(), LexerError> {
        match self.consume_until_long_close(level) {
            Some(_) => Ok(()),
            None => Err(LexerError::UnterminatedComment(self.current_span())),
        }
    }

    // ===== Literals =====

    fn scan_long_string(&mut self, level: usize) -> Result<Token, LexerError> {
        let mut content = match self.consume_until_long_close(level) {
            Some(c) => c,
            None => return Err(LexerError::unterminated_string(self.current_span())),
        };
        // A newline immediately after the opening bracket is dropped.
        if content.starts_with("\r\n") {
            content.drain(..2);
        } else if content.starts_with('\n') || content.starts_with('\r') {
            content.drain(..1);
        }
        Ok(self.make_token(TokenKind::Str(content.into_bytes())))
    }

    fn scan_string(&mut self, quote: char) -> Result<Token, LexerError> {
        let mut bytes = Vec::new();

        loop {
            let Some(c) = self.peek() else {
                return Err(LexerError::unterminated_string(self.current_span()));
            };
            match c {
                '\n' => return Err(LexerError::unterminated_string(self.current_span())),
                c if c == quote => {
                    self.advance();
                    return Ok(self.make_token(TokenKind::Str(bytes)));
                }
                '\\' => {
                    self.advance();
                    self.scan_escape(&mut bytes)?;
                }
                c => {
                    self.advance();
                    let mut buf = [0u8; 4];
                    bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
    }

    fn scan_escape(&mut self, out: &mut Vec<u8>) -> Result<(), LexerError> {
        let Some(c) = self.advance() else {
            return Err(LexerError::unterminated_string(self.current_span()));
        };
        match c {
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'v' => out.push(0x0b),
            '\\' => out.push(b'\\'),
            '"' => out.push(b'"'),
            '\'' => out.push(b'\''),
            '\n' => out.push(b'\n'),
            'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while digits < 2 {
                    match self.peek().and_then(|c| c.to_digit(16)) {
                        Some(d) => {
                            self.advance();
                            value = value * 16 + d;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if digits == 0 {
                    return Err(LexerError::invalid_escape('x', self.current_span()));
                }
                out.push(value as u8);
            }
            c if c.is_ascii_digit() => {
                // Up to three decimal digits, value must fit in a byte.
                let mut value: u32 = c.to_digit(10).unwrap();
                let mut digits = 1;
                while digits < 3 {
                    match self.peek().and_then(|c| c.to_digit(10)) {
                        Some(d) => {
                            self.advance();
                            value = value * 10 + d;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                if value > 255 {
                    return Err(LexerError::invalid_escape(c, self.current_span()));
                }
                out.push(value as u8);
            }
            c => return Err(LexerError::invalid_escape(c, self.current_span())),
        }
        Ok(())
    }

    fn scan_number(&mut self, first: char) -> Result<Token, LexerError> {
        let mut text = String::new();
        text.push(first);

        // Hex literal
        if first == '0' && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            let mut hex = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_hexdigit() {
                    hex.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            if hex.is_empty() {
                return Err(LexerError::invalid_number("0x", self.current_span()));
            }
            let value = u64::from_str_radix(&hex, 16).map_err(|_| {
                LexerError::invalid_number(format!("0x{}", hex), self.current_span())
            })?;
            return Ok(self.make_token(TokenKind::Number(value as f64)));
        }

        let mut seen_dot = first == '.';
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else if c == '.' && !seen_dot && self.peek_at(1) != Some('.') {
                // A second dot would start a concat operator.
                seen_dot = true;
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // Exponent part
        if matches!(self.peek(), Some('e') | Some('E')) {
            text.push('e');
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                text.push(self.advance().unwrap());
            }
            let mut any = false;
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                    any = true;
                } else {
                    break;
                }
            }
            if !any {
                return Err(LexerError::invalid_number(text, self.current_span()));
            }
        }

        text.parse::<f64>()
            .map(|n| self.make_token(TokenKind::Number(n)))
            .map_err(|_| LexerError::invalid_number(text, self.current_span()))
    }

    fn scan_identifier(&mut self, first: char) -> Result<Token, LexerError> {
        let mut text = String::new();
        text.push(first);

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier(text));
        Ok(self.make_token(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn scans_keywords_and_identifiers() {
        let toks = kinds("local x = nil");
        assert_eq!(
            toks,
            vec![
                TokenKind::Local,
                TokenKind::Identifier("x".to_string()),
                TokenKind::Equal,
                TokenKind::Nil,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_numbers() {
        assert_eq!(kinds("42")[0], TokenKind::Number(42.0));
        assert_eq!(kinds("3.75")[0], TokenKind::Number(3.75));
        assert_eq!(kinds("0xFF")[0], TokenKind::Number(255.0));
        assert_eq!(kinds("1e3")[0], TokenKind::Number(1000.0));
        assert_eq!(kinds("2.5e-1")[0], TokenKind::Number(0.25));
        assert_eq!(kinds(".5")[0], TokenKind::Number(0.5));
    }

    #[test]
    fn number_then_concat() {
        let toks = kinds("1..2");
        assert_eq!(
            toks,
            vec![
                TokenKind::Number(1.0),
                TokenKind::Concat,
                TokenKind::Number(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scans_strings_with_escapes() {
        assert_eq!(kinds("'a\\nb'")[0], TokenKind::Str(b"a\nb".to_vec()));
        assert_eq!(kinds("\"\\65\\66\"")[0], TokenKind::Str(b"AB".to_vec()));
        assert_eq!(kinds("'\\x41'")[0], TokenKind::Str(b"A".to_vec()));
    }

    #[test]
    fn scans_long_strings() {
        assert_eq!(kinds("[[hello]]")[0], TokenKind::Str(b"hello".to_vec()));
        assert_eq!(
            kinds("[==[a]]b]==]")[0],
            TokenKind::Str(b"a]]b".to_vec())
        );
        // leading newline dropped
        assert_eq!(kinds("[[\nhey]]")[0], TokenKind::Str(b"hey".to_vec()));
    }

    #[test]
    fn skips_comments() {
        let toks = kinds("-- line\nx --[[ block\nspanning ]] y");
        assert_eq!(
            toks,
            vec![
                TokenKind::Identifier("x".to_string()),
                TokenKind::Identifier("y".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn unterminated_string_fails() {
        let err = Scanner::new("'abc").scan_tokens().unwrap_err();
        assert!(matches!(err, LexerError::UnterminatedString(_)));
    }

    #[test]
    fn unterminated_long_comment_fails() {
        let err = Scanner::new("--[[ never closed").scan_tokens().unwrap_err();
        assert!(matches!(err, LexerError::UnterminatedComment(_)));
    }

    #[test]
    fn lone_tilde_fails() {
        let err = Scanner::new("a ~ b").scan_tokens().unwrap_err();
        assert!(matches!(err, LexerError::UnexpectedChar('~', _)));
    }

    #[test]
    fn tracks_positions() {
        let tokens = Scanner::new("x\n  y").scan_tokens().unwrap();
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 2);
        assert_eq!(tokens[1].span.column, 3);
    }

    #[test]
    fn scans_all_operators() {
        let toks = kinds("+ - * / % ^ # == ~= <= >= < > = ( ) { } [ ] ; : , . .. ...");
        assert_eq!(toks.len(), 27);
        assert_eq!(toks[25], TokenKind::Ellipsis);
    }
}
