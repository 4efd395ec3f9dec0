/// Lexer
///
/// Produces the token stream for the compiler with one token of lookahead.
/// Works on raw bytes: the only meaningful code units are ASCII, and string
/// literals may legally contain arbitrary bytes via `\x` escapes.
///
/// Notable states:
///   • every `\n` becomes a Line token (statements are newline-separated)
///   • `%( … )` string interpolation is tracked with a stack of unmatched
///     `(` counts, one per open interpolation, at most 8 deep
///   • `"""` raw strings trim a whitespace-only first and last line
///   • a `#!/` line at the top of the file is skipped as a shebang
///
/// Lexical errors are collected and lexing continues so that several can be
/// reported from one pass.

use once_cell::sync::Lazy;
use hashbrown::HashMap;

/// The maximum depth that string interpolation can nest:
///
///     "outside %(one + "%(two + "%(three)")")"
pub const MAX_INTERPOLATION_NESTING: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Colon,
    Dot,
    DotDot,
    DotDotDot,
    Comma,
    Star,
    Slash,
    Percent,
    Hash,
    Plus,
    Minus,
    LtLt,
    GtGt,
    Pipe,
    PipePipe,
    Caret,
    Amp,
    AmpAmp,
    Bang,
    Tilde,
    Question,
    Eq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    BangEq,

    Break,
    Continue,
    Class,
    Construct,
    Else,
    False,
    For,
    Foreign,
    If,
    Import,
    As,
    In,
    Is,
    Null,
    Return,
    Static,
    Super,
    This,
    True,
    Var,
    While,

    Field,
    StaticField,
    Name,
    Number,

    /// A string literal without any interpolation, or the last section of a
    /// string following the last interpolated expression.
    String,

    /// A portion of a string literal preceding an interpolated expression:
    ///
    ///     "a %(b) c %(d) e"
    ///
    /// lexes to Interpolation "a ", Name b, Interpolation " c ", Name d,
    /// String " e".
    Interpolation,

    Line,

    Error,
    Eof,
}

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert("break", TokenKind::Break);
    map.insert("continue", TokenKind::Continue);
    map.insert("class", TokenKind::Class);
    map.insert("construct", TokenKind::Construct);
    map.insert("else", TokenKind::Else);
    map.insert("false", TokenKind::False);
    map.insert("for", TokenKind::For);
    map.insert("foreign", TokenKind::Foreign);
    map.insert("if", TokenKind::If);
    map.insert("import", TokenKind::Import);
    map.insert("as", TokenKind::As);
    map.insert("in", TokenKind::In);
    map.insert("is", TokenKind::Is);
    map.insert("null", TokenKind::Null);
    map.insert("return", TokenKind::Return);
    map.insert("static", TokenKind::Static);
    map.insert("super", TokenKind::Super);
    map.insert("this", TokenKind::This);
    map.insert("true", TokenKind::True);
    map.insert("var", TokenKind::Var);
    map.insert("while", TokenKind::While);
    map
});

/// Pre-parsed literal payload for number and string tokens.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Num(f64),
    Str(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token start in the source.
    pub start: usize,
    pub length: usize,
    /// 1-based source line the token appears on.
    pub line: u32,
    pub value: Option<Literal>,
}

impl Token {
    pub fn text<'s>(&self, source: &'s str) -> &'s str {
        &source[self.start..self.start + self.length]
    }
}

#[derive(Debug, Clone)]
pub struct LexError {
    pub line: u32,
    pub message: String,
}

pub struct Lexer<'src> {
    source: &'src str,
    bytes: &'src [u8],
    pos: usize,
    token_start: usize,
    line: u32,
    /// One counter per unclosed interpolation: the number of unmatched `(`
    /// inside the embedded expression.
    parens: [u32; MAX_INTERPOLATION_NESTING],
    num_parens: usize,
    /// Accumulated lexical errors; drained by the compiler.
    pub errors: Vec<LexError>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            token_start: 0,
            line: 1,
            parens: [0; MAX_INTERPOLATION_NESTING],
            num_parens: 0,
            errors: Vec::new(),
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    // ── Character helpers ────────────────────────────────────────────────────

    fn peek_char(&self) -> u8 {
        self.bytes.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_next_char(&self) -> u8 {
        if self.peek_char() == 0 {
            return 0;
        }
        self.bytes.get(self.pos + 1).copied().unwrap_or(0)
    }

    fn next_char(&mut self) -> u8 {
        let c = self.peek_char();
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        c
    }

    fn match_char(&mut self, c: u8) -> bool {
        if self.peek_char() != c {
            return false;
        }
        self.next_char();
        true
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(LexError { line: self.line, message: message.into() });
    }

    fn make(&self, kind: TokenKind) -> Token {
        let mut line = self.line;
        // Line tokens appear on the line containing the "\n".
        if kind == TokenKind::Line {
            line -= 1;
        }
        Token {
            kind,
            start: self.token_start,
            length: self.pos - self.token_start,
            line,
            value: None,
        }
    }

    fn make_value(&self, kind: TokenKind, value: Literal) -> Token {
        let mut token = self.make(kind);
        token.value = Some(value);
        token
    }

    fn two_char(&mut self, c: u8, two: TokenKind, one: TokenKind) -> Token {
        let kind = if self.match_char(c) { two } else { one };
        self.make(kind)
    }

    // ── Comments ─────────────────────────────────────────────────────────────

    fn skip_line_comment(&mut self) {
        while self.peek_char() != b'\n' && !self.at_end() {
            self.next_char();
        }
    }

    fn skip_block_comment(&mut self) {
        let mut nesting = 1;
        while nesting > 0 {
            if self.at_end() {
                self.error("Unterminated block comment.");
                return;
            }
            if self.peek_char() == b'/' && self.peek_next_char() == b'*' {
                self.next_char();
                self.next_char();
                nesting += 1;
                continue;
            }
            if self.peek_char() == b'*' && self.peek_next_char() == b'/' {
                self.next_char();
                self.next_char();
                nesting -= 1;
                continue;
            }
            self.next_char();
        }
    }

    // ── Numbers ──────────────────────────────────────────────────────────────

    fn read_hex_digit(&mut self) -> Option<u32> {
        let c = self.next_char();
        let digit = match c {
            b'0'..=b'9' => (c - b'0') as u32,
            b'a'..=b'f' => (c - b'a' + 10) as u32,
            b'A'..=b'F' => (c - b'A' + 10) as u32,
            _ => {
                // Back up so an unexpected character is not consumed; this
                // keeps us from reading past an unterminated string.
                self.pos -= 1;
                return None;
            }
        };
        Some(digit)
    }

    fn make_number(&mut self, is_hex: bool) -> Token {
        let text = &self.source[self.token_start..self.pos];
        let value = if is_hex {
            u64::from_str_radix(&text[2..], 16).map(|n| n as f64).ok()
        } else {
            text.parse::<f64>().ok().filter(|n| n.is_finite())
        };
        let n = match value {
            Some(n) => n,
            None => {
                self.error("Number literal was too large.");
                0.0
            }
        };
        self.make_value(TokenKind::Number, Literal::Num(n))
    }

    fn read_hex_number(&mut self) -> Token {
        // Skip past the `x`.
        self.next_char();
        while self.read_hex_digit().is_some() {}
        self.make_number(true)
    }

    fn read_number(&mut self) -> Token {
        while self.peek_char().is_ascii_digit() {
            self.next_char();
        }

        // A fraction needs a digit after the "." so method calls on number
        // literals still lex.
        if self.peek_char() == b'.' && self.peek_next_char().is_ascii_digit() {
            self.next_char();
            while self.peek_char().is_ascii_digit() {
                self.next_char();
            }
        }

        if self.match_char(b'e') || self.match_char(b'E') {
            // Allow a single positive or negative exponent sign.
            if !self.match_char(b'+') {
                self.match_char(b'-');
            }
            if !self.peek_char().is_ascii_digit() {
                self.error("Unterminated scientific notation.");
            }
            while self.peek_char().is_ascii_digit() {
                self.next_char();
            }
        }

        self.make_number(false)
    }

    // ── Names ────────────────────────────────────────────────────────────────

    fn read_name(&mut self, kind: TokenKind) -> Token {
        while is_name(self.peek_char()) || self.peek_char().is_ascii_digit() {
            self.next_char();
        }
        let text = &self.source[self.token_start..self.pos];
        let kind = KEYWORDS.get(text).copied().unwrap_or(kind);
        self.make(kind)
    }

    // ── Strings ──────────────────────────────────────────────────────────────

    fn read_hex_escape(&mut self, digits: usize, description: &str) -> u32 {
        let mut value = 0u32;
        for _ in 0..digits {
            if self.peek_char() == b'"' || self.at_end() {
                self.error(format!("Incomplete {} escape sequence.", description));
                break;
            }
            match self.read_hex_digit() {
                Some(digit) => value = (value * 16) | digit,
                None => {
                    self.error(format!("Invalid {} escape sequence.", description));
                    break;
                }
            }
        }
        value
    }

    fn read_unicode_escape(&mut self, string: &mut Vec<u8>, length: usize) {
        let value = self.read_hex_escape(length, "Unicode");
        match char::from_u32(value) {
            Some(c) => {
                let mut buf = [0u8; 4];
                string.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            None => self.error("Invalid Unicode code point."),
        }
    }

    fn read_raw_string(&mut self) -> Token {
        // Consume the second and third `"`.
        self.next_char();
        self.next_char();

        let mut string: Vec<u8> = Vec::new();
        let mut first_newline: Option<usize> = None;
        let mut last_newline: Option<usize> = None;
        let mut leading_whitespace_only = true;

        loop {
            if self.at_end() {
                self.error("Unterminated raw string.");
                break;
            }
            let c = self.next_char();
            if c == b'\r' {
                continue;
            }
            if c == b'"' && self.peek_char() == b'"' && self.peek_next_char() == b'"' {
                self.next_char();
                self.next_char();
                break;
            }
            if c == b'\n' {
                if first_newline.is_none() {
                    first_newline = Some(string.len());
                }
                last_newline = Some(string.len());
            } else if c != b' ' && c != b'\t' && first_newline.is_none() {
                leading_whitespace_only = false;
            }
            string.push(c);
        }

        // Trim a whitespace-only first line and a whitespace-only last line.
        let mut offset = 0;
        let mut count = string.len();
        if let Some(first) = first_newline {
            if leading_whitespace_only {
                offset = first + 1;
            }
        }
        if let Some(last) = last_newline {
            if string[last + 1..].iter().all(|&c| c == b' ' || c == b'\t') {
                count = last;
            }
        }
        let trimmed = if offset <= count { string[offset..count].to_vec() } else { Vec::new() };

        self.make_value(TokenKind::String, Literal::Str(trimmed))
    }

    fn read_string(&mut self) -> Token {
        let mut string: Vec<u8> = Vec::new();
        let mut kind = TokenKind::String;

        loop {
            if self.at_end() {
                self.error("Unterminated string.");
                break;
            }
            let c = self.next_char();
            if c == b'"' {
                break;
            }
            if c == b'\r' {
                continue;
            }

            if c == b'%' {
                if self.num_parens < MAX_INTERPOLATION_NESTING {
                    if self.next_char() != b'(' {
                        self.error("Expect '(' after '%'.");
                    }
                    self.parens[self.num_parens] = 1;
                    self.num_parens += 1;
                    kind = TokenKind::Interpolation;
                    break;
                }
                self.error(format!(
                    "Interpolation may only nest {} levels deep.",
                    MAX_INTERPOLATION_NESTING
                ));
            }

            if c == b'\\' {
                match self.next_char() {
                    b'"' => string.push(b'"'),
                    b'\\' => string.push(b'\\'),
                    b'%' => string.push(b'%'),
                    b'0' => string.push(b'\0'),
                    b'a' => string.push(0x07),
                    b'b' => string.push(0x08),
                    b'e' => string.push(0x1b),
                    b'f' => string.push(0x0c),
                    b'n' => string.push(b'\n'),
                    b'r' => string.push(b'\r'),
                    b't' => string.push(b'\t'),
                    b'u' => self.read_unicode_escape(&mut string, 4),
                    b'U' => self.read_unicode_escape(&mut string, 8),
                    b'v' => string.push(0x0b),
                    b'x' => {
                        let byte = self.read_hex_escape(2, "byte");
                        string.push(byte as u8);
                    }
                    other => {
                        self.error(format!("Invalid escape character '{}'.", other as char));
                    }
                }
            } else {
                string.push(c);
            }
        }

        self.make_value(kind, Literal::Str(string))
    }

    // ── Main entry ───────────────────────────────────────────────────────────

    /// Lexes and returns the next token.
    pub fn next_token(&mut self) -> Token {
        while !self.at_end() {
            self.token_start = self.pos;
            let c = self.next_char();
            match c {
                b'(' => {
                    // Inside an interpolated expression, count the "(".
                    if self.num_parens > 0 {
                        self.parens[self.num_parens - 1] += 1;
                    }
                    return self.make(TokenKind::LeftParen);
                }
                b')' => {
                    if self.num_parens > 0 {
                        self.parens[self.num_parens - 1] -= 1;
                        if self.parens[self.num_parens - 1] == 0 {
                            // The final ")" of the interpolated expression;
                            // resume lexing the rest of the template string.
                            self.num_parens -= 1;
                            return self.read_string();
                        }
                    }
                    return self.make(TokenKind::RightParen);
                }
                b'[' => return self.make(TokenKind::LeftBracket),
                b']' => return self.make(TokenKind::RightBracket),
                b'{' => return self.make(TokenKind::LeftBrace),
                b'}' => return self.make(TokenKind::RightBrace),
                b':' => return self.make(TokenKind::Colon),
                b',' => return self.make(TokenKind::Comma),
                b'*' => return self.make(TokenKind::Star),
                b'%' => return self.make(TokenKind::Percent),
                b'#' => {
                    // Ignore a shebang on the first line.
                    if self.line == 1 && self.peek_char() == b'!' && self.peek_next_char() == b'/' {
                        self.skip_line_comment();
                        continue;
                    }
                    return self.make(TokenKind::Hash);
                }
                b'^' => return self.make(TokenKind::Caret),
                b'+' => return self.make(TokenKind::Plus),
                b'-' => return self.make(TokenKind::Minus),
                b'~' => return self.make(TokenKind::Tilde),
                b'?' => return self.make(TokenKind::Question),

                b'|' => return self.two_char(b'|', TokenKind::PipePipe, TokenKind::Pipe),
                b'&' => return self.two_char(b'&', TokenKind::AmpAmp, TokenKind::Amp),
                b'=' => return self.two_char(b'=', TokenKind::EqEq, TokenKind::Eq),
                b'!' => return self.two_char(b'=', TokenKind::BangEq, TokenKind::Bang),

                b'.' => {
                    if self.match_char(b'.') {
                        return self.two_char(b'.', TokenKind::DotDotDot, TokenKind::DotDot);
                    }
                    return self.make(TokenKind::Dot);
                }

                b'/' => {
                    if self.match_char(b'/') {
                        self.skip_line_comment();
                        continue;
                    }
                    if self.match_char(b'*') {
                        self.skip_block_comment();
                        continue;
                    }
                    return self.make(TokenKind::Slash);
                }

                b'<' => {
                    if self.match_char(b'<') {
                        return self.make(TokenKind::LtLt);
                    }
                    return self.two_char(b'=', TokenKind::LtEq, TokenKind::Lt);
                }
                b'>' => {
                    if self.match_char(b'>') {
                        return self.make(TokenKind::GtGt);
                    }
                    return self.two_char(b'=', TokenKind::GtEq, TokenKind::Gt);
                }

                b'\n' => return self.make(TokenKind::Line),

                b' ' | b'\r' | b'\t' => {
                    while matches!(self.peek_char(), b' ' | b'\r' | b'\t') {
                        self.next_char();
                    }
                    continue;
                }

                b'"' => {
                    if self.peek_char() == b'"' && self.peek_next_char() == b'"' {
                        return self.read_raw_string();
                    }
                    return self.read_string();
                }

                b'_' => {
                    let kind = if self.peek_char() == b'_' {
                        TokenKind::StaticField
                    } else {
                        TokenKind::Field
                    };
                    return self.read_name(kind);
                }

                b'0' if self.peek_char() == b'x' => return self.read_hex_number(),

                _ => {
                    if is_name(c) {
                        return self.read_name(TokenKind::Name);
                    }
                    if c.is_ascii_digit() {
                        return self.read_number();
                    }
                    if (32..=126).contains(&c) {
                        self.error(format!("Invalid character '{}'.", c as char));
                    } else {
                        // The lexer works on raw bytes, so don't render
                        // non-ASCII values as characters.
                        self.error(format!("Invalid byte 0x{:x}.", c));
                    }
                    return Token {
                        kind: TokenKind::Error,
                        start: self.token_start,
                        length: 0,
                        line: self.line,
                        value: None,
                    };
                }
            }
        }

        self.token_start = self.pos;
        self.make(TokenKind::Eof)
    }
}

fn is_name(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push(token.kind);
        }
        out
    }

    fn string_value(source: &str) -> Vec<u8> {
        let mut lexer = Lexer::new(source);
        let token = lexer.next_token();
        assert!(lexer.errors.is_empty(), "lex errors: {:?}", lexer.errors);
        match token.value {
            Some(Literal::Str(bytes)) => bytes,
            other => panic!("expected string literal, got {:?}", other),
        }
    }

    #[test]
    fn test_keywords() {
        assert_eq!(
            kinds("class construct foreign static var while super this"),
            vec![
                TokenKind::Class,
                TokenKind::Construct,
                TokenKind::Foreign,
                TokenKind::Static,
                TokenKind::Var,
                TokenKind::While,
                TokenKind::Super,
                TokenKind::This,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            kinds("== != <= >= << >> && || .. ..."),
            vec![
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::LtLt,
                TokenKind::GtGt,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::DotDot,
                TokenKind::DotDotDot,
            ]
        );
    }

    #[test]
    fn test_line_tokens() {
        assert_eq!(
            kinds("a\nb"),
            vec![TokenKind::Name, TokenKind::Line, TokenKind::Name]
        );
        // The Line token reports the line holding the newline itself.
        let mut lexer = Lexer::new("a\nb");
        lexer.next_token();
        let line = lexer.next_token();
        assert_eq!(line.kind, TokenKind::Line);
        assert_eq!(line.line, 1);
    }

    #[test]
    fn test_numbers() {
        let mut lexer = Lexer::new("123 4.5 0x1F 2e3 1.5e-2");
        let expected = [123.0, 4.5, 31.0, 2000.0, 0.015];
        for want in expected {
            let token = lexer.next_token();
            assert_eq!(token.kind, TokenKind::Number);
            assert_eq!(token.value, Some(Literal::Num(want)));
        }
    }

    #[test]
    fn test_number_method_call_is_not_a_fraction() {
        assert_eq!(
            kinds("1.abs"),
            vec![TokenKind::Number, TokenKind::Dot, TokenKind::Name]
        );
    }

    #[test]
    fn test_escape_sequences() {
        // "\n\t\\\"" decodes to exactly these four bytes.
        assert_eq!(string_value(r#""\n\t\\\"""#), vec![0x0a, 0x09, 0x5c, 0x22]);
        assert_eq!(string_value(r#""\x41\x42""#), b"AB".to_vec());
        assert_eq!(string_value(r#""A""#), b"A".to_vec());
        assert_eq!(string_value(r#""é""#), "é".as_bytes().to_vec());
        assert_eq!(string_value(r#""\U0001F600""#), "😀".as_bytes().to_vec());
        assert_eq!(string_value(r#""\e[0m""#), vec![0x1b, b'[', b'0', b'm']);
    }

    #[test]
    fn test_invalid_escape_reports_and_continues() {
        let mut lexer = Lexer::new(r#""\q" 1"#);
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(lexer.errors.len(), 1);
        assert!(lexer.errors[0].message.contains("Invalid escape character"));
        assert_eq!(lexer.next_token().kind, TokenKind::Number);
    }

    #[test]
    fn test_interpolation_tokens() {
        assert_eq!(
            kinds(r#""a %(b) c %(d) e""#),
            vec![
                TokenKind::Interpolation,
                TokenKind::Name,
                TokenKind::Interpolation,
                TokenKind::Name,
                TokenKind::String,
            ]
        );
    }

    #[test]
    fn test_interpolation_counts_parens() {
        assert_eq!(
            kinds(r#""%((1))""#),
            vec![
                TokenKind::Interpolation,
                TokenKind::LeftParen,
                TokenKind::Number,
                TokenKind::RightParen,
                TokenKind::String,
            ]
        );
    }

    #[test]
    fn test_interpolation_nests() {
        let src = r#""a %("b %(c) d") e""#;
        assert_eq!(
            kinds(src),
            vec![
                TokenKind::Interpolation,
                TokenKind::Interpolation,
                TokenKind::Name,
                TokenKind::String,
                TokenKind::String,
            ]
        );
    }

    #[test]
    fn test_interpolation_depth_limit() {
        // Eight levels lex cleanly, a ninth reports an error.
        let mut eight = String::from("\"%(");
        for _ in 0..7 {
            eight.push_str("\"%(");
        }
        eight.push('1');
        for _ in 0..7 {
            eight.push_str(")\"");
        }
        eight.push_str(")\"");
        let mut lexer = Lexer::new(&eight);
        while lexer.next_token().kind != TokenKind::Eof {}
        assert!(lexer.errors.is_empty(), "{:?}", lexer.errors);

        let mut nine = String::from("\"%(");
        for _ in 0..8 {
            nine.push_str("\"%(");
        }
        nine.push('1');
        for _ in 0..8 {
            nine.push_str(")\"");
        }
        nine.push_str(")\"");
        let mut lexer = Lexer::new(&nine);
        while lexer.next_token().kind != TokenKind::Eof {}
        assert!(lexer
            .errors
            .iter()
            .any(|e| e.message.contains("Interpolation may only nest")));
    }

    #[test]
    fn test_raw_strings() {
        let src = "\"\"\"\n  keep this\n\"\"\"";
        assert_eq!(string_value(src), b"  keep this".to_vec());

        // Raw strings take everything literally, including escapes.
        assert_eq!(string_value("\"\"\"a\\nb\"\"\""), b"a\\nb".to_vec());

        // Interior quotes survive when not followed by two more.
        assert_eq!(
            string_value("\"\"\"say \"hi\" ok\"\"\""),
            b"say \"hi\" ok".to_vec()
        );
    }

    #[test]
    fn test_shebang_skipped() {
        assert_eq!(
            kinds("#!/usr/bin/env wisp\n1"),
            vec![TokenKind::Line, TokenKind::Number]
        );
        // A hash anywhere else is a token.
        assert_eq!(kinds("1\n#"), vec![
            TokenKind::Number,
            TokenKind::Line,
            TokenKind::Hash
        ]);
    }

    #[test]
    fn test_comments() {
        assert_eq!(kinds("1 // comment\n2"), vec![
            TokenKind::Number,
            TokenKind::Line,
            TokenKind::Number
        ]);
        assert_eq!(kinds("1 /* a /* nested */ b */ 2"), vec![
            TokenKind::Number,
            TokenKind::Number
        ]);
    }

    #[test]
    fn test_fields() {
        assert_eq!(kinds("_a __b"), vec![TokenKind::Field, TokenKind::StaticField]);
    }

    #[test]
    fn test_invalid_character_keeps_lexing() {
        let mut lexer = Lexer::new("$ 1");
        let token = lexer.next_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert!(lexer.errors[0].message.contains("Invalid character '$'"));
        assert_eq!(lexer.next_token().kind, TokenKind::Number);
    }

    #[test]
    fn test_token_slices_cover_source() {
        // Round-trip law: concatenating token slices plus the skipped
        // whitespace reproduces a prefix of the source.
        let source = "var x = 1 + 2";
        let mut lexer = Lexer::new(source);
        let mut rebuilt = String::new();
        loop {
            let token = lexer.next_token();
            if token.kind == TokenKind::Eof {
                break;
            }
            rebuilt.push_str(token.text(source));
            rebuilt.push(' ');
        }
        assert_eq!(rebuilt.trim_end(), "var x = 1 + 2");
    }
}
