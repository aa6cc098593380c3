//! reads the path dialect into [Segment]s
//!
//! Only what RFC 9535 lacks is interpreted here: `@` as the start of a top-level path,
//! `@key`, `%name` operands and `=~`. Everything else is kept structurally and rendered
//! back as standard JSONPath for `serde_json_path`.
use super::{Path, PathError, Root, Segment, Token};
use serde_json::Value as Json;

pub(super) struct Parser<'s> {
    source: &'s str,
    position: usize,
}

impl<'s> Parser<'s> {
    pub(super) fn new(source: &'s str) -> Self {
        Self {
            source,
            position: 0,
        }
    }

    pub(super) fn parse_path(mut self) -> Result<Path, PathError> {
        self.skip_whitespace();
        let path = self.parse_operand_path()?;
        self.skip_whitespace();
        if !self.at_end() {
            return Err(self.error("unexpected trailing input"));
        }
        Ok(Path {
            source: self.source.to_string(),
            ..path
        })
    }

    /// `$` or `@` followed by segments; stops at the first character that cannot continue
    fn parse_operand_path(&mut self) -> Result<Path, PathError> {
        let root = match self.bump() {
            Some('$') => Root::Document,
            Some('@') => Root::Current,
            _ => return Err(self.error("path must start with `$` or `@`")),
        };
        let segments = self.parse_segments()?;
        Ok(Path {
            root,
            segments,
            source: String::new(),
        })
    }

    fn parse_segments(&mut self) -> Result<Vec<Segment>, PathError> {
        let mut segments = vec![];
        loop {
            match self.peek() {
                Some('.') if self.rest().starts_with("..") => {
                    self.position += 2;
                    let inner = if self.eat('*') {
                        Segment::Wildcard
                    } else if self.peek() == Some('[') {
                        self.parse_bracket()?
                    } else {
                        Segment::Name(self.parse_name()?)
                    };
                    if inner.uses_key() {
                        return Err(self.error("`@key` filters cannot follow `..`"));
                    }
                    segments.push(Segment::Descendant(Box::new(inner)));
                }
                Some('.') => {
                    self.position += 1;
                    segments.push(if self.eat('*') {
                        Segment::Wildcard
                    } else {
                        Segment::Name(self.parse_name()?)
                    });
                }
                Some('[') => segments.push(self.parse_bracket()?),
                _ => return Ok(segments),
            }
        }
    }

    fn parse_bracket(&mut self) -> Result<Segment, PathError> {
        self.expect('[')?;
        self.skip_whitespace();

        let segment = match self.peek() {
            Some('*') => {
                self.position += 1;
                Segment::Wildcard
            }
            Some('?') => {
                self.position += 1;
                Segment::Filter(self.parse_expression()?)
            }
            Some('\'' | '"') => {
                let mut names = vec![self.parse_quoted()?];
                loop {
                    self.skip_whitespace();
                    if !self.eat(',') {
                        break;
                    }
                    self.skip_whitespace();
                    names.push(self.parse_quoted()?);
                }
                if names.len() == 1 {
                    Segment::Name(names.remove(0))
                } else {
                    Segment::Names(names)
                }
            }
            Some(c) if c == '-' || c.is_ascii_digit() => Segment::Index(self.parse_integer()?),
            _ => return Err(self.error("expected `*`, `?`, an index or a quoted name")),
        };

        self.skip_whitespace();
        self.expect(']')?;
        Ok(segment)
    }

    /// Tokens of a filter expression, up to the closing `]`
    fn parse_expression(&mut self) -> Result<Vec<Token>, PathError> {
        let mut tokens: Vec<Token> = vec![];
        let mut depth = 0usize;

        loop {
            self.skip_whitespace();
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated filter"));
            };

            let token = match c {
                ']' if depth == 0 => break,
                '(' => {
                    depth += 1;
                    self.position += 1;
                    Token::Punct("(")
                }
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| self.error("unbalanced `)`"))?;
                    self.position += 1;
                    Token::Punct(")")
                }
                ',' => {
                    self.position += 1;
                    Token::Punct(",")
                }
                '=' | '!' | '<' | '>' | '&' | '|' => self.parse_operator()?,
                '\'' | '"' => Token::Literal(Json::String(self.parse_quoted()?)),
                '@' if self.rest().starts_with("@key") && !self.next_is_name_char(4) => {
                    self.position += 4;
                    Token::Key
                }
                '@' | '$' => Token::Path(Box::new(self.parse_operand_path()?)),
                '%' => {
                    self.position += 1;
                    let start = self.position;
                    while self.peek().is_some_and(|c| {
                        is_name_char(c) || c == '[' || c == ']' && self.in_index(start)
                    }) {
                        self.position += 1;
                    }
                    if start == self.position {
                        return Err(self.error("expected a context name after `%`"));
                    }
                    Token::Context(self.source[start..self.position].to_string())
                }
                c if c == '-' || c.is_ascii_digit() => {
                    let start = self.position;
                    self.position += 1;
                    while self.peek().is_some_and(|c| {
                        c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')
                    }) {
                        self.position += 1;
                    }
                    let number: Json = serde_json::from_str(&self.source[start..self.position])
                        .map_err(|_| self.error("invalid number"))?;
                    Token::Literal(number)
                }
                c if c.is_ascii_alphabetic() => {
                    let start = self.position;
                    while self
                        .peek()
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        self.position += 1;
                    }
                    match &self.source[start..self.position] {
                        "true" => Token::Literal(Json::Bool(true)),
                        "false" => Token::Literal(Json::Bool(false)),
                        "null" => Token::Literal(Json::Null),
                        function => Token::Function(function.to_string()),
                    }
                }
                _ => return Err(self.error("unexpected character in filter")),
            };

            if matches!(tokens.last(), Some(Token::Punct("=~"))) {
                if !matches!(token, Token::Literal(Json::String(_)) | Token::Context(_)) {
                    return Err(self.error("`=~` needs a quoted pattern"));
                }
                tokens.pop();
                let subject = tokens
                    .pop()
                    .ok_or_else(|| self.error("`=~` needs a left operand"))?;
                tokens.push(Token::Search(Box::new(subject), Box::new(token)));
            } else {
                tokens.push(token);
            }
        }

        if depth != 0 {
            return Err(self.error("unbalanced `(`"));
        }
        if tokens.is_empty() {
            return Err(self.error("empty filter"));
        }
        if matches!(tokens.last(), Some(Token::Punct("=~"))) {
            return Err(self.error("`=~` needs a quoted pattern"));
        }
        Ok(tokens)
    }

    fn parse_operator(&mut self) -> Result<Token, PathError> {
        for operator in ["==", "!=", "=~", "<=", ">=", "&&", "||", "<", ">", "!"] {
            if self.eat_str(operator) {
                return Ok(Token::Punct(operator));
            }
        }
        Err(self.error("unknown operator"))
    }

    /// Whether a `%name[...]` index is open at the current position
    fn in_index(&self, start: usize) -> bool {
        let name = &self.source[start..self.position];
        name.matches('[').count() > name.matches(']').count()
    }

    fn parse_name(&mut self) -> Result<String, PathError> {
        let start = self.position;
        while self.peek().is_some_and(is_name_char) {
            self.position += 1;
        }
        if start == self.position {
            return Err(self.error("expected a name"));
        }
        Ok(self.source[start..self.position].to_string())
    }

    fn parse_quoted(&mut self) -> Result<String, PathError> {
        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };

        let mut text = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => match self.bump() {
                    Some(c) => text.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) if c == quote => return Ok(text),
                Some(c) => text.push(c),
            }
        }
    }

    fn parse_integer(&mut self) -> Result<i64, PathError> {
        let start = self.position;
        if self.peek() == Some('-') {
            self.position += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.position += 1;
        }
        self.source[start..self.position]
            .parse()
            .map_err(|_| self.error("invalid index"))
    }

    fn rest(&self) -> &'s str {
        &self.source[self.position..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.position += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, expected: &str) -> bool {
        if self.rest().starts_with(expected) {
            self.position += expected.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), PathError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{expected}`")))
        }
    }

    fn next_is_name_char(&self, offset: usize) -> bool {
        self.rest()[offset..].chars().next().is_some_and(is_name_char)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.position += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.position >= self.source.len()
    }

    fn error(&self, message: &str) -> PathError {
        PathError::Syntax {
            path: self.source.to_string(),
            message: format!("{message} at {}", self.position),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':')
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::placeholder::Context;
    use pretty_assertions::assert_eq;

    fn standard(source: &str) -> String {
        let path = Parser::new(source).parse_path().expect("path must parse");
        path.to_standard(&Default::default(), &Context::new()).unwrap()
    }

    #[test]
    fn names_become_bracketed() {
        assert_eq!(
            standard("$.functions.create-order['My Fn'].events[0]"),
            "$['functions']['create-order']['My Fn']['events'][0]"
        );
        assert_eq!(standard("$..Ref"), "$..['Ref']");
        assert_eq!(standard("$.obj['c','a'].*"), "$['obj']['c','a'][*]");
    }

    #[test]
    fn regex_matches_become_search() {
        assert_eq!(
            standard("$.Resources[?(@.Type =~ '^AWS::SQS' && !@.Condition)]"),
            "$['Resources'][?( search(@['Type'], \"^AWS::SQS\") && ! @['Condition'] )]"
        );
    }

    #[test]
    fn key_filters_are_flagged() {
        let path = Parser::new("@.environment[?(@key =~ '_TABLE$')]")
            .parse_path()
            .unwrap();
        assert_eq!(path.root, Root::Current);
        assert!(path.segments[1].uses_key());
        assert!(!path.segments[0].uses_key());
    }

    #[test]
    fn syntax_errors() {
        for source in [
            "Resources",
            "$.",
            "$[",
            "$['open",
            "$[?(@.a == 1]",
            "$[?(@.a =~ )]",
            "$..[?(@key == 'a')]",
        ] {
            assert!(
                matches!(
                    Parser::new(source).parse_path(),
                    Err(PathError::Syntax { .. })
                ),
                "{source} should not parse"
            );
        }
    }
}
