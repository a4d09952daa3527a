//! Token gating and error recovery on top of the lexer.
//!
//! Holds the current/previous token pair and the panic-mode flag: the first
//! error in a statement is reported, everything after it is suppressed until
//! `synchronize` skips to the next statement boundary.

use super::lexer::{Lexer, Token, TokenKind};

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    pub current: Token<'src>,
    pub previous: Token<'src>,
    error_count: usize,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Parser<'src> {
        let mut parser = Parser {
            lexer: Lexer::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            error_count: 0,
            panic_mode: false,
        };
        parser.advance();
        parser
    }

    /// Move to the next token, reporting and skipping error tokens.
    pub fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    pub fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Consume the current token if it matches.
    pub fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Require the current token to match, else report `message`.
    pub fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    pub fn had_error(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn panic_mode(&self) -> bool {
        self.panic_mode
    }

    /// Report an error at the previous token.
    pub fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    pub fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.error_count += 1;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
    }

    /// Leave panic mode by skipping ahead to a statement boundary: just past
    /// a semicolon, or just before a statement-starting keyword.
    pub fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }
}
