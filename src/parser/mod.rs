use std::ops::Range;

use crate::ast::{Ast, Func, NodeId, NodeKind, Span};
use crate::lexer::Token;

#[derive(Debug, thiserror::Error)]
#[error("parse error at token {position}: {message}")]
pub struct ParseError {
    pub code: &'static str,
    pub position: usize,
    pub span: Span,
    pub message: String,
}

type Result<T> = std::result::Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    end: usize,
    ast: Ast,
}

impl Parser {
    pub fn new(source: String, tokens: Vec<(Token, Range<usize>)>) -> Self {
        let end = source.len();
        // Parentheses are grouping noise with no effect on the prefix
        // grammar; filter them out up front.
        let tokens: Vec<(Token, Span)> = tokens
            .into_iter()
            .filter(|(t, _)| !matches!(t, Token::LParen | Token::RParen))
            .map(|(t, r)| (t, Span { start: r.start, end: r.end }))
            .collect();
        Parser {
            tokens,
            pos: 0,
            end,
            ast: Ast::new(source),
        }
    }

    fn peek(&self) -> Option<(Token, Span)> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<(Token, Span)> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, code: &'static str, message: String) -> ParseError {
        let span = self
            .tokens
            .get(self.pos)
            .map(|(_, s)| *s)
            .unwrap_or(Span { start: self.end, end: self.end });
        ParseError {
            code,
            position: self.pos,
            span,
            message,
        }
    }

    pub fn parse_program(mut self) -> Result<Ast> {
        self.parse_expr()?;
        if let Some((tok, _)) = self.peek() {
            return Err(self.error(
                "KN-P002",
                format!("expected end of program, got {:?}", tok),
            ));
        }
        Ok(self.ast)
    }

    fn parse_expr(&mut self) -> Result<NodeId> {
        match self.advance() {
            Some((Token::Integer, span)) => {
                let id = self.ast.push_node(NodeKind::Integer, span);
                self.ast.set_bytes(id, span.start, span.end);
                Ok(id)
            }
            Some((Token::Text, span)) => {
                let id = self.ast.push_node(NodeKind::Text, span);
                // The quotes are part of the token but not of the string.
                self.ast.set_bytes(id, span.start + 1, span.end - 1);
                Ok(id)
            }
            Some((Token::Ident, span)) => {
                let id = self.ast.push_node(NodeKind::Identifier, span);
                self.ast.set_bytes(id, span.start, span.end);
                Ok(id)
            }
            Some((Token::Function(func), span)) => {
                // Parent first: node 0 must be the root, and node order must
                // follow source order for the analyzer's slot assignment.
                let id = self.ast.push_node(NodeKind::Function(func), span);
                let mut args = [0 as NodeId; 4];
                for slot in args.iter_mut().take(func.arity()) {
                    *slot = self.parse_arg(func)?;
                }
                self.ast.set_children(id, &args[..func.arity()]);
                Ok(id)
            }
            Some((tok, _)) => {
                self.pos -= 1;
                Err(self.error("KN-P003", format!("expected expression, got {:?}", tok)))
            }
            None => Err(self.error("KN-P001", "expected expression, got end of input".into())),
        }
    }

    fn parse_arg(&mut self, func: Func) -> Result<NodeId> {
        if self.peek().is_none() {
            return Err(self.error(
                "KN-P001",
                format!("missing argument for `{}`", func.name()),
            ));
        }
        self.parse_expr()
    }
}

/// Convenience function
pub fn parse(source: String, tokens: Vec<(Token, Range<usize>)>) -> Result<Ast> {
    Parser::new(source, tokens).parse_program()
}
