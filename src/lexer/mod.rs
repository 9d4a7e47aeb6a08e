use logos::Logos;

use crate::ast::Func;

#[derive(Logos, Debug, PartialEq, Clone, Copy)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[regex(r"[0-9]+")]
    Integer,

    // Raw string literals: no escapes, body runs to the matching quote.
    #[regex(r#""[^"]*""#)]
    #[regex(r"'[^']*'")]
    Text,

    #[regex(r"[a-z_][a-z0-9_]*")]
    Ident,

    // Word functions collapse to their first letter; trailing uppercase
    // letters and underscores belong to the same token, so `OUTPUT` and
    // `O` lex identically. Unknown first letters and symbols are errors.
    #[regex(r"[A-Z][A-Z_]*", |lex| Func::from_word(lex.slice()))]
    #[regex(r"[+\-*/%^<>?&|;=!~,:@\[\]]", |lex| Func::from_symbol(lex.slice().as_bytes()[0]))]
    Function(Func),

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,
}

#[derive(Debug, thiserror::Error)]
#[error("lex error at byte {position}: '{snippet}'. {suggestion}")]
pub struct LexError {
    pub code: &'static str,
    pub position: usize,
    pub snippet: String,
    pub suggestion: String,
}

/// Lex source into tokens with byte ranges.
pub fn lex(source: &str) -> Result<Vec<(Token, std::ops::Range<usize>)>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                let span = lexer.span();
                let bad = &source[span.clone()];
                let (code, suggestion) = lex_error_kind(bad);
                return Err(LexError {
                    code,
                    position: span.start,
                    snippet: bad.to_string(),
                    suggestion,
                });
            }
        }
    }

    Ok(tokens)
}

fn lex_error_kind(bad_token: &str) -> (&'static str, String) {
    let first = bad_token.bytes().next();
    if first == Some(b'"') || first == Some(b'\'') {
        (
            "KN-L002",
            "Unterminated string: strings run to the matching quote and have no escapes".to_string(),
        )
    } else if first.is_some_and(|b| b.is_ascii_uppercase()) {
        (
            "KN-L003",
            format!("'{}' does not name a function", bad_token),
        )
    } else {
        (
            "KN-L001",
            format!("Unexpected character(s): '{bad_token}'"),
        )
    }
}
