//! Recursive-descent parser over the token stream produced by
//! [`super::lexer`].

use std::fmt;

use super::ast::{ArgNode, BackendNode, CallNode, PredicateClause, RouteNode};
use super::lexer::{Lexer, Spanned, Token};

/// A parse failure, carrying enough context to report a useful message:
/// the last token consumed, its byte offset, and the id of the route
/// being parsed when the failure occurred (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub offset: usize,
    pub last_token: String,
    pub partial_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parse error at byte {} near {:?}{}: {}",
            self.offset,
            self.last_token,
            self.partial_id
                .as_ref()
                .map(|id| format!(" (route {id:?})"))
                .unwrap_or_default(),
            self.message
        )
    }
}

impl std::error::Error for ParseError {}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    partial_id: Option<String>,
}

impl Parser {
    fn cur(&self) -> &Spanned {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            offset: self.cur().offset,
            last_token: format!("{:?}", self.cur().token),
            partial_id: self.partial_id.clone(),
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Token {
        let t = self.cur().token.clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Token) -> Result<(), ParseError> {
        if &self.cur().token == want {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {want:?}, found {:?}", self.cur().token)))
        }
    }

    fn at_eof(&self) -> bool {
        self.cur().token == Token::Eof
    }

    fn parse_routes(&mut self) -> Result<Vec<RouteNode>, ParseError> {
        let mut routes = Vec::new();
        while !self.at_eof() {
            let route = self.parse_route()?;
            routes.push(route);
            if self.cur().token == Token::Semi {
                self.advance();
            } else if !self.at_eof() {
                return Err(self.err("expected ';' between routes"));
            }
        }
        Ok(routes)
    }

    fn parse_route(&mut self) -> Result<RouteNode, ParseError> {
        self.partial_id = None;
        let id = if let Token::Ident(name) = &self.cur().token {
            // An id is only present if followed by ':'.
            let save = self.pos;
            let name = name.clone();
            self.advance();
            if self.cur().token == Token::Colon {
                self.advance();
                self.partial_id = Some(name.clone());
                Some(name)
            } else {
                self.pos = save;
                None
            }
        } else {
            None
        };

        let predicates = self.parse_predicate_clause()?;
        self.expect(&Token::Arrow)?;

        let mut filters = Vec::new();
        let backend = loop {
            match &self.cur().token {
                Token::Ident(_) => {
                    let call = self.parse_call()?;
                    self.expect(&Token::Arrow)?;
                    filters.push(call);
                }
                Token::String(_) | Token::Lt => break self.parse_backend()?,
                _ => return Err(self.err("expected filter call or backend")),
            }
        };

        Ok(RouteNode { id, predicates, filters, backend })
    }

    fn parse_predicate_clause(&mut self) -> Result<PredicateClause, ParseError> {
        if self.cur().token == Token::Star {
            self.advance();
            return Ok(PredicateClause::Any);
        }
        let mut calls = vec![self.parse_call()?];
        while self.cur().token == Token::And {
            self.advance();
            calls.push(self.parse_call()?);
        }
        Ok(PredicateClause::All(calls))
    }

    fn parse_call(&mut self) -> Result<CallNode, ParseError> {
        let name = match self.advance() {
            Token::Ident(name) => name,
            other => return Err(self.err(format!("expected identifier, found {other:?}"))),
        };
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if self.cur().token != Token::RParen {
            args.push(self.parse_arg()?);
            while self.cur().token == Token::Comma {
                self.advance();
                args.push(self.parse_arg()?);
            }
        }
        self.expect(&Token::RParen)?;
        Ok(CallNode { name, args })
    }

    fn parse_arg(&mut self) -> Result<ArgNode, ParseError> {
        match self.advance() {
            Token::String(s) => Ok(ArgNode::String(s)),
            Token::Number(n) => Ok(ArgNode::Number(n)),
            Token::Regex(r) => Ok(ArgNode::Regex(r)),
            other => Err(self.err(format!("expected argument, found {other:?}"))),
        }
    }

    fn parse_backend(&mut self) -> Result<BackendNode, ParseError> {
        match self.advance() {
            Token::String(s) => Ok(BackendNode::Network(s)),
            Token::Lt => {
                let keyword = match self.advance() {
                    Token::Ident(name) => name,
                    other => return Err(self.err(format!("expected backend keyword, found {other:?}"))),
                };
                match keyword.as_str() {
                    "shunt" => {
                        self.expect(&Token::Gt)?;
                        Ok(BackendNode::Shunt)
                    }
                    "loopback" => {
                        self.expect(&Token::Gt)?;
                        Ok(BackendNode::Loopback)
                    }
                    "dynamic" => {
                        self.expect(&Token::Gt)?;
                        Ok(BackendNode::Dynamic)
                    }
                    algorithm => {
                        let mut endpoints = Vec::new();
                        while self.cur().token == Token::Comma {
                            self.advance();
                            match self.advance() {
                                Token::String(s) => endpoints.push(s),
                                other => {
                                    return Err(self.err(format!(
                                        "expected endpoint url string, found {other:?}"
                                    )))
                                }
                            }
                        }
                        if endpoints.is_empty() {
                            return Err(self.err("load-balanced backend needs at least one endpoint"));
                        }
                        self.expect(&Token::Gt)?;
                        Ok(BackendNode::LoadBalanced { algorithm: algorithm.to_string(), endpoints })
                    }
                }
            }
            other => Err(self.err(format!("expected backend, found {other:?}"))),
        }
    }
}

/// Parse a full route script into its route nodes.
pub fn parse_routes(src: &str) -> Result<Vec<RouteNode>, ParseError> {
    let tokens = Lexer::new(src).tokenize().map_err(|e| ParseError {
        offset: e.offset,
        last_token: String::new(),
        partial_id: None,
        message: e.message,
    })?;
    let mut parser = Parser { tokens, pos: 0, partial_id: None };
    parser.parse_routes()
}

/// Parse a standalone, comma-free filter chain: `f1(...) -> f2(...)`.
pub fn parse_filters(src: &str) -> Result<Vec<CallNode>, ParseError> {
    let tokens = Lexer::new(src).tokenize().map_err(|e| ParseError {
        offset: e.offset,
        last_token: String::new(),
        partial_id: None,
        message: e.message,
    })?;
    let mut parser = Parser { tokens, pos: 0, partial_id: None };
    let mut filters = Vec::new();
    if !parser.at_eof() {
        filters.push(parser.parse_call()?);
        while parser.cur().token == Token::Arrow {
            parser.advance();
            filters.push(parser.parse_call()?);
        }
    }
    if !parser.at_eof() {
        return Err(parser.err("unexpected trailing tokens"));
    }
    Ok(filters)
}

/// Parse a standalone predicate conjunction: `p1(...) && p2(...)`.
pub fn parse_predicates(src: &str) -> Result<Vec<CallNode>, ParseError> {
    let tokens = Lexer::new(src).tokenize().map_err(|e| ParseError {
        offset: e.offset,
        last_token: String::new(),
        partial_id: None,
        message: e.message,
    })?;
    let mut parser = Parser { tokens, pos: 0, partial_id: None };
    match parser.parse_predicate_clause()? {
        PredicateClause::Any => Ok(Vec::new()),
        PredicateClause::All(calls) => {
            if !parser.at_eof() {
                return Err(parser.err("unexpected trailing tokens"));
            }
            Ok(calls)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_shunt_route() {
        let routes = parse_routes(
            r#"r: Path("/old") -> status(302) -> setResponseHeader("Location", "/new") -> <shunt>;"#,
        )
        .unwrap();
        assert_eq!(routes.len(), 1);
        let r = &routes[0];
        assert_eq!(r.id.as_deref(), Some("r"));
        assert_eq!(r.filters.len(), 2);
        assert_eq!(r.backend, BackendNode::Shunt);
    }

    #[test]
    fn parses_load_balanced_backend() {
        let routes =
            parse_routes(r#"* -> <roundRobin, "http://a:80", "http://b:80">;"#).unwrap();
        assert_eq!(
            routes[0].backend,
            BackendNode::LoadBalanced {
                algorithm: "roundRobin".into(),
                endpoints: vec!["http://a:80".into(), "http://b:80".into()],
            }
        );
    }

    #[test]
    fn parses_multiple_routes_without_trailing_semi() {
        let routes = parse_routes(
            r#"
            r1: Header("X-Loop","1") -> setRequestHeader("X-Loop","2") -> <loopback>;
            r2: Header("X-Loop","2") -> inlineContent("done") -> <shunt>
            "#,
        )
        .unwrap();
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn reports_offset_and_partial_id_on_error() {
        let err = parse_routes(r#"r: Path("/a" -> "http://x";"#).unwrap_err();
        assert_eq!(err.partial_id.as_deref(), Some("r"));
    }
}
