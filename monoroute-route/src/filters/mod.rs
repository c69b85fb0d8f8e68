//! The bundled filter set: response shaping (`status`, header mutation,
//! `inlineContent`), request shaping (header mutation, `setQuery`,
//! `stripQuery`, `modPath`, `preserveHost`).

use bytes::Bytes;
use http::{HeaderName, HeaderValue, StatusCode};
use regex::Regex;

use crate::engine::FilterContext;
use crate::registry::{Filter, FilterRegistry, FilterSpec, SpecError};
use crate::script::ast::ArgNode;

fn arg_str(args: &[ArgNode], idx: usize) -> Result<String, SpecError> {
    match args.get(idx) {
        Some(ArgNode::String(s)) => Ok(s.clone()),
        Some(ArgNode::Number(n)) => Ok(n.to_string()),
        Some(ArgNode::Regex(r)) => Ok(r.clone()),
        None => Err(SpecError(format!("missing argument {idx}"))),
    }
}

fn header_name(s: &str) -> Result<HeaderName, SpecError> {
    HeaderName::try_from(s).map_err(|e| SpecError(format!("invalid header name {s:?}: {e}")))
}

fn header_value(s: &str) -> Result<HeaderValue, SpecError> {
    HeaderValue::try_from(s).map_err(|e| SpecError(format!("invalid header value {s:?}: {e}")))
}

macro_rules! simple_spec {
    ($spec_name:ident, $name:literal, $filter_ty:ty, $create:expr) => {
        struct $spec_name;
        impl FilterSpec for $spec_name {
            fn name(&self) -> &str {
                $name
            }
            fn create(&self, args: &[ArgNode]) -> Result<Box<dyn Filter>, SpecError> {
                let f: fn(&[ArgNode]) -> Result<$filter_ty, SpecError> = $create;
                f(args).map(|filter| Box::new(filter) as Box<dyn Filter>)
            }
        }
    };
}

// -- status(code) : overrides the response status line.
struct Status(StatusCode);
impl Filter for Status {
    fn on_response(&self, ctx: &mut FilterContext<'_>) {
        if let Some(resp) = ctx.response.as_mut() {
            *resp.status_mut() = self.0;
        }
    }
}
simple_spec!(StatusSpec, "status", Status, |args| {
    let code = arg_str(args, 0)?;
    let code: u16 = code.parse().map_err(|_| SpecError(format!("invalid status code: {code}")))?;
    StatusCode::from_u16(code).map(Status).map_err(|e| SpecError(format!("invalid status code: {e}")))
});

// -- setRequestHeader(name, value) : replaces (or inserts) a request header.
struct SetRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}
impl Filter for SetRequestHeader {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        ctx.request.headers_mut().insert(self.name.clone(), self.value.clone());
    }
}
simple_spec!(SetRequestHeaderSpec, "setRequestHeader", SetRequestHeader, |args| {
    Ok(SetRequestHeader { name: header_name(&arg_str(args, 0)?)?, value: header_value(&arg_str(args, 1)?)? })
});

// -- setResponseHeader(name, value) : replaces (or inserts) a response header.
struct SetResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}
impl Filter for SetResponseHeader {
    fn on_response(&self, ctx: &mut FilterContext<'_>) {
        if let Some(resp) = ctx.response.as_mut() {
            resp.headers_mut().insert(self.name.clone(), self.value.clone());
        }
    }
}
simple_spec!(SetResponseHeaderSpec, "setResponseHeader", SetResponseHeader, |args| {
    Ok(SetResponseHeader { name: header_name(&arg_str(args, 0)?)?, value: header_value(&arg_str(args, 1)?)? })
});

// -- appendRequestHeader(name, value) : adds an additional request header value.
struct AppendRequestHeader {
    name: HeaderName,
    value: HeaderValue,
}
impl Filter for AppendRequestHeader {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        ctx.request.headers_mut().append(self.name.clone(), self.value.clone());
    }
}
simple_spec!(AppendRequestHeaderSpec, "appendRequestHeader", AppendRequestHeader, |args| {
    Ok(AppendRequestHeader { name: header_name(&arg_str(args, 0)?)?, value: header_value(&arg_str(args, 1)?)? })
});

// -- appendResponseHeader(name, value) : adds an additional response header value.
struct AppendResponseHeader {
    name: HeaderName,
    value: HeaderValue,
}
impl Filter for AppendResponseHeader {
    fn on_response(&self, ctx: &mut FilterContext<'_>) {
        if let Some(resp) = ctx.response.as_mut() {
            resp.headers_mut().append(self.name.clone(), self.value.clone());
        }
    }
}
simple_spec!(AppendResponseHeaderSpec, "appendResponseHeader", AppendResponseHeader, |args| {
    Ok(AppendResponseHeader { name: header_name(&arg_str(args, 0)?)?, value: header_value(&arg_str(args, 1)?)? })
});

// -- setQuery(name, value) : sets (replacing any existing occurrences) a query parameter.
struct SetQuery {
    name: String,
    value: String,
}
impl Filter for SetQuery {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        let uri = ctx.request.uri().clone();
        let path = uri.path();
        let mut pairs: Vec<(String, String)> = uri
            .query()
            .map(|q| {
                q.split('&')
                    .filter(|s| !s.is_empty())
                    .map(|kv| match kv.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (kv.to_string(), String::new()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        pairs.retain(|(k, _)| k != &self.name);
        pairs.push((self.name.clone(), self.value.clone()));
        let query = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        let new_uri = format!("{path}?{query}");
        if let Ok(uri) = new_uri.parse() {
            *ctx.request.uri_mut() = uri;
        }
    }
}
simple_spec!(SetQuerySpec, "setQuery", SetQuery, |args| {
    Ok(SetQuery { name: arg_str(args, 0)?, value: arg_str(args, 1)? })
});

// -- stripQuery() : removes the whole query string.
struct StripQuery;
impl Filter for StripQuery {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        let path = ctx.request.uri().path().to_string();
        if let Ok(uri) = path.parse() {
            *ctx.request.uri_mut() = uri;
        }
    }
}
simple_spec!(StripQuerySpec, "stripQuery", StripQuery, |_args| Ok(StripQuery));

// -- preserveHost(flag) : whether to forward the original Host header unchanged (default true).
struct PreserveHost(bool);
impl Filter for PreserveHost {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        ctx.state.state.insert(monoroute_core::context::state::KEY_PRESERVE_HOST, self.0);
    }
}
simple_spec!(PreserveHostSpec, "preserveHost", PreserveHost, |args| {
    let flag = match args.first() {
        Some(ArgNode::String(s)) => s != "false",
        None => true,
        other => return Err(SpecError(format!("expected boolean-like argument, found {other:?}"))),
    };
    Ok(PreserveHost(flag))
});

// -- inlineContent(body) : replaces the response body with a literal string, defaulting status to 200.
struct InlineContent(Bytes);
impl Filter for InlineContent {
    fn on_response(&self, ctx: &mut FilterContext<'_>) {
        if let Some(resp) = ctx.response.as_mut() {
            if resp.status() == StatusCode::NOT_FOUND {
                *resp.status_mut() = StatusCode::OK;
            }
            *resp.body_mut() = self.0.clone();
            if let Ok(len) = HeaderValue::from_str(&self.0.len().to_string()) {
                resp.headers_mut().insert(http::header::CONTENT_LENGTH, len);
            }
        }
    }
}
simple_spec!(InlineContentSpec, "inlineContent", InlineContent, |args| {
    Ok(InlineContent(Bytes::from(arg_str(args, 0)?)))
});

// -- modPath(pattern, replacement) : rewrites the request path via a regex substitution.
struct ModPath {
    pattern: Regex,
    replacement: String,
}
impl Filter for ModPath {
    fn on_request(&self, ctx: &mut FilterContext<'_>) {
        let uri = ctx.request.uri().clone();
        let new_path = self.pattern.replace(uri.path(), self.replacement.as_str()).into_owned();
        let rebuilt = match uri.query() {
            Some(q) => format!("{new_path}?{q}"),
            None => new_path,
        };
        if let Ok(uri) = rebuilt.parse() {
            *ctx.request.uri_mut() = uri;
        }
    }
}
simple_spec!(ModPathSpec, "modPath", ModPath, |args| {
    let pattern = arg_str(args, 0)?;
    let pattern = Regex::new(&pattern).map_err(|e| SpecError(format!("invalid regex {pattern:?}: {e}")))?;
    Ok(ModPath { pattern, replacement: arg_str(args, 1)? })
});

/// Register the bundled filter set into a fresh registry.
pub fn register_all(reg: &mut FilterRegistry) {
    reg.register("status", std::rc::Rc::new(StatusSpec));
    reg.register("setRequestHeader", std::rc::Rc::new(SetRequestHeaderSpec));
    reg.register("setResponseHeader", std::rc::Rc::new(SetResponseHeaderSpec));
    reg.register("appendRequestHeader", std::rc::Rc::new(AppendRequestHeaderSpec));
    reg.register("appendResponseHeader", std::rc::Rc::new(AppendResponseHeaderSpec));
    reg.register("setQuery", std::rc::Rc::new(SetQuerySpec));
    reg.register("stripQuery", std::rc::Rc::new(StripQuerySpec));
    reg.register("preserveHost", std::rc::Rc::new(PreserveHostSpec));
    reg.register("inlineContent", std::rc::Rc::new(InlineContentSpec));
    reg.register("modPath", std::rc::Rc::new(ModPathSpec));
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request, Response};

    fn ctx_request() -> Request<Bytes> {
        Request::builder().method("GET").uri("/a/b?x=1").body(Bytes::new()).unwrap()
    }

    #[test]
    fn set_query_replaces_existing_value() {
        let filter = SetQuerySpec.create(&[ArgNode::String("x".into()), ArgNode::String("2".into())]).unwrap();
        let mut request = ctx_request();
        let mut response = None;
        let mut state = monoroute_core::context::state::RequestState::new("h".into(), 1);
        let mut ctx = FilterContext { request: &mut request, response: &mut response, original: None, peer_ip: None, state: &mut state };
        filter.on_request(&mut ctx);
        assert_eq!(ctx.request.uri().query(), Some("x=2"));
    }

    #[test]
    fn mod_path_rewrites_and_keeps_query() {
        let filter = ModPathSpec
            .create(&[ArgNode::String("^/a".into()), ArgNode::String("/z".into())])
            .unwrap();
        let mut request = ctx_request();
        let mut response = None;
        let mut state = monoroute_core::context::state::RequestState::new("h".into(), 1);
        let mut ctx = FilterContext { request: &mut request, response: &mut response, original: None, peer_ip: None, state: &mut state };
        filter.on_request(&mut ctx);
        assert_eq!(ctx.request.uri().path(), "/z/b");
        assert_eq!(ctx.request.uri().query(), Some("x=1"));
    }

    #[test]
    fn inline_content_turns_not_found_into_ok() {
        let filter = InlineContentSpec.create(&[ArgNode::String("done".into())]).unwrap();
        let mut request = ctx_request();
        let mut response = Some(Response::builder().status(StatusCode::NOT_FOUND).body(Bytes::new()).unwrap());
        let mut state = monoroute_core::context::state::RequestState::new("h".into(), 1);
        let mut ctx = FilterContext { request: &mut request, response: &mut response, original: None, peer_ip: None, state: &mut state };
        filter.on_response(&mut ctx);
        assert_eq!(response.unwrap().status(), StatusCode::OK);
    }
}
