//! The concrete [`BackendDispatcher`]: proxies a request over a fresh
//! TCP connection to the chosen backend endpoint, using the framing in
//! [`crate::http1`], since the engine deals in fully-buffered
//! `Request<Bytes>`/`Response<Bytes>` rather than a streaming body type.

use bytes::Bytes;
use http::{Request, Response};
use monoio::net::TcpStream;
use monoroute_route::engine::{BackendDispatcher, EngineError, EngineTimeouts};

pub struct NetworkDispatcher;

fn parse_authority(endpoint_url: &str) -> Result<String, EngineError> {
    let without_scheme = endpoint_url.split_once("://").map(|(_, rest)| rest).unwrap_or(endpoint_url);
    let authority = without_scheme.split(['/', '?']).next().unwrap_or(without_scheme);
    if authority.is_empty() {
        return Err(EngineError::BackendError(format!("invalid endpoint url: {endpoint_url}")));
    }
    Ok(if authority.contains(':') { authority.to_string() } else { format!("{authority}:80") })
}

impl BackendDispatcher for NetworkDispatcher {
    async fn dispatch(
        &self,
        endpoint_url: &str,
        request: Request<Bytes>,
        timeouts: EngineTimeouts,
    ) -> Result<Response<Bytes>, EngineError> {
        let authority = parse_authority(endpoint_url)?;

        let connect = monoio::time::timeout(timeouts.connect, TcpStream::connect(&authority));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(EngineError::BackendError(format!("connect to {authority}: {e}"))),
            Err(_) => return Err(EngineError::Timeout),
        };

        if let Err(e) = crate::http1::write_request(&mut stream, &request).await {
            return Err(EngineError::BackendError(format!("write to {authority}: {e}")));
        }

        let read = monoio::time::timeout(timeouts.response_header, crate::http1::read_response(&mut stream));
        match read.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(EngineError::BackendError(format!("read from {authority}: {e}"))),
            Err(_) => Err(EngineError::Timeout),
        }
    }
}
