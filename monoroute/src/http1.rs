//! Minimal HTTP/1.1 framing over monoio's owned-buffer I/O traits:
//! decode a request off an accepted connection, encode a response back,
//! and the client-side mirror used by [`crate::dispatch::NetworkDispatcher`].
//!
//! Deliberately narrow: fixed-length (`Content-Length`) bodies only, no
//! chunked transfer-encoding, no pipelining beyond one request in
//! flight per read. Good enough to drive the execution engine end to
//! end; a production build-out would reach for `monoio-http`'s codec
//! instead of this hand-rolled framing.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 4096;

async fn read_until_headers_done<S: AsyncReadRent>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>> {
    let mut acc = Vec::new();
    loop {
        let buf = vec![0u8; READ_CHUNK];
        let (res, buf) = stream.read(buf).await;
        let n = res?;
        if n == 0 {
            return Ok(if acc.is_empty() { None } else { Some(acc) });
        }
        acc.extend_from_slice(&buf[..n]);
        if acc.len() > MAX_HEADER_BYTES * 4 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "headers too large"));
        }
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut probe = httparse::Request::new(&mut headers);
        if probe.parse(&acc).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?.is_complete() {
            return Ok(Some(acc));
        }
    }
}

fn content_length(headers: &HeaderMap) -> usize {
    headers.get(http::header::CONTENT_LENGTH).and_then(|v| v.to_str().ok()).and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Read one request off `stream`. Returns `Ok(None)` on a clean EOF
/// before any bytes arrive (idle keep-alive connection closed by peer).
pub async fn read_request<S: AsyncReadRent>(stream: &mut S) -> std::io::Result<Option<Request<Bytes>>> {
    let Some(acc) = read_until_headers_done(stream).await? else { return Ok(None) };

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    let httparse::Status::Complete(consumed) =
        parsed.parse(&acc).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "incomplete request"));
    };

    let method = Method::from_bytes(parsed.method.unwrap_or("GET").as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let uri: Uri =
        parsed.path.unwrap_or("/").parse().map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad uri"))?;

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(h.name.as_bytes()), HeaderValue::from_bytes(h.value)) {
            headers.append(name, value);
        }
    }

    let mut builder = Request::builder().method(method).uri(uri);
    *builder.headers_mut().expect("fresh builder has headers") = headers.clone();

    let want = content_length(&headers);
    let mut body = acc[consumed..].to_vec();
    while body.len() < want {
        let buf = vec![0u8; (want - body.len()).min(READ_CHUNK).max(1)];
        let (res, buf) = stream.read(buf).await;
        let n = res?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(want);

    builder.body(Bytes::from(body)).map(Some).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Serialize and write a response back over `stream`, setting
/// `Content-Length` from the concrete (fully buffered) body.
pub async fn write_response<S: monoio::io::AsyncWriteRent>(stream: &mut S, resp: Response<Bytes>) -> std::io::Result<()> {
    let (parts, body) = resp.into_parts();
    let mut out = Vec::with_capacity(body.len() + 256);
    let reason = parts.status.canonical_reason().unwrap_or("");
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", parts.status.as_u16(), reason).as_bytes());
    for (name, value) in parts.headers.iter() {
        if name == http::header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    let (res, _) = stream.write_all(out).await;
    res?;
    Ok(())
}

/// Client-side mirror of [`write_response`], used by the network
/// dispatcher to send a proxied request to a backend.
pub async fn write_request<S: monoio::io::AsyncWriteRent>(stream: &mut S, req: &Request<Bytes>) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(req.body().len() + 256);
    let path_and_query = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path_and_query).as_bytes());
    for (name, value) in req.headers().iter() {
        if name == http::header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", req.body().len()).as_bytes());
    out.extend_from_slice(req.body());
    let (res, _) = stream.write_all(out).await;
    res?;
    Ok(())
}

/// Client-side mirror of [`read_request`]: decode a backend's response.
pub async fn read_response<S: AsyncReadRent>(stream: &mut S) -> std::io::Result<Response<Bytes>> {
    let acc = read_until_headers_done(stream).await?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "backend closed before sending a response")
    })?;

    let mut raw_headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut raw_headers);
    let httparse::Status::Complete(consumed) =
        parsed.parse(&acc).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
    else {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "incomplete response"));
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or(502))
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut headers = HeaderMap::new();
    for h in parsed.headers.iter() {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(h.name.as_bytes()), HeaderValue::from_bytes(h.value)) {
            headers.append(name, value);
        }
    }

    let mut builder = Response::builder().status(status);
    *builder.headers_mut().expect("fresh builder has headers") = headers.clone();

    let want = content_length(&headers);
    let mut body = acc[consumed..].to_vec();
    while body.len() < want {
        let buf = vec![0u8; (want - body.len()).min(READ_CHUNK).max(1)];
        let (res, buf) = stream.read(buf).await;
        let n = res?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(want);

    builder.body(Bytes::from(body)).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
