//! Small HTTP contracts shared by the matcher, the filter chain, and backend
//! dispatch in `monoroute-route`.
use http::Response;

/// A response paired with whether the inbound connection may be kept alive.
pub type ResponseWithContinue<B> = (Response<B>, bool);

/// Errors that can render themselves into an HTTP response (404, 502,
/// 504, 413, 500) rather than unwinding the request. `None` means the
/// error has no representable status and the connection should just be
/// torn down.
pub trait HttpError<B> {
    fn to_response(&self) -> Option<Response<B>>;
}
