//! HTTP protocol layer
//!
//! Request parsing, response framing, headers and cookies

pub mod cookie;
pub mod headers;
pub mod request;
pub mod response;

pub use cookie::{parse_cookie_header, Cookie};
pub use headers::{HeaderMap, HeadersChecker, HttpError};
pub use request::{parse_urlencoded, percent_decode, ParseStatus, Part, Request, RequestParser};
pub use response::{FramingMode, Response};
