/*!
Canned error documents and the static-file responder.
*/

use std::io::Write;

use hyper::{
    header,
    header::{HeaderName, HeaderValue},
    Body, Response, StatusCode,
};
use smallvec::SmallVec;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::{mime::MimeMap, resolve::ResolvedTarget, GateErr, Output};

static CANNED_HEAD: &str = include_str!("response_files/canned_head.html");
static CANNED_MIDDLE: &str = include_str!("response_files/canned_middle.html");
static CANNED_FOOT: &str = include_str!("response_files/canned_foot.html");
static CANNED_BASE_RESPONSE_LEN: usize =
    CANNED_HEAD.len() + CANNED_MIDDLE.len() + CANNED_FOOT.len();

static R_400: (&str, &str) = (
    "Invalid Request",
    "The request cannot be processed.",
);
static R_403: (&str, &str) = (
    "Forbidden",
    "Requested file isn't available.",
);
static R_404: (&str, &str) = (
    "File not found",
    "Requested file isn't available.",
);
static R_500: (&str, &str) = (
    "Internal Error",
    "The server encountered error on trying to process your request.",
);
static R_OTHER: (&str, &str) = (
    "Request Failed",
    "The server encountered malfunction on processing your request.",
);

/// Title and body text for an error document. Generic on purpose: detail
/// goes to the log, never to the client.
pub fn error_text(code: StatusCode) -> (&'static str, &'static str) {
    match code {
        StatusCode::BAD_REQUEST => R_400,
        StatusCode::FORBIDDEN => R_403,
        StatusCode::NOT_FOUND => R_404,
        StatusCode::INTERNAL_SERVER_ERROR => R_500,
        _ => R_OTHER,
    }
}

/// The `Date` header value, RFC 2822 formatted.
pub fn date_value() -> Option<HeaderValue> {
    let mut bytes = SmallVec::<[u8; 36]>::new();
    if let Err(e) = OffsetDateTime::now_utc().format_into(&mut bytes, &Rfc2822) {
        log::error!("Error formatting date header: {}", &e);
        return None;
    }
    match HeaderValue::try_from(bytes.as_slice()) {
        Ok(val) => Some(val),
        Err(e) => {
            log::error!("Error headerizing date {:?}: {}", &bytes, &e);
            None
        }
    }
}

/// Minimal HTML error document for the given status code.
pub fn error_doc(code: StatusCode) -> Response<Body> {
    let (title, text) = error_text(code);
    let contents = format!("<h1>{}</h1>\n<p>{}</p>\n", title, text);

    let response_length = CANNED_BASE_RESPONSE_LEN + title.len() + contents.len();
    let mut v: Vec<u8> = Vec::with_capacity(response_length);

    v.write_all(CANNED_HEAD.as_bytes()).unwrap();
    v.write_all(title.as_bytes()).unwrap();
    v.write_all(CANNED_MIDDLE.as_bytes()).unwrap();
    v.write_all(contents.as_bytes()).unwrap();
    v.write_all(CANNED_FOOT.as_bytes()).unwrap();

    let mut resp_builder = Response::builder()
        .status(code)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("text/html"))
        .header(header::CONTENT_LENGTH, HeaderValue::from(v.len()));
    if let Some(date) = date_value() {
        resp_builder = resp_builder.header(header::DATE, date);
    }
    resp_builder.body(Body::from(v)).unwrap()
}

/// A bodyless response, used for redirects.
pub fn header_only(
    code: StatusCode,
    mut addl_headers: Vec<(HeaderName, HeaderValue)>,
) -> Response<Body> {
    let mut resp = Response::builder()
        .status(code)
        .body(Body::empty())
        .unwrap();

    for (name, val) in addl_headers.drain(..) {
        resp.headers_mut().insert(name, val);
    }

    resp
}

/// Streams the resolved file with its configured MIME type.
///
/// A failure to open the stream renders as 403 upstream, so the error
/// carries that code already.
pub async fn respond_static_file(target: &ResolvedTarget, mimes: &MimeMap) -> Output {
    let p = &target.path;
    log::trace!("respond_static_file( {} ) called.", p.display());

    let content_type = mimes.mime_type(p.extension());

    let f = File::open(p).await.map_err(|e| {
        GateErr::from(StatusCode::FORBIDDEN)
            .wrap(format!("on retrieving file {}: {}", p.display(), &e))
    })?;
    let body = Body::wrap_stream(ReaderStream::new(f));

    let mut resp_builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, target.metadata.len());
    if let Some(date) = date_value() {
        resp_builder = resp_builder.header(header::DATE, date);
    }

    Ok(resp_builder.body(body)?)
}
