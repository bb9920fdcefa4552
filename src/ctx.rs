/*!
Per-request state and the single-shot error renderer.
*/

use std::sync::atomic::{AtomicU64, Ordering};

use hyper::{header, Body, HeaderMap, Method, Request, Response, Version};

use crate::{resp, GateErr};

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn protocol_str(v: Version) -> &'static str {
    match v {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Context of one request, created at dispatch and carried through every
/// pipeline stage.
#[derive(Debug)]
pub struct RequestContext {
    /// Zero-padded monotonic id, used to tie log entries together.
    pub id: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub host: String,
    /// The URL as the client sent it. Retained after rewriting for
    /// logging and REQUEST_URI attribution.
    pub original_url: String,
    /// The URL after the rewrite stage; the rest of the pipeline works
    /// off this one.
    pub rewritten_url: String,
    /// Set by the root selector when the CGI prefix matched.
    pub execute: bool,
    pub tls: bool,
    pub protocol: String,
    responded: bool,
}

impl RequestContext {
    pub fn new(req: &Request<Body>, tls: bool) -> RequestContext {
        let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let url = match req.uri().path_and_query() {
            Some(pq) => pq.as_str().to_string(),
            None => req.uri().path().to_string(),
        };

        RequestContext {
            id: format!("{:08}", n),
            method: req.method().clone(),
            headers: req.headers().clone(),
            host,
            original_url: url.clone(),
            rewritten_url: url,
            execute: false,
            tls,
            protocol: protocol_str(req.version()).to_string(),
            responded: false,
        }
    }

    pub fn responded(&self) -> bool { self.responded }

    /// Marks the context as answered so a later `render_exception` call
    /// stays inert.
    pub fn mark_responded(&mut self) {
        self.responded = true;
    }

    /// Renders the error document for a failed request, at most once.
    ///
    /// Logs one structured line with the request id, then hands back the
    /// canned HTML document for the error's status code. A second call
    /// returns `None` and flags the programming error in the log instead
    /// of producing a second status line.
    pub fn render_exception(&mut self, e: GateErr) -> Option<Response<Body>> {
        if self.responded {
            log::warn!(
                "{}: error renderer invoked again after a response was already written",
                &self.id
            );
            return None;
        }
        self.responded = true;

        let code = e.code();
        let (title, text) = resp::error_text(code);
        log::error!(
            "{}: {}: {} - {} ({} //{}{})",
            &self.id,
            code.as_u16(),
            title,
            text,
            &self.method,
            &self.host,
            &self.original_url
        );
        if e.has_messages() {
            log::error!("{}: {}", &self.id, &e);
        }

        Some(resp::error_doc(code))
    }
}
