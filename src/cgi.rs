/*!
The request-to-process gateway.

Executes the resolved target as an external program and relays its
standard output to the client as if it were an HTTP response: request
body into stdin, stderr into the log line by line, and stdout through an
incremental scanner that finds the header/body boundary while the
process is still producing output.
*/

use std::{
    os::unix::{fs::MetadataExt, process::ExitStatusExt},
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::Poll,
};

use futures_util::{future::poll_fn, TryStreamExt};
use hyper::{
    body::Bytes,
    header::{HeaderName, HeaderValue},
    Body, Response, StatusCode,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
};
use tokio_util::io::StreamReader;

use crate::{
    conf::Cfg, ctx::RequestContext, gate::ConnInfo, resolve::ResolvedTarget, GateErr, Output,
    SERVER,
};

const MAX_SCRIPT_HEADERS: usize = 64;
const READ_BUF_SIZE: usize = 8192;

/// The complete, fixed environment handed to a script. Every key is
/// always present; absent request headers map to empty strings.
#[derive(Debug)]
pub struct CgiEnv {
    pub content_length: String,
    pub content_type: String,
    pub document_root: String,
    pub gateway_interface: String,
    pub http_accept: String,
    pub http_accept_charset: String,
    pub http_accept_encoding: String,
    pub http_accept_language: String,
    pub http_connection: String,
    pub http_cookie: String,
    pub http_host: String,
    pub http_referer: String,
    pub http_user_agent: String,
    pub path_info: String,
    pub path_translated: String,
    pub query_string: String,
    pub remote_address: String,
    pub remote_host: String,
    pub remote_ident: String,
    pub remote_port: String,
    pub remote_user: String,
    pub request_method: String,
    pub request_uri: String,
    pub script_filename: String,
    pub script_name: String,
    pub server_addr: String,
    pub server_admin: String,
    pub server_name: String,
    pub server_port: String,
    pub server_protocol: String,
    pub server_signature: String,
    pub server_software: String,
}

impl CgiEnv {
    pub fn build(
        ctx: &RequestContext,
        target: &ResolvedTarget,
        conn: &ConnInfo,
        cfg: &Cfg,
        query: &str,
    ) -> CgiEnv {
        let h = |name: &str| -> String {
            ctx.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let content_length = {
            let v = h("content-length");
            if v.is_empty() {
                "0".to_string()
            } else {
                v
            }
        };

        // The configured prefix joined with the script's path relative
        // to the script root, forward slashes regardless of host style.
        let script_name = match target.path.strip_prefix(&cfg.script_root) {
            Ok(rel) => {
                let mut s = cfg.cgi_prefix.trim_end_matches('/').to_string();
                for comp in rel.components() {
                    s.push('/');
                    s.push_str(&comp.as_os_str().to_string_lossy());
                }
                s
            }
            Err(_) => cfg.cgi_prefix.clone(),
        };

        CgiEnv {
            content_length,
            content_type: h("content-type"),
            document_root: cfg.web_root.to_string_lossy().into_owned(),
            gateway_interface: "1.1".to_string(),
            http_accept: h("accept"),
            http_accept_charset: h("accept-charset"),
            http_accept_encoding: h("accept-encoding"),
            http_accept_language: h("accept-language"),
            http_connection: h("connection"),
            http_cookie: h("cookie"),
            http_host: h("host"),
            http_referer: h("referer"),
            http_user_agent: h("user-agent"),
            path_info: target.path_info.clone(),
            path_translated: target.path.to_string_lossy().into_owned(),
            query_string: query.to_string(),
            remote_address: conn.remote.ip().to_string(),
            remote_host: String::new(),
            remote_ident: String::new(),
            remote_port: conn.remote.port().to_string(),
            remote_user: String::new(),
            request_method: ctx.method.to_string(),
            request_uri: ctx.original_url.clone(),
            script_filename: target.path.to_string_lossy().into_owned(),
            script_name,
            server_addr: conn.local.ip().to_string(),
            server_admin: cfg.server_admin.clone(),
            server_name: cfg.server_name.clone(),
            server_port: conn.local.port().to_string(),
            server_protocol: ctx.protocol.clone(),
            server_signature: String::new(),
            server_software: SERVER.clone(),
        }
    }

    /// The full key set in deterministic order, for `Command::env`.
    pub fn vars(&self) -> [(&'static str, &str); 32] {
        [
            ("CONTENT_LENGTH", self.content_length.as_str()),
            ("CONTENT_TYPE", self.content_type.as_str()),
            ("DOCUMENT_ROOT", self.document_root.as_str()),
            ("GATEWAY_INTERFACE", self.gateway_interface.as_str()),
            ("HTTP_ACCEPT", self.http_accept.as_str()),
            ("HTTP_ACCEPT_CHARSET", self.http_accept_charset.as_str()),
            ("HTTP_ACCEPT_ENCODING", self.http_accept_encoding.as_str()),
            ("HTTP_ACCEPT_LANGUAGE", self.http_accept_language.as_str()),
            ("HTTP_CONNECTION", self.http_connection.as_str()),
            ("HTTP_COOKIE", self.http_cookie.as_str()),
            ("HTTP_HOST", self.http_host.as_str()),
            ("HTTP_REFERER", self.http_referer.as_str()),
            ("HTTP_USER_AGENT", self.http_user_agent.as_str()),
            ("PATH_INFO", self.path_info.as_str()),
            ("PATH_TRANSLATED", self.path_translated.as_str()),
            ("QUERY_STRING", self.query_string.as_str()),
            ("REMOTE_ADDRESS", self.remote_address.as_str()),
            ("REMOTE_HOST", self.remote_host.as_str()),
            ("REMOTE_IDENT", self.remote_ident.as_str()),
            ("REMOTE_PORT", self.remote_port.as_str()),
            ("REMOTE_USER", self.remote_user.as_str()),
            ("REQUEST_METHOD", self.request_method.as_str()),
            ("REQUEST_URI", self.request_uri.as_str()),
            ("SCRIPT_FILENAME", self.script_filename.as_str()),
            ("SCRIPT_NAME", self.script_name.as_str()),
            ("SERVER_ADDR", self.server_addr.as_str()),
            ("SERVER_ADMIN", self.server_admin.as_str()),
            ("SERVER_NAME", self.server_name.as_str()),
            ("SERVER_PORT", self.server_port.as_str()),
            ("SERVER_PROTOCOL", self.server_protocol.as_str()),
            ("SERVER_SIGNATURE", self.server_signature.as_str()),
            ("SERVER_SOFTWARE", self.server_software.as_str()),
        ]
    }
}

/// Incremental scanner over script stdout looking for the header/body
/// boundary. One transition: once the boundary is found, everything
/// after it is body and passes through untouched.
#[derive(Debug)]
pub enum HeaderScanner {
    AwaitingBoundary(Vec<u8>),
    Forwarding,
}

#[derive(Debug)]
pub enum Scan {
    /// Boundary not seen yet; bytes are buffered.
    NeedMore,
    /// The single boundary emission: the header block (blank line
    /// included) and any body bytes buffered past it.
    Split { head: Vec<u8>, body: Vec<u8> },
    /// Post-boundary bytes, forwarded unmodified.
    Body(Vec<u8>),
}

impl HeaderScanner {
    pub fn new() -> HeaderScanner {
        HeaderScanner::AwaitingBoundary(Vec::new())
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Scan {
        match self {
            HeaderScanner::Forwarding => Scan::Body(chunk.to_vec()),
            HeaderScanner::AwaitingBoundary(buf) => {
                buf.extend_from_slice(chunk);
                match find_boundary(buf) {
                    Some(body_start) => {
                        let body = buf.split_off(body_start);
                        let head = std::mem::take(buf);
                        *self = HeaderScanner::Forwarding;
                        Scan::Split { head, body }
                    }
                    None => Scan::NeedMore,
                }
            }
        }
    }
}

impl Default for HeaderScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the first byte past the blank line, accepting both CRLF and
/// bare-LF line endings.
fn find_boundary(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1).copied(), buf.get(i + 2).copied()) {
                (Some(b'\n'), _) => return Some(i + 2),
                (Some(b'\r'), Some(b'\n')) => return Some(i + 3),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parses the header block: the numeric `Status:` pseudo-header dictates
/// the response status (200 when absent or non-numeric) and is stripped
/// from the forwarded set.
fn parse_head(head: &[u8]) -> Result<(StatusCode, Vec<(HeaderName, HeaderValue)>), GateErr> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_SCRIPT_HEADERS];
    let parsed = match httparse::parse_headers(head, &mut storage) {
        Ok(httparse::Status::Complete((_, headers))) => headers,
        Ok(httparse::Status::Partial) => {
            return Err(GateErr::new("could only partially parse script headers"));
        }
        Err(e) => {
            return Err(GateErr::new(format!("error parsing script headers: {}", &e)));
        }
    };

    let mut status = StatusCode::OK;
    let mut headers: Vec<(HeaderName, HeaderValue)> = Vec::with_capacity(parsed.len());
    for h in parsed.iter() {
        if h.name.eq_ignore_ascii_case("status") {
            let text = String::from_utf8_lossy(h.value);
            if let Some(token) = text.split_whitespace().next() {
                if let Ok(code) = token.parse::<u16>() {
                    if let Ok(sc) = StatusCode::from_u16(code) {
                        status = sc;
                    }
                }
            }
            continue;
        }

        let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|e| {
            GateErr::new(format!("unusable script header name {:?}: {}", h.name, &e))
        })?;
        let value = HeaderValue::from_bytes(h.value).map_err(|e| {
            GateErr::new(format!(
                "unusable script header value {:?}: {}",
                &String::from_utf8_lossy(h.value),
                &e
            ))
        })?;
        headers.push((name, value));
    }

    Ok((status, headers))
}

/// Reaps the script and puts out its one completion record. Every path
/// that has observed the end of the script's output funnels through
/// here, so the record goes out exactly once per spawned script.
async fn reap(id: &str, mut child: Child, bytes_in: u64, bytes_out: u64) {
    match child.wait().await {
        Ok(exit) => log::info!(
            "{}: script exited with {:?} (signal {:?}); in {}, out {}",
            id,
            exit.code(),
            exit.signal(),
            bytes_in,
            bytes_out
        ),
        Err(e) => log::error!("{}: error awaiting script exit: {}", id, &e),
    }
}

/// Resolves once the response body's receiving end is gone. Send
/// readiness is of no interest here; dropping the `Body` wakes the
/// waker `poll_ready` registered, with an error.
async fn body_gone(sender: &mut hyper::body::Sender) {
    poll_fn(|cx| match sender.poll_ready(cx) {
        Poll::Ready(Err(_)) => Poll::Ready(()),
        _ => Poll::Pending,
    })
    .await
}

/// Runs the resolved target as a CGI script and relays its output.
///
/// Returns the response as soon as the script's header boundary has been
/// located; the body keeps streaming through a channel afterwards. A
/// spawn failure, or stdout closing before any boundary, is a 500.
pub async fn run(
    id: &str,
    body: Body,
    target: &ResolvedTarget,
    env: &CgiEnv,
    run_as_uid: Option<u32>,
) -> Output {
    let parent = target.path.parent().ok_or_else(|| {
        GateErr::new(format!(
            "script {} has no containing directory",
            target.path.display()
        ))
    })?;

    let mut cmd = Command::new(&target.path);
    cmd.current_dir(parent)
        .uid(run_as_uid.unwrap_or_else(|| target.metadata.uid()))
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (name, value) in env.vars() {
        cmd.env(name, value);
    }

    let mut child = cmd.spawn().map_err(|e| {
        GateErr::new(format!(
            "failed to execute {}: {}",
            target.path.display(),
            &e
        ))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or("unable to get a handle on script stdin")?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or("unable to get a handle on script stdout")?;
    let stderr = child
        .stderr
        .take()
        .ok_or("unable to get a handle on script stderr")?;

    let bytes_in = Arc::new(AtomicU64::new(0));

    // Request body into script stdin. Coupling the streams directly
    // makes the client connection itself the flow control.
    {
        let id = id.to_string();
        let counter = bytes_in.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            let mut reader = StreamReader::new(body.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
            }));
            match tokio::io::copy(&mut reader, &mut stdin).await {
                Ok(n) => {
                    counter.store(n, Ordering::Relaxed);
                }
                Err(e) => {
                    log::debug!("{}: error piping request body to script: {}", &id, &e);
                }
            }
            if let Err(e) = stdin.shutdown().await {
                log::debug!("{}: error closing script stdin: {}", &id, &e);
            }
        });
    }

    // One log record per complete stderr line.
    {
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => log::debug!("{}: {}", &id, &line),
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("{}: error reading script stderr: {}", &id, &e);
                        break;
                    }
                }
            }
        });
    }

    // Scan stdout until the header/body boundary turns up. Failure in
    // here still owes the log a completion record; a SIGKILL to an
    // already-exited script is a no-op and leaves its status intact.
    let mut scanner = HeaderScanner::new();
    let mut buf = [0u8; READ_BUF_SIZE];
    let (head, prelude) = loop {
        let n = match stdout.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = child.start_kill();
                reap(id, child, bytes_in.load(Ordering::Relaxed), 0).await;
                return Err(GateErr::new(format!("error reading script output: {}", &e)));
            }
        };
        if n == 0 {
            let _ = child.start_kill();
            reap(id, child, bytes_in.load(Ordering::Relaxed), 0).await;
            return Err(GateErr::new(
                "script closed its output without a header boundary",
            ));
        }
        if let Scan::Split { head, body } = scanner.feed(&buf[..n]) {
            break (head, body);
        }
    };

    let (status, headers) = match parse_head(&head) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = child.start_kill();
            reap(id, child, bytes_in.load(Ordering::Relaxed), 0).await;
            return Err(e);
        }
    };
    log::debug!("{}: script requests HTTP status {}", id, status.as_u16());

    let (mut sender, resp_body) = Body::channel();
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let response = builder.body(resp_body)?;

    // Relay the rest of stdout, then consolidate the two completion
    // signals. The exit status and the end of stdout can land in either
    // order; the completion record goes out exactly once, only after
    // both have been observed. The client going away must terminate the
    // script even while stdout is silent, so every read races the
    // response channel's closed signal.
    {
        let id = id.to_string();
        let bytes_in = bytes_in;
        tokio::spawn(async move {
            let mut bytes_out: u64 = prelude.len() as u64;
            let mut client_gone = false;

            if !prelude.is_empty() && sender.send_data(Bytes::from(prelude)).await.is_err() {
                client_gone = true;
            }

            let mut buf = [0u8; READ_BUF_SIZE];
            while !client_gone {
                let read = tokio::select! {
                    res = stdout.read(&mut buf) => Some(res),
                    _ = body_gone(&mut sender) => None,
                };
                match read {
                    None => client_gone = true,
                    Some(Ok(0)) => break,
                    Some(Ok(n)) => {
                        bytes_out += n as u64;
                        if sender
                            .send_data(Bytes::copy_from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            client_gone = true;
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("{}: error reading script output: {}", &id, &e);
                        break;
                    }
                }
            }

            if client_gone {
                log::debug!("{}: client went away; terminating script", &id);
                if let Err(e) = child.start_kill() {
                    log::debug!("{}: error terminating script: {}", &id, &e);
                }
            }

            reap(&id, child, bytes_in.load(Ordering::Relaxed), bytes_out).await;
        });
    }

    Ok(response)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boundary_in_a_single_chunk() {
        let mut scanner = HeaderScanner::new();
        match scanner.feed(b"Status: 201 Created\r\nX-Extra: yes\r\n\r\nHi") {
            Scan::Split { head, body } => {
                assert_eq!(&head, b"Status: 201 Created\r\nX-Extra: yes\r\n\r\n");
                assert_eq!(&body, b"Hi");
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn boundary_split_across_many_chunks() {
        let full = b"Content-Type: text/plain\r\n\r\nchunked body";
        // Whatever the chunking, no body byte may surface before the
        // boundary, and the reassembled body must be intact.
        for stride in 1..=5usize {
            let mut scanner = HeaderScanner::new();
            let mut head: Option<Vec<u8>> = None;
            let mut body: Vec<u8> = Vec::new();
            for chunk in full.chunks(stride) {
                match scanner.feed(chunk) {
                    Scan::NeedMore => assert!(head.is_none()),
                    Scan::Split { head: h, body: b } => {
                        assert!(head.is_none());
                        head = Some(h);
                        body.extend_from_slice(&b);
                    }
                    Scan::Body(b) => {
                        assert!(head.is_some());
                        body.extend_from_slice(&b);
                    }
                }
            }
            let head = head.expect("boundary never found");
            assert_eq!(&head, b"Content-Type: text/plain\r\n\r\n");
            assert_eq!(&body, b"chunked body");
        }
    }

    #[test]
    fn bare_lf_boundary() {
        let mut scanner = HeaderScanner::new();
        match scanner.feed(b"Status: 201 Created\n\nHi") {
            Scan::Split { head, body } => {
                assert_eq!(&head, b"Status: 201 Created\n\n");
                assert_eq!(&body, b"Hi");
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn post_boundary_bytes_pass_through() {
        let mut scanner = HeaderScanner::new();
        let _ = scanner.feed(b"X: y\n\n");
        match scanner.feed(b"raw body bytes\n\nwith fake boundary") {
            Scan::Body(bytes) => {
                assert_eq!(&bytes, b"raw body bytes\n\nwith fake boundary");
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn pseudo_header_sets_status_and_is_stripped() {
        let (status, headers) =
            parse_head(b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\n").unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0.as_str(), "content-type");
    }

    #[test]
    fn missing_or_unusable_status_defaults_to_200() {
        let (status, _) = parse_head(b"Content-Type: text/plain\r\n\r\n").unwrap();
        assert_eq!(status, StatusCode::OK);

        let (status, _) = parse_head(b"Status: teapot\r\n\r\n").unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn empty_header_block_is_fine() {
        let (status, headers) = parse_head(b"\r\n").unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(headers.is_empty());
    }
}
