pub mod cgi;
pub mod conf;
pub mod ctx;
pub mod gate;
pub mod mime;
pub mod resolve;
pub mod resp;
pub mod rewrite;
pub mod rlog;
pub mod tls;

use hyper::{Body, Response, StatusCode};
use once_cell::sync::Lazy;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub static SERVER: Lazy<String> = Lazy::new(|| format!("scriptgate v{}", VERSION));

/// Error type for everything that can go wrong while answering a request.
///
/// Carries the status code the client should see and a stack of context
/// messages that only ever end up in the log.
#[derive(Debug)]
pub struct GateErr {
    code: StatusCode,
    messages: Vec<String>,
}

impl GateErr {
    pub fn new<S: Into<String>>(message: S) -> GateErr {
        GateErr {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            messages: vec![message.into()],
        }
    }

    pub fn with_code<C: Into<StatusCode>>(self, code: C) -> GateErr {
        GateErr {
            code: code.into(),
            messages: self.messages,
        }
    }

    pub fn wrap<S: Into<String>>(self, s: S) -> GateErr {
        let mut messages = self.messages;
        messages.push(s.into());
        GateErr {
            code: self.code,
            messages,
        }
    }

    pub fn code(&self) -> StatusCode { self.code }

    pub fn has_messages(&self) -> bool { !self.messages.is_empty() }
}

impl From<String> for GateErr {
    fn from(s: String) -> GateErr { GateErr::new(s) }
}

impl From<&str> for GateErr {
    fn from(s: &str) -> GateErr { GateErr::new(String::from(s)) }
}

impl From<StatusCode> for GateErr {
    fn from(code: StatusCode) -> GateErr {
        GateErr {
            code,
            messages: vec![],
        }
    }
}

impl From<http::Error> for GateErr {
    fn from(e: http::Error) -> GateErr {
        GateErr::new(format!("error building response: {}", &e))
    }
}

impl std::fmt::Display for GateErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.code)?;
        for msg in self.messages.iter().rev() {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

pub type Output = Result<Response<Body>, GateErr>;
