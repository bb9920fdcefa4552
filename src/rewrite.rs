/*!
URL rewrite and redirect rules, applied ahead of resolution.

Rules match on a literal prefix of the URL (path plus query, as the
client sent it). Rewriting is pure with respect to the response; a
matching redirect rule terminates the pipeline with its own response.
*/

use hyper::{header, header::HeaderValue, Body, Response, StatusCode};
use serde::Deserialize;

use crate::{ctx::RequestContext, resp};

#[derive(Clone, Debug, Deserialize)]
pub struct RewriteRule {
    pub prefix: String,
    pub replacement: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedirectRule {
    pub prefix: String,
    pub location: String,
    /// Redirect status; 302 when unset.
    pub status: Option<u16>,
}

/// Applies the first matching rewrite rule. Logging only; the caller
/// retains the original URL on the context.
pub fn rewrite(id: &str, rules: &[RewriteRule], url: &str) -> String {
    for rule in rules {
        if url.starts_with(rule.prefix.as_str()) {
            let new_url = format!("{}{}", rule.replacement, &url[rule.prefix.len()..]);
            log::debug!("{}: rewrote {} -> {}", id, url, &new_url);
            return new_url;
        }
    }
    url.to_string()
}

/// Answers with a redirect when a rule matches the rewritten URL.
///
/// `Some` means the request is handled; no further pipeline stage may
/// run. The context is marked responded so the error renderer stays
/// inert afterwards.
pub fn redirect(ctx: &mut RequestContext, rules: &[RedirectRule]) -> Option<Response<Body>> {
    for rule in rules {
        if !ctx.rewritten_url.starts_with(rule.prefix.as_str()) {
            continue;
        }

        let status = rule
            .status
            .and_then(|n| StatusCode::from_u16(n).ok())
            .unwrap_or(StatusCode::FOUND);
        let location = match HeaderValue::try_from(rule.location.as_str()) {
            Ok(val) => val,
            Err(e) => {
                log::warn!(
                    "{}: redirect target {:?} is not a valid header value: {}",
                    &ctx.id,
                    &rule.location,
                    &e
                );
                continue;
            }
        };

        log::info!(
            "{}: redirecting {} to {} ({})",
            &ctx.id,
            &ctx.rewritten_url,
            &rule.location,
            status.as_u16()
        );
        ctx.mark_responded();
        return Some(resp::header_only(status, vec![(header::LOCATION, location)]));
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use hyper::{Method, Request};

    fn context(url: &str) -> RequestContext {
        let req = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header("host", "test.example")
            .body(Body::empty())
            .unwrap();
        RequestContext::new(&req, false)
    }

    #[test]
    fn first_matching_rewrite_wins() {
        let rules = vec![
            RewriteRule {
                prefix: "/old".to_string(),
                replacement: "/new".to_string(),
            },
            RewriteRule {
                prefix: "/old/deep".to_string(),
                replacement: "/elsewhere".to_string(),
            },
        ];
        assert_eq!(rewrite("00000000", &rules, "/old/deep/x"), "/new/deep/x");
        assert_eq!(rewrite("00000000", &rules, "/other"), "/other");
    }

    #[test]
    fn redirect_match_terminates_pipeline() {
        let rules = vec![RedirectRule {
            prefix: "/gone".to_string(),
            location: "https://elsewhere.example/".to_string(),
            status: Some(301),
        }];

        let mut ctx = context("/gone/page");
        let resp = redirect(&mut ctx, &rules).unwrap();
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "https://elsewhere.example/"
        );
        assert!(ctx.responded());
    }

    #[test]
    fn redirect_defaults_to_302() {
        let rules = vec![RedirectRule {
            prefix: "/moved".to_string(),
            location: "/target".to_string(),
            status: None,
        }];

        let mut ctx = context("/moved");
        let resp = redirect(&mut ctx, &rules).unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
    }

    #[test]
    fn no_match_is_a_passthrough() {
        let rules = vec![RedirectRule {
            prefix: "/gone".to_string(),
            location: "/target".to_string(),
            status: None,
        }];

        let mut ctx = context("/stays");
        assert!(redirect(&mut ctx, &rules).is_none());
        assert!(!ctx.responded());
    }
}
