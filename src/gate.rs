/*!
The per-request pipeline, from dispatch to response.
*/

use std::net::SocketAddr;

use hyper::{Body, Request, Response, StatusCode};

use crate::{
    cgi::{self, CgiEnv},
    conf::Cfg,
    ctx::RequestContext,
    resolve, resp, rewrite, GateErr,
};

/// Socket addresses of one connection, captured at accept time.
#[derive(Clone, Copy, Debug)]
pub struct ConnInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

pub struct Gate {
    cfg: Cfg,
}

impl Gate {
    pub fn new(cfg: Cfg) -> Gate {
        Gate { cfg }
    }

    fn fail(&self, ctx: &mut RequestContext, e: GateErr) -> Response<Body> {
        match ctx.render_exception(e) {
            Some(resp) => resp,
            // Only reachable through a programming error; the renderer
            // has already logged it.
            None => resp::header_only(StatusCode::INTERNAL_SERVER_ERROR, vec![]),
        }
    }

    /// Answers one request: rewrite, maybe redirect, select a root,
    /// resolve the target, then execute it or stream it.
    pub async fn handle(
        &self,
        req: Request<Body>,
        conn: ConnInfo,
        tls: bool,
    ) -> Response<Body> {
        let mut ctx = RequestContext::new(&req, tls);

        log::info!(
            "{}: {} {} {}{}",
            &ctx.id,
            &ctx.method,
            &ctx.host,
            &ctx.original_url,
            if ctx.tls { " (https)" } else { "" }
        );

        ctx.rewritten_url =
            rewrite::rewrite(&ctx.id, &self.cfg.rewrites, &ctx.original_url);

        if let Some(response) = rewrite::redirect(&mut ctx, &self.cfg.redirects) {
            return response;
        }

        let url = ctx.rewritten_url.clone();
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (url.as_str(), ""),
        };

        // Raw string-prefix match, as configured. A prefix of /cgi-bin
        // also matches /cgi-binX; historical behavior, kept as is.
        let (root, url_path) = if path.starts_with(self.cfg.cgi_prefix.as_str()) {
            ctx.execute = true;
            (&self.cfg.script_root, &path[self.cfg.cgi_prefix.len()..])
        } else {
            (&self.cfg.web_root, path)
        };

        log::debug!(
            "{}: {} is accessing {} under {}",
            &ctx.id,
            path,
            url_path,
            root.display()
        );

        let target = match resolve::resolve(
            root,
            url_path,
            !ctx.execute,
            self.cfg.follow_symlinks,
        )
        .await
        {
            Ok(target) => target,
            Err(e) => {
                return self.fail(&mut ctx, e.into());
            }
        };

        if ctx.execute {
            log::info!("{}: executing {}", &ctx.id, target.path.display());

            let env = CgiEnv::build(&ctx, &target, &conn, &self.cfg, query);
            match cgi::run(
                &ctx.id,
                req.into_body(),
                &target,
                &env,
                self.cfg.run_as_uid,
            )
            .await
            {
                Ok(response) => {
                    ctx.mark_responded();
                    response
                }
                Err(e) => self.fail(&mut ctx, e),
            }
        } else {
            match resp::respond_static_file(&target, &self.cfg.mime_types).await {
                Ok(response) => {
                    ctx.mark_responded();
                    response
                }
                Err(e) => self.fail(&mut ctx, e),
            }
        }
    }
}
