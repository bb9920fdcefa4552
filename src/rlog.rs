/*!
Per-request access logging, as a `tower` layer around the gate service.
*/

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};

use hyper::{header::HeaderValue, Body, Request, Response};
use pin_project::pin_project;
use tower::{Layer, Service};

#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    remote: SocketAddr,
}

#[pin_project]
pub struct AccessLogFuture<F> {
    #[pin]
    response_future: F,
    data: String,
}

impl<F, E> Future for AccessLogFuture<F>
where
    F: Future<Output = Result<Response<Body>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.response_future.poll(cx) {
            Poll::Ready(result) => match result {
                Ok(resp) => {
                    log::info!("{} {}", resp.status().as_str(), &this.data);
                    Poll::Ready(Ok(resp))
                }
                Err(e) => {
                    log::info!("ERR {}", &this.data);
                    Poll::Ready(Err(e))
                }
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<ReqB, S> Service<Request<ReqB>> for AccessLogService<S>
where
    S: Service<Request<ReqB>, Response = Response<Body>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = AccessLogFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        let host: &str = match req.headers().get("host").map(HeaderValue::to_str) {
            Some(Ok(name)) => name,
            _ => "[-host]",
        };

        let data = format!(
            "{} {} {} {}",
            host,
            &self.remote,
            req.method(),
            req.uri()
        );
        let response_future = self.inner.call(req);

        AccessLogFuture {
            response_future,
            data,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AccessLogLayer {
    remote: SocketAddr,
}

impl AccessLogLayer {
    pub fn new(remote: SocketAddr) -> Self {
        Self { remote }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            remote: self.remote,
        }
    }
}
