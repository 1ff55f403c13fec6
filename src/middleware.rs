//! The request pipeline shared by the dev server hosts
//!
//! A host owns an ordered chain of [`Middleware`]s. Each one either answers
//! the request or hands it on to the next handler; a request nobody answers
//! gets a 404.

use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;

/// Body type used for every request and response inside the pipeline
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub type HostRequest = Request<ProxyBody>;
pub type HostResponse = Response<ProxyBody>;

/// Connection facts a middleware may need besides the request itself
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub is_tls: bool,
}

/// What a middleware did with a request
pub enum Flow {
    /// The request was answered
    Respond(HostResponse),
    /// The request was not for this handler; pass it on
    Next(HostRequest),
}

pub trait Middleware: Send + Sync {
    /// Stable name, used to find built-in handlers in a live stack
    fn name(&self) -> &str;

    fn handle(&self, req: HostRequest, ctx: RequestContext) -> BoxFuture<'_, Flow>;
}

/// Something that can hand out the current middleware chain
pub trait Pipeline: Send + Sync {
    fn snapshot(&self) -> Vec<Arc<dyn Middleware>>;
}

impl Pipeline for Vec<Arc<dyn Middleware>> {
    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.clone()
    }
}

/// An entry of a named handler stack
#[derive(Clone)]
pub struct Layer {
    pub route: String,
    pub name: String,
    pub handle: Arc<dyn Middleware>,
}

impl Layer {
    pub fn new(handle: Arc<dyn Middleware>) -> Self {
        Self {
            route: String::new(),
            name: handle.name().to_string(),
            handle,
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("route", &self.route)
            .field("name", &self.name)
            .finish()
    }
}

/// Run a request through the chain in order
pub async fn dispatch(chain: &[Arc<dyn Middleware>], req: HostRequest, ctx: RequestContext) -> HostResponse {
    let mut req = req;
    for middleware in chain {
        match middleware.handle(req, ctx).await {
            Flow::Respond(response) => return response,
            Flow::Next(passed) => req = passed,
        }
    }
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn text_response(status: StatusCode, message: &str) -> HostResponse {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.to_string()))
        .expect("valid response builder")
}
