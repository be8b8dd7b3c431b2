//! Request routing shared by the HTTP/1 and HTTP/2 servers

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;

pub type ResponseBody = Full<Bytes>;

/// An HTTP endpoint.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, Response<ResponseBody>>;
}

/// Build a short `text/plain` response.
pub fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Exact-path router; unknown paths get `404`.
#[derive(Clone, Default)]
pub struct ServeMux {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, path: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.routes.insert(path.into(), Arc::new(handler));
        self
    }

    pub fn route(&self, path: &str) -> Option<Arc<dyn Handler>> {
        self.routes.get(path).cloned()
    }

    pub async fn dispatch(&self, req: Request<Incoming>) -> Response<ResponseBody> {
        match self.route(req.uri().path()) {
            Some(handler) => handler.call(req).await,
            None => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }
}
