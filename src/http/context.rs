use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use crate::http::form::{FORM_URLENCODED, parse_form};
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;
use crate::http::writer::ResponseWriter;

/// Application handler mounted at a path.
///
/// Each method runs on a worker thread, exactly once per request. Methods
/// that are not overridden answer `405 Method Not Allowed`.
pub trait HttpContext: Send + Sync {
    fn do_get(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }

    fn do_post(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }

    fn do_put(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }

    fn do_delete(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }

    /// Runs `do_get` with the body suppressed.
    fn do_head(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        resp.ignore_body();
        self.do_get(req, resp)
    }

    fn do_trace(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }

    fn do_options(&self, _req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        not_allowed(resp)
    }
}

fn not_allowed(resp: &mut ResponseWriter) -> anyhow::Result<()> {
    resp.set_status(StatusCode::MethodNotAllowed);
    Ok(())
}

/// Per-context settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Compress responses when the client accepts a registered encoding.
    pub accept_encoding: bool,
    /// Largest request body accepted, below the server-wide limit.
    pub max_content_length: Option<usize>,
}

/// Adapts a closure to every method of [`HttpContext`].
pub struct FnContext<F>(pub F);

impl<F> HttpContext for FnContext<F>
where
    F: Fn(&mut Request, &mut ResponseWriter) -> anyhow::Result<()> + Send + Sync,
{
    fn do_get(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }

    fn do_post(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }

    fn do_put(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }

    fn do_delete(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }

    fn do_trace(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }

    fn do_options(&self, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
        (self.0)(req, resp)
    }
}

/// Calls the context method matching the request method.
///
/// POST bodies must name a media type; urlencoded forms are decoded into
/// the request parameters first.
pub fn dispatch(ctx: &dyn HttpContext, req: &mut Request, resp: &mut ResponseWriter) -> anyhow::Result<()> {
    match req.method {
        Method::GET => ctx.do_get(req, resp),
        Method::HEAD => ctx.do_head(req, resp),
        Method::POST => {
            let Some(content_type) = req.content_type() else {
                resp.send_error(StatusCode::UnsupportedMediaType)?;
                return Ok(());
            };
            if content_type == FORM_URLENCODED {
                let mut raw = Vec::new();
                req.body().read_to_end(&mut raw)?;
                match parse_form(&raw) {
                    Ok(fields) => req.params.extend(fields),
                    Err(e) => {
                        resp.send_error(e.status())?;
                        return Ok(());
                    }
                }
            }
            ctx.do_post(req, resp)
        }
        Method::PUT => ctx.do_put(req, resp),
        Method::DELETE => ctx.do_delete(req, resp),
        Method::TRACE => ctx.do_trace(req, resp),
        Method::OPTIONS => ctx.do_options(req, resp),
        Method::CONNECT | Method::PATCH => not_allowed(resp),
    }
}

/// A resolved mount point.
#[derive(Clone)]
pub struct Route {
    pub context: Arc<dyn HttpContext>,
    pub options: ContextOptions,
}

/// Exact-match table from decoded path to context.
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl Into<String>, context: Arc<dyn HttpContext>, options: ContextOptions) {
        self.routes.insert(path.into(), Route { context, options });
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
