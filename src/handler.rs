use std::fs;
use std::path::Path;

use log::{error, warn};

use crate::config::ServerConfig;
use crate::form_data::{clear_file_name, FormData};
use crate::request::HttpRequest;
use crate::response::HttpResponse;

/// Everything a handler needs for one request: the server block that owns
/// the connection and the parsed request.
pub struct Context<'a> {
    pub config: &'a ServerConfig,
    pub request: &'a HttpRequest,
}

pub trait RequestHandler: Send {
    fn handle_request(&self, ctx: &Context) -> HttpResponse;
}

type RouteHandler = fn(&Context) -> HttpResponse;

struct Route {
    method: String,
    path: String,
    handler: RouteHandler,
}

/// Method + path dispatch: exact match first, then prefix match (excluding
/// the root path), then 405 for a known path with the wrong method, then
/// 404.
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Router { routes: Vec::new() }
    }

    /// A router preloaded with the default routes.
    pub fn with_default_routes() -> Self {
        let mut router = Router::new();
        router.register("GET", "/", handle_root);
        router.register("GET", "/health", handle_health);
        router.register("POST", "/upload", handle_upload);
        router
    }

    pub fn register(&mut self, method: &str, path: &str, handler: RouteHandler) {
        self.routes.push(Route {
            method: method.to_string(),
            path: path.to_string(),
            handler,
        });
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::with_default_routes()
    }
}

impl RequestHandler for Router {
    fn handle_request(&self, ctx: &Context) -> HttpResponse {
        let request = ctx.request;
        for route in &self.routes {
            if route.method == request.method() && route.path == request.uri() {
                return (route.handler)(ctx);
            }
        }

        // Prefix matching for routes like /api/, root excluded.
        for route in &self.routes {
            if route.method == request.method()
                && route.path != "/"
                && request.uri().starts_with(&route.path)
            {
                return (route.handler)(ctx);
            }
        }

        if self.routes.iter().any(|r| r.path == request.uri()) {
            return HttpResponse::method_not_allowed();
        }
        HttpResponse::not_found()
    }
}

fn handle_root(_ctx: &Context) -> HttpResponse {
    HttpResponse::ok(
        "<html><body><h1>webserv</h1><p>Try /health or POST a form to /upload</p></body></html>",
    )
}

fn handle_health(_ctx: &Context) -> HttpResponse {
    let mut response = HttpResponse::ok(r#"{"status": "healthy"}"#);
    response.set_header("Content-Type", "application/json");
    response
}

/// Stores the first part of a multipart body under the configured upload
/// directory, with whitespace in the filename sanitized away.
fn handle_upload(ctx: &Context) -> HttpResponse {
    let form = FormData::from_request(ctx.request);
    if !form.is_valid() {
        warn!("upload rejected: multipart body failed validation");
        return HttpResponse::bad_request();
    }

    let name = match form.filename().filter(|f| !f.is_empty()) {
        Some(filename) => clear_file_name(filename),
        None => match form.disposition().get("name") {
            Some(field) => clear_file_name(field),
            None => return HttpResponse::bad_request(),
        },
    };
    if name.is_empty() {
        return HttpResponse::bad_request();
    }

    if !create_dir(&ctx.config.upload_dir) {
        error!("upload dir {} could not be created", ctx.config.upload_dir);
        return HttpResponse::internal_error();
    }
    let path = Path::new(&ctx.config.upload_dir).join(&name);
    match fs::write(&path, form.content()) {
        Ok(()) => {
            let mut response = HttpResponse::new(
                201,
                "Created",
                &format!("<html><body><p>stored {}</p></body></html>", name),
            );
            response.set_header("Location", &format!("/{}", name));
            response
        }
        Err(e) => {
            error!("writing upload {}: {}", path.display(), e);
            HttpResponse::internal_error()
        }
    }
}

fn is_dir(path: &str) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

fn create_dir(path: &str) -> bool {
    if is_dir(path) {
        return true;
    }
    fs::create_dir_all(path).is_ok()
}
