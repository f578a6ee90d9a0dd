//! Routing of validated requests to the static, CGI and SCGI handlers.

pub mod cgi;
pub mod cgi_output;
pub mod range;
pub mod static_file;

use crate::context::RequestContext;
use crate::error::ServeError;
use crate::http::request::Method;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::proxy::ScgiProxy;
use crate::site::auth::{AuthOutcome, AuthPolicy};
use crate::site::{self, Resolution, TargetKind};

use static_file::CachePolicy;

/// Runs validation, access control and the terminal handler for one request.
pub async fn route(ctx: &mut RequestContext<'_>) -> Result<Response, ServeError> {
    let (site, resolution) = site::validate(ctx.config, &ctx.request)?;

    let target = match resolution {
        Resolution::Target(target) => target,
        Resolution::AddSlash(path) => {
            let location = if ctx.request.query.is_empty() {
                path
            } else {
                format!("{}?{}", path, ctx.request.query)
            };
            return Ok(Response::redirect(StatusCode::MovedPermanently, &location));
        }
    };

    if let Some(policy) = AuthPolicy::load(target.dir())? {
        let host = ctx.request.host().unwrap_or(&site.server_name).to_string();
        match policy.check(&ctx.request, ctx.config.https, &host)? {
            AuthOutcome::Allow { remote_user } => ctx.remote_user = remote_user,
            AuthOutcome::Redirect(location) => {
                return Ok(Response::redirect(StatusCode::MovedPermanently, &location));
            }
            AuthOutcome::Challenge(realm) => {
                return Ok(ResponseBuilder::new(StatusCode::Unauthorized)
                    .header("WWW-Authenticate", format!("Basic realm=\"{realm}\""))
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(b"401 Unauthorized\n".to_vec())
                    .build());
            }
        }
    }

    check_method(&ctx.request.method, target.kind)?;

    tracing::debug!(
        file = %target.file.display(),
        kind = ?target.kind,
        path_info = %target.path_info,
        "dispatching request"
    );

    let ctx = &*ctx;
    match target.kind {
        TargetKind::Static => {
            static_file::serve_file(ctx, &target.file, CachePolicy::MaxAge(ctx.config.max_age)).await
        }
        TargetKind::Cgi => cgi::execute(ctx, &site, &target).await,
        TargetKind::Scgi => ScgiProxy::default().forward(ctx, &site, &target).await,
    }
}

fn check_method(method: &Method, kind: TargetKind) -> Result<(), ServeError> {
    match method {
        Method::GET | Method::HEAD => Ok(()),
        Method::POST if kind != TargetKind::Static => Ok(()),
        Method::POST => Err(ServeError::MethodNotAllowed),
        _ => Err(ServeError::NotImplemented("method")),
    }
}
