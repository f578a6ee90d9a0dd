//! CGI execution.
//!
//! The program sees a cleared environment holding only the fixed set of
//! variables built here, all derived from the validated request and target.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::SERVER_SOFTWARE;
use crate::context::RequestContext;
use crate::error::{Budget, ServeError};
use crate::handler::cgi_output::{self, HeadError};
use crate::http::response::{Body, Response};
use crate::server::limits;
use crate::site::{Site, ValidatedTarget};

/// `PATH` given to every program.
pub const CGI_PATH: &str = "/bin:/usr/bin:/usr/local/bin";

/// Request headers forwarded to programs, and the variable each becomes.
/// No other header reaches a program.
const FORWARDED_HEADERS: &[(&str, &str)] = &[
    ("Accept", "HTTP_ACCEPT"),
    ("Accept-Encoding", "HTTP_ACCEPT_ENCODING"),
    ("Accept-Language", "HTTP_ACCEPT_LANGUAGE"),
    ("Cookie", "HTTP_COOKIE"),
    ("Host", "HTTP_HOST"),
    ("If-Modified-Since", "HTTP_IF_MODIFIED_SINCE"),
    ("If-None-Match", "HTTP_IF_NONE_MATCH"),
    ("Referer", "HTTP_REFERER"),
    ("User-Agent", "HTTP_USER_AGENT"),
];

/// True for names a shell would only ever read as a plain variable.
pub fn is_safe_env_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_uppercase() || b == b'_')
        && bytes.all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// True for text a shell could import as a function definition.
pub fn looks_like_function_definition(text: &str) -> bool {
    text.trim_start().starts_with("()")
}

/// Environment table for a program, in a stable order.
#[derive(Debug, Default, Clone)]
pub struct CgiEnv {
    vars: Vec<(String, String)>,
}

impl CgiEnv {
    /// Adds a variable unless its name or value is unsafe to hand to a shell.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if !is_safe_env_name(name)
            || looks_like_function_definition(name)
            || looks_like_function_definition(&value)
            || value.contains('\0')
        {
            tracing::warn!(name, "refusing unsafe CGI environment entry");
            return;
        }
        self.vars.retain(|(k, _)| k != name);
        self.vars.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Builds the program environment for a validated request.
pub fn cgi_environment(ctx: &RequestContext<'_>, site: &Site, target: &ValidatedTarget) -> CgiEnv {
    let request = &ctx.request;
    let config = ctx.config;
    let mut env = CgiEnv::default();

    if ctx.remote_user.is_some() {
        env.set("AUTH_TYPE", "Basic");
    }
    env.set("CONTENT_LENGTH", request.body.len().to_string());
    if let Some(content_type) = request.content_type() {
        env.set("CONTENT_TYPE", content_type);
    }
    env.set("DOCUMENT_ROOT", target.site_dir.to_string_lossy());
    env.set("GATEWAY_INTERFACE", "CGI/1.1");
    for (header, var) in FORWARDED_HEADERS {
        if let Some(value) = request.header(header) {
            env.set(var, value);
        }
    }
    if config.https {
        env.set("HTTPS", "on");
    }
    env.set("PATH", CGI_PATH);
    env.set("PATH_INFO", target.path_info.as_str());
    env.set("QUERY_STRING", request.query.as_str());
    env.set("REMOTE_ADDR", ctx.remote_addr());
    if let Some(port) = ctx.remote_port() {
        env.set("REMOTE_PORT", port.to_string());
    }
    if let Some(user) = &ctx.remote_user {
        env.set("REMOTE_USER", user.as_str());
    }
    env.set("REQUEST_METHOD", request.method.as_str());
    env.set("REQUEST_SCHEME", config.scheme());
    env.set("REQUEST_URI", request.uri.as_str());
    env.set("SCRIPT_DIRECTORY", target.dir().to_string_lossy());
    env.set("SCRIPT_FILENAME", target.file.to_string_lossy());
    env.set("SCRIPT_NAME", target.script_name.as_str());
    let server_name = if site.server_name.is_empty() { "localhost" } else { &site.server_name };
    env.set("SERVER_NAME", server_name);
    env.set("SERVER_PORT", ctx.server_port().to_string());
    env.set("SERVER_PROTOCOL", request.version.as_str());
    env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
    env
}

/// Runs a CGI program and returns its response with the output still streaming.
pub async fn execute(
    ctx: &RequestContext<'_>,
    site: &Site,
    target: &ValidatedTarget,
) -> Result<Response, ServeError> {
    let env = cgi_environment(ctx, site, target);
    let max_cpu = ctx.config.max_cpu;

    let mut command = Command::new(&target.file);
    command
        .env_clear()
        .envs(env.iter())
        .current_dir(target.dir())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if max_cpu > 0 {
        // SAFETY: only calls setrlimit, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || limits::limit_cpu(max_cpu).map_err(std::io::Error::from));
        }
    }

    let mut child = command.spawn().map_err(|e| {
        tracing::error!(program = %target.file.display(), error = %e, "failed to start CGI program");
        ServeError::ExecutionFailure(format!("cannot execute {}: {e}", target.script_name))
    })?;
    tracing::debug!(program = %target.file.display(), pid = ?child.id(), "CGI program started");

    if let Some(mut stdin) = child.stdin.take() {
        let body = ctx.request.body.clone();
        tokio::spawn(async move {
            if !body.is_empty() {
                // The program may exit without reading its input.
                let _ = stdin.write_all(&body).await;
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let program = target.script_name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(program = %program, "{}", line);
            }
        });
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ServeError::ExecutionFailure("program stdout unavailable".into()))?;

    let mut head = match cgi_output::read_cgi_head(&mut stdout).await {
        Ok(head) => head,
        Err(HeadError::Eof) => {
            let status = child.wait().await?;
            if limits::cpu_exhausted(&status) {
                tracing::warn!(program = %target.script_name, "CGI program exceeded its CPU budget");
                return Err(ServeError::ResourceExceeded(Budget::Cpu));
            }
            return Err(HeadError::Eof.into());
        }
        Err(e) => {
            let _ = child.start_kill();
            return Err(e.into());
        }
    };

    let leftover = std::io::Cursor::new(std::mem::take(&mut head.leftover));
    let body = Body::Process {
        stdout: Box::new(leftover.chain(stdout)),
        child,
    };
    Ok(cgi_output::into_response(head, body))
}
