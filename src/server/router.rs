//! Request routing: control endpoints and token-addressed media streams.

use std::io::Write;
use std::sync::Arc;

use super::control::{PlayerControl, PlayerSet, CONTROL_PAGE};
use super::http::{read_request, Request, ResponseHead};
use super::listener::{Connection, WorkItem};
use super::registry::TokenRegistry;
use super::streamer::{RangeFileStreamer, StreamRequest};
use super::ServeError;
use crate::mime::MimeResolver;

/// What a request target refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    ControlPage,
    PlayPause,
    Stream { token: String, key: Option<String> },
    NotFound,
}

/// Classify a request by method and path.
pub fn route(method: &str, path: &str) -> Result<Route, ServeError> {
    let readable = method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD");

    if path.eq_ignore_ascii_case("/control") {
        return Ok(if readable { Route::ControlPage } else { Route::NotFound });
    }
    if path.eq_ignore_ascii_case("/control/playpause") {
        return Ok(if method.eq_ignore_ascii_case("POST") {
            Route::PlayPause
        } else {
            Route::NotFound
        });
    }
    if !readable {
        return Ok(Route::NotFound);
    }

    let mut token = None;
    let mut key = None;
    for segment in path.trim_start_matches('/').split(';') {
        if let Some(value) = segment.strip_prefix("v=") {
            token = Some(value.to_string());
        } else if let Some(value) = segment.strip_prefix("k=") {
            let decoded = urlencoding::decode(value)
                .map_err(|_| ServeError::BadRequest("key is not valid UTF-8".to_string()))?;
            key = Some(decoded.into_owned());
        }
    }

    Ok(match token {
        Some(token) if !token.is_empty() => Route::Stream { token, key },
        _ => Route::NotFound,
    })
}

pub struct RequestRouter {
    registry: Arc<TokenRegistry>,
    resolver: Arc<dyn MimeResolver>,
    streamer: RangeFileStreamer,
    players: PlayerSet,
}

impl RequestRouter {
    pub fn new(
        registry: Arc<TokenRegistry>,
        resolver: Arc<dyn MimeResolver>,
        streamer: RangeFileStreamer,
    ) -> Self {
        Self {
            registry,
            resolver,
            streamer,
            players: PlayerSet::default(),
        }
    }

    pub fn attach_player(&self, player: Arc<dyn PlayerControl>) {
        self.players.attach(player);
    }

    pub fn detach_player(&self, player: &Arc<dyn PlayerControl>) -> bool {
        self.players.detach(player)
    }

    /// Serve one accepted connection. Items for a stopped server are dropped.
    pub fn handle_connection(&self, item: WorkItem) {
        let WorkItem { server, connection } = item;
        if !server.is_alive() {
            log::debug!("Dropping connection for stopped server {}", server.url());
            return;
        }
        let Connection { mut stream, peer } = connection;
        let peer = peer.map_or_else(|| "unknown".to_string(), |p| p.to_string());

        let request = match read_request(&mut stream) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Unreadable request from {}: {}", peer, e);
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    let _ = ResponseHead::empty(400).write_to(&mut stream);
                }
                return;
            }
        };

        let status = self.respond(&request, &mut stream);
        let _ = stream.flush();
        log::debug!("{} {} {} -> {}", peer, request.method, request.target, status);
    }

    /// Write the full response for `request`, returning the status sent.
    pub fn respond<W: Write>(&self, request: &Request, out: &mut W) -> u16 {
        let head_only = request.is_method("HEAD");
        let result = route(&request.method, request.path()).and_then(|route| match route {
            Route::ControlPage => {
                let head = ResponseHead::new(200)
                    .header("Content-Type", "text/html; charset=utf-8")
                    .header("Content-Length", CONTROL_PAGE.len().to_string());
                head.write_to(out)?;
                if !head_only {
                    out.write_all(CONTROL_PAGE.as_bytes())?;
                }
                Ok(200)
            }
            Route::PlayPause => {
                self.players.for_each(|player| player.play_pause());
                ResponseHead::empty(200).write_to(out)?;
                Ok(200)
            }
            Route::Stream { token, key } => self.stream(request, &token, key.as_deref(), head_only, out),
            Route::NotFound => Err(ServeError::NotFound(request.target.clone())),
        });

        match result {
            Ok(status) => status,
            Err(e) => write_error(out, &e),
        }
    }

    fn stream<W: Write>(
        &self,
        request: &Request,
        token: &str,
        key: Option<&str>,
        head_only: bool,
        out: &mut W,
    ) -> Result<u16, ServeError> {
        let path = self
            .registry
            .resolve(token)
            .ok_or_else(|| ServeError::NotFound("unknown stream token".to_string()))?;
        let media = self.resolver.resolve(&path).ok_or_else(|| {
            ServeError::NotFound(format!("unrecognized media type: {}", path.display()))
        })?;

        self.streamer.stream(
            out,
            StreamRequest {
                path: &path,
                media: &media,
                key,
                range: request.header("range"),
                head_only,
            },
        )
    }
}

fn write_error<W: Write>(out: &mut W, err: &ServeError) -> u16 {
    let status = err.status();
    if status >= 500 {
        log::error!("Request failed: {}", err);
    } else {
        log::debug!("Request rejected ({}): {}", status, err);
    }
    if let Err(e) = ResponseHead::empty(status).write_to(out) {
        log::debug!("Could not send error response: {}", e);
    }
    status
}
