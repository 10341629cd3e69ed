//! The WebSocket session front end.
//!
//! Each accepted connection runs on its own task: the token is captured
//! during the upgrade, the session's agent and view are registered per its
//! capabilities, and a dedicated writer task serializes all outbound
//! frames. A panic inside the command loop is caught at the session
//! boundary; the session is torn down and the server keeps running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use geopulse_core::WorldError;
use geopulse_transport::{ErrorReply, SessionCommand, SessionSink};

use crate::auth::{self, AuthError, Claims};
use crate::AppState;

/// Header carrying the capability token; the `token` query parameter is the
/// fallback.
pub const TOKEN_HEADER: &str = "x-geopulse-token";

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

pub async fn accept_loop(listener: TcpListener, state: Arc<AppState>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr.to_string(), state).await;
                });
            }
            Err(err) => warn!("session accept error: {err}"),
        }
    }
}

fn token_from_request(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(TOKEN_HEADER) {
        if let Ok(token) = value.to_str() {
            return Some(token.to_string());
        }
    }
    let query = request.uri().query()?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .map(str::to_string)
}

async fn handle_connection(stream: TcpStream, peer: String, state: Arc<AppState>) {
    let mut token = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = token_from_request(request);
        Ok(response)
    };
    let ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("upgrade error from {peer}: {err}");
            return;
        }
    };
    let (ws_writer, ws_reader) = ws.split();
    let (tx, rx) = unbounded_channel::<String>();
    let writer = tokio::spawn(write_loop(ws_writer, rx));

    // the token is checked after the upgrade so the reply can travel over
    // the socket before it closes
    let claims = token
        .ok_or(AuthError::MissingToken)
        .and_then(|token| auth::verify(&token, &state.secret));
    let claims = match claims {
        Ok(claims) => claims,
        Err(err) => {
            warn!("{peer}: rejected session: {err}");
            if let Ok(reply) = serde_json::to_string(&ErrorReply::new(
                "Can't parse token, or token invalid",
                err.to_string(),
            )) {
                let _ = tx.send(reply);
            }
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let caps = &claims.capabilities;
    let agent_id = caps.produce.then(|| claims.agent_id.clone());
    let view_id = caps.consume.then(|| claims.view_id.clone());
    let identity = match (&agent_id, &view_id) {
        (Some(agent), Some(view)) => format!("agent:{agent}+view:{view}"),
        (Some(agent), None) => format!("agent:{agent}"),
        (None, Some(view)) => format!("view:{view}"),
        (None, None) => format!("admin:{peer}"),
    };

    let sink = SessionSink::new(identity.clone(), tx.clone(), state.send_interval);
    if let Some(id) = &agent_id {
        state
            .world
            .add_agent(id, sink.clone(), claims.public_properties.clone());
    }
    if let Some(id) = &view_id {
        state.world.add_view(id, sink.clone());
    }
    info!("login: {identity}");

    let session = run_session(
        ws_reader,
        &sink,
        &state,
        &claims,
        agent_id.as_deref(),
        view_id.as_deref(),
        &identity,
    );
    if AssertUnwindSafe(session).catch_unwind().await.is_err() {
        error!("{identity}: session handler panicked, tearing down");
    }

    info!("logout: {identity}");
    if let Some(id) = &agent_id {
        state.dispatcher.agent_disconnected(id);
    }
    if let Some(id) = &view_id {
        state.world.remove_view(id);
    }
    sink.close();
    drop(sink);
    drop(tx);
    let _ = writer.await;
}

async fn write_loop(mut writer: WsWriter, mut rx: UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        if writer.send(Message::Text(frame)).await.is_err() {
            debug!("connection gone, dropping remaining outbound frames");
            break;
        }
    }
    let _ = writer.close().await;
}

async fn run_session(
    mut reader: WsReader,
    sink: &Arc<SessionSink>,
    state: &Arc<AppState>,
    claims: &Claims,
    agent_id: Option<&str>,
    view_id: Option<&str>,
    identity: &str,
) {
    loop {
        let message = match reader.next().await {
            None => return,
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!("{identity}: {err}");
                return;
            }
        };
        match message {
            Message::Text(text) => {
                handle_message(&text, sink, state, claims, agent_id, view_id, identity);
            }
            Message::Binary(_) => warn!("{identity}: ignoring binary frame"),
            Message::Close(_) => return,
            // ping/pong are answered by the protocol layer
            _ => {}
        }
    }
}

fn handle_message(
    text: &str,
    sink: &Arc<SessionSink>,
    state: &Arc<AppState>,
    claims: &Claims,
    agent_id: Option<&str>,
    view_id: Option<&str>,
    identity: &str,
) {
    let mut command: SessionCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            sink.send_now(&ErrorReply::new(
                format!("Can't parse command ({text})"),
                err.to_string(),
            ));
            warn!("{identity}: invalid JSON command");
            return;
        }
    };
    if let Err(err) = command.check() {
        sink.send_now(&ErrorReply::new(
            format!("Invalid Command ({text})"),
            err.to_string(),
        ));
        warn!("{identity}: {err}");
        return;
    }
    debug!("{identity}: {text}");
    let caps = &claims.capabilities;

    if let Some(pos) = command.agent_position {
        match agent_id {
            Some(id) => state.dispatcher.agent_move(id, pos),
            None => warn!("{identity}: agentPosition without the produce capability"),
        }
    }

    if let Some(rect) = command.view_position {
        match view_id {
            Some(id) => {
                let (width, height) = rect.size();
                if width > caps.max_view[0] || height > caps.max_view[1] {
                    sink.send_now(&ErrorReply::simple(
                        "View size error: it can't be larger than what your token allows",
                    ));
                    warn!("{identity}: view size error");
                } else {
                    state.dispatcher.view_move(id, rect);
                }
            }
            None => warn!("{identity}: viewPosition without the consume capability"),
        }
    }

    if let Some(data) = command.public_data {
        match agent_id {
            Some(id) => state.dispatcher.agent_public_data(id, data),
            None => warn!("{identity}: publicData without the produce capability"),
        }
    }

    if let Some(poi) = command.create_poi {
        if caps.create_poi {
            if let (Some(id), Some(pos)) = (poi.poi_id.as_deref(), poi.pos) {
                match state
                    .dispatcher
                    .create_poi(id, pos, poi.public_data.unwrap_or_default(), agent_id)
                {
                    Ok(_) => {}
                    Err(err @ WorldError::DuplicateId { .. }) => {
                        sink.send_now(&ErrorReply::simple(err.to_string()));
                        warn!("{identity}: {err}");
                    }
                    Err(err) => warn!("{identity}: {err}"),
                }
            }
        } else {
            warn!("{identity}: createPOI without the createPOI capability");
        }
    }

    if let Some(poi) = command.remove_poi {
        if caps.create_poi {
            if let Some(id) = poi.poi_id.as_deref() {
                match state.dispatcher.remove_poi(id, agent_id) {
                    Ok(_) => {}
                    // absent ids are tolerated on sessions
                    Err(WorldError::NotFound { .. }) => {
                        debug!("{identity}: removePOI for unknown id {id:?}");
                    }
                    Err(err) => warn!("{identity}: {err}"),
                }
            }
        } else {
            warn!("{identity}: removePOI without the createPOI capability");
        }
    }

    if let Some(beacon) = command.create_air_beacon {
        if caps.create_air_beacon {
            if let (Some(id), Some(rect)) = (beacon.ab_id.as_deref(), beacon.pos) {
                let (width, height) = rect.size();
                if width > caps.max_air_beacon[0] || height > caps.max_air_beacon[1] {
                    sink.send_now(&ErrorReply::simple(
                        "Air beacon size error: it can't be larger than what your token allows",
                    ));
                    warn!("{identity}: air beacon size error");
                } else {
                    match state.world.create_beacon(
                        id,
                        rect,
                        beacon.public_data.unwrap_or_default(),
                        agent_id,
                    ) {
                        Ok(_) => {}
                        Err(err @ WorldError::DuplicateId { .. }) => {
                            sink.send_now(&ErrorReply::simple(err.to_string()));
                            warn!("{identity}: {err}");
                        }
                        Err(err) => warn!("{identity}: {err}"),
                    }
                }
            }
        } else {
            warn!("{identity}: createAirBeacon without the createAirBeacon capability");
        }
    }

    if let Some(beacon) = command.remove_air_beacon {
        if caps.create_air_beacon {
            if let Some(id) = beacon.ab_id.as_deref() {
                match state.world.remove_beacon(id, agent_id) {
                    Ok(_) => {}
                    Err(WorldError::NotFound { .. }) => {
                        debug!("{identity}: removeAirBeacon for unknown id {id:?}");
                    }
                    Err(err) => warn!("{identity}: {err}"),
                }
            }
        } else {
            warn!("{identity}: removeAirBeacon without the createAirBeacon capability");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, header: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some(token) = header {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn token_comes_from_the_header_or_the_query() {
        let req = request("/ws", Some("abc"));
        assert_eq!(token_from_request(&req), Some("abc".to_string()));

        let req = request("/ws?foo=1&token=xyz", None);
        assert_eq!(token_from_request(&req), Some("xyz".to_string()));

        // the header wins over the query
        let req = request("/ws?token=query", Some("header"));
        assert_eq!(token_from_request(&req), Some("header".to_string()));

        let req = request("/ws", None);
        assert_eq!(token_from_request(&req), None);
    }
}
