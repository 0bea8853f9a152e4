// This file is part of capsync, a collaborative video-annotation server.
// Copyright (C) 2025 The capsync Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later

//! Common code for the sync websocket: upgrade handling and origin checks.

use std::pin::Pin;

use base::{bail, ErrorKind};
use futures::{Future, SinkExt as _};
use http::{header, Request, Response};
use hyper::Body;
use tokio_tungstenite::{tungstenite, WebSocketStream};
use tracing::Instrument as _;

use crate::json::{ErrorCode, ServerMessage};

use super::{bad_req, ResponseResult};

/// Upgrades to websocket and runs the supplied handler in a separate tokio
/// task.
///
/// Fails on `Origin` mismatch with an HTTP-level error. If the handler
/// returns an authentication error, it is sent to the client as an `error`
/// frame before the stream is dropped; other errors are only logged.
pub(super) fn upgrade<H>(req: Request<Body>, handler: H) -> ResponseResult
where
    for<'a> H: FnOnce(
            &'a mut WebSocketStream<hyper::upgrade::Upgraded>,
        ) -> Pin<Box<dyn Future<Output = Result<(), base::Error>> + Send + 'a>>
        + Send
        + 'static,
{
    // An `Origin` mismatch should be an HTTP-level error; this is likely a
    // cross-site attack, and failing before the upgrade avoids giving any
    // information to the Javascript running in the browser.
    check_origin(req.headers())?;

    let response = tungstenite::handshake::server::create_response_with_body(&req, Body::empty)
        .map_err(|e| bad_req(e.to_string()))?;
    let (parts, _) = response.into_parts();
    let span = tracing::info_span!("websocket");
    tokio::spawn(
        async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(u) => u,
                Err(err) => {
                    tracing::error!(%err, "upgrade failed");
                    return;
                }
            };
            let mut ws = WebSocketStream::from_raw_socket(
                upgraded,
                tungstenite::protocol::Role::Server,
                None,
            )
            .await;
            if let Err(err) = handler(&mut ws).await {
                tracing::error!(err = %err.chain(), "closing with error");
                if err.kind() == ErrorKind::Unauthenticated {
                    let frame = ServerMessage::Error {
                        code: ErrorCode::Unauthenticated,
                        message: err.to_string(),
                    };
                    let _ = ws
                        .send(tungstenite::Message::Text(
                            serde_json::to_string(&frame).expect("error frames serialize"),
                        ))
                        .await;
                }
            } else {
                tracing::info!("closing");
            }
            let _ = ws.close(None).await;
        }
        .instrument(span),
    );
    Ok(Response::from_parts(parts, Body::empty()))
}

/// Checks the `Host` and `Origin` headers match, if the latter is supplied.
///
/// Web browsers must supply origin, per RFC 6455 section 4.1; it's not
/// required for non-browser clients. Browsers don't honor cookie SameSite
/// rules for websocket upgrades, so this check is the protection against
/// cross-site websocket hijacking.
fn check_origin(headers: &header::HeaderMap) -> Result<(), super::HttpError> {
    let origin_hdr = match headers.get(http::header::ORIGIN) {
        None => return Ok(()),
        Some(o) => o,
    };
    let host_hdr = headers
        .get(header::HOST)
        .ok_or_else(|| bad_req("missing Host header"))?;
    let host_str = host_hdr.to_str().map_err(|_| bad_req("bad Host header"))?;

    // Ignores the port number, matching the browser's rules for when it
    // sends a cookie.
    let host = match host_str.split_once(':') {
        Some((host, _port)) => host,
        None => host_str,
    };
    let origin_url = origin_hdr
        .to_str()
        .ok()
        .and_then(|o| url::Url::parse(o).ok())
        .ok_or_else(|| bad_req("bad Origin header"))?;
    let origin_host = origin_url
        .host_str()
        .ok_or_else(|| bad_req("bad Origin header"))?;
    if host != origin_host {
        bail!(
            PermissionDenied,
            msg("cross-origin request forbidden (request host {host_hdr:?}, origin {origin_hdr:?})")
        );
    }
    Ok(())
}
