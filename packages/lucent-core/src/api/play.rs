//! Playback handlers.
//!
//! `/live/{name}` streams packets straight off a live-edge cursor for
//! low-latency players; `/web/{name}/...` serves the chunked publisher for
//! browser playback. Both use the record framing from [`crate::web::framing`].

use std::net::SocketAddr;

use async_stream::stream;
use axum::body::Body;
use axum::extract::{connect_info::ConnectInfo, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{LucentError, LucentResult};
use crate::ingest::{ChannelInfo, ViewerGuard};
use crate::media::CursorEvent;
use crate::web::framing;

use super::AppState;

const MEDIA_CONTENT_TYPE: &str = "application/octet-stream";

pub(super) async fn list_channels(State(state): State<AppState>) -> Json<Vec<ChannelInfo>> {
    Json(state.manager.channel_infos())
}

#[derive(Debug, Deserialize)]
pub(super) struct PlayQuery {
    /// Select the derived Opus queue instead of the raw ingest queue.
    #[serde(default)]
    opus: bool,
}

pub(super) async fn play_live(
    Path(name): Path<String>,
    Query(query): Query<PlayQuery>,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> LucentResult<Response> {
    let ch = state
        .manager
        .channel(&name)
        .ok_or_else(|| LucentError::ChannelOffline(name.clone()))?;
    let mut cursor = ch
        .queue(query.opus)
        .ok_or_else(|| LucentError::ChannelOffline(name.clone()))?;
    let guard = ViewerGuard::new(ch.clone());
    log::info!(
        "[play] {remote} started direct playback of {name} (opus={})",
        query.opus
    );

    let streams = cursor
        .streams()
        .await
        .map_err(|e| LucentError::Internal(e.to_string()))?;

    let body = stream! {
        // Viewer accounting lives and dies with the response body.
        let _guard = guard;
        yield Ok::<Bytes, std::io::Error>(framing::header_record(&streams));
        loop {
            match cursor.read().await {
                CursorEvent::Packet(pkt) => yield Ok(framing::packet_record(&pkt)),
                CursorEvent::Discontinuity => {
                    // The player resets and resyncs from the fresh header.
                    yield Ok(framing::discontinuity_record());
                    yield Ok(framing::header_record(&streams));
                }
                CursorEvent::End => break,
            }
        }
        log::debug!("[play] {remote} finished playback of {name}");
    };

    Response::builder()
        .header(header::CONTENT_TYPE, MEDIA_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| LucentError::Internal(e.to_string()))
}

pub(super) async fn web_manifest(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> LucentResult<Response> {
    let publisher = state
        .manager
        .channel(&name)
        .and_then(|ch| ch.web())
        .ok_or_else(|| LucentError::ChannelOffline(name.clone()))?;
    Ok(Json(publisher.manifest()).into_response())
}

#[derive(Debug, Deserialize)]
pub(super) struct ChunkQuery {
    /// Single-track rendition index, when the publish mode maintains them.
    track: Option<usize>,
}

pub(super) async fn web_chunk(
    Path((name, seq)): Path<(String, u64)>,
    Query(query): Query<ChunkQuery>,
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> LucentResult<Response> {
    let ch = state
        .manager
        .channel(&name)
        .ok_or_else(|| LucentError::ChannelOffline(name.clone()))?;
    let publisher = ch
        .web()
        .ok_or_else(|| LucentError::ChannelOffline(name.clone()))?;
    let header_streams = publisher.header().ok_or(LucentError::ChunkNotFound)?;
    let chunk = publisher
        .chunk(seq, query.track)
        .ok_or(if query.track.is_some() {
            LucentError::TrackNotFound
        } else {
            LucentError::ChunkNotFound
        })?;

    // Fetching media marks this host as a current web viewer.
    ch.web_viewed(&remote.ip().to_string());

    let body = framing::chunk_body(&header_streams, &chunk.packets);
    Response::builder()
        .header(header::CONTENT_TYPE, MEDIA_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .map_err(|e| LucentError::Internal(e.to_string()))
}
