//! HTTP surface: verified content for local consumers and peer sidecars,
//! plus update and status endpoints.
//!
//! # Routes
//!
//! - `GET {download_path}/{campaign}` - database or metadata of a campaign
//! - `GET /update[?campaign=<id>]` - request an update
//! - `GET /status` - counters, peers and installed digests

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::codec::{DB_MEDIATYPE, METADATA_MEDIATYPE};
use crate::content::ContentView;
use crate::discovery::PeerStatus;
use crate::events::{Event, EventBus};
use crate::stats::Counters;

#[derive(Clone)]
pub struct AppState {
    pub content: ContentView,
    pub bus: EventBus,
    pub counters: Arc<Counters>,
    pub peers: Option<watch::Receiver<PeerStatus>>,
}

pub fn router(state: AppState, download_path: &str) -> Router {
    let content_route = format!("{}/{{campaign}}", download_path.trim_end_matches('/'));
    Router::new()
        .route(&content_route, get(content))
        .route("/update", get(update))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, router: Router) -> anyhow::Result<()> {
    info!("serving content on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;
    Ok(())
}

fn etag_matches(headers: &HeaderMap, digest: &str) -> bool {
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|tag| tag.trim().trim_start_matches("W/").trim_matches('"'))
        .any(|tag| tag == digest || tag == "*")
}

fn accepts_metadata(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains(METADATA_MEDIATYPE))
}

async fn content(
    State(state): State<AppState>,
    Path(campaign): Path<String>,
    request: Request,
) -> Response {
    let Some(content) = state.content.get(&campaign) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let etag = HeaderValue::from_str(&format!("\"{}\"", content.digest)).ok();
    if etag.is_none() {
        warn!("{campaign}: digest {:?} is not a valid entity tag", content.digest);
    }

    if etag_matches(request.headers(), &content.digest) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        if let Some(etag) = etag {
            response.headers_mut().insert(header::ETAG, etag);
        }
        return response;
    }

    let (path, media_type) = if accepts_metadata(request.headers())
        && tokio::fs::try_exists(&content.metadata_file)
            .await
            .unwrap_or(false)
    {
        (content.metadata_file, METADATA_MEDIATYPE)
    } else {
        (content.content_file, DB_MEDIATYPE)
    };
    debug!("{campaign}: serving {}", path.display());

    let mut response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };
    if response.status().is_success() {
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(media_type));
        if let Some(etag) = etag {
            headers.insert(header::ETAG, etag);
        }
    }
    response
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    campaign: Option<String>,
}

async fn update(State(state): State<AppState>, Query(params): Query<UpdateParams>) -> StatusCode {
    info!("update requested for {:?}", params.campaign);
    state.bus.publish(Event::RequestUpdate {
        campaign: params.campaign,
    });
    StatusCode::ACCEPTED
}

#[derive(Debug, Serialize)]
struct StatusBody {
    counters: BTreeMap<&'static str, u64>,
    content: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peers: Option<PeerStatus>,
}

async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let content = state
        .content
        .snapshot()
        .iter()
        .map(|(id, c)| (id.clone(), c.digest.clone()))
        .collect();
    Json(StatusBody {
        counters: state.counters.snapshot(),
        content,
        peers: state.peers.as_ref().map(|rx| rx.borrow().clone()),
    })
}
