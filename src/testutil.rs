//! A scripted origin server for tests.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use url::Url;

use crate::codec::{HashAlgorithm, Metadata, DB_MEDIATYPE, METADATA_MEDIATYPE};
use crate::types::Campaign;

/// Block size of metadata served by the fake origin.
pub const ORIGIN_BLOCK_SIZE: u32 = 1024;

#[derive(Debug, Clone, Default)]
pub struct SeenRequest {
    pub path: String,
    pub accept: Option<String>,
    pub accept_encoding: Option<String>,
    pub authorization: Option<String>,
    pub if_none_match: Option<String>,
    pub range: Option<String>,
}

#[derive(Default)]
struct Script {
    campaigns: Vec<Campaign>,
    campaigns_fail: bool,
    contents: HashMap<String, Vec<u8>>,
    offer_metadata: bool,
    corrupt_metadata: bool,
    content_type: Option<String>,
    ignore_ranges: bool,
    gzip: bool,
    last_body_len: Option<usize>,
    seen: Vec<SeenRequest>,
}

#[derive(Clone)]
pub struct Origin {
    addr: SocketAddr,
    script: Arc<Mutex<Script>>,
}

pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(HashAlgorithm::Md5.digest(data))
}

impl Origin {
    pub async fn start() -> Self {
        let script = Arc::new(Mutex::new(Script::default()));
        let app = Router::new()
            .route("/campaigns", get(campaigns))
            .route("/content/{id}", get(content))
            .with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        Self { addr, script }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}/content", self.addr)).unwrap()
    }

    pub fn content_url(&self, id: &str) -> Url {
        Url::parse(&format!("http://{}/content/{id}", self.addr)).unwrap()
    }

    pub fn campaigns_url(&self) -> Url {
        Url::parse(&format!("http://{}/campaigns", self.addr)).unwrap()
    }

    pub fn set_campaigns(&self, campaigns: Vec<Campaign>) {
        self.script.lock().unwrap().campaigns = campaigns;
    }

    pub fn fail_campaigns(&self, fail: bool) {
        self.script.lock().unwrap().campaigns_fail = fail;
    }

    pub fn put_content(&self, id: &str, data: Vec<u8>) {
        self.script.lock().unwrap().contents.insert(id.to_string(), data);
    }

    pub fn offer_metadata(&self, offer: bool) {
        self.script.lock().unwrap().offer_metadata = offer;
    }

    pub fn corrupt_metadata(&self, corrupt: bool) {
        self.script.lock().unwrap().corrupt_metadata = corrupt;
    }

    pub fn override_content_type(&self, content_type: &str) {
        self.script.lock().unwrap().content_type = Some(content_type.to_string());
    }

    /// Answer ranged requests with the whole file, as servers without
    /// range support do.
    pub fn ignore_ranges(&self, ignore: bool) {
        self.script.lock().unwrap().ignore_ranges = ignore;
    }

    /// Gzip full responses with `Content-Encoding: gzip`.
    pub fn gzip_responses(&self, gzip: bool) {
        self.script.lock().unwrap().gzip = gzip;
    }

    /// Size on the wire of the last full body served.
    pub fn last_body_len(&self) -> Option<usize> {
        self.script.lock().unwrap().last_body_len
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.script.lock().unwrap().seen.clone()
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.requests().pop()
    }
}

fn header_value(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn campaigns(State(script): State<Arc<Mutex<Script>>>) -> Response {
    let script = script.lock().unwrap();
    if script.campaigns_fail {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(script.campaigns.clone()).into_response()
}

async fn content(
    State(script): State<Arc<Mutex<Script>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut script = script.lock().unwrap();
    let seen = SeenRequest {
        path: format!("/content/{id}"),
        accept: header_value(&headers, header::ACCEPT),
        accept_encoding: header_value(&headers, header::ACCEPT_ENCODING),
        authorization: header_value(&headers, header::AUTHORIZATION),
        if_none_match: header_value(&headers, header::IF_NONE_MATCH),
        range: header_value(&headers, header::RANGE),
    };
    script.seen.push(seen.clone());

    let Some(data) = script.contents.get(&id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = seen
        .range
        .as_deref()
        .filter(|_| !script.ignore_ranges)
        .and_then(|r| r.strip_prefix("bytes="));
    if let Some(range) = range {
        let (first, last) = range.split_once('-').unwrap();
        let first: usize = first.parse().unwrap();
        let last: usize = last.parse().unwrap();
        return (
            StatusCode::PARTIAL_CONTENT,
            [(header::CONTENT_TYPE, DB_MEDIATYPE)],
            data[first..=last].to_vec(),
        )
            .into_response();
    }

    let digest = md5_hex(&data);
    if seen.if_none_match.as_deref() == Some(format!("\"{digest}\"").as_str()) {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let wants_metadata = seen
        .accept
        .as_deref()
        .is_some_and(|a| a.contains(METADATA_MEDIATYPE));
    let (content_type, body) = if wants_metadata && script.offer_metadata {
        let mut meta = Metadata::generate(
            &data,
            ORIGIN_BLOCK_SIZE,
            HashAlgorithm::Md5,
            HashAlgorithm::Md5,
        );
        if script.corrupt_metadata {
            meta.file_hash[0] ^= 0x01;
        }
        (METADATA_MEDIATYPE.to_string(), meta.encode())
    } else {
        (DB_MEDIATYPE.to_string(), data)
    };
    let content_type = script.content_type.clone().unwrap_or(content_type);
    if script.gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).unwrap();
        let body = encoder.finish().unwrap();
        script.last_body_len = Some(body.len());
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CONTENT_ENCODING, "gzip".to_string()),
            ],
            body,
        )
            .into_response();
    }
    script.last_body_len = Some(body.len());
    (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
}
