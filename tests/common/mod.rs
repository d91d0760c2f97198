#![allow(dead_code)]

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyIvInit};
use axum::{
    extract::State,
    http::{StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

use hls_fetch::retry::RetryPolicy;
use hls_fetch::{FetchConfig, JobConfig};

pub const KEY_HEX: &str = "00112233445566778899aabbccddeeff";
pub const IV_HEX: &str = "000102030405060708090a0b0c0d0e0f";

#[derive(Default)]
struct Route {
    body: Bytes,
    /// Remaining requests answered with HTTP 500.
    failures: usize,
    delay: Duration,
    hits: usize,
}

#[derive(Default)]
pub struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    total: AtomicUsize,
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri) -> impl IntoResponse {
    state.total.fetch_add(1, Ordering::SeqCst);
    let (status, body, delay) = {
        let mut routes = state.routes.lock().unwrap();
        match routes.get_mut(uri.path()) {
            None => (StatusCode::NOT_FOUND, Bytes::new(), Duration::ZERO),
            Some(route) => {
                route.hits += 1;
                if route.failures > 0 {
                    route.failures -= 1;
                    (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new(), route.delay)
                } else {
                    (StatusCode::OK, route.body.clone(), route.delay)
                }
            }
        }
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    (status, body)
}

/// Local HTTP server with per-path bodies, injected failures and counters.
pub struct TestServer {
    base_url: Url,
    state: Arc<ServerState>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn new() -> Self {
        let state = Arc::new(ServerState::default());
        let router = Router::new().fallback(serve).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, router).with_graceful_shutdown(async {
            shutdown_rx.await.ok();
        });
        tokio::spawn(async move {
            server.await.unwrap();
        });

        Self {
            base_url: Url::parse(&format!("http://{}", addr)).unwrap(),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.base_url.join(path).unwrap()
    }

    pub fn put(&self, path: &str, body: impl Into<Bytes>) {
        let mut routes = self.state.routes.lock().unwrap();
        let route = routes.entry(path.to_string()).or_default();
        route.body = body.into();
    }

    pub fn fail(&self, path: &str, times: usize) {
        let mut routes = self.state.routes.lock().unwrap();
        routes.entry(path.to_string()).or_default().failures = times;
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        let mut routes = self.state.routes.lock().unwrap();
        routes.entry(path.to_string()).or_default().delay = delay;
    }

    pub fn hits(&self, path: &str) -> usize {
        let routes = self.state.routes.lock().unwrap();
        routes.get(path).map(|r| r.hits).unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }

    /// Serves `segments` under `/{dir}/seg{i}.ts` plus a playlist at
    /// `/{dir}/index.m3u8`; the key (if any) at `/{dir}/key.bin`.
    pub fn publish(&self, dir: &str, segments: &[Vec<u8>], encrypted: bool) -> Url {
        if encrypted {
            self.put(&format!("/{}/key.bin", dir), hex_bytes(KEY_HEX));
        }
        for (i, seg) in segments.iter().enumerate() {
            self.put(&format!("/{}/seg{}.ts", dir, i), seg.clone());
        }
        self.put(&format!("/{}/index.m3u8", dir), playlist_text(segments.len(), encrypted));
        self.url(&format!("/{}/index.m3u8", dir))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

pub fn playlist_text(count: usize, encrypted: bool) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n");
    if encrypted {
        text.push_str(&format!(
            "#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\",IV=0x{}\n",
            IV_HEX
        ));
    }
    for i in 0..count {
        text.push_str(&format!("#EXTINF:10.0,\nseg{}.ts\n", i));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

pub fn hex_bytes(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap()
}

/// Deterministic fake transport-stream payload.
pub fn media_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 251) as u8).collect()
}

/// Encrypts `plain` as one CBC stream and cuts it into `parts` block-aligned
/// segments.
pub fn encrypt_into_segments(plain: &[u8], parts: usize) -> Vec<Vec<u8>> {
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    hex::decode_to_slice(KEY_HEX, &mut key).unwrap();
    hex::decode_to_slice(IV_HEX, &mut iv).unwrap();

    let mut buf = vec![0u8; plain.len() + 16];
    buf[..plain.len()].copy_from_slice(plain);
    let len = cbc::Encryptor::<aes::Aes128>::new(&key.into(), &iv.into())
        .encrypt_padded_mut::<Pkcs7>(&mut buf, plain.len())
        .unwrap()
        .len();
    buf.truncate(len);

    let blocks = buf.len() / 16;
    let per = blocks.div_ceil(parts);
    let segments: Vec<Vec<u8>> = buf.chunks(per * 16).map(|c| c.to_vec()).collect();
    assert_eq!(segments.len(), parts, "choose a plaintext size that splits evenly");
    segments
}

pub fn test_config(max_retries: u32) -> JobConfig {
    JobConfig {
        fetch: FetchConfig {
            concurrency: 4,
            retry: RetryPolicy::immediate(max_retries),
            cache_segments: true,
            progress: false,
        },
        reorder_window: 2,
        ..JobConfig::default()
    }
}
