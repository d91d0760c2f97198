use log::{debug, info, warn};
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist};
use reqwest::Client;
use url::Url;

use crate::crypto::{parse_iv, KeyDescriptor};
use crate::error::DownloadError;

const MAX_VARIANT_DEPTH: usize = 3;

/// One media segment, in playlist order.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRef {
    /// Zero-based position in the playlist; reassembly follows this.
    pub index: usize,
    pub uri: Url,
    pub duration: f32,
    /// Listed under an AES-128 key tag.
    pub encrypted: bool,
}

/// 解析后的媒体播放列表
#[derive(Debug, Clone)]
pub struct Playlist {
    pub segments: Vec<SegmentRef>,
    /// The key of the encrypted segments, if any.
    pub key: Option<KeyDescriptor>,
    /// Whether `#EXT-X-ENDLIST` was present.
    pub ended: bool,
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Per-index encryption flags, in playlist order.
    pub fn encryption_map(&self) -> Vec<bool> {
        self.segments.iter().map(|s| s.encrypted).collect()
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| f64::from(s.duration)).sum()
    }
}

/// Directory form of `url`: the trailing path component is dropped.
pub fn base_url_of(url: &Url) -> Result<Url, DownloadError> {
    url.join(".")
        .map_err(|e| DownloadError::malformed(format!("cannot derive base of {}: {}", url, e)))
}

enum Parsed {
    Master(Url),
    Media(Playlist),
}

/// 解析媒体播放列表文本
///
/// `playlist_url` is the URL the text was served from; relative segment and
/// key URIs are resolved against its directory.
pub fn parse_playlist(content: &[u8], playlist_url: &Url) -> Result<Playlist, DownloadError> {
    match parse(content, playlist_url)? {
        Parsed::Media(playlist) => Ok(playlist),
        Parsed::Master(_) => Err(DownloadError::malformed(
            "master playlist has no media segments",
        )),
    }
}

fn parse(content: &[u8], playlist_url: &Url) -> Result<Parsed, DownloadError> {
    let playlist = m3u8_rs::parse_playlist_res(content)
        .map_err(|e| DownloadError::malformed(format!("failed to parse M3U8 playlist: {}", e)))?;

    match playlist {
        m3u8_rs::Playlist::MasterPlaylist(pl) => select_variant(&pl, playlist_url).map(Parsed::Master),
        m3u8_rs::Playlist::MediaPlaylist(pl) => build_media(pl, playlist_url).map(Parsed::Media),
    }
}

fn select_variant(pl: &MasterPlaylist, playlist_url: &Url) -> Result<Url, DownloadError> {
    info!("Master playlist found with {} variants.", pl.variants.len());

    let best_variant = pl
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .max_by_key(|v| v.bandwidth)
        .ok_or_else(|| DownloadError::malformed("no variants found in master playlist"))?;

    info!("Selected variant with bandwidth: {}", best_variant.bandwidth);

    playlist_url
        .join(&best_variant.uri)
        .map_err(|e| DownloadError::malformed(format!("bad variant URI {}: {}", best_variant.uri, e)))
}

fn build_media(pl: MediaPlaylist, playlist_url: &Url) -> Result<Playlist, DownloadError> {
    if pl.segments.is_empty() {
        return Err(DownloadError::malformed("no media segments found"));
    }

    let base_url = base_url_of(playlist_url)?;
    let mut key: Option<KeyDescriptor> = None;
    // whether the most recent key tag is AES-128
    let mut encrypting = false;
    let mut segments = Vec::with_capacity(pl.segments.len());

    for (index, segment) in pl.segments.iter().enumerate() {
        if let Some(tag) = &segment.key {
            match &tag.method {
                KeyMethod::None => encrypting = false,
                KeyMethod::AES128 => {
                    let uri = tag
                        .uri
                        .as_deref()
                        .ok_or_else(|| DownloadError::malformed("AES-128 key tag without URI"))?;
                    let iv = tag.iv.as_deref().ok_or_else(|| {
                        DownloadError::malformed("AES-128 key tag without explicit IV is not supported")
                    })?;
                    let descriptor = KeyDescriptor {
                        uri: resolve(&base_url, uri)?,
                        iv: parse_iv(iv)?,
                    };
                    match &key {
                        None => key = Some(descriptor),
                        Some(current) if *current != descriptor => {
                            warn!("Ignoring key rotation at segment {}; only a single key per playlist is supported", index);
                        }
                        Some(_) => {}
                    }
                    encrypting = true;
                }
                other => {
                    return Err(DownloadError::malformed(format!(
                        "unsupported encryption method {}",
                        other
                    )));
                }
            }
        }

        segments.push(SegmentRef {
            index,
            uri: resolve(&base_url, &segment.uri)?,
            duration: segment.duration,
            encrypted: encrypting,
        });
    }

    debug!(
        "Parsed {} segments, {} encrypted, relative to {}",
        segments.len(),
        segments.iter().filter(|s| s.encrypted).count(),
        base_url
    );

    Ok(Playlist {
        segments,
        key,
        ended: pl.end_list,
    })
}

fn resolve(base_url: &Url, uri: &str) -> Result<Url, DownloadError> {
    base_url
        .join(uri.trim())
        .map_err(|e| DownloadError::malformed(format!("cannot resolve URI {}: {}", uri, e)))
}

/// 获取并解析M3U8播放列表，遇到主播放列表时选择最高码率的变体
pub async fn fetch_playlist(client: &Client, url: Url) -> Result<Playlist, DownloadError> {
    let mut url = url;
    for _ in 0..=MAX_VARIANT_DEPTH {
        info!("Fetching playlist from {}", url);
        let (final_url, content) = fetch_text(client, &url).await?;

        match parse(&content, &final_url)? {
            Parsed::Media(playlist) => {
                debug!("Media playlist found at {}", final_url);
                return Ok(playlist);
            }
            Parsed::Master(variant) => url = variant,
        }
    }

    Err(DownloadError::malformed(format!(
        "master playlists nested deeper than {} levels",
        MAX_VARIANT_DEPTH
    )))
}

async fn fetch_text(client: &Client, url: &Url) -> Result<(Url, Vec<u8>), DownloadError> {
    let failed = |reason: String| DownloadError::PlaylistFetch {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url.clone())
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| failed(e.to_string()))?;
    let final_url = response.url().clone();
    let content = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    Ok((final_url, content.to_vec()))
}
