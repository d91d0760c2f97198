use log::{debug, warn};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
    Client,
};

use crate::config::HttpConfig;
use crate::error::DownloadError;

/// 构建HTTP客户端，包含自定义请求头
///
/// The client is built once per downloader and shared read-only by the
/// playlist, key and segment fetches.
pub fn build_http_client(config: &HttpConfig) -> Result<Client, DownloadError> {
    let headers = build_headers(config)?;
    debug!("Using HTTP headers: {:?}", headers);

    let client = Client::builder()
        .default_headers(headers)
        .timeout(config.timeout)
        .build()?;

    Ok(client)
}

fn build_headers(config: &HttpConfig) -> Result<HeaderMap, DownloadError> {
    let mut headers = HeaderMap::new();
    let user_agent = HeaderValue::from_str(&config.user_agent).map_err(|e| {
        DownloadError::InvalidHeader {
            header: format!("User-Agent: {}", config.user_agent),
            reason: e.to_string(),
        }
    })?;
    headers.insert(USER_AGENT, user_agent);

    for header in &config.headers {
        let Some((key, value)) = header.split_once(':') else {
            warn!("Ignoring malformed header: {}", header);
            continue;
        };
        let invalid = |reason: String| DownloadError::InvalidHeader {
            header: header.clone(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(key.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}
