use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use log::{debug, info};
use reqwest::Client;
use std::fmt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::DownloadError;
use crate::retry::{is_retryable_reqwest_error, retry_with_backoff, RetryAction, RetryPolicy};

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

pub const AES_BLOCK_LEN: usize = 16;

/// Key tag as declared by the playlist; the key bytes are fetched later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub uri: Url,
    pub iv: [u8; AES_BLOCK_LEN],
}

/// AES-128 key and IV for a whole job.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    pub key: [u8; AES_BLOCK_LEN],
    pub iv: [u8; AES_BLOCK_LEN],
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"<redacted>")
            .field("iv", &hex::encode(self.iv))
            .finish()
    }
}

/// 解析IV值，例如 `0x000102...0f`
///
/// The value is a 128-bit big-endian number; shorter hex strings are
/// left-padded with zeros.
pub fn parse_iv(text: &str) -> Result<[u8; AES_BLOCK_LEN], DownloadError> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.is_empty() || digits.len() > AES_BLOCK_LEN * 2 {
        return Err(DownloadError::malformed(format!("invalid IV value: {}", text)));
    }

    let padded = format!("{:0>32}", digits);
    let mut iv = [0u8; AES_BLOCK_LEN];
    hex::decode_to_slice(&padded, &mut iv)
        .map_err(|e| DownloadError::malformed(format!("invalid IV value {}: {}", text, e)))?;
    Ok(iv)
}

/// 获取密钥（整个任务只获取一次）
pub async fn fetch_key(
    client: &Client,
    descriptor: &KeyDescriptor,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> Result<EncryptionKey, DownloadError> {
    let url = descriptor.uri.clone();
    info!("Fetching key from {}", url);

    let failed = |reason: String| DownloadError::KeyFetch {
        url: url.to_string(),
        reason,
    };

    let key = retry_with_backoff(policy, token, |_| {
        let request = client.get(url.clone());
        async move {
            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if is_retryable_reqwest_error(&e) => return RetryAction::Retry(failed(e.to_string())),
                Err(e) => return RetryAction::Fail(failed(e.to_string())),
            };
            let status = response.status();
            if !status.is_success() {
                let err = failed(format!("HTTP {}", status));
                return if DownloadError::is_retryable_status(status) {
                    RetryAction::Retry(err)
                } else {
                    RetryAction::Fail(err)
                };
            }
            let bytes = match response.bytes().await {
                Ok(b) => b,
                Err(e) => return RetryAction::Retry(failed(e.to_string())),
            };
            match <[u8; AES_BLOCK_LEN]>::try_from(bytes.as_ref()) {
                Ok(key) => RetryAction::Success(key),
                Err(_) => RetryAction::Fail(failed(format!(
                    "invalid key length: {} (expected {})",
                    bytes.len(),
                    AES_BLOCK_LEN
                ))),
            }
        }
    })
    .await?;

    debug!("Key fetched, IV {}", hex::encode(descriptor.iv));
    Ok(EncryptionKey {
        key,
        iv: descriptor.iv,
    })
}

/// Cipher state carried from one segment to the next.
///
/// Segments are decrypted as one continuous CBC stream: the last ciphertext
/// block of segment `i` is the IV of segment `i + 1`. The state is consumed
/// and returned by every call, so segments can only be fed in order.
#[derive(Clone)]
pub struct ChainState {
    key: [u8; AES_BLOCK_LEN],
    prev_block: [u8; AES_BLOCK_LEN],
}

impl fmt::Debug for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState")
            .field("key", &"<redacted>")
            .field("prev_block", &hex::encode(self.prev_block))
            .finish()
    }
}

impl ChainState {
    pub fn new(key: &EncryptionKey) -> Self {
        Self {
            key: key.key,
            prev_block: key.iv,
        }
    }

    /// Decrypts one segment in place. Only the final segment is
    /// PKCS#7-unpadded.
    pub fn decrypt_segment(
        self,
        index: usize,
        mut data: Vec<u8>,
        is_final: bool,
    ) -> Result<(Vec<u8>, ChainState), DownloadError> {
        let fail = |reason: String| DownloadError::Decryption { index, reason };

        if data.len() % AES_BLOCK_LEN != 0 {
            return Err(fail(format!(
                "ciphertext length {} is not a multiple of {}",
                data.len(),
                AES_BLOCK_LEN
            )));
        }
        if is_final && data.is_empty() {
            return Err(fail("final segment is empty, padding missing".to_string()));
        }

        let mut next_block = self.prev_block;
        if let Some(tail) = data.len().checked_sub(AES_BLOCK_LEN) {
            next_block.copy_from_slice(&data[tail..]);
        }

        let cipher = Aes128CbcDec::new(&self.key.into(), &self.prev_block.into());
        let plain_len = if is_final {
            cipher
                .decrypt_padded_mut::<Pkcs7>(&mut data)
                .map_err(|e| fail(format!("bad padding: {}", e)))?
                .len()
        } else {
            cipher
                .decrypt_padded_mut::<NoPadding>(&mut data)
                .map_err(|e| fail(e.to_string()))?
                .len()
        };
        data.truncate(plain_len);

        Ok((
            data,
            ChainState {
                key: self.key,
                prev_block: next_block,
            },
        ))
    }
}
