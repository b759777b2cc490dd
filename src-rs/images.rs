use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use http::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Client for an OpenAI-compatible image generation API, plus the plain
/// downloader used to pull generated images off the provider's temporary URLs.
#[derive(Clone)]
pub struct ImageClient {
    http: reqwest::Client,
    download_http: reqwest::Client,
    download_hosts: Vec<String>,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

/// What the provider handed back for one generated image.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedImage {
    /// Short-lived URL hosted by the provider.
    Temporary(String),
    /// Image bytes returned inline (PNG).
    Inline(Bytes),
}

#[derive(Debug)]
pub struct DownloadedImage {
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Vec<GenerationItem>,
}

#[derive(Debug, Deserialize)]
struct GenerationItem {
    url: Option<String>,
    b64_json: Option<String>,
}

impl ImageClient {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        download_hosts: Vec<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create image HTTP client")?;
        // Redirects could leave the allowlisted hosts.
        let download_http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to create image download client")?;

        Ok(Self {
            http,
            download_http,
            download_hosts: download_hosts
                .into_iter()
                .map(|host| host.trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedImage> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not configured."))?;

        let response = self
            .http
            .post(format!("{}/images/generations", self.base_url))
            .bearer_auth(key)
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "n": 1,
                "size": "1024x1024",
            }))
            .send()
            .await
            .context("image generation request failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read image generation response")?;
        if !status.is_success() {
            return Err(anyhow!(
                "image generation failed with status {}: {}",
                status,
                text
            ));
        }

        let parsed: GenerationResponse =
            serde_json::from_str(&text).context("failed to decode image generation response")?;
        let item = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("image generation returned no images"))?;

        match (item.url, item.b64_json) {
            (Some(url), _) => Ok(GeneratedImage::Temporary(url)),
            (None, Some(encoded)) => {
                let bytes = STANDARD
                    .decode(encoded.as_bytes())
                    .context("image generation returned invalid base64")?;
                Ok(GeneratedImage::Inline(Bytes::from(bytes)))
            }
            (None, None) => Err(anyhow!("image generation returned neither url nor data")),
        }
    }

    /// Whether `url` points at a host images may be downloaded from. Entries
    /// match the bare host or `host:port`.
    pub fn allows_source(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return false,
        };
        let with_port = url
            .port_or_known_default()
            .map(|port| format!("{}:{}", host, port));

        self.download_hosts
            .iter()
            .any(|allowed| *allowed == host || Some(allowed) == with_port.as_ref())
    }

    pub async fn download(&self, url: &Url) -> anyhow::Result<DownloadedImage> {
        if !self.allows_source(url) {
            return Err(anyhow!(
                "image host {:?} is not allowed",
                url.host_str().unwrap_or_default()
            ));
        }

        let mut response = self
            .download_http
            .get(url.clone())
            .send()
            .await
            .context("failed to download generated image")?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("image download failed with status {}", status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_default();
        if !content_type.starts_with("image/") {
            return Err(anyhow!(
                "downloaded file is not an image (content-type {:?})",
                content_type
            ));
        }

        if response
            .content_length()
            .is_some_and(|length| length as usize > MAX_IMAGE_BYTES)
        {
            return Err(anyhow!("image exceeds {} bytes", MAX_IMAGE_BYTES));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("failed to read downloaded image")?
        {
            if body.len() + chunk.len() > MAX_IMAGE_BYTES {
                return Err(anyhow!("image exceeds {} bytes", MAX_IMAGE_BYTES));
            }
            body.extend_from_slice(&chunk);
        }
        let bytes = body.freeze();

        Ok(DownloadedImage {
            content_type,
            bytes,
        })
    }
}

/// File extension for an image content type.
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}
