use anyhow::{anyhow, Context};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            use_speaker_boost: true,
            speed: None,
        }
    }
}

/// Caller-supplied overrides; anything left out falls back to [`VoiceSettings::default`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceSettingsOverrides {
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub style: Option<f32>,
    pub use_speaker_boost: Option<bool>,
    pub speed: Option<f32>,
}

impl VoiceSettingsOverrides {
    pub fn resolve(self, speed: Option<f32>) -> VoiceSettings {
        let defaults = VoiceSettings::default();
        VoiceSettings {
            stability: self.stability.unwrap_or(defaults.stability),
            similarity_boost: self.similarity_boost.unwrap_or(defaults.similarity_boost),
            style: self.style.unwrap_or(defaults.style),
            use_speaker_boost: self.use_speaker_boost.unwrap_or(defaults.use_speaker_boost),
            speed: speed.or(self.speed),
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug)]
pub struct SynthesizedAudio {
    pub content_type: String,
    pub audio: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    #[serde(default)]
    voices: Vec<Voice>,
}

impl ElevenLabsClient {
    pub fn new(base_url: String, api_key: Option<String>, model_id: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create ElevenLabs HTTP client")?;

        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    pub async fn text_to_speech(
        &self,
        voice_id: &str,
        text: &str,
        voice_settings: VoiceSettings,
    ) -> anyhow::Result<SynthesizedAudio> {
        let key = self.require_api_key()?;
        let url = format!("{}/text-to-speech/{}", self.base_url, voice_id);

        tracing::debug!(
            voice_id = %voice_id,
            model_id = %self.model_id,
            input_len = text.len(),
            "ElevenLabs text-to-speech request"
        );

        let response = self
            .http
            .post(url)
            .header("xi-api-key", key)
            .header("Accept", "audio/mpeg")
            .json(&SpeechBody {
                text,
                model_id: &self.model_id,
                voice_settings,
            })
            .send()
            .await
            .with_context(|| format!("ElevenLabs request failed for voice {}", voice_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "ElevenLabs API error ({}): {}",
                status,
                body
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();

        let audio = response
            .bytes()
            .await
            .context("failed to read ElevenLabs audio body")?;

        Ok(SynthesizedAudio {
            content_type,
            audio,
        })
    }

    pub async fn list_voices(&self) -> anyhow::Result<Vec<Voice>> {
        let key = self.require_api_key()?;
        let response = self
            .http
            .get(format!("{}/voices", self.base_url))
            .header("xi-api-key", key)
            .send()
            .await
            .context("ElevenLabs voices request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("ElevenLabs API error ({}): {}", status, body));
        }

        let voices: VoicesResponse = response
            .json()
            .await
            .context("failed to decode ElevenLabs voices")?;
        Ok(voices.voices)
    }

    fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("ELEVENLABS_API_KEY is not configured."))
    }
}
