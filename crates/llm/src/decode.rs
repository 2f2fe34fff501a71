use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::backend::AnswerChunk;

/// Response wrapper shared by every endpoint: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Stream payloads carry either an answer object or the boolean end marker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum StreamData {
    Marker(bool),
    Answer(AnswerChunk),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Answer(AnswerChunk),
    End,
    Failure { code: i64, message: String },
}

/// Decodes the payload of one completion event.
///
/// Malformed payloads are logged and skipped so the rest of the stream still
/// applies. `data: false` and a missing `data` carry nothing.
pub fn decode_frame(payload: &str) -> Option<DecodedFrame> {
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }

    let envelope = match decode_envelope::<StreamData>(payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::debug!(error = %error, "skipping malformed stream chunk");
            return None;
        }
    };

    if !envelope.is_success() {
        return Some(DecodedFrame::Failure {
            code: envelope.code,
            message: envelope.message,
        });
    }

    match envelope.data {
        Some(StreamData::Answer(chunk)) => Some(DecodedFrame::Answer(chunk)),
        Some(StreamData::Marker(true)) => Some(DecodedFrame::End),
        Some(StreamData::Marker(false)) | None => None,
    }
}

pub fn decode_envelope<T: DeserializeOwned>(body: &str) -> serde_json::Result<Envelope<T>> {
    serde_json::from_str(body)
}
