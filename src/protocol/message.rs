//! Protocol message definitions
//!
//! Outbound commands, the model type tag, the ridge artifact schema and the
//! decoder that classifies every datagram arriving on the artifact port.

use std::fmt;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use super::{CHUNK_MARKER, PROGRESS_MARKER, SERVER_ERROR_MARKER};

/// One-field JSON commands sent to the motor server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Start,
    Disconnect,
}

impl Command {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Disconnect => "disconnect",
        }
    }
}

/// Which artifact schema a training round produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelType {
    None,
    RidgeForExo,
    Tflite,
}

impl ModelType {
    /// Name used in the training header
    pub fn wire_name(&self) -> &'static str {
        match self {
            ModelType::None => "NONE",
            ModelType::RidgeForExo => "RIDGE_FOR_EXO",
            ModelType::Tflite => "TFLITE",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(ModelType::None),
            "RIDGE_FOR_EXO" | "RIDGE" => Ok(ModelType::RidgeForExo),
            "TFLITE" | "MLP" => Ok(ModelType::Tflite),
            other => Err(format!("Unknown model type: {}", other)),
        }
    }
}

/// One per-class linear model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeClassModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub intercept: f64,
    pub coef: Vec<f64>,
}

/// Feature extraction parameters the model was trained with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub window_size: u32,
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mse: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
}

/// Ridge regression artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeModel {
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub models: Vec<RidgeClassModel>,
    pub preprocessing: Preprocessing,
}

impl RidgeModel {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Evaluate every class model on one feature vector
    pub fn predict(&self, features: &[f64]) -> Vec<f64> {
        self.models
            .iter()
            .map(|m| {
                m.intercept
                    + m.coef
                        .iter()
                        .zip(features)
                        .map(|(c, x)| c * x)
                        .sum::<f64>()
            })
            .collect()
    }
}

/// A trained artifact as delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ModelArtifact {
    /// Ridge model JSON text
    Ridge(String),
    /// Reassembled TFLite interpreter bytes
    Tflite(Vec<u8>),
}

impl ModelArtifact {
    pub fn model_type(&self) -> ModelType {
        match self {
            ModelArtifact::Ridge(_) => ModelType::RidgeForExo,
            ModelArtifact::Tflite(_) => ModelType::Tflite,
        }
    }
}

/// Training progress as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub current: u32,
    pub total: u32,
}

impl ProgressEvent {
    /// floor(current / total * 100); may exceed 100 if the server overshoots,
    /// saturating at `u32::MAX`
    pub fn percent(&self) -> u32 {
        let percent = u64::from(self.current) * 100 / u64::from(self.total.max(1));
        u32::try_from(percent).unwrap_or(u32::MAX)
    }
}

/// One decoded datagram from the artifact port
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Complete ridge model JSON document
    RidgeModel(String),
    /// One fragment of a chunked binary artifact
    Chunk {
        index: u32,
        total: u32,
        payload: Vec<u8>,
    },
    Progress(ProgressEvent),
    ServerError(String),
    /// Recognised prefix with an unusable body
    Malformed { kind: &'static str, reason: String },
    /// Anything else
    Unknown,
}

impl InboundMessage {
    /// Classify a datagram by its structural prefix
    pub fn decode(datagram: &[u8]) -> Self {
        let text = String::from_utf8_lossy(datagram);

        if text.starts_with('{') {
            InboundMessage::RidgeModel(text.into_owned())
        } else if let Some(rest) = text.strip_prefix(CHUNK_MARKER) {
            decode_chunk(rest)
        } else if let Some(rest) = text.strip_prefix(PROGRESS_MARKER) {
            match parse_progress(rest) {
                Some(progress) => InboundMessage::Progress(progress),
                None => InboundMessage::Malformed {
                    kind: "progress",
                    reason: format!("no <current>/<total> in {:?}", text),
                },
            }
        } else if let Some(rest) = text.strip_prefix(SERVER_ERROR_MARKER) {
            InboundMessage::ServerError(rest.to_string())
        } else {
            InboundMessage::Unknown
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::RidgeModel(_) => "ridge-model",
            InboundMessage::Chunk { .. } => "chunk",
            InboundMessage::Progress(_) => "progress",
            InboundMessage::ServerError(_) => "server-error",
            InboundMessage::Malformed { .. } => "malformed",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// Parse `:<index>:<total>:<base64>`
fn decode_chunk(rest: &str) -> InboundMessage {
    let malformed = |reason: String| InboundMessage::Malformed {
        kind: "chunk",
        reason,
    };

    let Some(rest) = rest.strip_prefix(':') else {
        return malformed("missing separator after marker".to_string());
    };

    let mut parts = rest.splitn(3, ':');
    let (Some(index), Some(total), Some(encoded)) = (parts.next(), parts.next(), parts.next())
    else {
        return malformed("expected <index>:<total>:<payload>".to_string());
    };

    let (index, total) = match (index.trim().parse::<u32>(), total.trim().parse::<u32>()) {
        (Ok(index), Ok(total)) => (index, total),
        _ => return malformed(format!("bad index/total {:?}/{:?}", index, total)),
    };

    if index >= total {
        return malformed(format!("index {} out of range for total {}", index, total));
    }

    let encoded: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    match BASE64.decode(encoded.as_bytes()) {
        Ok(payload) => InboundMessage::Chunk {
            index,
            total,
            payload,
        },
        Err(e) => malformed(format!("base64: {}", e)),
    }
}

/// Parse `[:\s]*<digits>/<digits>`, ignoring anything after the second number
fn parse_progress(rest: &str) -> Option<ProgressEvent> {
    let rest = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
    let (current, rest) = take_digits(rest)?;
    let rest = rest.strip_prefix('/')?;
    let (total, _) = take_digits(rest)?;

    if total == 0 {
        return None;
    }
    Some(ProgressEvent { current, total })
}

fn take_digits(s: &str) -> Option<(u32, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}
