use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::ServerError;
use crate::storage::EncryptedGroupMessage;
use crate::tokens::{DleqProof, SpentToken};

/// Serde adapter encoding `Vec<u8>` as standard base64 text.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional byte fields.
pub mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            Some(t) => STANDARD
                .decode(t)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// One protocol frame. Frames travel as newline-delimited JSON over the
/// hidden-service connection; the `type` tag selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    PowChallenge {
        #[serde(with = "base64_bytes")]
        challenge: Vec<u8>,
        difficulty: u32,
    },
    PowSolution {
        solution: u64,
    },
    PowResult {
        accepted: bool,
    },

    IssueRequest {
        #[serde(with = "base64_bytes")]
        blinded: Vec<u8>,
    },
    IssueResponse {
        #[serde(with = "base64_bytes")]
        signed: Vec<u8>,
        proof: DleqProof,
    },

    SpendToken {
        token: SpentToken,
    },
    SpendResult {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<u16>,
    },

    Post {
        message: EncryptedGroupMessage,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<SpentToken>,
    },
    PostResult {
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<u16>,
    },

    Replay {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        last_seen_signature: Option<Vec<u8>>,
    },
    ReplayStream {
        message: EncryptedGroupMessage,
    },
    ReplayEnd {},

    Error {
        code: u16,
        message: String,
    },
}

impl Frame {
    pub fn error(err: &ServerError) -> Frame {
        Frame::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<(), ServerError> {
    let mut line = serde_json::to_vec(frame).map_err(|e| ServerError::Connection(e.to_string()))?;
    line.push(b'\n');
    w.write_all(&line)
        .await
        .map_err(|e| ServerError::Connection(e.to_string()))
}

/// Reads the next frame. `Ok(None)` signals a cleanly closed peer; malformed
/// JSON is a protocol violation and the caller drops the connection.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut BufReader<R>,
) -> Result<Option<Frame>, ServerError> {
    let mut line = String::new();
    let n = r
        .read_line(&mut line)
        .await
        .map_err(|e| ServerError::Connection(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    let frame = serde_json::from_str(line.trim_end())
        .map_err(|_| ServerError::Protocol("malformed frame"))?;
    Ok(Some(frame))
}
