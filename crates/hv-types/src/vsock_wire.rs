//! VSOCK wire format: a 4-byte big-endian body length,
//! a 4-byte big-endian type tag, then a UTF-8 JSON body.
//!
//! Framed over a generic `AsyncRead`/`AsyncWrite` transport rather than
//! a concrete `VsockStream` so the channel is testable without a real
//! vsock socket.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: Uuid,
    pub vm_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TaskResult {
    pub fn timed_out(task_id: Uuid, duration_ms: u64) -> Self {
        Self {
            task_id,
            success: false,
            output: None,
            error: Some("task timed out".into()),
            duration_ms,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    Payload = 0,
    Result = 1,
}

impl TryFrom<u32> for FrameType {
    type Error = FrameError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Payload),
            1 => Ok(FrameType::Result),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short")]
    TooShort,
    #[error("unknown type: {0}")]
    UnknownType(u32),
    #[error("frame incomplete")]
    Incomplete,
    #[error("invalid json body: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone)]
pub enum FrameBody {
    Payload(TaskPayload),
    Result(TaskResult),
}

/// Serialize a payload/result into the wire frame: len(4) + tag(4) + json.
pub fn serialize_payload(payload: &TaskPayload) -> Vec<u8> {
    encode_frame(FrameType::Payload, payload)
}

pub fn serialize_result(result: &TaskResult) -> Vec<u8> {
    encode_frame(FrameType::Result, result)
}

fn encode_frame<T: Serialize>(frame_type: FrameType, body: &T) -> Vec<u8> {
    let json = serde_json::to_vec(body).expect("wire types always serialize");
    let mut frame = Vec::with_capacity(8 + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&(frame_type as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    frame
}

/// Parse a complete in-memory frame (used by tests and by
/// [`read_frame`] once bytes have arrived).
pub fn parse_frame(bytes: &[u8]) -> Result<FrameBody, FrameError> {
    if bytes.len() < 8 {
        return Err(FrameError::TooShort);
    }
    let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    let frame_type = FrameType::try_from(u32::from_be_bytes(bytes[4..8].try_into().unwrap()))?;
    let body = &bytes[8..];
    if body.len() < len {
        return Err(FrameError::Incomplete);
    }
    let json = &body[..len];
    match frame_type {
        FrameType::Payload => {
            let payload: TaskPayload =
                serde_json::from_slice(json).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
            Ok(FrameBody::Payload(payload))
        }
        FrameType::Result => {
            let result: TaskResult =
                serde_json::from_slice(json).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
            Ok(FrameBody::Result(result))
        }
    }
}

/// Read one frame from an async transport (an in-memory duplex in
/// tests, any `AsyncRead` implementor otherwise).
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<FrameBody> {
    let len = reader.read_u32().await? as usize;
    let tag = reader.read_u32().await?;
    let frame_type =
        FrameType::try_from(tag).map_err(|e| std::io::Error::other(e.to_string()))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    match frame_type {
        FrameType::Payload => {
            let payload: TaskPayload =
                serde_json::from_slice(&body).map_err(std::io::Error::other)?;
            Ok(FrameBody::Payload(payload))
        }
        FrameType::Result => {
            let result: TaskResult =
                serde_json::from_slice(&body).map_err(std::io::Error::other)?;
            Ok(FrameBody::Result(result))
        }
    }
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> TaskPayload {
        TaskPayload {
            task_id: Uuid::nil(),
            vm_id: "vm-1".into(),
            command: "run".into(),
            args: vec!["--flag".into()],
            input: Some("stdin".into()),
            timeout_ms: 1000,
        }
    }

    fn sample_result() -> TaskResult {
        TaskResult {
            task_id: Uuid::nil(),
            success: true,
            output: Some("ok".into()),
            error: None,
            duration_ms: 42,
            exit_code: Some(0),
        }
    }

    #[test]
    fn payload_round_trips() {
        let frame = serialize_payload(&sample_payload());
        match parse_frame(&frame).unwrap() {
            FrameBody::Payload(p) => assert_eq!(p.vm_id, "vm-1"),
            _ => panic!("expected payload"),
        }
    }

    #[test]
    fn result_round_trips() {
        let frame = serialize_result(&sample_result());
        match parse_frame(&frame).unwrap() {
            FrameBody::Result(r) => assert_eq!(r.duration_ms, 42),
            _ => panic!("expected result"),
        }
    }

    #[test]
    fn too_short_frame_errors() {
        assert!(matches!(parse_frame(&[0u8; 4]), Err(FrameError::TooShort)));
    }

    #[test]
    fn unknown_type_errors() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            parse_frame(&frame),
            Err(FrameError::UnknownType(99))
        ));
    }

    #[test]
    fn incomplete_body_errors() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&100u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(b"{}");
        assert!(matches!(parse_frame(&frame), Err(FrameError::Incomplete)));
    }
}
