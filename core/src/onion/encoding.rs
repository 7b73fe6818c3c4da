// Onion wire encodings
//
// Hop payload:  | u32_le N | N bytes ciphertext | JSON routing info (utf8) |
// v4 message:   l<infoLen>:<json info>[<dataLen>:<data>]e

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Payload truncated")]
    Truncated,
    #[error("Malformed length prefix")]
    BadLength,
    #[error("Missing list marker")]
    MissingMarker,
    #[error("Trailing bytes after message")]
    TrailingBytes,
    #[error("Invalid JSON: {0}")]
    Json(String),
}

/// Encode a hop payload: ciphertext for the next hop followed by routing JSON
pub fn encode_onion_payload(ciphertext: &[u8], json: &Value) -> Result<Vec<u8>, EncodingError> {
    let len = u32::try_from(ciphertext.len()).map_err(|_| EncodingError::BadLength)?;
    let json_bytes = serde_json::to_vec(json).map_err(|e| EncodingError::Json(e.to_string()))?;

    let mut out = Vec::with_capacity(4 + ciphertext.len() + json_bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(ciphertext);
    out.extend_from_slice(&json_bytes);
    Ok(out)
}

/// Split a hop payload back into ciphertext and routing JSON
pub fn decode_onion_payload(data: &[u8]) -> Result<(Vec<u8>, Value), EncodingError> {
    if data.len() < 4 {
        return Err(EncodingError::Truncated);
    }
    let (len_bytes, rest) = data.split_at(4);
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(len_bytes);
    let len = u32::from_le_bytes(prefix) as usize;
    if rest.len() < len {
        return Err(EncodingError::Truncated);
    }
    let (ciphertext, json_bytes) = rest.split_at(len);
    let json = serde_json::from_slice(json_bytes).map_err(|e| EncodingError::Json(e.to_string()))?;
    Ok((ciphertext.to_vec(), json))
}

/// Encode a v4 message from its info object and optional data section
pub fn encode_v4(info: &Value, body: Option<&[u8]>) -> Result<Vec<u8>, EncodingError> {
    let info_bytes = serde_json::to_vec(info).map_err(|e| EncodingError::Json(e.to_string()))?;

    let mut out = Vec::with_capacity(info_bytes.len() + body.map_or(0, <[u8]>::len) + 16);
    out.push(b'l');
    out.extend_from_slice(info_bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(&info_bytes);
    if let Some(body) = body {
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(body);
    }
    out.push(b'e');
    Ok(out)
}

/// Read `<digits>:` and return the length and the remaining bytes
fn read_length(data: &[u8]) -> Result<(usize, &[u8]), EncodingError> {
    let sep = data
        .iter()
        .position(|&b| b == b':')
        .ok_or(EncodingError::BadLength)?;
    let digits = &data[..sep];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) || digits.len() > 10 {
        return Err(EncodingError::BadLength);
    }
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(EncodingError::BadLength)?;
    Ok((len, &data[sep + 1..]))
}

/// Decode a v4 message into its info object and data section.
/// An absent or empty data section yields `None`.
pub fn decode_v4(data: &[u8]) -> Result<(Value, Option<Vec<u8>>), EncodingError> {
    let rest = match data.first() {
        Some(b'l') => &data[1..],
        _ => return Err(EncodingError::MissingMarker),
    };

    let (info_len, rest) = read_length(rest)?;
    if rest.len() < info_len {
        return Err(EncodingError::Truncated);
    }
    let (info_bytes, rest) = rest.split_at(info_len);
    let info: Value =
        serde_json::from_slice(info_bytes).map_err(|e| EncodingError::Json(e.to_string()))?;

    match rest {
        [] => Err(EncodingError::MissingMarker),
        [b'e'] => Ok((info, None)),
        _ => {
            let (body_len, rest) = read_length(rest)?;
            if rest.len() < body_len + 1 {
                return Err(EncodingError::Truncated);
            }
            let (body, tail) = rest.split_at(body_len);
            if tail != b"e" {
                return Err(EncodingError::TrailingBytes);
            }
            let body = (!body.is_empty()).then(|| body.to_vec());
            Ok((info, body))
        }
    }
}
