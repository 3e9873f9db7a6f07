// Copyright (c) 2026 Kind Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! # KLP Envelope Codec
//!
//! Canonical binary serialization for [`KlpMessage`]. The same byte layout
//! serves two purposes: the wire envelope (`encode`/`decode`) and the signed
//! payload (`signing_bytes` — everything except the trailing signature
//! section). Two conforming implementations therefore sign identical bytes
//! for identical logical messages.
//!
//! ## Wire layout (version 1)
//!
//! ```text
//! magic   "KLP" (3 bytes) + format version (1 byte)
//! kind    u8 wire tag
//! from, to, task_id        length-prefixed UTF-8 (u32 BE length)
//! timestamp                length-prefixed RFC 3339, microsecond precision
//! flags   u8 bitfield: AUTH | PRIORITY | TTL | RETRY
//! [auth_token]             length-prefixed UTF-8, when AUTH
//! [priority]               u8 tag, when PRIORITY
//! [ttl_seconds]            u32 BE, when TTL
//! [retry_count]            u32 BE, when RETRY
//! payload                  length-prefixed canonical JSON of the kind body
//! extensions               u16 BE count, then (u16 BE tag, u32 BE len, bytes)
//! ──────────────── signing boundary ────────────────
//! signature                u8 presence + 64 raw bytes
//! ```
//!
//! Unknown extension tags ride through decode and re-encode untouched (and
//! are covered by the signature); an unrecognized kind tag rejects the
//! envelope with [`DecodeError::UnknownMessageType`]. Field order is fixed —
//! signature verification depends on it.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::domain::identity::AgentId;
use crate::domain::message::{
    ConfigUpdateBody, Extension, IntentionDeclarationBody, KlpMessage, MemoryReadBody,
    MemoryWriteBody, MessageKind, MessagePayload, PlanGraphBody, Priority, SecurityAlertBody,
    StatusUpdateBody, TaskErrorBody, TaskRequestBody, TaskResultBody,
};
use crate::domain::task::TaskId;

const MAGIC: &[u8; 3] = b"KLP";
const FORMAT_VERSION: u8 = 1;

const FLAG_AUTH: u8 = 0x01;
const FLAG_PRIORITY: u8 = 0x02;
const FLAG_TTL: u8 = 0x04;
const FLAG_RETRY: u8 = 0x08;

const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unknown message type tag {0:#04x}")]
    UnknownMessageType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload serialization failed: {0}")]
    Payload(String),
}

/// Canonical bytes covered by the envelope signature: the full layout minus
/// the signature section.
pub fn signing_bytes(message: &KlpMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = BytesMut::new();
    put_unsigned_sections(&mut buf, message)?;
    Ok(buf.to_vec())
}

/// Serialize the full envelope, signature included when present.
pub fn encode(message: &KlpMessage) -> Result<Vec<u8>, EncodeError> {
    let mut buf = BytesMut::new();
    put_unsigned_sections(&mut buf, message)?;
    match &message.signature {
        Some(sig) => {
            buf.put_u8(1);
            buf.put_slice(sig);
        }
        None => buf.put_u8(0),
    }
    Ok(buf.to_vec())
}

/// Parse an envelope. Strict: trailing bytes after the signature section are
/// rejected as malformed.
pub fn decode(input: &[u8]) -> Result<KlpMessage, DecodeError> {
    let mut buf = input;

    let magic = take_bytes(&mut buf, 3)?;
    if magic != MAGIC {
        return Err(DecodeError::MalformedEnvelope("bad magic".into()));
    }
    let version = take_u8(&mut buf)?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::MalformedEnvelope(format!(
            "unsupported format version {version}"
        )));
    }

    let kind_tag = take_u8(&mut buf)?;
    let kind =
        MessageKind::from_wire_tag(kind_tag).ok_or(DecodeError::UnknownMessageType(kind_tag))?;

    let from = AgentId::new(take_string(&mut buf)?);
    let to = AgentId::new(take_string(&mut buf)?);
    let task_id = TaskId::new(take_string(&mut buf)?);

    let raw_timestamp = take_string(&mut buf)?;
    let timestamp = DateTime::parse_from_rfc3339(&raw_timestamp)
        .map_err(|e| DecodeError::MalformedEnvelope(format!("bad timestamp: {e}")))?
        .with_timezone(&Utc);

    let flags = take_u8(&mut buf)?;
    if flags & !(FLAG_AUTH | FLAG_PRIORITY | FLAG_TTL | FLAG_RETRY) != 0 {
        return Err(DecodeError::MalformedEnvelope(format!("unknown flag bits {flags:#04x}")));
    }

    let auth_token =
        if flags & FLAG_AUTH != 0 { Some(take_string(&mut buf)?) } else { None };
    let priority = if flags & FLAG_PRIORITY != 0 {
        let tag = take_u8(&mut buf)?;
        Some(
            Priority::from_wire_tag(tag)
                .ok_or_else(|| DecodeError::MalformedEnvelope(format!("bad priority tag {tag}")))?,
        )
    } else {
        None
    };
    let ttl_seconds = if flags & FLAG_TTL != 0 { Some(take_u32(&mut buf)?) } else { None };
    let retry_count = if flags & FLAG_RETRY != 0 { Some(take_u32(&mut buf)?) } else { None };

    let payload_len = take_u32(&mut buf)? as usize;
    let payload_bytes = take_bytes(&mut buf, payload_len)?;
    let payload = decode_payload(kind, payload_bytes)?;

    let ext_count = take_u16(&mut buf)?;
    let mut extensions = Vec::with_capacity(ext_count as usize);
    for _ in 0..ext_count {
        let tag = take_u16(&mut buf)?;
        let len = take_u32(&mut buf)? as usize;
        let data = take_bytes(&mut buf, len)?.to_vec();
        extensions.push(Extension { tag, data });
    }

    let signature = match take_u8(&mut buf)? {
        0 => None,
        1 => Some(take_bytes(&mut buf, SIGNATURE_LEN)?.to_vec()),
        other => {
            return Err(DecodeError::MalformedEnvelope(format!(
                "bad signature presence byte {other}"
            )))
        }
    };

    if !buf.is_empty() {
        return Err(DecodeError::MalformedEnvelope(format!(
            "{} trailing bytes after envelope",
            buf.len()
        )));
    }

    Ok(KlpMessage {
        from,
        to,
        task_id,
        payload,
        timestamp,
        auth_token,
        priority,
        ttl_seconds,
        retry_count,
        extensions,
        signature,
    })
}

fn put_unsigned_sections(buf: &mut BytesMut, message: &KlpMessage) -> Result<(), EncodeError> {
    buf.put_slice(MAGIC);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(message.kind().wire_tag());

    put_str(buf, message.from.as_str());
    put_str(buf, message.to.as_str());
    put_str(buf, message.task_id.as_str());
    put_str(buf, &message.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));

    let mut flags = 0u8;
    if message.auth_token.is_some() {
        flags |= FLAG_AUTH;
    }
    if message.priority.is_some() {
        flags |= FLAG_PRIORITY;
    }
    if message.ttl_seconds.is_some() {
        flags |= FLAG_TTL;
    }
    if message.retry_count.is_some() {
        flags |= FLAG_RETRY;
    }
    buf.put_u8(flags);

    if let Some(token) = &message.auth_token {
        put_str(buf, token);
    }
    if let Some(priority) = message.priority {
        buf.put_u8(priority.wire_tag());
    }
    if let Some(ttl) = message.ttl_seconds {
        buf.put_u32(ttl);
    }
    if let Some(retry) = message.retry_count {
        buf.put_u32(retry);
    }

    let payload = encode_payload(&message.payload)?;
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);

    buf.put_u16(message.extensions.len() as u16);
    for ext in &message.extensions {
        buf.put_u16(ext.tag);
        buf.put_u32(ext.data.len() as u32);
        buf.put_slice(&ext.data);
    }
    Ok(())
}

/// Canonical JSON of the kind-specific body. `serde_json` without
/// `preserve_order` keeps map keys sorted, and struct fields serialize in
/// declaration order, so the output is deterministic.
fn encode_payload(payload: &MessagePayload) -> Result<Vec<u8>, EncodeError> {
    let result = match payload {
        MessagePayload::TaskRequest(b) => serde_json::to_vec(b),
        MessagePayload::TaskResult(b) => serde_json::to_vec(b),
        MessagePayload::TaskError(b) => serde_json::to_vec(b),
        MessagePayload::StatusUpdate(b) => serde_json::to_vec(b),
        MessagePayload::IntentionDeclaration(b) => serde_json::to_vec(b),
        MessagePayload::MemoryRead(b) => serde_json::to_vec(b),
        MessagePayload::MemoryWrite(b) => serde_json::to_vec(b),
        MessagePayload::PlanGraph(b) => serde_json::to_vec(b),
        MessagePayload::SecurityAlert(b) => serde_json::to_vec(b),
        MessagePayload::ConfigUpdate(b) => serde_json::to_vec(b),
    };
    result.map_err(|e| EncodeError::Payload(e.to_string()))
}

fn decode_payload(kind: MessageKind, bytes: &[u8]) -> Result<MessagePayload, DecodeError> {
    fn parse<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::MalformedEnvelope(format!("bad payload body: {e}")))
    }
    Ok(match kind {
        MessageKind::TaskRequest => MessagePayload::TaskRequest(parse::<TaskRequestBody>(bytes)?),
        MessageKind::TaskResult => MessagePayload::TaskResult(parse::<TaskResultBody>(bytes)?),
        MessageKind::TaskError => MessagePayload::TaskError(parse::<TaskErrorBody>(bytes)?),
        MessageKind::StatusUpdate => {
            MessagePayload::StatusUpdate(parse::<StatusUpdateBody>(bytes)?)
        }
        MessageKind::IntentionDeclaration => {
            MessagePayload::IntentionDeclaration(parse::<IntentionDeclarationBody>(bytes)?)
        }
        MessageKind::MemoryRead => MessagePayload::MemoryRead(parse::<MemoryReadBody>(bytes)?),
        MessageKind::MemoryWrite => MessagePayload::MemoryWrite(parse::<MemoryWriteBody>(bytes)?),
        MessageKind::PlanGraph => MessagePayload::PlanGraph(parse::<PlanGraphBody>(bytes)?),
        MessageKind::SecurityAlert => {
            MessagePayload::SecurityAlert(parse::<SecurityAlertBody>(bytes)?)
        }
        MessageKind::ConfigUpdate => {
            MessagePayload::ConfigUpdate(parse::<ConfigUpdateBody>(bytes)?)
        }
    })
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    let bytes = take_bytes(buf, 1)?;
    Ok(bytes[0])
}

fn take_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    let bytes = take_bytes(buf, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    let bytes = take_bytes(buf, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take_bytes<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], DecodeError> {
    if buf.len() < len {
        return Err(DecodeError::MalformedEnvelope(format!(
            "truncated: wanted {len} bytes, {} remaining",
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = take_u32(buf)? as usize;
    let bytes = take_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| DecodeError::MalformedEnvelope(format!("invalid utf-8: {e}")))
}
