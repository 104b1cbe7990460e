//! Encoding and decoding of the signed multipart wire frame, and the binary
//! bundle format used to multiplex channels over a single client socket.
//!
//! A wire frame is, in order: zero or more routing identity frames, the
//! `<IDS|MSG>` delimiter, the hex HMAC signature, the four JSON segments
//! (header, parent_header, metadata, content), and finally zero or more
//! opaque binary buffers. The HMAC is computed over exactly the four JSON
//! segments, concatenated in that order.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use super::{KernelHeader, KernelMessage};
use crate::Error;

/// The sentinel that separates routing identities from the signed message
/// parts.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

fn sign(key: &str, header: &[u8], parent_header: &[u8], metadata: &[u8], content: &[u8]) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(header);
    mac.update(parent_header);
    mac.update(metadata);
    mac.update(content);
    format!("{:x}", mac.finalize().into_bytes())
}

/// Compare two hex-encoded digests in constant time, to avoid leaking timing
/// information about where a forged signature first diverges.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Encode a message into the ordered sequence of byte frames that make up a
/// wire frame, prefixed by the given routing identities (empty for a DEALER
/// socket with no explicit identity).
pub fn encode<T: Serialize>(
    msg: &KernelMessage<T>,
    key: &str,
    routing_ids: &[Bytes],
) -> Result<Vec<Bytes>, Error> {
    let header = serde_json::to_vec(&msg.header)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let parent_header = serde_json::to_vec(&msg.parent_header)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let metadata = serde_json::to_vec(&msg.metadata)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let content = serde_json::to_vec(&msg.content)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;

    let signature = sign(key, &header, &parent_header, &metadata, &content);

    let mut frames = Vec::with_capacity(routing_ids.len() + 6 + msg.buffers.len());
    frames.extend(routing_ids.iter().cloned());
    frames.push(Bytes::from_static(DELIMITER));
    frames.push(Bytes::from(signature));
    frames.push(Bytes::from(header));
    frames.push(Bytes::from(parent_header));
    frames.push(Bytes::from(metadata));
    frames.push(Bytes::from(content));
    frames.extend(msg.buffers.iter().cloned());
    Ok(frames)
}

/// Decode a wire frame into a message, verifying its HMAC signature.
///
/// Returns [`Error::MalformedFrame`] if the `<IDS|MSG>` delimiter is missing
/// or a JSON segment doesn't parse, and [`Error::SignatureMismatch`] if the
/// signature doesn't match (frames with no signature required use an empty
/// `key`, which is accepted unconditionally, matching unsigned ZeroMQ
/// heartbeat-style sockets).
pub fn decode(frames: &[Bytes], key: &str) -> Result<KernelMessage, Error> {
    let delim_idx = frames
        .iter()
        .position(|f| f.as_ref() == DELIMITER)
        .ok_or_else(|| Error::MalformedFrame("missing <IDS|MSG> delimiter".into()))?;

    let parts = &frames[delim_idx + 1..];
    if parts.len() < 5 {
        return Err(Error::MalformedFrame("truncated message parts".into()));
    }
    let signature = std::str::from_utf8(&parts[0])
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let header_raw = &parts[1];
    let parent_header_raw = &parts[2];
    let metadata_raw = &parts[3];
    let content_raw = &parts[4];
    let buffers = parts[5..].to_vec();

    if !key.is_empty() {
        let expected = sign(key, header_raw, parent_header_raw, metadata_raw, content_raw);
        if !constant_time_eq(signature, &expected) {
            return Err(Error::SignatureMismatch);
        }
    }

    let header: KernelHeader =
        serde_json::from_slice(header_raw).map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let parent_header = serde_json::from_slice(parent_header_raw)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let metadata = serde_json::from_slice(metadata_raw)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;
    let content = serde_json::from_slice(content_raw)
        .map_err(|err| Error::MalformedFrame(err.to_string()))?;

    Ok(KernelMessage {
        header,
        parent_header,
        metadata,
        content,
        buffers,
    })
}

/// Recompute and replace a frame's signature with one keyed by `key`,
/// leaving every other segment (routing ids, JSON parts, buffers) untouched.
///
/// Used by the session fan-out to re-sign client-originated frames before
/// forwarding them to the kernel: a client never holds the connection's
/// shared key, so whatever it places in the signature slot is meaningless
/// and must be replaced, not merely checked.
pub fn resign(frames: &[Bytes], key: &str) -> Result<Vec<Bytes>, Error> {
    let delim_idx = frames
        .iter()
        .position(|f| f.as_ref() == DELIMITER)
        .ok_or_else(|| Error::MalformedFrame("missing <IDS|MSG> delimiter".into()))?;

    let parts = &frames[delim_idx + 1..];
    if parts.len() < 5 {
        return Err(Error::MalformedFrame("truncated message parts".into()));
    }
    let header_raw = &parts[1];
    let parent_header_raw = &parts[2];
    let metadata_raw = &parts[3];
    let content_raw = &parts[4];
    let signature = sign(key, header_raw, parent_header_raw, metadata_raw, content_raw);

    let mut out = Vec::with_capacity(frames.len());
    out.extend_from_slice(&frames[..=delim_idx]);
    out.push(Bytes::from(signature));
    out.extend_from_slice(&parts[1..]);
    Ok(out)
}

/// Parse just the parent header out of a raw wire frame, without verifying
/// the signature or touching the other segments. Used by the session
/// fan-out's routing path, which only needs to know which client session a
/// shell/control reply belongs to.
pub fn peek_parent_header(frames: &[Bytes]) -> Option<KernelHeader> {
    let delim_idx = frames.iter().position(|f| f.as_ref() == DELIMITER)?;
    let parent_header_raw = frames.get(delim_idx + 3)?;
    serde_json::from_slice(parent_header_raw).ok()
}

/// Parse just the message type out of a raw wire frame's header segment.
pub fn peek_msg_type(frames: &[Bytes]) -> Option<super::KernelMessageType> {
    let delim_idx = frames.iter().position(|f| f.as_ref() == DELIMITER)?;
    let header_raw = frames.get(delim_idx + 2)?;
    let header: KernelHeader = serde_json::from_slice(header_raw).ok()?;
    Some(header.msg_type)
}

/// Encode a client-facing binary bundle: a single socket's framing for
/// multiplexing shell/control/iopub messages, per the `channel_u8_len ·
/// channel_utf8 · offset_count_u32 · offset_u32[] · frame_bytes[]` layout.
/// Offsets are relative to the start of the payload region (the first byte
/// after the offset table).
pub fn encode_bundle(channel: &str, frames: &[Bytes]) -> Vec<u8> {
    let channel = channel.as_bytes();
    assert!(channel.len() <= u8::MAX as usize, "channel name too long");

    let mut payload = Vec::new();
    let mut offsets = Vec::with_capacity(frames.len());
    for frame in frames {
        offsets.push(payload.len() as u32);
        payload.extend_from_slice(frame);
    }

    let mut out = Vec::with_capacity(1 + channel.len() + 4 + 4 * offsets.len() + payload.len());
    out.push(channel.len() as u8);
    out.extend_from_slice(channel);
    out.extend_from_slice(&(offsets.len() as u32).to_le_bytes());
    for offset in &offsets {
        out.extend_from_slice(&offset.to_le_bytes());
    }
    out.extend_from_slice(&payload);
    out
}

/// Decode a client-facing binary bundle back into a channel name and its
/// constituent frames.
pub fn decode_bundle(bytes: &[u8]) -> Option<(String, Vec<Bytes>)> {
    let channel_len = *bytes.first()? as usize;
    let mut pos = 1;
    let channel = String::from_utf8(bytes.get(pos..pos + channel_len)?.to_vec()).ok()?;
    pos += channel_len;

    let offset_count = u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?) as usize;
    pos += 4;

    let mut offsets = Vec::with_capacity(offset_count);
    for _ in 0..offset_count {
        offsets.push(u32::from_le_bytes(bytes.get(pos..pos + 4)?.try_into().ok()?) as usize);
        pos += 4;
    }

    let payload = &bytes[pos..];
    let mut frames = Vec::with_capacity(offset_count);
    for i in 0..offset_count {
        let start = offsets[i];
        let end = offsets.get(i + 1).copied().unwrap_or(payload.len());
        frames.push(Bytes::copy_from_slice(payload.get(start..end)?));
    }
    Some((channel, frames))
}
