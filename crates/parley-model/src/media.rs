// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Media attachments and the `ext.media` normaliser.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

/// One media attachment.
///
/// `thought_signature` is an opaque provider token returned alongside
/// generated media.  It is carried verbatim — never re-encoded or stripped —
/// because follow-up turns that reference the media are rejected without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(rename = "thoughtSignature", default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl MediaItem {
    pub fn image_base64(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            mime_type: mime_type.into(),
            data: Some(data.into()),
            url: None,
            thought_signature: None,
        }
    }

    pub fn with_thought_signature(mut self, sig: impl Into<String>) -> Self {
        self.thought_signature = Some(sig.into());
        self
    }

    /// Data URL form (`data:<mime>;base64,<b64>`), when base64 data is present.
    pub fn as_data_url(&self) -> Option<String> {
        self.data
            .as_ref()
            .map(|d| format!("data:{};base64,{}", self.mime_type, d))
    }
}

/// Normalise a loose JSON media list into [`MediaItem`]s.
///
/// Accepts the field spellings seen in the wild (`mimeType` / `mime_type`,
/// `thoughtSignature` / `thought_signature`), splits data URLs into mime +
/// base64, strips whitespace from base64 payloads, infers the kind from the
/// mime prefix when absent, and drops entries with neither `data` nor `url`.
/// Idempotent: normalising an already-normalised list is a no-op.
pub fn normalize_media(media: &[Value]) -> Vec<MediaItem> {
    let mut out = Vec::new();
    for m in media {
        let Some(obj) = m.as_object() else { continue };

        let mut mime_type = obj
            .get("mimeType")
            .or_else(|| obj.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        let mut data = obj
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let url = obj.get("url").and_then(Value::as_str).map(str::to_string);

        // data URL → split out the base64 payload and derive the mime type
        if let Some(rest) = data.strip_prefix("data:") {
            if let Some((header, b64)) = rest.split_once(";base64,") {
                if mime_type.is_empty() {
                    mime_type = header.trim().to_string();
                }
                data = b64.to_string();
            }
        }
        data.retain(|c| !c.is_whitespace());

        if data.is_empty() && url.is_none() {
            continue;
        }

        let kind_str = obj
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_lowercase();
        let kind = match kind_str.as_str() {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ if mime_type.starts_with("image/") => Some(MediaKind::Image),
            _ if mime_type.starts_with("video/") => Some(MediaKind::Video),
            _ if mime_type.starts_with("audio/") => Some(MediaKind::Audio),
            _ => None,
        };
        let Some(kind) = kind else { continue };

        let thought_signature = obj
            .get("thoughtSignature")
            .or_else(|| obj.get("thought_signature"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        out.push(MediaItem {
            kind,
            mime_type: if mime_type.is_empty() {
                "application/octet-stream".to_string()
            } else {
                mime_type
            },
            data: if data.is_empty() { None } else { Some(data) },
            url,
            thought_signature,
        });
    }
    out
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_url_is_split_into_mime_and_base64() {
        let out = normalize_media(&[json!({
            "type": "image",
            "data": "data:image/png;base64,AAAA"
        })]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mime_type, "image/png");
        assert_eq!(out[0].data.as_deref(), Some("AAAA"));
    }

    #[test]
    fn whitespace_is_stripped_from_base64() {
        let out = normalize_media(&[json!({
            "type": "image",
            "mimeType": "image/png",
            "data": "AA\nAA BB\r\n"
        })]);
        assert_eq!(out[0].data.as_deref(), Some("AAAABB"));
    }

    #[test]
    fn kind_inferred_from_mime_prefix() {
        let out = normalize_media(&[json!({
            "mime_type": "audio/mp3",
            "data": "Zm9v"
        })]);
        assert_eq!(out[0].kind, MediaKind::Audio);
    }

    #[test]
    fn entries_without_data_or_url_are_dropped() {
        let out = normalize_media(&[json!({ "type": "image", "mimeType": "image/png" })]);
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_kind_without_mime_hint_is_dropped() {
        let out = normalize_media(&[json!({ "data": "Zm9v", "mimeType": "application/pdf" })]);
        assert!(out.is_empty());
    }

    #[test]
    fn thought_signature_survives_verbatim() {
        let sig = "opaque-signature-==/+1234";
        let out = normalize_media(&[json!({
            "type": "image",
            "mimeType": "image/png",
            "data": "AAAA",
            "thoughtSignature": sig
        })]);
        assert_eq!(out[0].thought_signature.as_deref(), Some(sig));
    }

    #[test]
    fn snake_case_signature_spelling_is_accepted() {
        let out = normalize_media(&[json!({
            "type": "image",
            "mimeType": "image/png",
            "data": "AAAA",
            "thought_signature": "sig"
        })]);
        assert_eq!(out[0].thought_signature.as_deref(), Some("sig"));
    }

    #[test]
    fn url_only_items_are_kept() {
        let out = normalize_media(&[json!({
            "type": "video",
            "mimeType": "video/mp4",
            "url": "https://example.com/v.mp4"
        })]);
        assert_eq!(out[0].url.as_deref(), Some("https://example.com/v.mp4"));
        assert!(out[0].data.is_none());
    }

    #[test]
    fn normalisation_is_idempotent() {
        let raw = vec![
            json!({ "type": "image", "data": "data:image/png;base64,AA AA", "thoughtSignature": "s" }),
            json!({ "mimeType": "video/mp4", "url": "https://e.com/v" }),
        ];
        let once = normalize_media(&raw);
        let reserialised: Vec<Value> =
            once.iter().map(|m| serde_json::to_value(m).unwrap()).collect();
        let twice = normalize_media(&reserialised);
        assert_eq!(once, twice, "normalize(normalize(x)) must equal normalize(x)");
    }

    #[test]
    fn empty_mime_falls_back_to_octet_stream() {
        let out = normalize_media(&[json!({ "type": "image", "data": "AAAA" })]);
        assert_eq!(out[0].mime_type, "application/octet-stream");
    }
}
