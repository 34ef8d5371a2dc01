//! Out-of-band signal codec.
//!
//! A session description is shipped to the peer exactly once, by QR code
//! or clipboard, so the encoded form has to be as small as possible while
//! staying lossless for negotiation. The pipeline is:
//!
//! ```text
//! SDP -> minify (drop media attribute junk) -> {t, s} JSON -> DEFLATE -> base64
//! ```
//!
//! Decoding reverses each step and restores the CRLF line endings the
//! peer library silently requires.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Which side of the handshake produced a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// A session description blob as exchanged out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalBlob {
    pub kind: SignalKind,
    pub sdp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("inflate failed: {0}")]
    Inflate(std::io::Error),
    #[error("deflate failed: {0}")]
    Deflate(std::io::Error),
    #[error("invalid signal JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Attribute lines that only describe media codecs. The sole media
/// section in use is the data channel, so these never affect negotiation.
/// `a=msid:` carries the trailing colon on purpose: `a=msid-semantic:`
/// must survive minification.
const STRIP_PREFIXES: &[&str] = &[
    "a=rtpmap",
    "a=fmtp",
    "a=rtcp-fb",
    "a=ssrc",
    "a=extmap",
    "a=msid:",
];

/// Wire shape inside the encoded string. Serializes with the shortened
/// keys; deserializes both the short and the legacy long keys.
#[derive(Serialize, Deserialize)]
struct WireSignal {
    #[serde(alias = "type")]
    t: SignalKind,
    #[serde(alias = "sdp")]
    s: String,
}

/// Minify an SDP body: normalize line endings, trim every line, drop
/// empty lines and the codec-attribute lines in [`STRIP_PREFIXES`], and
/// rejoin with CRLF terminators (including a trailing one).
pub fn minify_sdp(sdp: &str) -> String {
    let mut out = String::with_capacity(sdp.len());
    for line in sdp.replace("\r\n", "\n").split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if STRIP_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Re-terminate every line with CRLF and guarantee a trailing CRLF.
/// A blob whose lines end in bare LF is silently rejected by the peer
/// library.
fn restore_crlf(sdp: &str) -> String {
    let mut out = sdp.replace("\r\n", "\n").replace('\n', "\r\n");
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

/// Encode a signal blob into the compact string shipped to the peer.
/// Deterministic for a given input.
pub fn encode_signal(blob: &SignalBlob) -> Result<String, SignalError> {
    let wire = WireSignal {
        t: blob.kind,
        s: minify_sdp(&blob.sdp),
    };
    let json = serde_json::to_vec(&wire)?;

    let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json).map_err(SignalError::Deflate)?;
    let compressed = encoder.finish().map_err(SignalError::Deflate)?;

    Ok(STANDARD.encode(compressed))
}

/// Decode a signal string produced by [`encode_signal`].
///
/// Falls back to plain base64-over-JSON when inflation fails, so blobs
/// from clients that predate compression still decode.
pub fn decode_signal(encoded: &str) -> Result<SignalBlob, SignalError> {
    let bytes = STANDARD.decode(encoded.trim())?;

    match inflate(&bytes).and_then(|json| parse_wire(&json)) {
        Ok(blob) => Ok(blob),
        Err(err) => parse_wire(&bytes).map_err(|_| err),
    }
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>, SignalError> {
    let mut decoder = flate2::read::DeflateDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(SignalError::Inflate)?;
    Ok(out)
}

fn parse_wire(json: &[u8]) -> Result<SignalBlob, SignalError> {
    let wire: WireSignal = serde_json::from_slice(json)?;
    Ok(SignalBlob {
        kind: wire.t,
        sdp: restore_crlf(&wire.s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// SDP in the shape the peer library emits for a data-channel-only
    /// session, including media attribute lines the codec must strip.
    const SAMPLE_SDP: &str = "v=0\r\n\
        o=- 5344439329872966899 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0\r\n\
        a=msid-semantic: WMS\r\n\
        m=application 54321 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        c=IN IP4 203.0.113.7\r\n\
        a=candidate:2395300328 1 udp 2122260223 192.168.1.17 54321 typ host generation 0\r\n\
        a=candidate:1234567890 1 udp 1686052607 203.0.113.7 54321 typ srflx raddr 192.168.1.17 rport 54321\r\n\
        a=ice-ufrag:4ZcD\r\n\
        a=ice-pwd:2/1muCWoOi3uLifh0NuRHlzN\r\n\
        a=fingerprint:sha-256 39:4A:09:1E:0E:33:32:85:51:03:49:95:54:0B:41:09:A2:B7:87:8C:4D:A6:C4:43:4A:97:27:1C:59:F9:13:50\r\n\
        a=setup:actpass\r\n\
        a=mid:0\r\n\
        a=sctp-port:5000\r\n\
        a=max-message-size:262144\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtcp-fb:111 transport-cc\r\n\
        a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\n\
        a=ssrc:1001 cname:courier\r\n\
        a=msid:stream track\r\n";

    #[test]
    fn minify_strips_codec_attributes() {
        let minified = minify_sdp(SAMPLE_SDP);
        for stripped in [
            "a=rtpmap",
            "a=fmtp",
            "a=rtcp-fb",
            "a=ssrc",
            "a=extmap",
            "a=msid:stream",
        ] {
            assert!(!minified.contains(stripped), "{stripped} should be dropped");
        }
    }

    #[test]
    fn minify_retains_negotiation_lines() {
        let minified = minify_sdp(SAMPLE_SDP);
        for kept in [
            "v=0",
            "m=application",
            "a=candidate:2395300328",
            "a=candidate:1234567890",
            "a=ice-ufrag:4ZcD",
            "a=ice-pwd:",
            "a=fingerprint:sha-256",
            "a=setup:actpass",
            "a=mid:0",
            "a=sctp-port:5000",
            "a=max-message-size:262144",
            "a=msid-semantic: WMS",
        ] {
            assert!(minified.contains(kept), "{kept} should survive");
        }
    }

    #[test]
    fn minify_terminates_every_line_with_crlf() {
        let minified = minify_sdp("v=0\ns=-\n\n\nt=0 0");
        assert_eq!(minified, "v=0\r\ns=-\r\nt=0 0\r\n");
        assert!(minified.ends_with("\r\n"));
    }

    #[test]
    fn roundtrip_preserves_kind_and_retained_lines() {
        let blob = SignalBlob {
            kind: SignalKind::Offer,
            sdp: SAMPLE_SDP.to_string(),
        };
        let encoded = encode_signal(&blob).unwrap();
        let decoded = decode_signal(&encoded).unwrap();

        assert_eq!(decoded.kind, SignalKind::Offer);
        assert!(decoded.sdp.ends_with("\r\n"));
        for line in minify_sdp(SAMPLE_SDP).split("\r\n") {
            if !line.is_empty() {
                assert!(decoded.sdp.contains(line), "{line} lost in roundtrip");
            }
        }
        // Every restored line is CRLF-terminated
        assert!(!decoded.sdp.replace("\r\n", "").contains('\n'));
    }

    #[test]
    fn answer_kind_roundtrip() {
        let blob = SignalBlob {
            kind: SignalKind::Answer,
            sdp: "v=0\r\na=setup:active\r\n".to_string(),
        };
        let decoded = decode_signal(&encode_signal(&blob).unwrap()).unwrap();
        assert_eq!(decoded.kind, SignalKind::Answer);
    }

    #[test]
    fn encode_is_deterministic() {
        let blob = SignalBlob {
            kind: SignalKind::Offer,
            sdp: SAMPLE_SDP.to_string(),
        };
        assert_eq!(encode_signal(&blob).unwrap(), encode_signal(&blob).unwrap());
    }

    #[test]
    fn encoded_form_is_much_smaller_than_json() {
        let blob = SignalBlob {
            kind: SignalKind::Offer,
            sdp: SAMPLE_SDP.to_string(),
        };
        let encoded = encode_signal(&blob).unwrap();
        assert!(encoded.len() < SAMPLE_SDP.len());
        // Standard alphabet with padding, nothing URL-safe
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric()
            || c == '+'
            || c == '/'
            || c == '='));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            decode_signal("not base64!"),
            Err(SignalError::Base64(_))
        ));
        // Valid base64 of bytes that neither inflate nor parse as JSON
        let junk = STANDARD.encode([0u8, 1, 2, 3, 4, 5]);
        assert!(decode_signal(&junk).is_err());
        assert!(decode_signal("").is_err());
    }

    #[test]
    fn decode_accepts_legacy_uncompressed_blob() {
        // Old clients shipped base64 over plain JSON with long keys
        let legacy = STANDARD.encode(r#"{"type":"offer","sdp":"v=0\nt=0 0"}"#);
        let decoded = decode_signal(&legacy).unwrap();
        assert_eq!(decoded.kind, SignalKind::Offer);
        assert_eq!(decoded.sdp, "v=0\r\nt=0 0\r\n");
    }

    #[test]
    fn restore_crlf_normalizes_bare_lf() {
        let blob = SignalBlob {
            kind: SignalKind::Offer,
            sdp: "v=0\ns=-\nt=0 0".to_string(),
        };
        let decoded = decode_signal(&encode_signal(&blob).unwrap()).unwrap();
        assert_eq!(decoded.sdp, "v=0\r\ns=-\r\nt=0 0\r\n");
    }

    #[test]
    fn surrounding_whitespace_in_pasted_signal_is_tolerated() {
        let blob = SignalBlob {
            kind: SignalKind::Answer,
            sdp: "v=0\r\n".to_string(),
        };
        let encoded = format!("  {}\n", encode_signal(&blob).unwrap());
        assert_eq!(decode_signal(&encoded).unwrap().kind, SignalKind::Answer);
    }
}
