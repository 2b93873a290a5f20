//! QR payload frame decoding.
//!
//! A frame is an 8-byte little-endian header followed by a zstd stream:
//!
//! ```text
//! 0      4                  8
//! +------+------------------+------------------...
//! | magic| uncompressed_size| compressed payload
//! +------+------------------+------------------...
//! ```
//!
//! Decompression is delegated to an external tool (`zstd -d -c <file>` by
//! default), fed through a temporary file that is removed before `decode`
//! returns.

use crate::config::DecompressorConfig;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, trace};

/// `"DTSZ"` on the wire, i.e. bytes `44 54 53 5A` read little-endian.
pub const FRAME_MAGIC: u32 = 0x5A53_5444;
pub const HEADER_LEN: usize = 8;

/// Errors that can occur while decoding a single payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid hex data: {0}")]
    MalformedHex(String),
    #[error("data too short, missing header ({len} bytes)")]
    TruncatedHeader { len: usize },
    #[error("invalid magic number: 0x{found:08X}, expected 0x5A535444")]
    BadMagic { found: u32 },
    #[error("decompressor `{program}` unavailable: {source}")]
    DecompressorUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decompression failed ({status}): {stderr}")]
    DecompressionFailed { status: String, stderr: String },
    #[error("decompressor `{program}` did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
    #[error("failed to stage compressed payload: {0}")]
    TempArtifact(#[source] std::io::Error),
}

impl DecodeError {
    /// Errors that point at a broken environment rather than a bad record.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            DecodeError::DecompressorUnavailable { .. }
                | DecodeError::DecompressionFailed { .. }
                | DecodeError::TimedOut { .. }
                | DecodeError::TempArtifact(_)
        )
    }
}

/// Raw payload as it arrives from a store row or bulk input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Bytes(Vec<u8>),
    /// Hex text; `0x` fragments and whitespace are tolerated.
    Hex(String),
}

impl RawPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            RawPayload::Bytes(b) => b.is_empty(),
            RawPayload::Hex(s) => normalize_hex(s).is_empty(),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, DecodeError> {
        match self {
            RawPayload::Bytes(b) => Ok(b),
            RawPayload::Hex(s) => decode_hex(&s),
        }
    }
}

/// Strip `0x` fragments and all whitespace.
pub fn normalize_hex(text: &str) -> String {
    text.replace("0x", "").split_whitespace().collect()
}

/// Decode hex text after [`normalize_hex`].
pub fn decode_hex(text: &str) -> Result<Vec<u8>, DecodeError> {
    let digits = normalize_hex(text);
    if digits.len() % 2 != 0 {
        return Err(DecodeError::MalformedHex("odd-length string".to_string()));
    }

    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    digits
        .as_bytes()
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(DecodeError::MalformedHex(format!(
                "non-hexadecimal digit at offset {}",
                i * 2
            ))),
        })
        .collect()
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    /// Advisory only; the decompressor output is trusted as-is.
    pub uncompressed_size: u32,
}

/// A validated frame borrowing its compressed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TruncatedHeader { len: bytes.len() });
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let uncompressed_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if magic != FRAME_MAGIC {
            return Err(DecodeError::BadMagic { found: magic });
        }
        Ok(Self {
            header: FrameHeader {
                magic,
                uncompressed_size,
            },
            payload: &bytes[HEADER_LEN..],
        })
    }
}

/// One-shot external decompressor.
#[derive(Debug, Clone)]
pub struct Decompressor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Decompressor {
    pub fn new(config: &DecompressorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    /// Run the tool over `compressed`, returning its stdout.
    ///
    /// The input is staged in a uniquely named temp file that is deleted when
    /// this call returns, on every path. The child is killed if it outlives
    /// the configured timeout or if this future is dropped.
    pub async fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let mut artifact = tempfile::Builder::new()
            .prefix("qrlog-")
            .suffix(".zst")
            .tempfile()
            .map_err(DecodeError::TempArtifact)?;
        artifact
            .write_all(compressed)
            .map_err(DecodeError::TempArtifact)?;
        artifact.flush().map_err(DecodeError::TempArtifact)?;

        trace!(path = %artifact.path().display(), len = compressed.len(), "staged compressed payload");

        let run = Command::new(&self.program)
            .args(&self.args)
            .arg(artifact.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DecodeError::TimedOut {
                program: self.program.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| DecodeError::DecompressorUnavailable {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(DecodeError::DecompressionFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

/// Validates frames and turns them into text.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    decompressor: Decompressor,
}

impl FrameDecoder {
    pub fn new(config: &DecompressorConfig) -> Self {
        Self {
            decompressor: Decompressor::new(config),
        }
    }

    /// Decode one payload into text. Invalid UTF-8 in the decompressed output
    /// is replaced, never rejected.
    pub async fn decode(&self, raw: RawPayload) -> Result<String, DecodeError> {
        let bytes = raw.into_bytes()?;
        let frame = Frame::parse(&bytes)?;

        debug!(
            compressed = frame.payload.len(),
            expected = frame.header.uncompressed_size,
            "decoding frame"
        );

        let decompressed = self.decompressor.decompress(frame.payload).await?;
        Ok(String::from_utf8_lossy(&decompressed).into_owned())
    }
}

/// Build a frame around an already-compressed body.
pub fn encode_frame(uncompressed_size: u32, compressed: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.extend_from_slice(compressed);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// `cat` as the "decompressor": frames carry plain text.
    pub(crate) fn identity_decoder() -> FrameDecoder {
        FrameDecoder::new(&DecompressorConfig {
            program: "cat".to_string(),
            args: Vec::new(),
            ..DecompressorConfig::default()
        })
    }

    pub(crate) fn plain_frame(text: &str) -> Vec<u8> {
        encode_frame(text.len() as u32, text.as_bytes())
    }

    #[test]
    fn normalize_hex_strips_prefixes_and_whitespace() {
        assert_eq!(normalize_hex("0x44 0x54\n53\t5A"), "4454535A");
        assert_eq!(normalize_hex("  \n"), "");
    }

    #[test]
    fn decode_hex_accepts_mixed_case() {
        assert_eq!(decode_hex("0a0B ff").unwrap(), vec![0x0a, 0x0b, 0xff]);
    }

    #[test]
    fn decode_hex_rejects_odd_length() {
        assert!(matches!(decode_hex("abc"), Err(DecodeError::MalformedHex(_))));
    }

    #[test]
    fn decode_hex_rejects_non_hex_digits() {
        let err = decode_hex("44zz").unwrap_err();
        match err {
            DecodeError::MalformedHex(msg) => assert!(msg.contains("offset 2"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_reads_little_endian_header() {
        let bytes = [0x44, 0x54, 0x53, 0x5A, 0x10, 0x00, 0x00, 0x00, 0xAA, 0xBB];
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(frame.header.magic, FRAME_MAGIC);
        assert_eq!(frame.header.uncompressed_size, 16);
        assert_eq!(frame.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn parse_short_input_is_truncated_header() {
        for len in 0..HEADER_LEN {
            let bytes = vec![0x44; len];
            assert!(matches!(
                Frame::parse(&bytes),
                Err(DecodeError::TruncatedHeader { len: l }) if l == len
            ));
        }
    }

    #[test]
    fn parse_wrong_magic_is_bad_magic() {
        let bytes = [0x45, 0x54, 0x53, 0x5A, 0x10, 0x00, 0x00, 0x00];
        match Frame::parse(&bytes) {
            Err(DecodeError::BadMagic { found }) => assert_eq!(found, 0x5A53_5445),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn header_only_frame_has_empty_payload() {
        let bytes = encode_frame(0, &[]);
        let frame = Frame::parse(&bytes).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn raw_payload_emptiness() {
        assert!(RawPayload::Bytes(Vec::new()).is_empty());
        assert!(RawPayload::Hex(" 0x ".to_string()).is_empty());
        assert!(!RawPayload::Hex("00".to_string()).is_empty());
    }

    #[tokio::test]
    async fn decode_bytes_through_identity_tool() {
        let decoder = identity_decoder();
        let text = decoder
            .decode(RawPayload::Bytes(plain_frame("hello\n")))
            .await
            .unwrap();
        assert_eq!(text, "hello\n");
    }

    #[tokio::test]
    async fn decode_hex_text_through_identity_tool() {
        let decoder = identity_decoder();
        let frame = plain_frame("<6>[    1.000000] boot\n");
        let hex: String = frame.iter().map(|b| format!("0x{b:02x} ")).collect();
        let text = decoder.decode(RawPayload::Hex(hex)).await.unwrap();
        assert_eq!(text, "<6>[    1.000000] boot\n");
    }

    #[tokio::test]
    async fn decode_replaces_invalid_utf8() {
        let decoder = identity_decoder();
        let frame = encode_frame(3, &[b'a', 0xFF, b'b']);
        let text = decoder.decode(RawPayload::Bytes(frame)).await.unwrap();
        assert_eq!(text, "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn decode_malformed_hex_fails_before_tool() {
        let decoder = FrameDecoder::new(&DecompressorConfig {
            program: "qrlog-no-such-tool".to_string(),
            args: Vec::new(),
            ..DecompressorConfig::default()
        });
        let err = decoder
            .decode(RawPayload::Hex("not hex".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedHex(_)));
    }

    #[tokio::test]
    async fn missing_tool_is_unavailable() {
        let decoder = FrameDecoder::new(&DecompressorConfig {
            program: "qrlog-no-such-tool".to_string(),
            args: Vec::new(),
            ..DecompressorConfig::default()
        });
        let err = decoder
            .decode(RawPayload::Bytes(plain_frame("x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::DecompressorUnavailable { .. }));
        assert!(err.is_environmental());
    }

    #[tokio::test]
    async fn failing_tool_reports_failure_and_cleans_up() {
        let decoder = FrameDecoder::new(&DecompressorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo \"corrupt input: $0\" >&2; exit 1".to_string(),
            ],
            ..DecompressorConfig::default()
        });
        let err = decoder
            .decode(RawPayload::Bytes(plain_frame("x")))
            .await
            .unwrap_err();
        let artifact = match err {
            DecodeError::DecompressionFailed { stderr, .. } => {
                let path = stderr
                    .strip_prefix("corrupt input: ")
                    .unwrap_or_else(|| panic!("unexpected stderr: {stderr}"));
                std::path::PathBuf::from(path)
            }
            other => panic!("unexpected error: {other:?}"),
        };
        assert!(!artifact.exists(), "temp artifact left behind: {artifact:?}");
    }

    #[tokio::test]
    async fn hung_tool_times_out_and_cleans_up() {
        let marker = tempfile::TempDir::new().unwrap();
        let seen = marker.path().join("artifact");
        let decoder = FrameDecoder::new(&DecompressorConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("printf '%s' \"$0\" > '{}'; exec sleep 30", seen.display()),
            ],
            timeout_ms: 1_000,
        });

        let started = std::time::Instant::now();
        let err = decoder
            .decode(RawPayload::Bytes(plain_frame("x")))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            err,
            DecodeError::TimedOut { timeout, .. } if timeout == Duration::from_secs(1)
        ));
        assert!(err.is_environmental());

        let artifact = std::fs::read_to_string(&seen).unwrap();
        assert!(!std::path::Path::new(&artifact).exists(), "{artifact}");
    }

    #[tokio::test]
    async fn successful_decode_removes_artifact() {
        let decoder = FrameDecoder::new(&DecompressorConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "printf '%s' \"$0\"".to_string()],
            ..DecompressorConfig::default()
        });
        let path = decoder
            .decode(RawPayload::Bytes(plain_frame("x")))
            .await
            .unwrap();
        assert!(path.contains("qrlog-"), "{path}");
        assert!(!std::path::Path::new(&path).exists());
    }

    #[tokio::test]
    async fn zstd_roundtrip_when_available() {
        let Ok(output) = std::process::Command::new("zstd")
            .args(["-q", "-c"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .and_then(|mut child| {
                child
                    .stdin
                    .take()
                    .unwrap()
                    .write_all(b"hello\n")?;
                child.wait_with_output()
            })
        else {
            // zstd not installed
            return;
        };
        assert!(output.status.success());

        let decoder = FrameDecoder::new(&DecompressorConfig::default());
        let frame = encode_frame(6, &output.stdout);
        let text = decoder.decode(RawPayload::Bytes(frame)).await.unwrap();
        assert_eq!(text, "hello\n");
    }
}
