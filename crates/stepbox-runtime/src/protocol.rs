//! Stdin framing between the server and the contained process.
//!
//! The payload is four segments written in order, then stdin is closed:
//!
//! 1. the JSON [`ProcessMeta`] followed by `\n`;
//! 2. the build location followed by `\n`;
//! 3. the source context followed by [`BINARY_SEPARATOR`];
//! 4. the raw binary.

use stepbox_common::constants::BINARY_SEPARATOR;
use stepbox_common::error::SandboxError;
use stepbox_common::types::ProcessMeta;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Failure while framing or sending the payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The metadata line could not be encoded.
    #[error("encoding process metadata: {0}")]
    Encode(#[from] serde_json::Error),

    /// Writing one of the segments to the contained process failed.
    #[error("writing {segment} to the contained process: {source}")]
    Write {
        /// Which segment was being written.
        segment: &'static str,
        /// Underlying pipe error.
        source: std::io::Error,
    },
}

/// The four-segment payload for one run, borrowing from the request.
#[derive(Debug, Clone, Copy)]
pub struct WirePayload<'a> {
    /// Invocation metadata.
    pub meta: &'a ProcessMeta,
    /// Directory the binary was built in.
    pub build_loc: &'a str,
    /// Source the binary was built from.
    pub source_context: &'a [u8],
    /// The executable itself.
    pub binary: &'a [u8],
}

impl WirePayload<'_> {
    fn meta_line(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(self.meta)?;
        line.push(b'\n');
        Ok(line)
    }

    /// Writes all four segments in order and flushes. Does not close `w`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] naming the segment that failed.
    pub async fn write_to<W>(&self, w: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let meta = self.meta_line()?;
        let segments: [(&'static str, &[u8]); 6] = [
            ("meta", meta.as_slice()),
            ("build location", self.build_loc.as_bytes()),
            ("build location", b"\n".as_slice()),
            ("source context", self.source_context),
            ("source context", BINARY_SEPARATOR),
            ("binary", self.binary),
        ];
        for (segment, bytes) in segments {
            w.write_all(bytes)
                .await
                .map_err(|source| ProtocolError::Write { segment, source })?;
        }
        w.flush()
            .await
            .map_err(|source| ProtocolError::Write {
                segment: "binary",
                source,
            })
    }

    /// Encodes the whole payload into one buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if the metadata cannot be encoded.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = self.meta_line()?;
        out.reserve(
            self.build_loc.len() + 1 + self.source_context.len() + BINARY_SEPARATOR.len() + self.binary.len(),
        );
        out.extend_from_slice(self.build_loc.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(self.source_context);
        out.extend_from_slice(BINARY_SEPARATOR);
        out.extend_from_slice(self.binary);
        Ok(out)
    }
}

/// A payload as received by the contained process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    /// Invocation metadata.
    pub meta: ProcessMeta,
    /// Directory the binary was built in.
    pub build_loc: String,
    /// Source the binary was built from.
    pub source_context: Vec<u8>,
    /// The executable itself.
    pub binary: Vec<u8>,
}

fn malformed(message: &str) -> SandboxError {
    SandboxError::MalformedInput {
        message: message.to_owned(),
    }
}

/// Splits raw stdin back into its four segments.
///
/// The source context ends at the first occurrence of the separator.
///
/// # Errors
///
/// Returns [`SandboxError::MalformedInput`] if a delimiter is missing or
/// the build location is not UTF-8, and [`SandboxError::Serialization`]
/// if the metadata line is not valid JSON.
pub fn decode(input: &[u8]) -> Result<DecodedPayload, SandboxError> {
    let nl = memchr(b'\n', input).ok_or_else(|| malformed("no newline found in input"))?;
    let (meta_json, rest) = (&input[..nl], &input[nl + 1..]);

    let nl = memchr(b'\n', rest).ok_or_else(|| malformed("no newline after build location"))?;
    let build_loc = std::str::from_utf8(&rest[..nl])
        .map_err(|_| malformed("build location is not UTF-8"))?
        .to_owned();
    let rest = &rest[nl + 1..];

    let sep = rest
        .windows(BINARY_SEPARATOR.len())
        .position(|w| w == BINARY_SEPARATOR)
        .ok_or_else(|| malformed("binary separator not found"))?;
    let source_context = rest[..sep].to_vec();
    let binary = rest[sep + BINARY_SEPARATOR.len()..].to_vec();

    let meta = serde_json::from_slice(meta_json)?;
    Ok(DecodedPayload {
        meta,
        build_loc,
        source_context,
        binary,
    })
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_segments_in_order() {
        let meta = ProcessMeta::default();
        let payload = WirePayload {
            meta: &meta,
            build_loc: "/tmp/x",
            source_context: b"package main",
            binary: &[1, 2, 3, 4, 5],
        };
        let mut expected = b"{\"args\":null}\n/tmp/x\npackage mainbinarySeparator".to_vec();
        expected.extend_from_slice(&[1, 2, 3, 4, 5]);
        assert_eq!(payload.encode().unwrap(), expected);
    }

    #[tokio::test]
    async fn write_to_matches_encode() {
        let meta = ProcessMeta {
            args: Some(vec!["-v".into(), "x y".into()]),
        };
        let payload = WirePayload {
            meta: &meta,
            build_loc: "/go/src/play",
            source_context: b"src",
            binary: b"\x7fELF",
        };
        let mut written = Vec::new();
        payload.write_to(&mut written).await.unwrap();
        assert_eq!(written, payload.encode().unwrap());
    }

    #[test]
    fn decode_inverts_encode() {
        let meta = ProcessMeta {
            args: Some(vec!["a".into()]),
        };
        let payload = WirePayload {
            meta: &meta,
            build_loc: "/tmp/build",
            source_context: b"line1\nline2\n",
            binary: b"bin\nwith binarySeparator inside",
        };
        let decoded = decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded.meta, meta);
        assert_eq!(decoded.build_loc, "/tmp/build");
        assert_eq!(decoded.source_context, b"line1\nline2\n");
        assert_eq!(decoded.binary, b"bin\nwith binarySeparator inside");
    }

    #[test]
    fn decode_rejects_missing_newline() {
        let err = decode(b"{\"args\":null}").unwrap_err();
        assert!(err.to_string().contains("no newline"));
    }

    #[test]
    fn decode_rejects_missing_separator() {
        let err = decode(b"{\"args\":null}\n/tmp\nsource only").unwrap_err();
        assert!(err.to_string().contains("separator"));
    }

    #[test]
    fn decode_rejects_bad_meta() {
        let err = decode(b"not json\n/tmp\nsrcbinarySeparatorbin").unwrap_err();
        assert!(matches!(err, SandboxError::Serialization { .. }));
    }
}
