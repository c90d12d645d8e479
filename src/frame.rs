// Binary image frame carried on `image` topics:
//
//   [1 byte filename length L][L bytes filename][u32 LE declared size][body]
//
// Decoding only validates the header. Whether the body matches the declared
// size is checked after the body has been written, see `verify_written`.
use crate::error::{GatewayError, Result};

const SIZE_FIELD_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    pub filename: String,
    pub declared_size: u32,
    pub body: Vec<u8>,
}

impl ImageFrame {
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (&name_len, rest) = raw
            .split_first()
            .ok_or_else(|| malformed("empty frame"))?;
        let name_len = name_len as usize;

        let name_bytes = rest.get(..name_len).ok_or_else(|| {
            malformed(format!(
                "filename needs {name_len} bytes, only {} available",
                rest.len()
            ))
        })?;
        let rest = &rest[name_len..];

        let size_bytes: [u8; SIZE_FIELD_LEN] = rest
            .get(..SIZE_FIELD_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed("truncated size field"))?;
        let body = &rest[SIZE_FIELD_LEN..];

        let filename = std::str::from_utf8(name_bytes)
            .map_err(|_| malformed("filename is not valid utf-8"))?;
        check_filename(filename)?;

        Ok(ImageFrame {
            filename: filename.to_string(),
            declared_size: u32::from_le_bytes(size_bytes),
            body: body.to_vec(),
        })
    }

    /// Build a frame whose declared size is the body length.
    pub fn encode(filename: &str, body: &[u8]) -> Result<Vec<u8>> {
        check_filename(filename)?;
        let name_len = u8::try_from(filename.len())
            .map_err(|_| malformed("filename longer than 255 bytes"))?;
        let declared = u32::try_from(body.len())
            .map_err(|_| malformed("body larger than u32::MAX bytes"))?;

        let mut out = Vec::with_capacity(1 + filename.len() + SIZE_FIELD_LEN + body.len());
        out.push(name_len);
        out.extend_from_slice(filename.as_bytes());
        out.extend_from_slice(&declared.to_le_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    pub fn verify_written(&self, written: u64) -> Result<()> {
        if written != u64::from(self.declared_size) {
            return Err(GatewayError::IncompleteWrite {
                written,
                declared: self.declared_size,
            });
        }
        Ok(())
    }
}

// The filename becomes a path component under the user's cache directory.
fn check_filename(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(malformed(format!("invalid filename '{name}'")));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(malformed(format!("filename '{name}' contains a path separator")));
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> GatewayError {
    GatewayError::MalformedFrame(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let body: Vec<u8> = (0u8..10).collect();
        let raw = ImageFrame::encode("a.jpg", &body).unwrap();
        assert_eq!(raw[0], 5);
        assert_eq!(raw.len(), 1 + 5 + 4 + 10);

        let frame = ImageFrame::decode(&raw).unwrap();
        assert_eq!(frame.filename, "a.jpg");
        assert_eq!(frame.declared_size, 10);
        assert_eq!(frame.body, body);
        assert!(frame.verify_written(10).is_ok());
    }

    #[test]
    fn test_declared_size_is_little_endian() {
        let mut raw = vec![1, b'x'];
        raw.extend_from_slice(&[0x01, 0x02, 0x00, 0x00]);
        let frame = ImageFrame::decode(&raw).unwrap();
        assert_eq!(frame.declared_size, 0x0201);
        assert!(frame.body.is_empty());
    }

    #[test]
    fn test_short_buffers_are_malformed() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![5, b'a', b'.'],
            vec![5, b'a', b'.', b'j', b'p', b'g'],
            vec![5, b'a', b'.', b'j', b'p', b'g', 10, 0, 0],
        ];
        for raw in cases {
            let err = ImageFrame::decode(&raw).unwrap_err();
            assert!(matches!(err, GatewayError::MalformedFrame(_)), "{raw:?}: {err}");
        }
    }

    #[test]
    fn test_size_mismatch_detected_after_write() {
        let mut raw = vec![5];
        raw.extend_from_slice(b"a.jpg");
        raw.extend_from_slice(&10u32.to_le_bytes());
        raw.extend_from_slice(&[7u8; 8]);

        // Decoding succeeds; the mismatch surfaces once the body is written.
        let frame = ImageFrame::decode(&raw).unwrap();
        assert_eq!(frame.body.len(), 8);
        match frame.verify_written(8) {
            Err(GatewayError::IncompleteWrite { written, declared }) => {
                assert_eq!(written, 8);
                assert_eq!(declared, 10);
            }
            other => panic!("expected IncompleteWrite, got {other:?}"),
        }
    }

    #[test]
    fn test_path_like_filenames_rejected() {
        for name in ["../up.jpg", "dir/a.jpg", "..", ".", "c:\\a.jpg"] {
            let mut raw = vec![name.len() as u8];
            raw.extend_from_slice(name.as_bytes());
            raw.extend_from_slice(&0u32.to_le_bytes());
            assert!(
                matches!(ImageFrame::decode(&raw), Err(GatewayError::MalformedFrame(_))),
                "{name}"
            );
        }
        assert!(ImageFrame::encode("", b"x").is_err());
    }

    #[test]
    fn test_non_utf8_filename_rejected() {
        let raw = vec![2, 0xff, 0xfe, 0, 0, 0, 0];
        assert!(matches!(ImageFrame::decode(&raw), Err(GatewayError::MalformedFrame(_))));
    }

    #[test]
    fn test_encode_rejects_long_filename() {
        let name = "n".repeat(256);
        assert!(ImageFrame::encode(&name, b"body").is_err());
    }
}
