//! Manifest header: the ASCII block above the `---` separator, carrying the
//! detached signature and, for self-signed manifests, the public key.
//!
//! The header grammar is deliberately tiny and parsed by hand rather than as
//! YAML: two field shapes only, each at most once.
//!
//! ```text
//! signature: |
//!   0xabc...:base64...
//! pubkey: |
//!   base64...
//! ```

use crate::crypto::{SigContext, SigError};

use super::ManifestError;

pub const HEADER_SEPARATOR: &[u8] = b"\n---\n";
pub const HEADER_SEPARATOR_EMPTY: &[u8] = b"---\n";

/// Split manifest data into header bytes and body bytes.
pub fn split_header(data: &[u8]) -> Result<(&[u8], &[u8]), ManifestError> {
    if data.starts_with(HEADER_SEPARATOR_EMPTY) {
        return Ok((&[], &data[HEADER_SEPARATOR_EMPTY.len()..]));
    }
    let pos = data
        .windows(HEADER_SEPARATOR.len())
        .position(|window| window == HEADER_SEPARATOR)
        .ok_or(ManifestError::MissingSeparator)?;
    Ok((&data[..pos], &data[pos + HEADER_SEPARATOR.len()..]))
}

/// How to treat a `pubkey` field in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfSigned {
    /// Reject manifests carrying their own pubkey.
    Disallow,
    /// Accept either form.
    Allow,
    /// Require the pubkey (bootstrapping a user from their own manifest).
    Require,
}

/// Parsed manifest header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub signature: Option<String>,
    pub pubkey: Option<String>,
}

impl Header {
    pub fn new(signature: Option<String>, pubkey: Option<String>) -> Self {
        Self {
            signature: signature.map(|s| s.trim_end_matches('\n').to_string()),
            pubkey: pubkey.map(|s| s.trim_end_matches('\n').to_string()),
        }
    }

    /// An empty header, used when an unsigned manifest is explicitly
    /// accepted (trusted storage).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ManifestError> {
        let mut parser = HeaderParser::new(data)?;
        let fields = parser.parse(&["signature", "pubkey"])?;
        let mut fields = fields;
        Ok(Self {
            signature: fields.remove("signature"),
            pubkey: fields.remove("pubkey"),
        })
    }

    /// Serialize the header. Field order is fixed: signature, then pubkey.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ManifestError> {
        let mut lines: Vec<String> = Vec::new();
        if let Some(signature) = &self.signature {
            lines.push("signature: |".to_string());
            for line in signature.lines() {
                lines.push(format!("  {}", line));
            }
        }
        if let Some(pubkey) = &self.pubkey {
            lines.push("pubkey: |".to_string());
            for line in pubkey.lines() {
                lines.push(format!("  {}", line));
            }
        }
        let data = lines.join("\n").into_bytes();
        self.verify_bytes(&data)?;
        Ok(data)
    }

    /// Verify the signature against the body bytes, returning the signer.
    ///
    /// With an embedded pubkey the verification runs in a scratch copy of
    /// the signature context, so a self-signed manifest cannot inject its
    /// key into the caller's context.
    pub fn verify_rest(
        &self,
        rest_data: &[u8],
        sig: &dyn SigContext,
        self_signed: SelfSigned,
        trusted_owner: Option<&str>,
    ) -> Result<String, ManifestError> {
        if self_signed == SelfSigned::Require && self.pubkey.is_none() {
            return Err(SigError::BadSignature("expecting the header to contain pubkey".into()).into());
        }
        if self_signed == SelfSigned::Disallow && self.pubkey.is_some() {
            return Err(
                SigError::BadSignature("not expecting the header to contain pubkey".into()).into(),
            );
        }

        if let Some(pubkey) = &self.pubkey {
            let signature = self.signature.as_ref().ok_or_else(|| {
                SigError::BadSignature("signature is required when providing pubkey".into())
            })?;
            let mut scratch = sig.duplicate();
            let pubkey_signer = scratch.add_pubkey(pubkey, None)?;
            let signer = scratch.verify(signature, rest_data)?;
            if signer != pubkey_signer {
                return Err(SigError::BadSignature(format!(
                    "signer {} does not match embedded pubkey {}",
                    signer, pubkey_signer
                ))
                .into());
            }
            return Ok(signer);
        }

        match &self.signature {
            None => match trusted_owner {
                Some(owner) => Ok(owner.to_string()),
                None => Err(SigError::BadSignature("signature expected".into()).into()),
            },
            Some(signature) => Ok(sig.verify(signature, rest_data)?),
        }
    }

    // Serialisation self-check: the emitted bytes must parse back into an
    // identical header.
    fn verify_bytes(&self, data: &[u8]) -> Result<(), ManifestError> {
        let parsed = Self::from_bytes(data)
            .map_err(|e| ManifestError::HeaderParse(format!("serialization self-check: {}", e)))?;
        if parsed != *self {
            return Err(ManifestError::HeaderParse(
                "header does not round-trip through serialization".into(),
            ));
        }
        Ok(())
    }
}

/// Strict line-based parser for the header grammar.
///
/// Recognizes `name: "value"` with value in `[A-Za-z0-9_ .-]+`, and block
/// fields `name: |` whose continuation lines are indented by exactly two
/// spaces. Interior blank lines are kept, trailing blank lines stripped.
struct HeaderParser {
    lines: Vec<String>,
    pos: usize,
}

impl HeaderParser {
    fn new(data: &[u8]) -> Result<Self, ManifestError> {
        if !data.is_ascii() {
            return Err(ManifestError::HeaderParse("header should be ASCII".into()));
        }
        let text = String::from_utf8_lossy(data);
        Ok(Self {
            lines: text.lines().map(str::to_string).collect(),
            pos: 0,
        })
    }

    fn parse(
        &mut self,
        fields: &[&str],
    ) -> Result<std::collections::HashMap<String, String>, ManifestError> {
        let mut result = std::collections::HashMap::new();
        while !self.is_eof() {
            let (name, value) = self.parse_field()?;
            if !fields.contains(&name.as_str()) {
                return Err(ManifestError::HeaderParse(format!(
                    "unexpected field: {:?}",
                    name
                )));
            }
            if result.contains_key(&name) {
                return Err(ManifestError::HeaderParse(format!(
                    "duplicate field: {:?}",
                    name
                )));
            }
            result.insert(name, value);
        }
        Ok(result)
    }

    fn parse_field(&mut self) -> Result<(String, String), ManifestError> {
        let line = self.lines[self.pos].clone();
        self.pos += 1;

        if let Some((name, value)) = parse_simple_field(&line) {
            return Ok((name, value));
        }
        if let Some(name) = parse_block_field(&line) {
            return Ok((name, self.parse_block()?));
        }
        Err(ManifestError::HeaderParse(format!(
            "unexpected line: {:?}",
            line
        )))
    }

    fn parse_block(&mut self) -> Result<String, ManifestError> {
        let mut parsed: Vec<String> = Vec::new();
        while self.pos < self.lines.len() {
            let line = &self.lines[self.pos];
            match parse_block_line(line) {
                Some(content) => {
                    self.pos += 1;
                    parsed.push(content);
                }
                None => break,
            }
        }
        while parsed.last().is_some_and(|line| line.is_empty()) {
            parsed.pop();
        }
        if parsed.is_empty() {
            return Err(ManifestError::HeaderParse(
                "block literal cannot be empty".into(),
            ));
        }
        Ok(parsed.join("\n"))
    }

    fn is_eof(&self) -> bool {
        self.pos == self.lines.len()
    }
}

// name: "value"
fn parse_simple_field(line: &str) -> Option<(String, String)> {
    let (name, rest) = line.split_once(": ")?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    let value = rest.strip_prefix('"')?.strip_suffix('"')?;
    if value.is_empty()
        || !value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b' ' | b'.' | b'-'))
    {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

// name: |
fn parse_block_field(line: &str) -> Option<String> {
    let name = line.strip_suffix(": |")?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_lowercase()) {
        return None;
    }
    Some(name.to_string())
}

// blank (up to two spaces) or exactly-two-space indented content
fn parse_block_line(line: &str) -> Option<String> {
    if line.len() <= 2 && line.bytes().all(|b| b == b' ') {
        return Some(String::new());
    }
    line.strip_prefix("  ").map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_header() {
        let (header, body) = split_header(b"signature: |\n  sig\n---\nbody\n").unwrap();
        assert_eq!(header, b"signature: |\n  sig");
        assert_eq!(body, b"body\n");
    }

    #[test]
    fn test_split_empty_header() {
        let (header, body) = split_header(b"---\nbody\n").unwrap();
        assert_eq!(header, b"");
        assert_eq!(body, b"body\n");
    }

    #[test]
    fn test_split_missing_separator() {
        assert!(matches!(
            split_header(b"no separator here"),
            Err(ManifestError::MissingSeparator)
        ));
    }

    #[test]
    fn test_parse_signature_block() {
        let header = Header::from_bytes(b"signature: |\n  line1\n  line2").unwrap();
        assert_eq!(header.signature.as_deref(), Some("line1\nline2"));
        assert_eq!(header.pubkey, None);
    }

    #[test]
    fn test_parse_with_pubkey() {
        let header =
            Header::from_bytes(b"signature: |\n  dummy.0x1\npubkey: |\n  key.0x1").unwrap();
        assert_eq!(header.signature.as_deref(), Some("dummy.0x1"));
        assert_eq!(header.pubkey.as_deref(), Some("key.0x1"));
    }

    #[test]
    fn test_parse_blank_lines_in_block() {
        let header = Header::from_bytes(b"signature: |\n  line1\n\n  line2\n\n").unwrap();
        assert_eq!(header.signature.as_deref(), Some("line1\n\nline2"));
    }

    #[test]
    fn test_parse_rejects_unknown_field() {
        assert!(Header::from_bytes(b"signer: \"0x1\"").is_err());
    }

    #[test]
    fn test_parse_rejects_duplicate_field() {
        assert!(Header::from_bytes(b"signature: |\n  a\nsignature: |\n  b").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_block() {
        assert!(Header::from_bytes(b"signature: |").is_err());
        assert!(Header::from_bytes(b"signature: |\n\n").is_err());
    }

    #[test]
    fn test_parse_rejects_non_ascii() {
        assert!(Header::from_bytes("signature: |\n  zażółć".as_bytes()).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_indent() {
        assert!(Header::from_bytes(b"signature: |\n    overindented").is_err());
    }

    #[test]
    fn test_simple_field_charset() {
        let (name, value) = parse_simple_field("field: \"A-Za-z0 9_.\"").unwrap();
        assert_eq!(name, "field");
        assert_eq!(value, "A-Za-z0 9_.");
        assert!(parse_simple_field("field: \"bad|chars\"").is_none());
        assert!(parse_simple_field("Field: \"x\"").is_none());
    }

    #[test]
    fn test_roundtrip() {
        let header = Header::new(Some("0xabc:c2ln\nmore".to_string()), Some("cHVi".to_string()));
        let bytes = header.to_bytes().unwrap();
        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
    }
}
