//! Wildland path grammar:
//! `wildland:(@default|<fingerprint>)?:(/segment)*:(/file/path)?`
//!
//! `:` separates user hops; a trailing `:` means the path addresses a
//! container, not a file inside it. `*` is the only glob wildcard.

#[derive(Debug, thiserror::Error)]
#[error("invalid wildland path: {0}")]
pub struct PathError(pub String);

/// A parsed Wildland path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildlandPath {
    /// Owner fingerprint; `None` means the default user (`@default`).
    pub owner: Option<String>,
    /// Container path hops, each absolute, possibly containing `*`.
    pub hops: Vec<String>,
    /// Optional path of a file within the final container.
    pub file_path: Option<String>,
}

impl WildlandPath {
    /// Quick check whether a string is meant to be a Wildland path.
    pub fn matches(value: &str) -> bool {
        value.starts_with("wildland:")
    }

    pub fn from_str(value: &str) -> Result<Self, PathError> {
        let rest = value
            .strip_prefix("wildland:")
            .ok_or_else(|| PathError(format!("missing wildland: prefix in {:?}", value)))?;
        let mut segments: Vec<&str> = rest.split(':').collect();
        if segments.len() < 2 {
            return Err(PathError(format!("expecting at least one hop in {:?}", value)));
        }

        let owner = match segments.remove(0) {
            "" | "@default" => None,
            fingerprint if fingerprint.starts_with("0x") => Some(fingerprint.to_string()),
            other => return Err(PathError(format!("invalid owner {:?}", other))),
        };

        // A trailing empty segment means "no file part".
        let file_path = match segments.last() {
            Some(&"") => {
                segments.pop();
                None
            }
            Some(last) if segments.len() > 1 => {
                let file = last.to_string();
                segments.pop();
                Some(file)
            }
            _ => None,
        };

        if segments.is_empty() {
            return Err(PathError(format!("expecting at least one hop in {:?}", value)));
        }
        for segment in &segments {
            if !segment.starts_with('/') {
                return Err(PathError(format!("hop {:?} must be absolute", segment)));
            }
        }
        if let Some(file) = &file_path {
            if !file.starts_with('/') {
                return Err(PathError(format!("file path {:?} must be absolute", file)));
            }
        }

        Ok(Self {
            owner,
            hops: segments.into_iter().map(str::to_string).collect(),
            file_path,
        })
    }

    /// Whether a concrete container path matches a hop pattern
    /// (`*` matches one path component).
    pub fn component_matches(pattern: &str, path: &str) -> bool {
        let pattern_parts: Vec<&str> = pattern.trim_matches('/').split('/').collect();
        let path_parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        if pattern_parts.len() != path_parts.len() {
            return false;
        }
        pattern_parts
            .iter()
            .zip(&path_parts)
            .all(|(pattern, part)| *pattern == "*" || pattern == part)
    }
}

impl std::fmt::Display for WildlandPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wildland:{}",
            self.owner.as_deref().unwrap_or("@default")
        )?;
        for hop in &self.hops {
            write!(f, ":{}", hop)?;
        }
        match &self.file_path {
            Some(file) => write!(f, ":{}", file),
            None => write!(f, ":"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_container_path() {
        let path = WildlandPath::from_str("wildland:0xaaa:/work/notes:").unwrap();
        assert_eq!(path.owner.as_deref(), Some("0xaaa"));
        assert_eq!(path.hops, ["/work/notes"]);
        assert_eq!(path.file_path, None);
    }

    #[test]
    fn test_parse_file_path() {
        let path = WildlandPath::from_str("wildland:@default:/work:/report.txt").unwrap();
        assert_eq!(path.owner, None);
        assert_eq!(path.hops, ["/work"]);
        assert_eq!(path.file_path.as_deref(), Some("/report.txt"));
    }

    #[test]
    fn test_parse_multi_hop() {
        let path = WildlandPath::from_str("wildland:0xaaa:/people/bob:/work:").unwrap();
        assert_eq!(path.hops, ["/people/bob", "/work"]);
    }

    #[test]
    fn test_rejects_bad_paths() {
        assert!(WildlandPath::from_str("wildland:").is_err());
        assert!(WildlandPath::from_str("wildland:0xaaa").is_err());
        assert!(WildlandPath::from_str("wildland:bob:/x:").is_err());
        assert!(WildlandPath::from_str("wildland:0xaaa:relative:").is_err());
        assert!(WildlandPath::from_str("/plain/path").is_err());
    }

    #[test]
    fn test_roundtrip_display() {
        for text in [
            "wildland:0xaaa:/work/notes:",
            "wildland:@default:/work:/file.txt",
        ] {
            let path = WildlandPath::from_str(text).unwrap();
            assert_eq!(path.to_string(), text);
        }
    }

    #[test]
    fn test_component_matching() {
        assert!(WildlandPath::component_matches("/work/*", "/work/notes"));
        assert!(!WildlandPath::component_matches("/work/*", "/work/notes/deep"));
        assert!(WildlandPath::component_matches("/work/notes", "/work/notes"));
        assert!(!WildlandPath::component_matches("/home/*", "/work/notes"));
    }
}
