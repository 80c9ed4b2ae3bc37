//! Container image references.
//!
//! Parsing follows Docker reference rules without library normalization:
//! `httpd:2.4` becomes `docker.io/httpd:2.4`, not `docker.io/library/httpd`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

/// Registry used when the reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

static PATH_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("static regex")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("static regex"));

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:sha256:[a-f0-9]{64}|[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,})$")
        .expect("static regex")
});

static REGISTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?$")
        .expect("static regex")
});

/// Why an image string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    /// Empty or whitespace-only reference.
    #[error("repository name must have at least one component")]
    Empty,

    /// The repository path contains uppercase characters.
    #[error("repository name must be lowercase")]
    Uppercase,

    /// A path component does not match the reference grammar.
    #[error("invalid reference format: bad path component `{0}`")]
    InvalidComponent(String),

    /// The registry host is malformed.
    #[error("invalid reference format: bad registry `{0}`")]
    InvalidRegistry(String),

    /// The tag is malformed.
    #[error("invalid reference format: bad tag `{0}`")]
    InvalidTag(String),

    /// The digest is malformed.
    #[error("invalid reference format: bad digest `{0}`")]
    InvalidDigest(String),
}

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Registry host, with port if present.
    pub registry: String,
    /// Last path component.
    pub name: String,
    /// Repository path below the registry.
    pub path: String,
    /// Tag; empty when only a digest was given.
    pub tag: String,
    /// Digest (`sha256:...`), empty when absent.
    pub digest: String,
}

impl ImageInfo {
    /// Parse an image string.
    pub fn parse(image: &str) -> Result<Self, ReferenceError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (remainder, digest) = match image.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST.is_match(digest) {
                    return Err(ReferenceError::InvalidDigest(digest.to_owned()));
                }
                (rest, digest.to_owned())
            }
            None => (image, String::new()),
        };

        // A tag can only appear after the last slash; a colon before it is a port.
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &remainder[split + 1..];
                if !TAG.is_match(tag) {
                    return Err(ReferenceError::InvalidTag(tag.to_owned()));
                }
                (&remainder[..split], tag.to_owned())
            }
            None => (remainder, String::new()),
        };

        let components: Vec<&str> = repository.split('/').collect();
        let (registry, path_components) = match components.split_first() {
            Some((first, rest)) if !rest.is_empty() && is_registry(first) => {
                if !REGISTRY.is_match(first) {
                    return Err(ReferenceError::InvalidRegistry((*first).to_owned()));
                }
                ((*first).to_owned(), rest)
            }
            _ => (DEFAULT_REGISTRY.to_owned(), components.as_slice()),
        };

        for component in path_components {
            if component.is_empty() {
                return Err(ReferenceError::Empty);
            }
            if component.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(ReferenceError::Uppercase);
            }
            if !PATH_COMPONENT.is_match(component) {
                return Err(ReferenceError::InvalidComponent((*component).to_owned()));
            }
        }

        let path = path_components.join("/");
        let name = path_components.last().copied().unwrap_or_default().to_owned();
        let tag = if tag.is_empty() && digest.is_empty() {
            DEFAULT_TAG.to_owned()
        } else {
            tag
        };

        Ok(Self {
            registry,
            name,
            path,
            tag,
            digest,
        })
    }

    /// `registry/path`.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.registry, self.path)
    }

    /// `registry/path:tag`, or the bare reference when there is no tag.
    pub fn reference_with_tag(&self) -> String {
        if self.tag.is_empty() {
            self.reference()
        } else {
            format!("{}:{}", self.reference(), self.tag)
        }
    }

    /// The JSON shape exposed to policies under `images.containers.<key>`.
    pub fn to_context_value(&self, pointer: &str) -> Value {
        json!({
            "registry": self.registry,
            "name": self.name,
            "path": self.path,
            "tag": self.tag,
            "digest": self.digest,
            "reference": self.reference(),
            "referenceWithTag": self.reference_with_tag(),
            "jsonPointer": pointer,
        })
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.digest.is_empty() {
            write!(f, "{}/{}:{}", self.registry, self.path, self.tag)
        } else {
            write!(f, "{}/{}@{}", self.registry, self.path, self.digest)
        }
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
