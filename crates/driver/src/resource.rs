use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A physical input a transformation depends on for versioning purposes.
///
/// `kind` selects the hashing strategy in the [`DigestRegistry`](crate::DigestRegistry);
/// `location` is interpreted by that strategy (a path, a URI, or literal text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub kind: String,
    pub location: String,
}

impl Resource {
    pub const LOCAL: &'static str = "file";
    pub const DISTRIBUTED: &'static str = "hdfs";
    pub const INLINE: &'static str = "inline";

    pub fn new(kind: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            location: location.into(),
        }
    }

    /// A file or directory on the local filesystem.
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::new(Self::LOCAL, path.as_ref().to_string_lossy())
    }

    /// A path on a distributed filesystem, e.g. `hdfs://namenode/libs/udf.jar`.
    pub fn distributed(uri: impl Into<String>) -> Self {
        Self::new(Self::DISTRIBUTED, uri)
    }

    /// Literal content, e.g. the query text of a transformation.
    pub fn inline(text: impl Into<String>) -> Self {
        Self::new(Self::INLINE, text)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == Self::INLINE {
            write!(f, "inline:<{} bytes>", self.location.len())
        } else {
            write!(f, "{}:{}", self.kind, self.location)
        }
    }
}
