use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use sha2::{Digest, Sha256};
use vista_core::ConfigValue;

use crate::digest::DigestRegistry;
use crate::error::DriverError;
use crate::resource::Resource;
use crate::run::DriverRunState;

/// Invoked with the terminal run state once a dispatch of the transformation
/// has been finalized.
pub type CompletionCallback = Arc<dyn Fn(&DriverRunState) + Send + Sync>;

/// Bumped whenever the digest layout changes, so old persisted digests miss.
const DIGEST_VERSION: &[u8] = b"vista-digest-v1";

/// One unit of recomputation logic.
///
/// The configuration bag stays mutable until the transformation is handed to
/// a driver as `Arc<Transformation>`; from then on the shared copy is frozen.
/// Owners that need to reconfigure go through `Arc::make_mut`, which leaves
/// any in-flight copy untouched.
#[derive(Clone)]
pub struct Transformation {
    kind: String,
    configuration: BTreeMap<String, ConfigValue>,
    resources: Vec<Resource>,
    on_completion: Option<CompletionCallback>,
    digest: OnceLock<String>,
}

impl Transformation {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            configuration: BTreeMap::new(),
            resources: Vec::new(),
            on_completion: None,
            digest: OnceLock::new(),
        }
    }

    pub fn with_resource(mut self, resource: Resource) -> Self {
        self.resources.push(resource);
        self.digest = OnceLock::new();
        self
    }

    pub fn with_resources(mut self, resources: impl IntoIterator<Item = Resource>) -> Self {
        self.resources.extend(resources);
        self.digest = OnceLock::new();
        self
    }

    pub fn with_completion(mut self, callback: impl Fn(&DriverRunState) + Send + Sync + 'static) -> Self {
        self.on_completion = Some(Arc::new(callback));
        self
    }

    /// Routing discriminator used to pick a driver.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn configuration(&self) -> &BTreeMap<String, ConfigValue> {
        &self.configuration
    }

    pub fn config_value(&self, key: &str) -> Option<&ConfigValue> {
        self.configuration.get(key)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configuration.get(key).and_then(ConfigValue::as_str)
    }

    /// Merge options into the configuration; the last write per key wins.
    ///
    /// Values are not validated here. Drivers reject bad configuration at
    /// dispatch time.
    pub fn configure_with<I, K, V>(&mut self, options: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        for (key, value) in options {
            self.configuration.insert(key.into(), value.into());
        }
        self
    }

    /// Resources this transformation is versioned by, in declaration order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// SHA-256 hex digest over the kind and the content of every resource.
    ///
    /// Computed at most once per instance until [`invalidate_digest`](Self::invalidate_digest).
    /// Fails with `ResourceUnavailable` when any resource cannot be hashed;
    /// failures are not cached.
    pub fn version_digest(&self, registry: &DigestRegistry) -> Result<String, DriverError> {
        if let Some(digest) = self.digest.get() {
            return Ok(digest.clone());
        }

        let mut hasher = Sha256::new();
        hasher.update(DIGEST_VERSION);
        hasher.update([0u8]);
        hasher.update(self.kind.as_bytes());
        hasher.update([0u8]);
        for resource in &self.resources {
            let content = registry.hash(resource)?;
            hasher.update(resource.kind.as_bytes());
            hasher.update([0u8]);
            hasher.update(&content);
        }
        let digest = format!("{:x}", hasher.finalize());

        // A concurrent computation may have won; both results are equal.
        Ok(self.digest.get_or_init(|| digest).clone())
    }

    pub fn cached_digest(&self) -> Option<&str> {
        self.digest.get().map(String::as_str)
    }

    /// Forget the cached digest so the next call re-reads every resource.
    pub fn invalidate_digest(&mut self) {
        self.digest.take();
    }

    /// Run the completion callback, if any.
    pub fn notify_completion(&self, state: &DriverRunState) {
        if let Some(callback) = &self.on_completion {
            callback(state);
        }
    }
}

impl fmt::Debug for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformation")
            .field("kind", &self.kind)
            .field("configuration", &self.configuration)
            .field("resources", &self.resources)
            .field("on_completion", &self.on_completion.is_some())
            .field("digest", &self.digest.get())
            .finish()
    }
}
