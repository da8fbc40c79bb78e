use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::manifest::{
    DumpId, Manifest, ManifestStatus, SourceDescriptor, manifest_key, payload_key, tag_key,
};
use crate::storage::{RetryPolicy, StorageBackend, StorageError, with_backoff};
use crate::utils::hash::{CopyError, copy_and_hash};

/// Outcome of a stash: the minted identifier plus which of the
/// requested tags actually landed. Tag failures are non-fatal; callers
/// report them as warnings.
#[derive(Debug)]
pub struct StashOutcome {
    pub manifest: Manifest,
    pub applied_tags: Vec<String>,
    pub failed_tags: Vec<(String, String)>,
}

/// Owns the identifier scheme, the tag index, and the two-phase write
/// protocol that makes a stash atomic from a reader's perspective: the
/// payload is uploaded first, then a `pending` manifest, and the
/// manifest flips to `complete` only once the stored payload size is
/// confirmed. Nothing resolves a dump before that flip.
pub struct ArtifactRegistry<'a> {
    store: &'a dyn StorageBackend,
    retry: RetryPolicy,
}

impl<'a> ArtifactRegistry<'a> {
    pub fn new(store: &'a dyn StorageBackend, retry: RetryPolicy) -> Self {
        ArtifactRegistry { store, retry }
    }

    /// Stream `dump` into storage under a freshly minted identifier and
    /// apply the requested tags. See `StashOutcome` for tag semantics.
    pub fn stash(
        &self,
        source: &SourceDescriptor,
        dump: &mut dyn Read,
        tags: &[String],
    ) -> Result<StashOutcome> {
        for tag in tags {
            validate_tag(tag)?;
        }

        let id = self.mint_unused_id()?;

        // Spool the stream through a fixed-size buffer, hashing as we
        // go, so upload size and checksum are known before any write.
        let mut spool = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Storage(format!("could not create spool file: {}", e)))?;
        // A dying extraction stream and a full spool disk are different
        // failures; keep them apart so exit codes stay truthful.
        let (size_bytes, sha256) = copy_and_hash(dump, &mut spool).map_err(|e| match e {
            CopyError::Read(err) => Error::Extraction(err.to_string()),
            CopyError::Write(err) => Error::Storage(format!("could not spool dump: {}", err)),
        })?;

        self.retrying(|| self.store.put_file(&payload_key(&id), spool.path()))?;

        let mut manifest = Manifest {
            dump_id: id.clone(),
            created_at: chrono::Utc::now(),
            source: source.clone(),
            size_bytes,
            sha256,
            status: ManifestStatus::Pending,
            tags: tags.to_vec(),
        };
        self.write_manifest(&manifest)?;

        // Visibility gate: confirm the stored payload before flipping
        // to complete. A failure here leaves the manifest pending and
        // the dump invisible to resolution.
        let stored = self.retrying(|| self.store.size_of(&payload_key(&id)))?;
        if stored != size_bytes {
            return Err(Error::Storage(format!(
                "stored payload for '{}' is {} bytes, expected {}",
                id, stored, size_bytes
            )));
        }
        manifest.status = ManifestStatus::Complete;
        self.write_manifest(&manifest)?;

        let mut applied_tags = Vec::new();
        let mut failed_tags = Vec::new();
        for tag in tags {
            match self.repoint_tag(tag, &id) {
                Ok(()) => applied_tags.push(tag.clone()),
                Err(e) => failed_tags.push((tag.clone(), e.to_string())),
            }
        }

        Ok(StashOutcome { manifest, applied_tags, failed_tags })
    }

    /// Mint an identifier not present in storage. One regeneration is
    /// allowed; a second collision signals a generator defect.
    fn mint_unused_id(&self) -> Result<DumpId> {
        let mut id = DumpId::mint();
        for attempt in 0..2 {
            let taken = self.retrying(|| {
                Ok(self.store.exists(&manifest_key(&id))? || self.store.exists(&payload_key(&id))?)
            })?;
            if !taken {
                return Ok(id);
            }
            if attempt == 0 {
                id = DumpId::mint();
            }
        }
        Err(Error::IdentifierCollision(id))
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.retrying(|| self.store.put_bytes(&manifest_key(&manifest.dump_id), &bytes))
    }

    /// Manifest for `id`, or None when the identifier was never
    /// stashed. Pending manifests are returned as-is; callers decide
    /// whether pending counts as existing.
    pub fn load_manifest(&self, id: &DumpId) -> Result<Option<Manifest>> {
        match with_backoff(&self.retry, || self.store.get_bytes(&manifest_key(id))) {
            Ok(bytes) => {
                let manifest = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Storage(format!("manifest for '{}' is unreadable: {}", id, e))
                })?;
                Ok(Some(manifest))
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically repoint `tag` at `id`, overwriting any previous
    /// binding (last writer wins).
    pub fn repoint_tag(&self, tag: &str, id: &DumpId) -> Result<()> {
        validate_tag(tag)?;
        self.retrying(|| self.store.put_bytes(&tag_key(tag), id.as_str().as_bytes()))
    }

    /// Identifier bound to `tag`, if any.
    pub fn lookup_tag(&self, tag: &str) -> Result<Option<DumpId>> {
        match with_backoff(&self.retry, || self.store.get_bytes(&tag_key(tag))) {
            Ok(bytes) => {
                let content = String::from_utf8_lossy(&bytes);
                match DumpId::parse(content.trim()) {
                    Ok(id) => Ok(Some(id)),
                    // A tag object holding garbage is a dangling tag.
                    Err(_) => Ok(None),
                }
            }
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every (tag, id) binding in the index.
    pub fn tag_bindings(&self) -> Result<Vec<(String, DumpId)>> {
        let keys = self.retrying(|| self.store.list("tags/"))?;
        let mut bindings = Vec::new();
        for key in keys {
            let Some(tag) = key.strip_prefix("tags/") else { continue };
            if let Some(id) = self.lookup_tag(tag)? {
                bindings.push((tag.to_string(), id));
            }
        }
        bindings.sort();
        Ok(bindings)
    }

    /// Tags currently pointing at `id`.
    pub fn tags_for(&self, id: &DumpId) -> Result<Vec<String>> {
        Ok(self
            .tag_bindings()?
            .into_iter()
            .filter(|(_, bound)| bound == id)
            .map(|(tag, _)| tag)
            .collect())
    }

    /// Every readable manifest in the bucket, sorted by identifier
    /// (identifiers are time-ordered). Unparseable manifests are
    /// skipped rather than failing the listing.
    pub fn list_manifests(&self) -> Result<Vec<Manifest>> {
        let keys = self.retrying(|| self.store.list("dumps/"))?;
        let mut manifests = Vec::new();
        for key in keys {
            if !key.ends_with("/manifest.json") {
                continue;
            }
            let bytes = match with_backoff(&self.retry, || self.store.get_bytes(&key)) {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            if let Ok(manifest) = serde_json::from_slice::<Manifest>(&bytes) {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| a.dump_id.cmp(&b.dump_id));
        Ok(manifests)
    }

    /// Download the payload for `id` into `dest`, returning its size.
    pub fn fetch_payload(&self, id: &DumpId, dest: &Path) -> Result<u64> {
        Ok(self.retrying(|| self.store.get_file(&payload_key(id), dest))?)
    }

    fn retrying<T>(&self, op: impl FnMut() -> std::result::Result<T, StorageError>) -> Result<T> {
        Ok(with_backoff(&self.retry, op)?)
    }
}

/// Tags are object-key segments; reject anything that could escape the
/// `tags/` namespace or collide with key separators.
pub fn validate_tag(tag: &str) -> Result<()> {
    let ok = !tag.is_empty()
        && tag.len() <= 128
        && tag != "."
        && tag != ".."
        && !tag.contains(['/', '\\'])
        && !tag.chars().any(char::is_whitespace)
        && !tag.chars().any(char::is_control);
    if ok {
        Ok(())
    } else {
        Err(Error::Configuration(format!("invalid tag '{}'", tag)))
    }
}
