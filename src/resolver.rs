use std::fs::File;
use std::time::Instant;

use crate::drivers::Loader;
use crate::error::{Error, Result};
use crate::manifest::{DumpId, Manifest, ManifestStatus, RestoreReport};
use crate::registry::ArtifactRegistry;
use crate::storage::RetryPolicy;
use crate::utils::hash::sha256_file;

/// Resolves user-supplied references to exactly one complete artifact
/// and drives restores. Only `complete` manifests are visible here;
/// pending or missing manifests read as not-found.
pub struct RestoreResolver<'a> {
    registry: &'a ArtifactRegistry<'a>,
    retry: RetryPolicy,
}

impl<'a> RestoreResolver<'a> {
    pub fn new(registry: &'a ArtifactRegistry<'a>, retry: RetryPolicy) -> Self {
        RestoreResolver { registry, retry }
    }

    /// Resolve an id-or-tag reference. Identifier-shaped refs are tried
    /// as identifiers first and only fall back to the tag index when no
    /// complete manifest exists under that id, so the two namespaces
    /// may collide lexically without ambiguity.
    pub fn resolve(&self, dump_ref: &str) -> Result<DumpId> {
        if DumpId::is_id_shaped(dump_ref) {
            let id = DumpId::parse(dump_ref)?;
            if self.complete_manifest(&id)?.is_some() {
                return Ok(id);
            }
        }
        if let Some(id) = self.registry.lookup_tag(dump_ref)? {
            if self.complete_manifest(&id)?.is_some() {
                return Ok(id);
            }
        }
        Err(Error::NotFound(dump_ref.to_string()))
    }

    /// Restore `id` into the target database. The payload checksum is
    /// verified before any byte reaches the loader and the target must
    /// be empty; a mid-load failure is surfaced without cleanup.
    pub fn restore(
        &self,
        id: &DumpId,
        target_uri: &str,
        target_label: &str,
        loader: &dyn Loader,
    ) -> Result<RestoreReport> {
        let started = Instant::now();

        let manifest = self
            .registry
            .load_manifest(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if manifest.status != ManifestStatus::Complete {
            return Err(Error::IncompleteArtifact(id.clone()));
        }

        let spool = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Storage(format!("could not create spool file: {}", e)))?;
        let bytes_transferred = self.registry.fetch_payload(id, spool.path())?;

        let actual = sha256_file(spool.path()).map_err(|e| Error::Storage(e.to_string()))?;
        if actual != manifest.sha256 {
            return Err(Error::CorruptArtifact {
                id: id.clone(),
                expected: manifest.sha256,
                actual,
            });
        }

        // The emptiness probe is the connection attempt against the
        // target; an unreachable database gets the same bounded
        // backoff as storage before turning fatal. The load itself is
        // never retried, a mid-load redo is not safe.
        let empty = with_connectivity_backoff(&self.retry, || loader.is_empty(target_uri))?;
        if !empty {
            return Err(Error::TargetNotEmpty(target_label.to_string()));
        }

        let mut payload = File::open(spool.path())
            .map_err(|e| Error::Storage(e.to_string()))?;
        loader.load(target_uri, &mut payload)?;

        Ok(RestoreReport {
            dump_id: id.clone(),
            target: target_label.to_string(),
            bytes_transferred,
            duration: started.elapsed(),
        })
    }

    fn complete_manifest(&self, id: &DumpId) -> Result<Option<Manifest>> {
        Ok(self
            .registry
            .load_manifest(id)?
            .filter(|m| m.status == ManifestStatus::Complete))
    }
}

/// Bounded exponential backoff for connectivity failures outside the
/// storage layer (the storage backends have their own, typed over
/// `StorageError`). Only `Connectivity` errors are retried.
fn with_connectivity_backoff<T>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = policy.attempts.max(1);
    let mut delay = policy.base_delay;
    for attempt in 1..=attempts {
        match op() {
            Err(Error::Connectivity(_)) if attempt < attempts => {
                std::thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
    unreachable!("retry loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{SourceDescriptor, manifest_key, payload_key};
    use crate::storage::fs::FsBackend;
    use crate::storage::{RetryPolicy, StorageBackend};
    use std::io::{Cursor, Read};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy { attempts: 2, base_delay: Duration::from_millis(1) }
    }

    fn source() -> SourceDescriptor {
        SourceDescriptor { host: "db.test".into(), database: "app".into() }
    }

    fn new_store() -> (tempfile::TempDir, FsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBackend::new(dir.path().join("bucket")).unwrap();
        (dir, store)
    }

    /// Loader double capturing what would have been written.
    #[derive(Default)]
    struct RecordingLoader {
        empty: bool,
        loaded: Mutex<Vec<u8>>,
    }

    impl RecordingLoader {
        fn empty_target() -> Self {
            RecordingLoader { empty: true, loaded: Mutex::new(Vec::new()) }
        }
    }

    impl Loader for RecordingLoader {
        fn is_empty(&self, _target_uri: &str) -> Result<bool> {
            Ok(self.empty)
        }
        fn load(&self, _target_uri: &str, dump: &mut dyn Read) -> Result<()> {
            dump.read_to_end(&mut self.loaded.lock().unwrap())
                .map_err(|e| Error::Load(e.to_string()))?;
            Ok(())
        }
    }

    #[test]
    fn stash_then_restore_round_trips_bytes() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());
        let data = b"copy public.users from stdin;\n1\ttest\n\\.\n";

        let outcome = registry
            .stash(&source(), &mut Cursor::new(&data[..]), &["nightly".into()])
            .unwrap();
        let id = resolver.resolve("nightly").unwrap();
        assert_eq!(id, outcome.manifest.dump_id);

        let loader = RecordingLoader::empty_target();
        let report = resolver
            .restore(&id, "postgres://t@h/db", "h/db", &loader)
            .unwrap();
        assert_eq!(report.bytes_transferred, data.len() as u64);
        assert_eq!(*loader.loaded.lock().unwrap(), data);
    }

    #[test]
    fn resolve_prefers_identifier_over_same_shaped_tag() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let real = registry
            .stash(&source(), &mut Cursor::new(b"real".as_slice()), &[])
            .unwrap();
        let other = registry
            .stash(&source(), &mut Cursor::new(b"other".as_slice()), &[])
            .unwrap();

        // A tag whose name is exactly the first dump's id, pointing at
        // the second dump. The literal id must win.
        registry
            .repoint_tag(real.manifest.dump_id.as_str(), &other.manifest.dump_id)
            .unwrap();
        assert_eq!(
            resolver.resolve(real.manifest.dump_id.as_str()).unwrap(),
            real.manifest.dump_id
        );
    }

    #[test]
    fn id_shaped_ref_falls_back_to_tag_when_no_such_dump() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"x".as_slice()), &[])
            .unwrap();
        let id_shaped_tag = "19990101000000-deadbeef";
        assert!(DumpId::is_id_shaped(id_shaped_tag));
        registry.repoint_tag(id_shaped_tag, &outcome.manifest.dump_id).unwrap();

        assert_eq!(
            resolver.resolve(id_shaped_tag).unwrap(),
            outcome.manifest.dump_id
        );
    }

    #[test]
    fn unknown_refs_are_not_found() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());
        assert!(matches!(resolver.resolve("nightly"), Err(Error::NotFound(_))));
        assert!(matches!(
            resolver.resolve("19990101000000-deadbeef"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn resolve_is_idempotent_without_tag_mutation() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());
        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"x".as_slice()), &["latest".into()])
            .unwrap();
        let first = resolver.resolve("latest").unwrap();
        let second = resolver.resolve("latest").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, outcome.manifest.dump_id);
    }

    #[test]
    fn pending_manifest_is_invisible_to_resolution() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let pending_id = DumpId::parse("20250101000000-0badc0de").unwrap();
        let manifest = crate::manifest::Manifest {
            dump_id: pending_id.clone(),
            created_at: chrono::Utc::now(),
            source: source(),
            size_bytes: 1,
            sha256: "00".repeat(32),
            status: ManifestStatus::Pending,
            tags: Vec::new(),
        };
        store
            .put_bytes(&manifest_key(&pending_id), &serde_json::to_vec(&manifest).unwrap())
            .unwrap();
        store.put_bytes("tags/broken", pending_id.as_str().as_bytes()).unwrap();

        // Not resolvable by id nor through a tag pointing at it.
        assert!(matches!(
            resolver.resolve(pending_id.as_str()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(resolver.resolve("broken"), Err(Error::NotFound(_))));

        // A direct restore attempt names the real problem.
        let loader = RecordingLoader::empty_target();
        assert!(matches!(
            resolver.restore(&pending_id, "uri", "label", &loader),
            Err(Error::IncompleteArtifact(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_before_any_database_write() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"pristine".as_slice()), &[])
            .unwrap();
        store
            .put_bytes(&payload_key(&outcome.manifest.dump_id), b"tampered")
            .unwrap();

        let loader = RecordingLoader::empty_target();
        let err = resolver
            .restore(&outcome.manifest.dump_id, "uri", "label", &loader)
            .unwrap_err();
        assert!(matches!(err, Error::CorruptArtifact { .. }));
        assert!(loader.loaded.lock().unwrap().is_empty());
    }

    #[test]
    fn non_empty_target_is_refused_before_loading() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"data".as_slice()), &[])
            .unwrap();
        let loader = RecordingLoader { empty: false, loaded: Mutex::new(Vec::new()) };
        let err = resolver
            .restore(&outcome.manifest.dump_id, "uri", "h/db", &loader)
            .unwrap_err();
        assert!(matches!(err, Error::TargetNotEmpty(_)));
        assert!(loader.loaded.lock().unwrap().is_empty());
    }

    /// Loader double whose emptiness probe fails a fixed number of
    /// times before succeeding, counting every attempt.
    struct FlakyLoader {
        failures: u32,
        calls: AtomicU32,
    }

    impl Loader for FlakyLoader {
        fn is_empty(&self, _target_uri: &str) -> Result<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(Error::Connectivity("connection refused".into()))
            } else {
                Ok(true)
            }
        }
        fn load(&self, _target_uri: &str, _dump: &mut dyn Read) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn transient_probe_failures_are_retried_with_backoff() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let retry = RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1) };
        let resolver = RestoreResolver::new(&registry, retry);

        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"data".as_slice()), &[])
            .unwrap();
        let loader = FlakyLoader { failures: 2, calls: AtomicU32::new(0) };
        let report = resolver
            .restore(&outcome.manifest.dump_id, "uri", "h/db", &loader)
            .unwrap();
        assert_eq!(report.bytes_transferred, 4);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unreachable_target_turns_fatal_after_the_attempt_ceiling() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let retry = RetryPolicy { attempts: 2, base_delay: Duration::from_millis(1) };
        let resolver = RestoreResolver::new(&registry, retry);

        let outcome = registry
            .stash(&source(), &mut Cursor::new(b"data".as_slice()), &[])
            .unwrap();
        let loader = FlakyLoader { failures: u32::MAX, calls: AtomicU32::new(0) };
        let err = resolver
            .restore(&outcome.manifest.dump_id, "uri", "h/db", &loader)
            .unwrap_err();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn repointing_a_tag_moves_resolution_and_keeps_old_dump() {
        let (_dir, store) = new_store();
        let registry = ArtifactRegistry::new(&store, fast_retry());
        let resolver = RestoreResolver::new(&registry, fast_retry());

        let a = registry
            .stash(&source(), &mut Cursor::new(b"a".as_slice()), &["latest".into()])
            .unwrap();
        let b = registry
            .stash(&source(), &mut Cursor::new(b"b".as_slice()), &["latest".into()])
            .unwrap();

        assert_eq!(resolver.resolve("latest").unwrap(), b.manifest.dump_id);
        assert_eq!(
            resolver.resolve(a.manifest.dump_id.as_str()).unwrap(),
            a.manifest.dump_id
        );
    }
}
