use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::error::{Error, Result};

pub const TEAMS: &str = "teams";
pub const PROJECTS: &str = "projects";
pub const ENVIRONMENTS: &str = "environments";
pub const APPLICATIONS: &str = "applications";
pub const PODS: &str = "pods";
pub const NETWORKS: &str = "networks";

const BUCKETS: [&str; 6] = [TEAMS, PROJECTS, ENVIRONMENTS, APPLICATIONS, PODS, NETWORKS];

/// Embedded desired-state store: one sled tree per entity bucket, values
/// JSON-encoded and keyed by id. Writes go through sled's transactional
/// tree operations, so each mutation is serialisable; reads see the last
/// committed write.
#[derive(Clone, Debug)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open (or create) the database, creating every bucket up front.
    ///
    /// The containing directory is probed for writability first so a
    /// misconfigured install fails with remediation hints instead of an
    /// opaque I/O error deep inside the first request.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_writable_parent(path)?;
        let db = sled::open(path).map_err(|err| map_open_error(path, err))?;
        for bucket in BUCKETS {
            db.open_tree(bucket)
                .map_err(|err| storage_error("open bucket", bucket, err))?;
        }
        Ok(Self { db })
    }

    /// Upsert. Last write wins.
    pub fn create<T: Serialize>(&self, bucket: &str, id: &str, value: &T) -> Result<()> {
        let buf = encode(bucket, id, value)?;
        self.tree(bucket)?
            .insert(id.as_bytes(), buf)
            .map_err(|err| storage_error("create", bucket, err))?;
        Ok(())
    }

    /// Insert only when the key is new; `AlreadyExists` otherwise.
    pub fn create_if_absent<T: Serialize>(&self, bucket: &str, id: &str, value: &T) -> Result<()> {
        let buf = encode(bucket, id, value)?;
        let swapped = self
            .tree(bucket)?
            .compare_and_swap(id.as_bytes(), None::<&[u8]>, Some(buf))
            .map_err(|err| storage_error("create", bucket, err))?;
        match swapped {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::already_exists(resource(bucket), id)),
        }
    }

    pub fn get<T: DeserializeOwned>(&self, bucket: &str, id: &str) -> Result<T> {
        let raw = self
            .tree(bucket)?
            .get(id.as_bytes())
            .map_err(|err| storage_error("get", bucket, err))?
            .ok_or_else(|| Error::not_found(resource(bucket), id))?;
        decode(bucket, id, &raw)
    }

    /// Full scan in key-ascending order.
    pub fn list<T: DeserializeOwned>(&self, bucket: &str) -> Result<Vec<T>> {
        let tree = self.tree(bucket)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (key, raw) = entry.map_err(|err| storage_error("list", bucket, err))?;
            let id = String::from_utf8_lossy(&key);
            out.push(decode(bucket, &id, &raw)?);
        }
        Ok(out)
    }

    /// Replace an existing value; `NotFound` when the key is absent.
    pub fn update<T: Serialize>(&self, bucket: &str, id: &str, value: &T) -> Result<()> {
        let buf = encode(bucket, id, value)?;
        let result: std::result::Result<(), TransactionError<Error>> =
            self.tree(bucket)?.transaction(|tx| {
                if tx.get(id.as_bytes())?.is_none() {
                    return Err(ConflictableTransactionError::Abort(Error::not_found(
                        resource(bucket),
                        id,
                    )));
                }
                tx.insert(id.as_bytes(), buf.as_slice())?;
                Ok(())
            });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(storage_error("update", bucket, err)),
        }
    }

    /// Idempotent delete.
    pub fn delete(&self, bucket: &str, id: &str) -> Result<()> {
        self.tree(bucket)?
            .remove(id.as_bytes())
            .map_err(|err| storage_error("delete", bucket, err))?;
        Ok(())
    }

    pub fn exists(&self, bucket: &str, id: &str) -> Result<bool> {
        self.tree(bucket)?
            .contains_key(id.as_bytes())
            .map_err(|err| storage_error("exists", bucket, err))
    }

    /// Confirm the backing file is still usable with a cheap read.
    pub fn ping(&self) -> Result<()> {
        self.tree(APPLICATIONS)?
            .first()
            .map_err(|err| storage_error("ping", APPLICATIONS, err))?;
        Ok(())
    }

    fn tree(&self, bucket: &str) -> Result<sled::Tree> {
        // open_tree is a cache hit after open() created the buckets.
        self.db
            .open_tree(bucket)
            .map_err(|err| storage_error("open bucket", bucket, err))
    }
}

fn encode<T: Serialize>(bucket: &str, id: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| {
        Error::internal(format!("failed to encode {} {id}", resource(bucket))).with_source(err)
    })
}

fn decode<T: DeserializeOwned>(bucket: &str, id: &str, raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|err| {
        Error::internal(format!("failed to decode {} {id}", resource(bucket))).with_source(err)
    })
}

fn storage_error(op: &str, bucket: &str, err: sled::Error) -> Error {
    Error::internal(format!("store {op} on {bucket} failed")).with_source(err)
}

fn resource(bucket: &str) -> &str {
    bucket.trim_end_matches('s')
}

fn map_open_error(path: &Path, err: sled::Error) -> Error {
    match &err {
        sled::Error::Io(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            permission_denied(path)
        }
        _ => Error::internal(format!("failed to open database {}", path.display())).with_source(err),
    }
}

fn permission_denied(path: &Path) -> Error {
    Error::permission_denied(
        path.display().to_string(),
        "the database location is not writable by this process; \
         chown the directory to the service user, re-run with sudo, \
         or point --config at a writable database.path",
    )
}

/// Create the parent directory if needed and probe it for writability.
fn ensure_writable_parent(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };
    if let Err(err) = std::fs::create_dir_all(parent) {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            return Err(permission_denied(path));
        }
        return Err(
            Error::internal(format!("failed to create {}", parent.display())).with_source(err),
        );
    }
    let probe = parent.join(".simplify-write-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(permission_denied(path))
        }
        Err(err) => {
            Err(Error::internal(format!("failed to probe {}", parent.display())).with_source(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::resource::Application;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("simplify.db")).unwrap();
        (dir, store)
    }

    fn app(id: &str, name: &str) -> Application {
        Application {
            id: id.to_owned(),
            name: name.to_owned(),
            image: "nginx:latest".to_owned(),
            ports: BTreeMap::from([("8080".to_owned(), "80".to_owned())]),
            env: BTreeMap::new(),
            replicas: 1,
            proxy: None,
            container_id: String::new(),
            status: String::new(),
            port_bindings: BTreeMap::new(),
            ip_address: String::new(),
            networks: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn update_then_get_returns_the_new_value() {
        let (_dir, store) = open_temp();
        store.create(APPLICATIONS, "a1", &app("a1", "web")).unwrap();

        let mut changed = app("a1", "web");
        changed.image = "nginx:1.25".to_owned();
        store.update(APPLICATIONS, "a1", &changed).unwrap();

        let got: Application = store.get(APPLICATIONS, "a1").unwrap();
        assert_eq!(got, changed);
    }

    #[test]
    fn get_after_delete_is_not_found() {
        let (_dir, store) = open_temp();
        store.create(APPLICATIONS, "a1", &app("a1", "web")).unwrap();
        store.delete(APPLICATIONS, "a1").unwrap();

        let err = store.get::<Application>(APPLICATIONS, "a1").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.resource_id(), Some(("application", "a1")));

        // Idempotent: a second delete succeeds.
        store.delete(APPLICATIONS, "a1").unwrap();
    }

    #[test]
    fn create_if_absent_conflicts_on_existing_key() {
        let (_dir, store) = open_temp();
        store
            .create_if_absent(APPLICATIONS, "a1", &app("a1", "web"))
            .unwrap();
        let err = store
            .create_if_absent(APPLICATIONS, "a1", &app("a1", "web"))
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[test]
    fn update_missing_key_is_not_found() {
        let (_dir, store) = open_temp();
        let err = store.update(APPLICATIONS, "ghost", &app("ghost", "x")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_is_key_sorted_ascending() {
        let (_dir, store) = open_temp();
        for id in ["c", "a", "b"] {
            store.create(APPLICATIONS, id, &app(id, id)).unwrap();
        }
        let apps: Vec<Application> = store.list(APPLICATIONS).unwrap();
        let ids: Vec<&str> = apps.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn exists_and_ping() {
        let (_dir, store) = open_temp();
        assert!(!store.exists(APPLICATIONS, "a1").unwrap());
        store.create(APPLICATIONS, "a1", &app("a1", "web")).unwrap();
        assert!(store.exists(APPLICATIONS, "a1").unwrap());
        store.ping().unwrap();
    }

    #[test]
    fn buckets_are_isolated() {
        let (_dir, store) = open_temp();
        store.create(APPLICATIONS, "x", &app("x", "web")).unwrap();
        assert!(!store.exists(PODS, "x").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_directory_reports_permission_denied_with_remediation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        if std::fs::write(locked.join("root-check"), b"x").is_ok() {
            // Privileged user: the mode bits don't apply, nothing to assert.
            return;
        }

        let err = Store::open(&locked.join("simplify.db")).unwrap_err();
        assert!(err.is_permission_denied());
        let message = err.to_string();
        assert!(message.contains("chown"));
        assert!(message.contains("sudo"));
        assert!(message.contains("--config"));

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}
