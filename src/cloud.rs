// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cloud collaborator boundary: the thin trait the supervisor calls to
//! resolve camera descriptors and refresh credentials, decoupled from any
//! concrete HTTP client (the login protocol itself is out of scope).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::model::{Camera, Credential, MfaState};

/// Credentials supplied by the operator to start a login.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub two_factor_code: Option<String>,
}

/// Boundary the supervisor depends on; a concrete implementation talks to
/// the vendor's cloud API, out of scope here.
pub trait CloudCollaborator: Send + Sync {
    fn login(&self, creds: &LoginRequest) -> Result<Credential>;
    fn refresh(&self, cred: &Credential) -> Result<Credential>;
    fn list_cameras(&self, cred: &Credential) -> Result<Vec<Camera>>;
}

/// A collaborator that never reaches the network; useful for offline runs
/// and as the base for tests. Returns [`BridgeError::Collaborator`] for
/// anything beyond listing whatever was pre-seeded.
pub struct StaticCloudCollaborator {
    pub cameras: Vec<Camera>,
}

impl CloudCollaborator for StaticCloudCollaborator {
    fn login(&self, _creds: &LoginRequest) -> Result<Credential> {
        Err(BridgeError::Collaborator("static collaborator has no login capability".into()))
    }

    fn refresh(&self, cred: &Credential) -> Result<Credential> {
        Ok(cred.clone())
    }

    fn list_cameras(&self, _cred: &Credential) -> Result<Vec<Camera>> {
        Ok(self.cameras.clone())
    }
}

/// Decorates any [`CloudCollaborator`] with an on-disk JSON cache keyed by
/// name, mirroring the upstream bridge's pickle-cache-or-fetch pattern for
/// its camera list and credential cache (`cameras.py::authWyze`), using
/// `serde_json` in place of pickle.
pub struct FileCacheCloudCollaborator<T> {
    inner: T,
    cache_dir: PathBuf,
    /// When true, cached blobs are ignored and the inner collaborator is
    /// always consulted (the `FRESH_DATA` environment convention).
    fresh_data: bool,
}

impl<T: CloudCollaborator> FileCacheCloudCollaborator<T> {
    pub fn new(inner: T, cache_dir: PathBuf, fresh_data: bool) -> Self {
        FileCacheCloudCollaborator { inner, cache_dir, fresh_data }
    }

    fn cache_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.json"))
    }

    fn read_cache<D: serde::de::DeserializeOwned>(&self, name: &str) -> Option<D> {
        if self.fresh_data {
            return None;
        }
        let path = self.cache_path(name);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(name, error = %e, "ignoring corrupt cache blob");
                None
            }
        }
    }

    fn write_cache<S: serde::Serialize>(&self, name: &str, value: &S) {
        if let Err(e) = fs::create_dir_all(&self.cache_dir) {
            warn!(error = %e, "failed to create cache directory");
            return;
        }
        let path = self.cache_path(name);
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                if let Err(e) = write_atomic(&path, &bytes) {
                    warn!(name, error = %e, "failed to write cache blob");
                }
            }
            Err(e) => warn!(name, error = %e, "failed to serialize cache blob"),
        }
    }
}

impl<T: CloudCollaborator> CloudCollaborator for FileCacheCloudCollaborator<T> {
    fn login(&self, creds: &LoginRequest) -> Result<Credential> {
        let cred = self.inner.login(creds)?;
        if cred.mfa.is_some() {
            debug!("login pending MFA, not caching credential");
            return Ok(cred);
        }
        self.write_cache("credential", &cred);
        Ok(cred)
    }

    fn refresh(&self, cred: &Credential) -> Result<Credential> {
        let refreshed = self.inner.refresh(cred)?;
        self.write_cache("credential", &refreshed);
        Ok(refreshed)
    }

    fn list_cameras(&self, cred: &Credential) -> Result<Vec<Camera>> {
        if let Some(cached) = self.read_cache::<Vec<Camera>>("cameras") {
            debug!("serving camera list from cache");
            return Ok(cached);
        }
        let cameras = self.inner.list_cameras(cred)?;
        self.write_cache("cameras", &cameras);
        Ok(cameras)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Constructs the [`MfaState`] the caller should surface to the operator
/// when a login attempt needs a second factor, mirroring
/// `cameras.py::twofactor`'s prompt loop.
pub fn pending_mfa(kind: &str, verification_id: &str) -> MfaState {
    MfaState { kind: kind.to_string(), verification_id: verification_id.to_string(), code: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct StubCollaborator;
    impl CloudCollaborator for StubCollaborator {
        fn login(&self, _creds: &LoginRequest) -> Result<Credential> {
            Ok(Credential {
                access_token: "tok".into(),
                refresh_token: "ref".into(),
                user_id: "u1".into(),
                phone_id: "p1".into(),
                mfa: None,
            })
        }
        fn refresh(&self, cred: &Credential) -> Result<Credential> {
            Ok(cred.clone())
        }
        fn list_cameras(&self, _cred: &Credential) -> Result<Vec<Camera>> {
            Ok(vec![])
        }
    }

    #[test]
    fn caches_camera_list_to_disk() {
        let dir = tempdir().unwrap();
        let collaborator = FileCacheCloudCollaborator::new(StubCollaborator, dir.path().to_path_buf(), false);
        let cred = collaborator.login(&LoginRequest { email: "a".into(), password: "b".into(), two_factor_code: None }).unwrap();
        let _ = collaborator.list_cameras(&cred).unwrap();
        assert!(dir.path().join("cameras.json").exists());
    }

    #[test]
    fn fresh_data_bypasses_cache() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join("cameras.json"), b"[]").unwrap();
        let collaborator = FileCacheCloudCollaborator::new(StubCollaborator, dir.path().to_path_buf(), true);
        assert!(collaborator.read_cache::<Vec<Camera>>("cameras").is_none());
    }
}
