//! Volume holder.
//!
//! Volumes are path-identified storage attachments. The holder owns
//! them exclusively; containers are coupled through links only. A link
//! marked *required* ties the volume's lifetime to the container: when
//! that container is destroyed, the volume goes with it.

use std::path::PathBuf;

use porto_error::{EError, PortoError, Result};

use crate::cred::Cred;

/// One container link of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLink {
    pub container: String,
    pub target: PathBuf,
    pub read_only: bool,
    pub required: bool,
}

/// A storage volume.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Client-visible identifier.
    pub path: String,
    pub source: String,
    pub quota: u64,
    pub flags: String,
    pub creds: Cred,
    pub links: Vec<VolumeLink>,
}

impl Volume {
    /// Verifies the caller may mutate this volume.
    ///
    /// # Errors
    ///
    /// Returns `Permission` for callers other than the creator or root.
    pub fn check_permission(&self, cred: Cred) -> Result<()> {
        if cred.is_root() || cred.uid == self.creds.uid {
            Ok(())
        } else {
            Err(PortoError::permission(format!(
                "volume {} belongs to {}",
                self.path, self.creds
            )))
        }
    }
}

/// Storage driver seam.
///
/// The real driver (quota setup, filesystem preparation) is an external
/// collaborator; the daemon only needs create and destroy.
pub trait VolumeBackend: Send + Sync {
    /// Prepares backing storage for a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be prepared.
    fn create(&self, volume: &Volume) -> Result<()>;

    /// Releases backing storage.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be released.
    fn destroy(&self, volume: &Volume) -> Result<()>;
}

/// Directory-per-volume backend under a fixed root.
pub struct LocalVolumeBackend {
    root: PathBuf,
}

impl LocalVolumeBackend {
    /// Creates the backend rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn volume_dir(&self, volume: &Volume) -> PathBuf {
        self.root.join(crate::name::escape_name(&volume.path))
    }
}

impl VolumeBackend for LocalVolumeBackend {
    fn create(&self, volume: &Volume) -> Result<()> {
        let dir = self.volume_dir(volume);
        std::fs::create_dir_all(&dir)
            .map_err(|e| PortoError::unknown(format!("can't create volume dir: {e}")))
    }

    fn destroy(&self, volume: &Volume) -> Result<()> {
        let dir = self.volume_dir(volume);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortoError::unknown(format!("can't remove volume dir: {e}"))),
        }
    }
}

/// The authoritative volume registry.
pub struct VolumeHolder {
    volumes: std::collections::HashMap<String, Volume>,
    backend: Box<dyn VolumeBackend>,
}

impl VolumeHolder {
    /// Creates an empty holder over a backend.
    #[must_use]
    pub fn new(backend: Box<dyn VolumeBackend>) -> Self {
        Self {
            volumes: std::collections::HashMap::new(),
            backend,
        }
    }

    /// Creates a volume.
    ///
    /// # Errors
    ///
    /// Returns `VolumeAlreadyExists` for a duplicate path or a backend
    /// failure.
    pub fn create(
        &mut self,
        path: &str,
        source: &str,
        quota: u64,
        flags: &str,
        cred: Cred,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(PortoError::invalid_value("volume path is empty"));
        }
        if self.volumes.contains_key(path) {
            return Err(PortoError::new(
                EError::VolumeAlreadyExists,
                format!("volume {path} already exists"),
            ));
        }

        let volume = Volume {
            path: path.to_string(),
            source: source.to_string(),
            quota,
            flags: flags.to_string(),
            creds: cred,
            links: Vec::new(),
        };
        self.backend.create(&volume)?;

        tracing::info!(volume = path, "volume created");
        self.volumes.insert(path.to_string(), volume);
        Ok(())
    }

    /// Returns a volume by path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Volume> {
        self.volumes.get(path)
    }

    /// All volumes, sorted by path.
    #[must_use]
    pub fn list(&self) -> Vec<&Volume> {
        let mut volumes: Vec<&Volume> = self.volumes.values().collect();
        volumes.sort_by(|a, b| a.path.cmp(&b.path));
        volumes
    }

    /// Destroys a volume.
    ///
    /// # Errors
    ///
    /// Returns `VolumeDoesNotExist` for an unknown path; no dereference
    /// happens before the lookup check.
    pub fn destroy(&mut self, path: &str) -> Result<()> {
        let Some(volume) = self.volumes.remove(path) else {
            return Err(PortoError::no_volume(path));
        };
        self.backend.destroy(&volume)?;
        tracing::info!(volume = path, "volume destroyed");
        Ok(())
    }

    /// Links a volume into a container.
    ///
    /// # Errors
    ///
    /// Returns `VolumeAlreadyLinked` when the pair already exists.
    pub fn link(
        &mut self,
        path: &str,
        container: &str,
        target: PathBuf,
        read_only: bool,
        required: bool,
    ) -> Result<()> {
        let volume = self
            .volumes
            .get_mut(path)
            .ok_or_else(|| PortoError::no_volume(path))?;

        if volume.links.iter().any(|l| l.container == container) {
            return Err(PortoError::new(
                EError::VolumeAlreadyLinked,
                format!("volume {path} is already linked to {container}"),
            ));
        }

        volume.links.push(VolumeLink {
            container: container.to_string(),
            target,
            read_only,
            required,
        });
        Ok(())
    }

    /// Removes a volume→container link.
    ///
    /// # Errors
    ///
    /// Returns `VolumeNotLinked` when no such link exists.
    pub fn unlink(&mut self, path: &str, container: &str) -> Result<()> {
        let volume = self
            .volumes
            .get_mut(path)
            .ok_or_else(|| PortoError::no_volume(path))?;

        let before = volume.links.len();
        volume.links.retain(|l| l.container != container);
        if volume.links.len() == before {
            return Err(PortoError::new(
                EError::VolumeNotLinked,
                format!("volume {path} is not linked to {container}"),
            ));
        }
        Ok(())
    }

    /// Reacts to a container being destroyed: volumes required by it are
    /// destroyed, other links are dropped.
    ///
    /// Returns the paths of destroyed volumes.
    pub fn container_destroyed(&mut self, container: &str) -> Vec<String> {
        let doomed: Vec<String> = self
            .volumes
            .values()
            .filter(|v| {
                v.links
                    .iter()
                    .any(|l| l.container == container && l.required)
            })
            .map(|v| v.path.clone())
            .collect();

        for path in &doomed {
            if let Err(e) = self.destroy(path) {
                tracing::warn!(volume = %path, "can't destroy required volume: {e}");
            }
        }

        for volume in self.volumes.values_mut() {
            volume.links.retain(|l| l.container != container);
        }
        doomed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;
    impl VolumeBackend for NullBackend {
        fn create(&self, _: &Volume) -> Result<()> {
            Ok(())
        }
        fn destroy(&self, _: &Volume) -> Result<()> {
            Ok(())
        }
    }

    fn holder() -> VolumeHolder {
        VolumeHolder::new(Box::new(NullBackend))
    }

    #[test]
    fn create_and_duplicate() {
        let mut vh = holder();
        vh.create("/place/v1", "", 0, "", Cred::new(1000, 1000))
            .unwrap();
        let err = vh
            .create("/place/v1", "", 0, "", Cred::new(1000, 1000))
            .unwrap_err();
        assert_eq!(err.code, EError::VolumeAlreadyExists);
    }

    #[test]
    fn destroy_unknown_returns_typed_error() {
        let mut vh = holder();
        let err = vh.destroy("/nope").unwrap_err();
        assert_eq!(err.code, EError::VolumeDoesNotExist);
    }

    #[test]
    fn link_unlink_cycle() {
        let mut vh = holder();
        vh.create("/v", "", 0, "", Cred::root()).unwrap();

        vh.link("/v", "a", PathBuf::from("/data"), false, false)
            .unwrap();
        let err = vh
            .link("/v", "a", PathBuf::from("/data2"), false, false)
            .unwrap_err();
        assert_eq!(err.code, EError::VolumeAlreadyLinked);

        vh.unlink("/v", "a").unwrap();
        let err = vh.unlink("/v", "a").unwrap_err();
        assert_eq!(err.code, EError::VolumeNotLinked);
    }

    #[test]
    fn required_link_couples_lifetime() {
        let mut vh = holder();
        vh.create("/required", "", 0, "", Cred::root()).unwrap();
        vh.create("/optional", "", 0, "", Cred::root()).unwrap();
        vh.link("/required", "a", PathBuf::from("/r"), false, true)
            .unwrap();
        vh.link("/optional", "a", PathBuf::from("/o"), false, false)
            .unwrap();

        let destroyed = vh.container_destroyed("a");
        assert_eq!(destroyed, vec!["/required".to_string()]);
        assert!(vh.get("/required").is_none());

        let optional = vh.get("/optional").unwrap();
        assert!(optional.links.is_empty());
    }

    #[test]
    fn permission_checks() {
        let mut vh = holder();
        vh.create("/v", "", 0, "", Cred::new(1000, 1000)).unwrap();
        let volume = vh.get("/v").unwrap();
        assert!(volume.check_permission(Cred::root()).is_ok());
        assert!(volume.check_permission(Cred::new(1000, 1000)).is_ok());
        assert!(volume.check_permission(Cred::new(1001, 1001)).is_err());
    }
}
