pub mod container;
pub mod fs;
pub mod shell;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};
use tracing::{debug, warn};

use container::ContainerFile;
use fs::{Config, FileSystem, LookupScope};

/// A [`FileSystem`] bound to the snapshot file it is saved to.
#[derive(Debug)]
pub struct Volume {
    path: PathBuf,
    fs: FileSystem,
}

impl Volume {
    /// Writes a snapshot of a freshly formatted file system to `path`.
    pub fn create(path: impl AsRef<Path>, config: Config) -> Result<()> {
        let path = path.as_ref();
        debug!("Creating volume at {path:?}");
        let parent = match path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => Path::new("."),
        };
        ensure!(parent.is_dir(), "target file location has no parent directory");
        ensure!(!path.exists(), "target file location already exists");
        let fs = FileSystem::new(config)?;
        ContainerFile::save(&fs, path)
    }

    pub fn open(path: impl AsRef<Path>, lookup: LookupScope) -> Result<Self> {
        let path = path.as_ref();
        let fs = ContainerFile::load(path)?.with_lookup_scope(lookup);
        Ok(Self {
            path: path.to_owned(),
            fs,
        })
    }

    /// Opens the snapshot at `path`, starting from an empty file system
    /// built from `config` if it is missing or unreadable.
    pub fn open_or_format(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            match Self::open(path, config.lookup) {
                Ok(volume) => return Ok(volume),
                Err(err) => warn!("Couldn't load snapshot {path:?}, starting empty: {err:#}"),
            }
        } else {
            debug!("No snapshot at {path:?}, starting empty");
        }
        Ok(Self {
            path: path.to_owned(),
            fs: FileSystem::new(config)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut FileSystem {
        &mut self.fs
    }

    /// Saves the current state to the volume's snapshot.
    pub fn sync(&self) -> Result<()> {
        ContainerFile::save(&self.fs, &self.path)
    }
}

#[cfg(test)]
fn small_config() -> Config {
    Config {
        block_size: 512,
        block_count: 32,
        ..Config::default()
    }
}

#[test]
fn test_create_refuses_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.snapshot");
    Volume::create(&path, small_config()).unwrap();
    assert!(Volume::create(&path, small_config()).is_err());
    assert!(Volume::create(dir.path().join("missing/vol"), small_config()).is_err());
    let volume = Volume::open(&path, LookupScope::Local).unwrap();
    assert_eq!(volume.fs().space_usage(), (32 * 512, 0));
    assert_eq!(volume.fs().lookup_scope(), LookupScope::Local);
}

#[test]
fn test_sync_persists_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.snapshot");
    let mut volume = Volume::open_or_format(&path, small_config()).unwrap();
    let fs = volume.fs_mut();
    fs.make_directory("docs").unwrap();
    fs.change_directory("docs").unwrap();
    fs.create_file("readme").unwrap();
    fs.write_file("readme", b"persisted").unwrap();
    volume.sync().unwrap();

    let mut reopened = Volume::open_or_format(&path, Config::default()).unwrap();
    let fs = reopened.fs_mut();
    assert_eq!(fs.current_path(), "/docs");
    assert_eq!(fs.read_file("readme").unwrap(), b"persisted");
    // geometry comes from the snapshot, not the config
    assert_eq!(fs.space_usage(), (32 * 512, 9));
}

#[test]
fn test_corrupt_snapshot_falls_back_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vol.snapshot");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();
    assert!(Volume::open(&path, LookupScope::Global).is_err());
    let volume = Volume::open_or_format(&path, small_config()).unwrap();
    assert_eq!(volume.fs().space_usage(), (32 * 512, 0));
    assert_eq!(volume.path(), path);
}
