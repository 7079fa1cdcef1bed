//! Drive folders mirrored on the local filesystem.
//!
//! Each shared folder maps to `<root>/<drive_folder_id>`. File ids are the
//! `/`-separated paths relative to that directory.

use anyhow::{bail, Context};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use super::{DriveFile, DriveSource};
use crate::db::SharedFolder;

const IMAGE_TYPES: [(&str, &str); 10] = [
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
];

/// Image mime type for a path, from its extension.
pub fn mime_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_string_lossy().to_lowercase();
    IMAGE_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

pub struct LocalDriveSource {
    root: PathBuf,
}

impl LocalDriveSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn folder_dir(&self, folder: &SharedFolder) -> anyhow::Result<PathBuf> {
        let relative = plain_relative(&folder.drive_folder_id)
            .with_context(|| format!("invalid drive folder id {:?}", folder.drive_folder_id))?;
        Ok(self.root.join(relative))
    }
}

/// Accept only plain relative paths: no root, no `..`, not empty.
fn plain_relative(s: &str) -> anyhow::Result<&Path> {
    let path = Path::new(s);
    if s.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("not a plain relative path");
    }
    Ok(path)
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl DriveSource for LocalDriveSource {
    fn list_images(&self, folder: &SharedFolder) -> anyhow::Result<Vec<DriveFile>> {
        let dir = self.folder_dir(folder)?;
        if !dir.is_dir() {
            bail!("drive folder {:?} not found", dir);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(mime_type) = mime_type_for(path) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(&dir) else {
                continue;
            };
            files.push(DriveFile {
                id: slash_path(relative),
                name: entry.file_name().to_string_lossy().into_owned(),
                mime_type: mime_type.to_string(),
                folder_path: relative.parent().map(slash_path).unwrap_or_default(),
            });
        }

        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    fn download(&self, folder: &SharedFolder, drive_file_id: &str) -> anyhow::Result<Vec<u8>> {
        let dir = self.folder_dir(folder)?;
        let relative = plain_relative(drive_file_id)
            .with_context(|| format!("invalid drive file id {:?}", drive_file_id))?;
        let path = dir.join(relative);
        std::fs::read(&path).with_context(|| format!("failed to read {:?}", path))
    }
}
