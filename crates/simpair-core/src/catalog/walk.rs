use super::{ItemCatalog, ItemRecord};
use crate::config::AppConfig;
use crate::error::Error;
use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Create the metadata, cache and output directories if they are missing.
pub fn ensure_layout(config: &AppConfig) -> Result<(), Error> {
    for dir in [config.meta_path(), config.cache_path(), config.output_path()] {
        if !dir.is_dir() {
            fs::create_dir_all(&dir).map_err(|err| {
                io::Error::new(
                    err.kind(),
                    format!("Error creating directory {}: {}", dir.display(), err),
                )
            })?;
            debug!("Created directory {}", dir.display());
        }
    }
    Ok(())
}

/// Scan the configured image folders (plus every album subfolder) into a
/// catalog ordered by id. Each folder is read one level deep, in parallel.
/// A file whose size cannot be read is logged and left out.
pub fn scan(config: &AppConfig) -> Result<ItemCatalog, Error> {
    ensure_layout(config)?;

    let root = config.root_path();
    let folders = image_folders(&root, config);
    debug!("Scanning {} image folders", folders.len());

    let extensions: Vec<String> = config
        .extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_lowercase())
        .collect();

    let ignore_patterns: Vec<Pattern> = config
        .ignore_patterns
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect();

    let map: DashMap<String, ItemRecord> = DashMap::new();

    folders
        .par_iter()
        .try_for_each(|folder| visit_folder(&root, folder, &extensions, &ignore_patterns, &map))?;

    let records: Vec<ItemRecord> = map.into_iter().map(|(_, record)| record).collect();
    Ok(ItemCatalog::from_records(records))
}

fn image_folders(root: &Path, config: &AppConfig) -> Vec<PathBuf> {
    let mut folders: Vec<PathBuf> = config.image_dirs.iter().map(|dir| root.join(dir)).collect();

    let albums = root.join(&config.albums_dir);
    if albums.is_dir() {
        let mut album_folders: Vec<PathBuf> = WalkDir::new(&albums)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    error!("Error reading albums folder {}: {}", albums.display(), err);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_dir())
            .map(|entry| entry.into_path())
            .collect();
        album_folders.sort();
        folders.extend(album_folders);
    }

    folders
}

fn visit_folder(
    root: &Path,
    folder: &Path,
    extensions: &[String],
    ignore_patterns: &[Pattern],
    map: &DashMap<String, ItemRecord>,
) -> Result<(), Error> {
    if !folder.is_dir() {
        warn!("Image folder {} does not exist, skipping", folder.display());
        return Ok(());
    }

    if ignore_patterns.iter().any(|pattern| pattern.matches_path(folder)) {
        return Ok(());
    }

    for entry in WalkDir::new(folder).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(|e| e.kind()) == Some(io::ErrorKind::PermissionDenied) {
                    error!("Access denied reading {}: {}", folder.display(), err);
                    continue;
                }
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Error reading directory {}: {}", folder.display(), err),
                )));
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !has_allowed_extension(path, extensions) {
            continue;
        }
        if ignore_patterns.iter().any(|pattern| pattern.matches_path(path)) {
            continue;
        }

        let byte_size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                error!("Error getting metadata for {}: {}", path.display(), err);
                continue;
            }
        };

        let id = item_id(root, path);
        let display_name = entry.file_name().to_string_lossy().into_owned();
        map.entry(id.clone())
            .or_insert_with(|| ItemRecord::new(id, display_name, byte_size));
    }

    Ok(())
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .map(|ext| extensions.iter().any(|allowed| *allowed == ext))
        .unwrap_or(false)
}

/// Root-relative path with `/` separators, so checkpoints survive moving the
/// collection.
fn item_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_scan_filters_extensions_and_merges_albums() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("Images/b.JPG"), b"bb");
        write(&root.join("Images/a.png"), b"a");
        write(&root.join("Images/notes.txt"), b"skip me");
        write(&root.join("Albums/trip/c.gif"), b"ccc");
        write(&root.join("Albums/trip/nested/d.png"), b"nested is not scanned");
        write(&root.join("Albums/stray.jpg"), b"file directly under albums");

        let config = AppConfig::default().with_root(root.to_string_lossy());
        let catalog = scan(&config).unwrap();

        let ids: Vec<&str> = catalog.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["Albums/trip/c.gif", "Images/a.png", "Images/b.JPG"]);
        assert_eq!(catalog.get("Images/b.JPG").unwrap().byte_size, 2);
        assert_eq!(catalog.get("Albums/trip/c.gif").unwrap().display_name, "c.gif");

        assert!(root.join("meta").is_dir());
        assert!(root.join("meta/.cache").is_dir());
    }

    #[test]
    fn test_scan_honours_ignore_patterns() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        write(&root.join("Images/keep.jpg"), b"k");
        write(&root.join("Images/thumb_skip.jpg"), b"s");

        let config = AppConfig {
            ignore_patterns: vec!["*thumb_*".to_string()],
            ..AppConfig::default().with_root(root.to_string_lossy())
        };
        let catalog = scan(&config).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("Images/keep.jpg").is_some());
    }

    #[test]
    fn test_missing_image_folder_yields_empty_catalog() {
        let tmp = tempdir().unwrap();
        let config = AppConfig::default().with_root(tmp.path().to_string_lossy());
        let catalog = scan(&config).unwrap();
        assert!(catalog.is_empty());
    }
}
