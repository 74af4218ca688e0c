//! Zip package reader.
//!
//! A package archive carries `manifest.json` at its root:
//!
//! ```json
//! { "name": "blog", "version": "1.2.0", "route_option": { "router_type": "simple" } }
//! ```
//!
//! Every other regular file is stored inline under its archive path.

use std::io::{Cursor, Read};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use spacegrid_state::RouteConfig;

use crate::error::{EngineError, EngineResult};

pub const MANIFEST_FILE: &str = "manifest.json";

static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("package name regex"));

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    version: String,
    #[serde(default)]
    route_option: RouteConfig,
}

/// A validated archive, ready to be stored.
#[derive(Debug)]
pub struct PackageBundle {
    pub name: String,
    pub version: semver::Version,
    pub route_option: RouteConfig,
    /// Hex sha256 of the archive bytes.
    pub checksum: String,
    pub files: Vec<(String, Vec<u8>)>,
}

pub fn read_package(bytes: &[u8]) -> EngineResult<PackageBundle> {
    let checksum = hex::encode(Sha256::digest(bytes));
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    let mut manifest = None;
    let mut files = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let path = entry
            .enclosed_name()
            .and_then(|p| p.to_str())
            .map(|p| p.replace('\\', "/"))
            .ok_or_else(|| EngineError::Install(format!("unsafe path in archive: {}", entry.name())))?;

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| EngineError::Install(format!("read {path}: {e}")))?;

        if path == MANIFEST_FILE {
            manifest = Some(data);
        } else {
            files.push((path, data));
        }
    }

    let manifest = manifest.ok_or_else(|| EngineError::Install(format!("archive has no {MANIFEST_FILE}")))?;
    let manifest: Manifest = serde_json::from_slice(&manifest)
        .map_err(|e| EngineError::Validation(format!("invalid {MANIFEST_FILE}: {e}")))?;

    if !PACKAGE_NAME.is_match(&manifest.name) {
        return Err(EngineError::Validation(format!(
            "invalid package name {:?}",
            manifest.name
        )));
    }
    let version = semver::Version::parse(&manifest.version)
        .map_err(|e| EngineError::Validation(format!("invalid version {:?}: {e}", manifest.version)))?;

    Ok(PackageBundle {
        name: manifest.name,
        version,
        route_option: manifest.route_option,
        checksum,
        files,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Build an in-memory zip from `(path, contents)` pairs.
    pub(crate) fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        for (path, contents) in entries {
            zip.start_file(*path, options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_manifest_and_files() {
        let bytes = zip_of(&[
            (MANIFEST_FILE, r#"{"name":"blog","version":"1.2.0"}"#),
            ("public/index.html", "<h1>hi</h1>"),
        ]);
        let bundle = read_package(&bytes).unwrap();
        assert_eq!(bundle.name, "blog");
        assert_eq!(bundle.version, semver::Version::new(1, 2, 0));
        assert_eq!(bundle.files.len(), 1);
        assert_eq!(bundle.files[0].0, "public/index.html");
        assert_eq!(bundle.checksum.len(), 64);
    }

    #[test]
    fn missing_manifest_is_rejected() {
        let bytes = zip_of(&[("index.html", "x")]);
        assert!(matches!(read_package(&bytes), Err(EngineError::Install(_))));
    }

    #[test]
    fn bad_name_and_version_are_rejected() {
        let bad_name = zip_of(&[(MANIFEST_FILE, r#"{"name":"Bad Name","version":"1.0.0"}"#)]);
        assert!(matches!(read_package(&bad_name), Err(EngineError::Validation(_))));

        let bad_version = zip_of(&[(MANIFEST_FILE, r#"{"name":"blog","version":"one"}"#)]);
        assert!(matches!(read_package(&bad_version), Err(EngineError::Validation(_))));
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let bytes = zip_of(&[
            (MANIFEST_FILE, r#"{"name":"blog","version":"1.0.0"}"#),
            ("../escape.txt", "x"),
        ]);
        assert!(matches!(read_package(&bytes), Err(EngineError::Install(_))));
    }

    #[test]
    fn garbage_is_not_a_zip() {
        assert!(read_package(b"definitely not a zip").is_err());
    }
}
