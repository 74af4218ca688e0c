//! Package source resolution for `install_package_by_url`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PackageSource {
    /// Plain HTTP(S) download: http://releases.example.com/blog-1.2.0.zip
    Http { url: String },
    /// Local archive: file:///srv/packages/blog.zip or ./blog.zip
    File { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported package source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid package source: {0}")]
    InvalidUri(String),
}

impl PackageSource {
    pub fn parse(uri: &str) -> Result<Self, SourceError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(SourceError::InvalidUri(uri.to_string()));
        }
        if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(PackageSource::Http { url: uri.to_string() })
        } else if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SourceError::InvalidUri(uri.to_string()));
            }
            Ok(PackageSource::File { path: PathBuf::from(path) })
        } else if uri.starts_with("./") || uri.starts_with('/') || uri.ends_with(".zip") {
            Ok(PackageSource::File { path: PathBuf::from(uri) })
        } else {
            Err(SourceError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            PackageSource::Http { url } if url.starts_with("https://") => "https",
            PackageSource::Http { .. } => "http",
            PackageSource::File { .. } => "file",
        }
    }
}
