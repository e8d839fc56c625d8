use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Invalid category tag {0:?}")]
	InvalidTag(String),
	#[error("Failed to create cache directory {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// One subdirectory per category tag beneath a cache root.
///
/// Resolution only ensures the directory exists. Writing files into it and evicting them is up
/// to the caller.
#[derive(Debug, Clone)]
pub struct CacheLayout {
	root: PathBuf,
}

/// An existing directory returned by [`CacheLayout::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirectory {
	tag: String,
	path: PathBuf,
}

impl CacheDirectory {
	pub fn tag(&self) -> &str {
		&self.tag
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn into_path(self) -> PathBuf {
		self.path
	}
}

impl CacheLayout {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	/// Path of the directory for `tag`, without touching the filesystem.
	pub fn path_of(&self, tag: &str) -> Result<PathBuf, CacheError> {
		let valid = !tag.is_empty()
			&& tag
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
		if !valid {
			return Err(CacheError::InvalidTag(String::from(tag)));
		}
		Ok(self.root.join(tag))
	}

	/// Ensures the directory for `tag` exists and returns it. Idempotent.
	pub async fn resolve(&self, tag: &str) -> Result<CacheDirectory, CacheError> {
		let path = self.path_of(tag)?;
		tokio::fs::create_dir_all(&path)
			.await
			.map_err(|source| CacheError::Io {
				path: path.clone(),
				source,
			})?;
		debug!(tag, path = %path.display(), "Resolved cache directory");
		Ok(CacheDirectory {
			tag: String::from(tag),
			path,
		})
	}
}
