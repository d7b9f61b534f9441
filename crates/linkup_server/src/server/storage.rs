#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tracing::debug;

/// Object storage boundary. The gateway only ever stores and deletes whole
/// objects; presigned access and serving are someone else's problem.
#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;

	/// Deleting an absent key is a no-op.
	async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Filesystem-backed store rooted at the configured uploads directory.
pub struct LocalObjectStore {
	root: PathBuf,
}

impl LocalObjectStore {
	pub fn new(root: PathBuf) -> Self {
		Self { root }
	}

	fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
		if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
			return Err(anyhow!("invalid object key: {key}"));
		}
		Ok(self.root.join(key))
	}
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
	async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
		let path = self.resolve(key)?;
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.with_context(|| format!("create object dir {}", parent.display()))?;
		}

		tokio::fs::write(&path, bytes)
			.await
			.with_context(|| format!("write object {}", path.display()))?;

		debug!(key, len = bytes.len(), "object stored");
		Ok(())
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		let path = self.resolve(key)?;
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(anyhow!(e).context(format!("delete object {}", path.display()))),
		}
	}
}
