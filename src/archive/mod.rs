//! Scratch space and archive normalization
//!
//! A fetched artifact is written to a run-scoped scratch directory and then
//! classified: a zip container is extracted and its first entry becomes the
//! image archive, anything else is used as the image archive directly.

pub mod extract;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{MoverError, Result};
use crate::fetch::{ArtifactOrigin, FetchedArtifact};

pub use extract::{ArchiveManifestEntry, extract_zip, resolve_entry_path};

const ARTIFACT_FILE: &str = "artifact";
const EXTRACTION_DIR: &str = "extracted";

/// How the fetched bytes were classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// A readable zip container; its entries were extracted.
    Zip,
    /// No zip signature; the bytes are used as the image archive.
    NotAZip,
    /// Starts like a zip but the zip reader rejected it. Treated like `NotAZip`.
    CorruptZip,
}

#[derive(Debug, Clone)]
pub struct NormalizedArchive {
    pub format: ArchiveFormat,
    /// The local docker-archive to hand to the transfer engine.
    pub archive_path: PathBuf,
    /// Every materialized path in archive order (empty unless `Zip`).
    pub extracted: Vec<PathBuf>,
}

/// A unique scratch directory owned by one run, removed on drop.
#[derive(Debug)]
pub struct ScratchSpace {
    dir: TempDir,
}

impl ScratchSpace {
    pub fn create_in(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| MoverError::io("create scratch root", e))?;
        let dir = tempfile::Builder::new()
            .prefix("image-mover-")
            .tempdir_in(root)
            .map_err(|e| MoverError::io("create scratch dir", e))?;
        debug!(path = %dir.path().display(), "allocated scratch space");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.path().join(ARTIFACT_FILE)
    }

    pub fn extraction_root(&self) -> PathBuf {
        self.dir.path().join(EXTRACTION_DIR)
    }

    /// Drain the download into the scratch artifact file.
    pub async fn materialize(&self, artifact: FetchedArtifact) -> Result<(PathBuf, u64)> {
        let path = self.artifact_path();
        let ArtifactOrigin::Network { url } = artifact.origin.clone();

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| MoverError::io("create artifact file", e))?;

        let mut written = 0u64;
        let mut stream = std::pin::pin!(artifact.into_stream());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MoverError::DownloadFailed {
                url: url.clone(),
                source: e.without_url(),
            })?;
            let chunk = chunk.as_ref();
            file.write_all(chunk)
                .await
                .map_err(|e| MoverError::io("write artifact file", e))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| MoverError::io("flush artifact file", e))?;

        info!(path = %path.display(), bytes = written, "artifact written to scratch");
        Ok((path, written))
    }
}

/// Resolve the image archive for the file at `artifact`.
///
/// Zip-open failures are logged and suppressed; the raw file is then the image
/// archive. Extraction failures after a zip was opened are fatal.
pub fn normalize(artifact: &Path, extraction_root: &Path) -> Result<NormalizedArchive> {
    let file = File::open(artifact).map_err(|e| MoverError::io("open artifact", e))?;

    let mut zip = match ZipArchive::new(file) {
        Ok(zip) => zip,
        Err(err) => {
            let format = if has_zip_signature(artifact)? {
                warn!(path = %artifact.display(), error = %err, "artifact looks like a zip but cannot be read, using it as is");
                ArchiveFormat::CorruptZip
            } else {
                debug!(path = %artifact.display(), error = %err, "artifact is not a zip");
                ArchiveFormat::NotAZip
            };
            return Ok(NormalizedArchive {
                format,
                archive_path: artifact.to_path_buf(),
                extracted: Vec::new(),
            });
        }
    };

    std::fs::create_dir_all(extraction_root)
        .map_err(|e| MoverError::io("create extraction root", e))?;
    let extracted = extract_zip(&mut zip, extraction_root)?;

    let archive_path = match extracted.first() {
        Some(first) => first.clone(),
        None => {
            info!("zip container is empty, using the artifact itself");
            artifact.to_path_buf()
        }
    };
    info!(
        entries = extracted.len(),
        archive = %archive_path.display(),
        "zip container extracted"
    );

    Ok(NormalizedArchive {
        format: ArchiveFormat::Zip,
        archive_path,
        extracted,
    })
}

fn has_zip_signature(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).map_err(|e| MoverError::io("open artifact", e))?;
    let mut read = 0;
    while read < magic.len() {
        match file.read(&mut magic[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) => return Err(MoverError::io("read artifact header", e)),
        }
    }
    Ok(read == magic.len()
        && magic.starts_with(b"PK")
        && matches!((magic[2], magic[3]), (3, 4) | (5, 6) | (7, 8)))
}
