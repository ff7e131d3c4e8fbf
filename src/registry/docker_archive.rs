//! Reading images out of docker-archive tarballs
//!
//! A docker-archive is what `docker save` produces: a tar with a top-level
//! `manifest.json` listing, per image, the config file and the layer tarballs.
//! Blobs are staged to disk in a single pass over the tar so that layers are
//! never held in memory whole.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::debug;

use crate::registry::error::{RegistryError, Result};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveImage {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// A blob staged on disk, ready to be pushed.
#[derive(Debug, Clone)]
pub struct Blob {
    pub digest: String,
    pub media_type: &'static str,
    pub size: u64,
    pub path: PathBuf,
}

/// Config and layers of one image, in manifest order.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub config: Blob,
    pub layers: Vec<Blob>,
}

pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Writer that digests and counts everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(mut self) -> io::Result<(String, u64)> {
        self.inner.flush()?;
        Ok((
            format!("sha256:{}", hex::encode(self.hasher.finalize())),
            self.written,
        ))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `target`, gzip-compressing it first when `compress` is
/// set and the content is not already gzip.
pub(crate) fn stage_blob(
    mut reader: impl Read,
    target: &Path,
    media_type: &'static str,
    compress: bool,
) -> Result<Blob> {
    let mut head = [0u8; 2];
    let head_len = read_up_to(&mut reader, &mut head)?;
    let mut reader = (&head[..head_len]).chain(reader);

    let mut writer = HashingWriter::new(BufWriter::new(File::create(target)?));
    if compress && !is_gzipped(&head[..head_len]) {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        writer = encoder.finish()?;
    } else {
        io::copy(&mut reader, &mut writer)?;
    }
    let (digest, size) = writer.finish()?;

    Ok(Blob {
        digest,
        media_type,
        size,
        path: target.to_path_buf(),
    })
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[derive(Debug)]
pub struct DockerArchive {
    path: PathBuf,
    image: ArchiveImage,
}

impl DockerArchive {
    /// Open `path` and read its manifest. Exactly one image must be present.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest = read_entry(path, "manifest.json")?.ok_or_else(|| {
            RegistryError::ImageParsing(format!(
                "{} is not a docker-archive: manifest.json not found",
                path.display()
            ))
        })?;

        let mut images: Vec<ArchiveImage> = serde_json::from_slice(&manifest)?;
        let image = match images.len() {
            1 => images.remove(0),
            0 => {
                return Err(RegistryError::ImageParsing(
                    "archive manifest lists no images".to_string(),
                ));
            }
            n => {
                return Err(RegistryError::ImageParsing(format!(
                    "archive contains {} images, expected exactly one",
                    n
                )));
            }
        };

        debug!(
            path = %path.display(),
            config = %image.config,
            layers = image.layers.len(),
            tags = ?image.repo_tags,
            "read docker-archive manifest"
        );

        Ok(Self {
            path: path.to_path_buf(),
            image,
        })
    }

    /// Stage the config and every layer into `dir` in one pass over the tar.
    /// Raw layers are gzip-compressed on the way; a layer listed twice is
    /// staged once.
    pub fn stage_blobs(&self, dir: &Path) -> Result<StagedImage> {
        let config_name = entry_name(&self.image.config);
        let layer_names: Vec<String> = self.image.layers.iter().map(|layer| entry_name(layer)).collect();

        let mut config = None;
        let mut layers: HashMap<String, Blob> = HashMap::new();

        let mut archive = Archive::new(File::open(&self.path)?);
        for entry in archive.entries()? {
            let entry = entry?;
            let name = entry_name(&entry.path()?.to_string_lossy());

            if name == config_name && config.is_none() {
                config = Some(stage_blob(entry, &dir.join("config"), MEDIA_TYPE_CONFIG, false)?);
            } else if layer_names.contains(&name) && !layers.contains_key(&name) {
                let target = dir.join(format!("layer-{}", layers.len()));
                let blob = stage_blob(entry, &target, MEDIA_TYPE_LAYER_GZIP, true)?;
                debug!(layer = %name, digest = %blob.digest, size = blob.size, "staged layer");
                layers.insert(name, blob);
            }
        }

        let missing = |name: &str| {
            RegistryError::ImageParsing(format!("{} not found in {}", name, self.path.display()))
        };
        let config = config.ok_or_else(|| missing(config_name.as_str()))?;
        let layers = layer_names
            .iter()
            .map(|name| layers.get(name).cloned().ok_or_else(|| missing(name.as_str())))
            .collect::<Result<Vec<_>>>()?;

        Ok(StagedImage { config, layers })
    }
}

pub fn is_gzipped(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

fn entry_name(name: &str) -> String {
    name.trim_start_matches("./").to_string()
}

/// Read one small member of the tar at `tar_path`, ignoring a leading `./`.
fn read_entry(tar_path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let wanted = entry_name(name);
    let mut archive = Archive::new(File::open(tar_path)?);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry_name(&entry.path()?.to_string_lossy()) == wanted {
            let mut data = Vec::with_capacity(entry.header().size().unwrap_or(0) as usize);
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }

    Ok(None)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    /// Build a minimal docker-archive with one layer.
    pub(crate) fn write_docker_archive(path: &Path, layer: &[u8]) {
        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;
        let manifest = br#"[{"Config":"config.json","RepoTags":["app:latest"],"Layers":["layer1/layer.tar"]}]"#;

        let mut builder = tar::Builder::new(File::create(path).unwrap());
        for (name, data) in [
            ("layer1/layer.tar", layer),
            ("config.json", &config[..]),
            ("manifest.json", &manifest[..]),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.finish().unwrap();
    }

    #[test]
    fn stages_config_and_compresses_raw_layers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        write_docker_archive(&path, b"raw layer bytes");
        let staging = tempfile::tempdir().unwrap();

        let staged = DockerArchive::open(&path).unwrap().stage_blobs(staging.path()).unwrap();

        let config = std::fs::read(&staged.config.path).unwrap();
        assert_eq!(staged.config.media_type, MEDIA_TYPE_CONFIG);
        assert_eq!(staged.config.digest, sha256_digest(&config));
        assert_eq!(staged.config.size, config.len() as u64);

        assert_eq!(staged.layers.len(), 1);
        let layer = std::fs::read(&staged.layers[0].path).unwrap();
        assert!(is_gzipped(&layer));
        assert_eq!(staged.layers[0].digest, sha256_digest(&layer));
        let mut decoded = Vec::new();
        GzDecoder::new(&layer[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, b"raw layer bytes");
    }

    #[test]
    fn gzipped_layers_are_passed_through() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"already compressed").unwrap();
        let gz = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        write_docker_archive(&path, &gz);

        let staged = DockerArchive::open(&path).unwrap().stage_blobs(dir.path()).unwrap();
        assert_eq!(std::fs::read(&staged.layers[0].path).unwrap(), gz);
        assert_eq!(staged.layers[0].digest, sha256_digest(&gz));
    }

    #[test]
    fn missing_layer_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        let manifest = br#"[{"Config":"config.json","Layers":["gone/layer.tar"]}]"#;
        let mut builder = tar::Builder::new(File::create(&path).unwrap());
        for (name, data) in [("manifest.json", &manifest[..]), ("config.json", &b"{}"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        }
        builder.finish().unwrap();

        let err = DockerArchive::open(&path).unwrap().stage_blobs(dir.path()).unwrap_err();
        assert!(err.to_string().contains("gone/layer.tar"));
    }

    #[test]
    fn tiny_blobs_are_staged() {
        let dir = tempfile::tempdir().unwrap();
        let blob = stage_blob(&b"x"[..], &dir.path().join("b"), MEDIA_TYPE_CONFIG, false).unwrap();
        assert_eq!(blob.size, 1);
        assert_eq!(blob.digest, sha256_digest(b"x"));
    }

    #[test]
    fn non_archives_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.tar");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        assert!(DockerArchive::open(&path).is_err());

        assert!(DockerArchive::open(dir.path()).is_err());
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
