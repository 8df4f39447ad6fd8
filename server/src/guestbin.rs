//! Guest helper binaries shipped into instances.
//!
//! The gzipped, statically linked helpers (`hatchway-sftp`,
//! `hatchway-stdio-proxy`) live in a directory on the host, one file per
//! target architecture: `<name>-<arch>.gz`. They are loaded and
//! decompressed once at startup; the byte slices are immutable afterwards.
//! Uploads into instances are keyed by content md5 so a binary is pushed
//! at most once per instance and version.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use tracing::{debug, info};

/// Which helper to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestTool {
    Sftp,
    StdioProxy,
}

impl GuestTool {
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Sftp => "hatchway-sftp",
            Self::StdioProxy => "hatchway-stdio-proxy",
        }
    }

    /// Where the helper is installed inside an instance.
    pub fn remote_path(&self) -> &'static str {
        match self {
            Self::Sftp => "/opt/hatchway/hatchway-sftp",
            Self::StdioProxy => "/opt/hatchway/hatchway-stdio-proxy",
        }
    }
}

/// A decompressed helper binary ready for upload.
pub struct GuestBinary {
    pub arch: String,
    pub bytes: bytes::Bytes,
    pub md5_hex: String,
}

/// All helper binaries found at startup, keyed by tool and architecture.
pub struct GuestBinaries {
    binaries: HashMap<(GuestTool, String), Arc<GuestBinary>>,
}

const ARCHES: &[&str] = &["amd64", "arm64"];
const TOOLS: &[GuestTool] = &[GuestTool::Sftp, GuestTool::StdioProxy];

impl GuestBinaries {
    /// Load every `<name>-<arch>.gz` present under `dir`.
    ///
    /// Missing files are tolerated here; resolution fails later only when
    /// a session actually needs the absent combination.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let mut binaries = HashMap::new();
        for tool in TOOLS {
            for arch in ARCHES {
                let path = dir.join(format!("{}-{arch}.gz", tool.file_stem()));
                if !path.exists() {
                    continue;
                }
                let compressed = std::fs::read(&path)
                    .with_context(|| format!("cannot read {}", path.display()))?;
                let mut decoder = GzDecoder::new(compressed.as_slice());
                let mut bytes = Vec::new();
                decoder
                    .read_to_end(&mut bytes)
                    .with_context(|| format!("cannot decompress {}", path.display()))?;
                let md5_hex = format!("{:x}", md5::compute(&bytes));
                debug!(
                    tool = tool.file_stem(),
                    arch,
                    size = bytes.len(),
                    md5 = %md5_hex,
                    "loaded guest binary"
                );
                binaries.insert(
                    (*tool, arch.to_string()),
                    Arc::new(GuestBinary {
                        arch: arch.to_string(),
                        bytes: bytes::Bytes::from(bytes),
                        md5_hex,
                    }),
                );
            }
        }
        info!(
            dir = %dir.display(),
            count = binaries.len(),
            "guest binaries loaded"
        );
        Ok(Self { binaries })
    }

    /// The directory to look in when none is configured: next to the
    /// server binary.
    pub fn default_dir() -> PathBuf {
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Resolve a helper for an instance architecture.
    pub fn resolve(&self, tool: GuestTool, arch: &str) -> anyhow::Result<Arc<GuestBinary>> {
        if !ARCHES.contains(&arch) {
            bail!("unsupported instance architecture: {arch}");
        }
        match self.binaries.get(&(tool, arch.to_string())) {
            Some(binary) => Ok(binary.clone()),
            None => bail!(
                "guest binary {}-{arch}.gz is not installed on this host",
                tool.file_stem()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gz(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn loads_and_hashes_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hatchway-sftp-amd64.gz"), gz(b"#!fake-sftp")).unwrap();

        let bins = GuestBinaries::load(dir.path()).unwrap();
        let binary = bins.resolve(GuestTool::Sftp, "amd64").unwrap();
        assert_eq!(&binary.bytes[..], b"#!fake-sftp");
        assert_eq!(binary.md5_hex, format!("{:x}", md5::compute(b"#!fake-sftp")));
    }

    #[test]
    fn unknown_arch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bins = GuestBinaries::load(dir.path()).unwrap();
        let err = bins.resolve(GuestTool::Sftp, "riscv64").unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bins = GuestBinaries::load(dir.path()).unwrap();
        let err = bins.resolve(GuestTool::StdioProxy, "arm64").unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }
}
