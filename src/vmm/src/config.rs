//! VM configuration, deserializable so a harness can drive runs from JSON.

use std::path::PathBuf;

use serde::Deserialize;

fn default_mem_size_mib() -> u64 {
    128
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmConfig {
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: u64,
    /// The ELF binary to run as the guest process.
    pub binary: PathBuf,
    /// Arguments after argv[0]; argv[0] is derived from `binary`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Read-only input files surfaced through the file hypercalls.
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl VmConfig {
    pub fn mem_size(&self) -> usize {
        (self.mem_size_mib << 20) as usize
    }

    pub fn argv(&self) -> Vec<String> {
        let argv0 = self
            .binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.display().to_string());
        std::iter::once(argv0).chain(self.args.iter().cloned()).collect()
    }
}
