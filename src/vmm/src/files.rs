//! Host-side table of file-backed inputs surfaced to the guest.
//!
//! The guest discovers files by index, binds a buffer for each, and the host
//! stages bytes into the bound buffers. Between runs a harness swaps an
//! input's bytes without the guest renegotiating its buffers.

use std::path::PathBuf;

use anyhow::Context;

pub struct InputFile {
    name: String,
    data: Vec<u8>,
    guest_buf: Option<u64>,
}

#[derive(Default)]
pub struct FileTable {
    files: Vec<InputFile>,
}

impl FileTable {
    pub fn new() -> FileTable {
        FileTable::default()
    }

    pub fn load(paths: &[PathBuf]) -> anyhow::Result<FileTable> {
        let mut table = FileTable::new();
        for path in paths {
            let data =
                std::fs::read(path).with_context(|| format!("reading input {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            table.add(name, data);
        }
        Ok(table)
    }

    pub fn add(&mut self, name: String, data: Vec<u8>) -> usize {
        self.files.push(InputFile {
            name,
            data,
            guest_buf: None,
        });
        self.files.len() - 1
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    pub fn data_len(&self, idx: usize) -> Option<u64> {
        self.files.get(idx).map(|f| f.data.len() as u64)
    }

    pub fn data(&self, idx: usize) -> Option<&[u8]> {
        self.files.get(idx).map(|f| f.data.as_slice())
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.files.get(idx).map(|f| f.name.as_str())
    }

    /// Bind the guest buffer the host stages this file into; returns the
    /// current bytes so the caller can stage them immediately.
    pub fn bind(&mut self, idx: usize, guest_buf: u64) -> Option<&[u8]> {
        let file = self.files.get_mut(idx)?;
        file.guest_buf = Some(guest_buf);
        Some(&file.data)
    }

    pub fn binding(&self, idx: usize) -> Option<(u64, &[u8])> {
        let file = self.files.get(idx)?;
        Some((file.guest_buf?, &file.data))
    }

    /// Swap an input's bytes for the next run. The guest buffer binding
    /// survives.
    pub fn replace(&mut self, idx: usize, data: Vec<u8>) -> bool {
        match self.files.get_mut(idx) {
            Some(file) => {
                file.data = data;
                true
            }
            None => false,
        }
    }
}
