use std::io::{Cursor, Read};

use thiserror::Error;

/// Compound File Binary signature (`D0 CF 11 E0 A1 B1 1A E1`).
pub const CFB_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

#[derive(Debug, Error)]
pub enum OleError {
    #[error("not an OLE compound file")]
    NotCompoundFile,
    #[error("failed to open compound file: {0}")]
    Open(#[source] std::io::Error),
    #[error("failed to read stream {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub fn looks_like_compound_file(bytes: &[u8]) -> bool {
    bytes.starts_with(&CFB_MAGIC)
}

/// Read-only view over an in-memory compound file (`vbaProject.bin`).
pub struct OleFile {
    inner: cfb::CompoundFile<Cursor<Vec<u8>>>,
}

impl OleFile {
    pub fn open(bytes: &[u8]) -> Result<Self, OleError> {
        if !looks_like_compound_file(bytes) {
            return Err(OleError::NotCompoundFile);
        }
        let inner =
            cfb::CompoundFile::open(Cursor::new(bytes.to_vec())).map_err(OleError::Open)?;
        Ok(Self { inner })
    }

    /// Paths of every stream in the file, `/`-separated and without a leading slash.
    pub fn list_streams(&self) -> Vec<String> {
        self.inner
            .walk()
            .filter(|entry| entry.is_stream())
            .map(|entry| normalize_path(&entry.path().to_string_lossy()))
            .collect()
    }

    /// Read a stream by path. Lookup is exact first, then ASCII case-insensitive (producers
    /// disagree on the case of `VBA/dir` and module stream names).
    pub fn read_stream_opt(&mut self, path: &str) -> Result<Option<Vec<u8>>, OleError> {
        let wanted = normalize_path(path);
        let resolved = if self.inner.is_stream(format!("/{wanted}")) {
            Some(wanted.clone())
        } else {
            self.list_streams()
                .into_iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(&wanted))
        };
        let Some(resolved) = resolved else {
            return Ok(None);
        };

        let mut stream = self
            .inner
            .open_stream(format!("/{resolved}"))
            .map_err(|source| OleError::Read {
                path: resolved.clone(),
                source,
            })?;
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .map_err(|source| OleError::Read {
                path: resolved,
                source,
            })?;
        Ok(Some(buf))
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}
