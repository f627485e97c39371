//! Archive entry writer
//!
//! Thin adapter over `tar::Builder`: every entry is a regular file, mode
//! 0755, with modtime pinned to the backup start so two backups of the
//! same state produce identical entry sets.

use std::io::Write;

use tar::{Builder, EntryType, Header};

use crate::{Error, Result};

/// Appends fixed-shape entries to a tar stream
pub struct TarAppender<W: Write> {
    builder: Builder<W>,
    mod_time: u64,
}

impl<W: Write> TarAppender<W> {
    /// Create an appender writing into `sink`, stamping entries with
    /// `mod_time` (seconds since the epoch)
    pub fn new(sink: W, mod_time: u64) -> Self {
        Self {
            builder: Builder::new(sink),
            mod_time,
        }
    }

    /// Append one file entry
    pub fn append(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_mtime(self.mod_time);
        header.set_cksum();

        self.builder
            .append_data(&mut header, path, data)
            .map_err(|e| Error::archive(format!("writing entry {path}: {e}")))
    }

    /// Finish the archive and hand back the sink
    pub fn into_inner(self) -> Result<W> {
        self.builder
            .into_inner()
            .map_err(|e| Error::archive(format!("finishing archive: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::Archive;

    #[test]
    fn entries_are_regular_0755_with_pinned_mtime() {
        let mut appender = TarAppender::new(Vec::new(), 1_700_000_000);
        appender
            .append("resources/pods/namespaces/default/nginx.json", b"{}")
            .unwrap();
        appender.append("metadata", b"\x01{}").unwrap();
        let buf = appender.into_inner().unwrap();

        let mut archive = Archive::new(&buf[..]);
        let entries: Vec<_> = archive.entries().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);

        let first = &entries[0];
        assert_eq!(
            first.path().unwrap().to_string_lossy(),
            "resources/pods/namespaces/default/nginx.json"
        );
        assert_eq!(first.header().mode().unwrap(), 0o755);
        assert_eq!(first.header().mtime().unwrap(), 1_700_000_000);
        assert_eq!(first.header().entry_type(), EntryType::Regular);
    }

    #[test]
    fn entry_bodies_round_trip() {
        use std::io::Read;

        let mut appender = TarAppender::new(Vec::new(), 0);
        appender
            .append("resources/pods/cluster/x.json", br#"{"kind":"Pod"}"#)
            .unwrap();
        let buf = appender.into_inner().unwrap();

        let mut archive = Archive::new(&buf[..]);
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, r#"{"kind":"Pod"}"#);
    }
}
