//! Reads tabular report members out of downloaded archives.

use std::fs;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("corrupt archive {archive}: {message}")]
    Corrupt { archive: String, message: String },
    #[error("reading archive {archive}: {source}")]
    Io {
        archive: String,
        #[source]
        source: io::Error,
    },
}

/// Member payload; large members are spilled to a temp file removed on drop.
#[derive(Debug)]
pub enum MemberData {
    InMemory(Vec<u8>),
    Spilled(NamedTempFile),
}

#[derive(Debug)]
pub struct ReportMember {
    pub name: String,
    pub size: u64,
    pub data: MemberData,
}

impl ReportMember {
    pub fn reader(&self) -> io::Result<Box<dyn Read + '_>> {
        match &self.data {
            MemberData::InMemory(bytes) => Ok(Box::new(Cursor::new(bytes.as_slice()))),
            MemberData::Spilled(file) => {
                let mut handle = file.reopen()?;
                handle.seek(SeekFrom::Start(0))?;
                Ok(Box::new(handle))
            }
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.data, MemberData::Spilled(_))
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    member_extension: String,
    max_in_memory_bytes: u64,
}

impl ArchiveExtractor {
    pub fn new(member_extension: impl Into<String>, max_in_memory_bytes: u64) -> Self {
        Self {
            member_extension: member_extension.into().to_ascii_lowercase(),
            max_in_memory_bytes,
        }
    }

    pub fn extract_path(&self, path: &Path) -> Result<Vec<ReportMember>, ArchiveError> {
        let archive = path.display().to_string();
        let bytes = fs::read(path).map_err(|source| ArchiveError::Io {
            archive: archive.clone(),
            source,
        })?;
        self.extract_bytes(&archive, &bytes)
    }

    /// All members with the report extension, in archive order.
    pub fn extract_bytes(&self, archive: &str, bytes: &[u8]) -> Result<Vec<ReportMember>, ArchiveError> {
        let corrupt = |message: String| ArchiveError::Corrupt {
            archive: archive.to_string(),
            message,
        };
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(e.to_string()))?;

        let mut members = Vec::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|e| corrupt(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if !name.to_ascii_lowercase().ends_with(&self.member_extension) {
                debug!(archive, member = %name, "skipping non-report member");
                continue;
            }
            let size = entry.size();

            let data = if size > self.max_in_memory_bytes {
                let mut spill = NamedTempFile::new().map_err(|source| ArchiveError::Io {
                    archive: archive.to_string(),
                    source,
                })?;
                io::copy(&mut entry, spill.as_file_mut())
                    .map_err(|e| corrupt(format!("{name}: {e}")))?;
                debug!(archive, member = %name, size, "member spilled to disk");
                MemberData::Spilled(spill)
            } else {
                let mut buf = Vec::with_capacity(size as usize);
                entry
                    .read_to_end(&mut buf)
                    .map_err(|e| corrupt(format!("{name}: {e}")))?;
                MemberData::InMemory(buf)
            };

            members.push(ReportMember { name, size, data });
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (name, body) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    fn read_all(member: &ReportMember) -> String {
        let mut out = String::new();
        member.reader().unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn filters_members_by_extension() {
        let bytes = build_zip(&[
            ("PUBLIC_TRADINGIS_1.CSV", "I,TRADING,PRICE,3\n"),
            ("notes.txt", "ignore me"),
        ]);
        let members = ArchiveExtractor::new(".csv", 1024)
            .extract_bytes("a.zip", &bytes)
            .unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "PUBLIC_TRADINGIS_1.CSV");
        assert!(!members[0].is_spilled());
        assert_eq!(read_all(&members[0]), "I,TRADING,PRICE,3\n");
    }

    #[test]
    fn large_members_spill_to_temp_files() {
        let body = "D,TRADING,PRICE,3,x\n".repeat(64);
        let bytes = build_zip(&[("big.csv", body.as_str())]);
        let members = ArchiveExtractor::new(".csv", 16)
            .extract_bytes("a.zip", &bytes)
            .unwrap();
        assert!(members[0].is_spilled());
        assert_eq!(read_all(&members[0]), body);

        let spilled_path = match &members[0].data {
            MemberData::Spilled(file) => file.path().to_path_buf(),
            MemberData::InMemory(_) => unreachable!(),
        };
        drop(members);
        assert!(!spilled_path.exists());
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = ArchiveExtractor::new(".csv", 1024)
            .extract_bytes("broken.zip", b"definitely not a zip")
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Corrupt { .. }));
    }
}
