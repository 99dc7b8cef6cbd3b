// src/zipfile.rs
//! Zip archive random access over a `ReadAt` blob
//!
//! Layout used here:
//! - End of central directory record (EOCD) at the tail, optionally followed by a comment
//! - Central directory: one header per file, holding the local header offset
//! - Local header + file data at that offset
//!
//! Resolving a file to a [`ZipFileEntry`] walks the central directory once and
//! reads the local header; afterwards the entry alone is enough to read the
//! file data with a single seek.

use crate::blobstore::{ReadAt, SectionReader};
use crate::error::StoreError;
use anyhow::{Context, Result};
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom};

const EOCD_SIGNATURE: u32 = 0x0605_4b50;
const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;

const EOCD_SIZE: usize = 22;
const CENTRAL_HEADER_SIZE: usize = 46;
const LOCAL_HEADER_SIZE: usize = 30;
const MAX_COMMENT_SIZE: usize = 0xFFFF;

pub const METHOD_STORE: u16 = 0;
pub const METHOD_DEFLATE: u16 = 8;

const FLAG_ENCRYPTED: u16 = 0x1;

/// Location of one file's data inside an archive blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZipFileEntry {
    /// Data is raw-deflate compressed (otherwise stored)
    pub compressed: bool,
    /// Absolute offset of the first data byte
    pub offset: i64,
    /// Number of data bytes at `offset` (compressed size)
    pub size: i64,
}

/// One central directory record
#[derive(Debug, Clone)]
pub struct CentralEntry {
    pub name: String,
    pub method: u16,
    pub flags: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub local_header_offset: u64,
}

impl CentralEntry {
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// The parsed central directory of one archive
#[derive(Debug, Clone)]
pub struct ZipIndex {
    pub entries: Vec<CentralEntry>,
}

impl ZipIndex {
    /// Read the central directory of a `size`-byte archive
    pub fn read<R: ReadAt + ?Sized>(reader: &R, size: u64) -> Result<Self> {
        if size < EOCD_SIZE as u64 {
            return Err(StoreError::bad_request("not a zip archive: too small").into());
        }

        let tail_len = (size as usize).min(EOCD_SIZE + MAX_COMMENT_SIZE);
        let tail_start = size - tail_len as u64;
        let mut tail = vec![0u8; tail_len];
        reader
            .read_exact_at(&mut tail, tail_start)
            .context("cannot read zip trailer")?;

        let eocd_pos = (0..=tail_len - EOCD_SIZE)
            .rev()
            .find(|&i| le_u32(&tail, i) == EOCD_SIGNATURE)
            .ok_or_else(|| StoreError::bad_request("not a zip archive: no end of central directory"))?;
        let eocd = &tail[eocd_pos..];

        let disk = le_u16(eocd, 4);
        let cd_disk = le_u16(eocd, 6);
        let total_entries = le_u16(eocd, 10);
        let cd_size = le_u32(eocd, 12);
        let cd_offset = le_u32(eocd, 16);

        if disk != 0 || cd_disk != 0 {
            return Err(StoreError::bad_request("multi-disk zip archives are not supported").into());
        }
        if total_entries == 0xFFFF || cd_size == 0xFFFF_FFFF || cd_offset == 0xFFFF_FFFF {
            return Err(StoreError::bad_request("zip64 archives are not supported").into());
        }

        let cd_end = cd_offset as u64 + cd_size as u64;
        if cd_end > tail_start + eocd_pos as u64 {
            return Err(StoreError::bad_request("zip central directory out of bounds").into());
        }

        let mut cd = vec![0u8; cd_size as usize];
        reader
            .read_exact_at(&mut cd, cd_offset as u64)
            .context("cannot read zip central directory")?;

        let mut entries = Vec::with_capacity(total_entries as usize);
        let mut pos = 0usize;
        for _ in 0..total_entries {
            if pos + CENTRAL_HEADER_SIZE > cd.len() || le_u32(&cd, pos) != CENTRAL_HEADER_SIGNATURE {
                return Err(StoreError::bad_request("corrupt zip central directory").into());
            }
            let name_len = le_u16(&cd, pos + 28) as usize;
            let extra_len = le_u16(&cd, pos + 30) as usize;
            let comment_len = le_u16(&cd, pos + 32) as usize;
            let name_start = pos + CENTRAL_HEADER_SIZE;
            let record_end = name_start + name_len + extra_len + comment_len;
            if record_end > cd.len() {
                return Err(StoreError::bad_request("corrupt zip central directory").into());
            }

            entries.push(CentralEntry {
                name: String::from_utf8_lossy(&cd[name_start..name_start + name_len]).into_owned(),
                flags: le_u16(&cd, pos + 8),
                method: le_u16(&cd, pos + 10),
                compressed_size: le_u32(&cd, pos + 20) as u64,
                uncompressed_size: le_u32(&cd, pos + 24) as u64,
                local_header_offset: le_u32(&cd, pos + 42) as u64,
            });
            pos = record_end;
        }

        Ok(Self { entries })
    }

    /// Find a file by cleaned path
    pub fn find(&self, path: &str) -> Option<&CentralEntry> {
        let wanted = clean_path(path);
        self.entries
            .iter()
            .find(|e| clean_path(&e.name) == wanted)
    }

    /// First plain file whose cleaned name is accepted by `matches`
    pub fn find_file<F: Fn(&str) -> bool>(&self, matches: F) -> Option<&CentralEntry> {
        self.find_by(|e| !e.is_dir() && matches(&clean_path(&e.name)))
    }

    /// First entry accepted by `matches`
    pub fn find_by<F: Fn(&CentralEntry) -> bool>(&self, matches: F) -> Option<&CentralEntry> {
        self.entries.iter().find(|e| matches(e))
    }

    /// Plain files (directories skipped) as (cleaned name, uncompressed size)
    pub fn manifest(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .filter(|e| !e.is_dir())
            .map(|e| (clean_path(&e.name), e.uncompressed_size))
            .collect()
    }
}

impl ZipFileEntry {
    /// Validate the compression method and locate the data via the local header
    pub fn locate<R: ReadAt + ?Sized>(reader: &R, entry: &CentralEntry) -> Result<Self> {
        let compressed = match entry.method {
            METHOD_STORE => false,
            METHOD_DEFLATE => true,
            _ => {
                return Err(StoreError::UnsupportedCompression {
                    name: entry.name.clone(),
                }
                .into())
            }
        };
        if entry.flags & FLAG_ENCRYPTED != 0 {
            return Err(StoreError::UnsupportedCompression {
                name: entry.name.clone(),
            }
            .into());
        }

        let mut header = [0u8; LOCAL_HEADER_SIZE];
        reader
            .read_exact_at(&mut header, entry.local_header_offset)
            .with_context(|| format!("cannot read local header for {:?}", entry.name))?;
        if le_u32(&header, 0) != LOCAL_HEADER_SIGNATURE {
            return Err(StoreError::bad_request(format!(
                "corrupt zip local header for {:?}",
                entry.name
            ))
            .into());
        }
        let name_len = le_u16(&header, 26) as u64;
        let extra_len = le_u16(&header, 28) as u64;

        Ok(ZipFileEntry {
            compressed,
            offset: (entry.local_header_offset + LOCAL_HEADER_SIZE as u64 + name_len + extra_len)
                as i64,
            size: entry.compressed_size as i64,
        })
    }

    /// Decompressing reader over the entry's data; no directory parsing involved
    pub fn open<'a, R: ReadAt + ?Sized>(&self, reader: &'a R) -> Box<dyn Read + 'a> {
        let section = SectionReader::new(reader, self.offset as u64, self.size as u64);
        if self.compressed {
            Box::new(DeflateDecoder::new(section))
        } else {
            Box::new(section)
        }
    }

    /// Owning variant of [`open`](Self::open) for streaming the file out
    /// of an open blob handle
    pub fn into_reader<R>(&self, mut source: R) -> Result<Box<dyn Read + Send>>
    where
        R: Read + Seek + Send + 'static,
    {
        source
            .seek(SeekFrom::Start(self.offset as u64))
            .context("cannot seek to zip file data")?;
        let section = source.take(self.size as u64);
        if self.compressed {
            Ok(Box::new(DeflateDecoder::new(section)))
        } else {
            Ok(Box::new(section))
        }
    }

    /// Read the whole (uncompressed) file, failing past `limit` bytes
    pub fn read_to_vec<R: ReadAt + ?Sized>(&self, reader: &R, limit: u64) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.open(reader)
            .take(limit.saturating_add(1))
            .read_to_end(&mut data)
            .context("cannot read zip file data")?;
        if data.len() as u64 > limit {
            return Err(StoreError::bad_request(format!(
                "zip file larger than {} bytes",
                limit
            ))
            .into());
        }
        Ok(data)
    }
}

/// `path.Clean`-style normalisation without a leading slash
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

fn le_u16(buf: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([buf[pos], buf[pos + 1]])
}

fn le_u32(buf: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;
    use zip::CompressionMethod;

    /// Build an in-memory archive; each file is (name, contents, deflate?)
    pub(crate) fn make_zip(files: &[(&str, &[u8], bool)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents, deflate) in files {
            let method = if *deflate {
                CompressionMethod::Deflated
            } else {
                CompressionMethod::Stored
            };
            let options = SimpleFileOptions::default().compression_method(method);
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Overwrite the compression method of every central directory record
    pub(crate) fn set_central_method(archive: &mut [u8], method: u16) {
        let mut i = 0;
        while i + 4 <= archive.len() {
            if le_u32(archive, i) == CENTRAL_HEADER_SIGNATURE {
                archive[i + 10..i + 12].copy_from_slice(&method.to_le_bytes());
            }
            i += 1;
        }
    }

    #[test]
    fn test_cache_and_read_store_and_deflate() {
        let readme = b"readme contents ".repeat(50);
        let icon = b"<svg>icon contents</svg>".to_vec();
        let files: Vec<(&str, &[u8], bool)> = vec![
            ("readme.md", &readme[..], true),
            ("icon.svg", &icon[..], false),
            ("metadata.yaml", &b"name: foo\n"[..], true),
        ];
        let archive = make_zip(&files);
        let reader = &archive[..];

        let index = ZipIndex::read(reader, archive.len() as u64).unwrap();
        assert_eq!(index.entries.len(), 3);

        for (name, contents, deflate) in &files {
            let central = index.find(name).unwrap();
            let entry = ZipFileEntry::locate(reader, central).unwrap();
            assert_eq!(entry.compressed, *deflate, "{}", name);
            assert_eq!(entry.size as u64, central.compressed_size);

            // Reading from the cached triple alone reproduces the file.
            let cached: ZipFileEntry =
                serde_json::from_str(&serde_json::to_string(&entry).unwrap()).unwrap();
            let data = cached.read_to_vec(reader, 1 << 20).unwrap();
            assert_eq!(&data[..], *contents, "{}", name);
        }
    }

    #[test]
    fn test_find_file_skips_directories_and_cleans_names() {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("readme.d", options).unwrap();
        writer.start_file("./README.md", options).unwrap();
        writer.write_all(b"top level").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();
        let found = index
            .find_file(|name| name.to_ascii_lowercase().starts_with("readme"))
            .unwrap();
        assert_eq!(found.name, "./README.md");
        assert!(index.find_file(|name| name == "readme.d").is_none());
    }

    #[test]
    fn test_into_reader_streams_from_owned_handle() {
        let body = b"streamed body ".repeat(1000);
        let archive = make_zip(&[("big.txt", &body[..], true), ("small", &b"s"[..], false)]);
        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();

        for (name, expected) in [("big.txt", &body[..]), ("small", &b"s"[..])] {
            let entry = ZipFileEntry::locate(&archive[..], index.find(name).unwrap()).unwrap();
            let mut data = Vec::new();
            entry
                .into_reader(Cursor::new(archive.clone()))
                .unwrap()
                .read_to_end(&mut data)
                .unwrap();
            assert_eq!(&data[..], expected, "{}", name);
        }
    }

    #[test]
    fn test_stored_entry_offset_points_at_data() {
        let archive = make_zip(&[("foo", &b"contents"[..], false)]);
        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();
        let entry = ZipFileEntry::locate(&archive[..], &index.entries[0]).unwrap();
        let start = entry.offset as usize;
        assert_eq!(&archive[start..start + entry.size as usize], b"contents");
    }

    #[test]
    fn test_unsupported_compression_names_file() {
        let mut archive = make_zip(&[("foo", &b"contents"[..], true)]);
        set_central_method(&mut archive, 99);
        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();
        let err = ZipFileEntry::locate(&archive[..], &index.entries[0]).unwrap_err();
        assert_eq!(err.to_string(), "unknown zip compression method for \"foo\"");
        assert!(matches!(
            crate::error::classify(&err),
            Some(StoreError::UnsupportedCompression { name }) if name == "foo"
        ));
    }

    #[test]
    fn test_not_a_zip() {
        let data = b"this is definitely not a zip archive at all".to_vec();
        let err = ZipIndex::read(&data[..], data.len() as u64).unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(StoreError::BadRequest(_))));
    }

    #[test]
    fn test_read_limit() {
        let big = vec![b'x'; 4096];
        let archive = make_zip(&[("big", &big[..], true)]);
        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();
        let entry = ZipFileEntry::locate(&archive[..], &index.entries[0]).unwrap();
        assert!(entry.read_to_vec(&archive[..], 100).is_err());
        assert_eq!(entry.read_to_vec(&archive[..], 4096).unwrap().len(), 4096);
    }

    #[test]
    fn test_clean_path_and_manifest() {
        assert_eq!(clean_path("./hooks/../hooks/install"), "hooks/install");
        assert_eq!(clean_path("/icon.svg"), "icon.svg");

        let archive = make_zip(&[
            ("hooks/install", &b"#!/bin/sh"[..], false),
            ("README", &b"hi"[..], true),
        ]);
        let index = ZipIndex::read(&archive[..], archive.len() as u64).unwrap();
        let mut manifest = index.manifest();
        manifest.sort();
        assert_eq!(
            manifest,
            vec![("README".to_string(), 2), ("hooks/install".to_string(), 9)]
        );
        assert!(index.find("./hooks/install").is_some());
        assert!(index.find("hooks/missing").is_none());
    }
}
