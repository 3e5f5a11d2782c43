//! Snapshot segments for the document database.
//!
//! A segment is an immutable file holding the complete database state at the
//! time of a compaction. Only the newest segment is needed on open; older
//! ones are pruned once a newer one is durable.
//!
//! # Layout
//! ```text
//! [MAGIC][VERSION][SegmentHeader frame][SegmentData frame]
//! ```
//! Files are named `segment_00001.seg`, `segment_00002.seg`, ... and are
//! written to a temporary file first, then renamed into place.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Document;

use super::codec;

/// Documents of one collection, by id.
pub type CollectionData = BTreeMap<String, Document>;

/// Full database contents: every collection by physical name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    pub collections: BTreeMap<String, CollectionData>,
}

impl SegmentData {
    /// Total number of documents across all collections.
    #[must_use]
    pub fn document_count(&self) -> u64 {
        self.collections.values().map(|c| c.len() as u64).sum()
    }
}

/// Segment file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Number of segments written before this one, plus one.
    pub generation: u32,
    /// Number of collections in the snapshot.
    pub collection_count: u64,
    /// Number of documents in the snapshot.
    pub document_count: u64,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

/// A finalized segment file.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    generation: u32,
}

impl Segment {
    /// Opens an existing segment and validates its header.
    pub fn open(path: &Path) -> IoResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        codec::read_header(&mut reader)?;
        let header: SegmentHeader = codec::decode(&mut reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            generation: header.generation,
        })
    }

    /// Path to the segment file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation number of this segment.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Reads the snapshot.
    pub fn read_all(&self) -> IoResult<SegmentData> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader)?;
        let _header: SegmentHeader = codec::decode(&mut reader)?;
        codec::decode(&mut reader)
    }
}

/// Writes a segment atomically: temp file, fsync, rename.
pub struct SegmentWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    generation: u32,
    writer: Option<BufWriter<File>>,
}

impl SegmentWriter {
    fn new(final_path: PathBuf, generation: u32) -> IoResult<Self> {
        let temp_path = final_path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            generation,
            writer: Some(writer),
        })
    }

    /// Writes the header and the snapshot.
    pub fn write_data(&mut self, data: &SegmentData) -> IoResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| IoError::new(ErrorKind::Other, "segment writer already consumed"))?;

        let header = SegmentHeader {
            generation: self.generation,
            collection_count: data.collections.len() as u64,
            document_count: data.document_count(),
            created_at: Utc::now(),
        };
        writer.write_all(&codec::encode(&header)?)?;
        writer.write_all(&codec::encode(data)?)?;
        Ok(())
    }

    /// Flushes, fsyncs and renames the segment into place.
    ///
    /// After this returns the snapshot is durable.
    pub fn finalize(mut self) -> IoResult<Segment> {
        let (Some(mut writer), Some(temp_path)) = (self.writer.take(), self.temp_path.take()) else {
            return Err(IoError::new(ErrorKind::Other, "segment writer already consumed"));
        };

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&temp_path, &self.final_path)?;

        Ok(Segment {
            path: self.final_path.clone(),
            generation: self.generation,
        })
    }

    /// Abandons the write and removes the temporary file.
    pub fn abort(mut self) -> IoResult<()> {
        self.writer.take();
        match self.temp_path.take() {
            Some(path) if path.exists() => fs::remove_file(path),
            _ => Ok(()),
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(path) = self.temp_path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Manages the segment files of one database.
#[derive(Debug)]
pub struct SegmentManager {
    dir: PathBuf,
    segments: Vec<Segment>,
    next_generation: u32,
}

fn parse_generation(path: &Path) -> Option<u32> {
    if path.extension()? != "seg" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment_")?
        .parse()
        .ok()
}

impl SegmentManager {
    /// Opens the segment directory, creating it if needed.
    ///
    /// Leftover temporary files from an interrupted compaction are removed;
    /// unreadable segments are skipped with a warning.
    pub fn open(dir: &Path) -> IoResult<Self> {
        fs::create_dir_all(dir)?;

        let mut segments = Vec::new();
        let mut next_generation = 1u32;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().map_or(false, |e| e == "tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some(generation) = parse_generation(&path) else {
                continue;
            };
            next_generation = next_generation.max(generation + 1);
            match Segment::open(&path) {
                Ok(segment) => segments.push(segment),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable segment"),
            }
        }

        segments.sort_by_key(Segment::generation);
        Ok(Self {
            dir: dir.to_path_buf(),
            segments,
            next_generation,
        })
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Segments ordered oldest first.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Starts writing the next segment.
    pub fn create_segment_writer(&mut self) -> IoResult<SegmentWriter> {
        let generation = self.next_generation;
        self.next_generation += 1;
        SegmentWriter::new(self.dir.join(format!("segment_{generation:05}.seg")), generation)
    }

    /// Registers a finalized segment and deletes every older one.
    pub fn install(&mut self, segment: Segment) -> IoResult<()> {
        for old in self.segments.drain(..) {
            if let Err(e) = fs::remove_file(old.path()) {
                tracing::warn!(path = %old.path().display(), error = %e, "failed to prune segment");
            }
        }
        self.segments.push(segment);
        Ok(())
    }

    /// Loads the newest snapshot, or an empty state if there is none.
    pub fn load_latest(&self) -> IoResult<SegmentData> {
        self.segments
            .last()
            .map_or_else(|| Ok(SegmentData::default()), Segment::read_all)
    }
}
