//! Recorded path log.
//!
//! A path is stored as three append-only, little-endian, versionless files
//! sharing one record order:
//!
//! | file | per record |
//! |------|------------|
//! | pose index | `x: f32, y: f32` |
//! | pose log | `timestamp: i64, x, y, orientation, head_pan, head_tilt, head_roll: f32, camera_index: i32, feature_count: i32` (40 bytes) |
//! | feature log | `len: i32` + deflate(`feature_count × [x_px, y_px, disparity]: f32`), then `len: i32` + deflate(`feature_count × [r, g, b]: u8`, or nothing when no feature is coloured) |
//!
//! The index allows a fast spatial scan without touching the larger logs.
//! A missing or truncated file is an error; a feature batch that fails to
//! inflate is skipped with a warning and the rest of the path still loads.
//!
//! # Example
//!
//! ```rust
//! use stereonav_memory::path_log::{PathWriter, read_path};
//! use stereonav_types::{OdometryRecord, StereoFeature};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let (idx, poses, feats) = (dir.path().join("idx"), dir.path().join("pose"), dir.path().join("feat"));
//!
//! let mut writer = PathWriter::create(&idx, &poses, &feats).unwrap();
//! writer
//!     .append(&OdometryRecord {
//!         timestamp: 1_700_000_000_000,
//!         x: 0.0,
//!         y: 100.0,
//!         orientation: 0.0,
//!         head_pan: 0.0,
//!         head_tilt: 0.0,
//!         head_roll: 0.0,
//!         camera_index: 0,
//!         features: vec![StereoFeature::new(320.0, 240.0, 15.0).with_colour([10, 20, 30])],
//!     })
//!     .unwrap();
//! writer.finish().unwrap();
//!
//! let log = read_path(&idx, &poses, &feats).unwrap();
//! assert_eq!(log.records.len(), 1);
//! assert_eq!(log.records[0].features[0].colour, Some([10, 20, 30]));
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use stereonav_types::{NavError, OdometryRecord, StereoFeature};
use tracing::{debug, warn};

/// Bytes per pose index entry.
pub const INDEX_RECORD_BYTES: usize = 8;
/// Bytes per pose log entry.
pub const POSE_RECORD_BYTES: usize = 40;

/// Largest feature batch accepted when reading; guards against garbage
/// counts allocating unbounded memory.
const MAX_FEATURES_PER_RECORD: usize = 1 << 20;

// ────────────────────────────────────────────────────────────────────────────
// Writer
// ────────────────────────────────────────────────────────────────────────────

/// Appends odometry records to the three path log files.
pub struct PathWriter {
    index: BufWriter<File>,
    poses: BufWriter<File>,
    features: BufWriter<File>,
    paths: [PathBuf; 3],
    records: usize,
}

impl PathWriter {
    /// Create (truncating) the three files.
    pub fn create(index: &Path, pose_log: &Path, feature_log: &Path) -> Result<Self, NavError> {
        let open = |path: &Path| {
            File::create(path)
                .map(BufWriter::new)
                .map_err(|e| NavError::io(path, e))
        };
        Ok(Self {
            index: open(index)?,
            poses: open(pose_log)?,
            features: open(feature_log)?,
            paths: [index.to_path_buf(), pose_log.to_path_buf(), feature_log.to_path_buf()],
            records: 0,
        })
    }

    pub fn records(&self) -> usize {
        self.records
    }

    pub fn append(&mut self, record: &OdometryRecord) -> Result<(), NavError> {
        let count = i32::try_from(record.features.len())
            .map_err(|_| NavError::invalid("too many features in one record"))?;

        let mut entry = Vec::with_capacity(INDEX_RECORD_BYTES);
        entry.extend_from_slice(&record.x.to_le_bytes());
        entry.extend_from_slice(&record.y.to_le_bytes());

        let mut pose = Vec::with_capacity(POSE_RECORD_BYTES);
        pose.extend_from_slice(&record.timestamp.to_le_bytes());
        for v in [
            record.x,
            record.y,
            record.orientation,
            record.head_pan,
            record.head_tilt,
            record.head_roll,
        ] {
            pose.extend_from_slice(&v.to_le_bytes());
        }
        pose.extend_from_slice(&record.camera_index.to_le_bytes());
        pose.extend_from_slice(&count.to_le_bytes());

        let positions: Vec<u8> = record
            .features
            .iter()
            .flat_map(|f| [f.x, f.y, f.disparity])
            .flat_map(f32::to_le_bytes)
            .collect();
        // An empty colour block marks a record whose features carry no colour.
        let colours: Vec<u8> = if record.features.iter().all(|f| f.colour.is_none()) {
            Vec::new()
        } else {
            record
                .features
                .iter()
                .flat_map(|f| f.colour.unwrap_or([0, 0, 0]))
                .collect()
        };
        let mut batch = Vec::new();
        for raw in [positions, colours] {
            let block = deflate(&raw).map_err(|e| NavError::io(&self.paths[2], e))?;
            let len = i32::try_from(block.len())
                .map_err(|_| NavError::invalid("compressed feature batch too large"))?;
            batch.extend_from_slice(&len.to_le_bytes());
            batch.extend_from_slice(&block);
        }

        self.index
            .write_all(&entry)
            .map_err(|e| NavError::io(&self.paths[0], e))?;
        self.poses
            .write_all(&pose)
            .map_err(|e| NavError::io(&self.paths[1], e))?;
        self.features
            .write_all(&batch)
            .map_err(|e| NavError::io(&self.paths[2], e))?;
        self.records += 1;
        Ok(())
    }

    /// Flush all files; returns the number of records written.
    pub fn finish(mut self) -> Result<usize, NavError> {
        self.index.flush().map_err(|e| NavError::io(&self.paths[0], e))?;
        self.poses.flush().map_err(|e| NavError::io(&self.paths[1], e))?;
        self.features.flush().map_err(|e| NavError::io(&self.paths[2], e))?;
        debug!(records = self.records, "path log closed");
        Ok(self.records)
    }
}

fn deflate(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    enc.write_all(raw)?;
    enc.finish()
}

fn inflate(block: &[u8], expected: usize) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(expected);
    DeflateDecoder::new(block)
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .ok()?;
    (out.len() == expected).then_some(out)
}

// ────────────────────────────────────────────────────────────────────────────
// Reader
// ────────────────────────────────────────────────────────────────────────────

/// Records loaded from a path log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathLog {
    pub records: Vec<OdometryRecord>,
    /// Feature or colour batches that could not be decoded.
    pub skipped_batches: usize,
    /// True when loading stopped early on request.
    pub stopped: bool,
}

/// Read a complete path log.
pub fn read_path(index: &Path, pose_log: &Path, feature_log: &Path) -> Result<PathLog, NavError> {
    read_path_until(index, pose_log, feature_log, &AtomicBool::new(false))
}

/// Read a path log, stopping after the last complete record once `stop` is
/// set.
pub fn read_path_until(
    index: &Path,
    pose_log: &Path,
    feature_log: &Path,
    stop: &AtomicBool,
) -> Result<PathLog, NavError> {
    let index_bytes = fs::read(index).map_err(|e| NavError::io(index, e))?;
    let pose_bytes = fs::read(pose_log).map_err(|e| NavError::io(pose_log, e))?;
    let feature_bytes = fs::read(feature_log).map_err(|e| NavError::io(feature_log, e))?;

    if index_bytes.len() % INDEX_RECORD_BYTES != 0 {
        return Err(NavError::MalformedLog(format!(
            "pose index {} is truncated ({} bytes)",
            index.display(),
            index_bytes.len()
        )));
    }
    if pose_bytes.len() % POSE_RECORD_BYTES != 0 {
        return Err(NavError::MalformedLog(format!(
            "pose log {} is truncated ({} bytes)",
            pose_log.display(),
            pose_bytes.len()
        )));
    }
    let count = index_bytes.len() / INDEX_RECORD_BYTES;
    if pose_bytes.len() / POSE_RECORD_BYTES != count {
        return Err(NavError::MalformedLog(format!(
            "pose index holds {count} records but pose log holds {}",
            pose_bytes.len() / POSE_RECORD_BYTES
        )));
    }

    let mut log = PathLog::default();
    let mut idx = ByteReader::new(&index_bytes);
    let mut poses = ByteReader::new(&pose_bytes);
    let mut feats = ByteReader::new(&feature_bytes);

    for n in 0..count {
        if stop.load(Ordering::Relaxed) {
            log.stopped = true;
            break;
        }
        let malformed = |what: &str| NavError::MalformedLog(format!("record {n}: {what}"));

        let (ix, iy) = (idx.f32(), idx.f32());
        let timestamp = poses.i64().ok_or_else(|| malformed("pose record truncated"))?;
        let mut values = [0.0f32; 6];
        for v in &mut values {
            *v = poses.f32().ok_or_else(|| malformed("pose record truncated"))?;
        }
        let camera_index = poses.i32().ok_or_else(|| malformed("pose record truncated"))?;
        let feature_count = poses.i32().ok_or_else(|| malformed("pose record truncated"))?;
        let [x, y, orientation, head_pan, head_tilt, head_roll] = values;

        if (ix, iy) != (Some(x), Some(y)) && !(x.is_nan() || y.is_nan()) {
            return Err(malformed("index entry disagrees with pose log"));
        }
        let feature_count = usize::try_from(feature_count)
            .ok()
            .filter(|&c| c <= MAX_FEATURES_PER_RECORD)
            .ok_or_else(|| malformed("invalid feature count"))?;

        let position_block = feats.block().ok_or_else(|| malformed("feature log truncated"))?;
        let colour_block = feats.block().ok_or_else(|| malformed("feature log truncated"))?;

        let mut features = match inflate(position_block, feature_count * 12) {
            Some(raw) => raw
                .chunks_exact(12)
                .map(|c| {
                    let f = |o: usize| f32::from_le_bytes([c[o], c[o + 1], c[o + 2], c[o + 3]]);
                    StereoFeature::new(f(0), f(4), f(8))
                })
                .collect(),
            None => {
                warn!(record = n, "corrupt feature batch skipped");
                log.skipped_batches += 1;
                Vec::new()
            }
        };
        if !features.is_empty() {
            let colours = inflate(colour_block, feature_count * 3)
                .or_else(|| inflate(colour_block, 0));
            match colours {
                Some(raw) if raw.is_empty() => {}
                Some(raw) => {
                    for (feat, c) in features.iter_mut().zip(raw.chunks_exact(3)) {
                        feat.colour = Some([c[0], c[1], c[2]]);
                    }
                }
                None => {
                    warn!(record = n, "corrupt colour batch skipped");
                    log.skipped_batches += 1;
                }
            }
        }

        log.records.push(OdometryRecord {
            timestamp,
            x,
            y,
            orientation,
            head_pan,
            head_tilt,
            head_roll,
            camera_index,
            features,
        });
    }

    debug!(
        records = log.records.len(),
        skipped = log.skipped_batches,
        stopped = log.stopped,
        "path log read"
    );
    Ok(log)
}

/// Little-endian cursor over a byte slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.buf.get(self.pos..self.pos + N)?;
        self.pos += N;
        bytes.try_into().ok()
    }

    fn f32(&mut self) -> Option<f32> {
        self.take().map(f32::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.take().map(i64::from_le_bytes)
    }

    /// A `len: i32` prefixed block.
    fn block(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.i32()?).ok()?;
        let bytes = self.buf.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(bytes)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Files {
        _dir: TempDir,
        index: PathBuf,
        poses: PathBuf,
        features: PathBuf,
    }

    fn files() -> Files {
        let dir = tempfile::tempdir().expect("tmp dir");
        Files {
            index: dir.path().join("path.idx"),
            poses: dir.path().join("path.pose"),
            features: dir.path().join("path.feat"),
            _dir: dir,
        }
    }

    fn record(step: usize, features: usize) -> OdometryRecord {
        OdometryRecord {
            timestamp: 1_700_000_000_000 + step as i64 * 100,
            x: step as f32 * 1.5,
            y: step as f32 * 100.0,
            orientation: 0.01 * step as f32,
            head_pan: 0.1,
            head_tilt: -0.05,
            head_roll: 0.0,
            camera_index: (step % 2) as i32,
            features: (0..features)
                .map(|i| {
                    StereoFeature::new(i as f32, 2.0 * i as f32, 10.0 + i as f32 * 0.25)
                        .with_colour([i as u8, 100, 255 - i as u8])
                })
                .collect(),
        }
    }

    fn write(f: &Files, records: &[OdometryRecord]) {
        let mut w = PathWriter::create(&f.index, &f.poses, &f.features).unwrap();
        for r in records {
            w.append(r).unwrap();
        }
        assert_eq!(w.finish().unwrap(), records.len());
    }

    // ── Round trip ──────────────────────────────────────────────────────────

    #[test]
    fn written_path_reads_back_identically() {
        let f = files();
        let records: Vec<_> = (0..20).map(|i| record(i, i * 7)).collect();
        write(&f, &records);

        let log = read_path(&f.index, &f.poses, &f.features).unwrap();
        assert_eq!(log.records, records);
        assert_eq!(log.skipped_batches, 0);
        assert!(!log.stopped);
    }

    #[test]
    fn file_sizes_match_layout() {
        let f = files();
        write(&f, &[record(0, 3), record(1, 0)]);
        assert_eq!(fs::metadata(&f.index).unwrap().len(), 16);
        assert_eq!(fs::metadata(&f.poses).unwrap().len(), 80);
    }

    #[test]
    fn uncoloured_features_read_back_uncoloured() {
        let f = files();
        let mut plain = record(0, 5);
        for feat in &mut plain.features {
            feat.colour = None;
        }
        let coloured = record(1, 5);
        write(&f, &[plain.clone(), coloured.clone()]);

        let log = read_path(&f.index, &f.poses, &f.features).unwrap();
        assert_eq!(log.records, vec![plain, coloured]);
        assert_eq!(log.skipped_batches, 0);
    }

    #[test]
    fn partly_coloured_record_fills_missing_with_black() {
        let f = files();
        let mut r = record(0, 3);
        r.features[1].colour = None;
        write(&f, &[r]);
        let log = read_path(&f.index, &f.poses, &f.features).unwrap();
        let colours: Vec<_> = log.records[0].features.iter().map(|f| f.colour).collect();
        assert_eq!(colours, vec![Some([0, 100, 255]), Some([0, 0, 0]), Some([2, 100, 253])]);
    }

    // ── Failure modes ───────────────────────────────────────────────────────

    #[test]
    fn missing_file_is_io_error() {
        let f = files();
        write(&f, &[record(0, 1)]);
        fs::remove_file(&f.features).unwrap();
        assert!(matches!(
            read_path(&f.index, &f.poses, &f.features),
            Err(NavError::Io { .. })
        ));
    }

    #[test]
    fn truncated_pose_log_is_malformed() {
        let f = files();
        write(&f, &[record(0, 1), record(1, 1)]);
        let bytes = fs::read(&f.poses).unwrap();
        fs::write(&f.poses, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            read_path(&f.index, &f.poses, &f.features),
            Err(NavError::MalformedLog(_))
        ));
    }

    #[test]
    fn truncated_feature_log_is_malformed() {
        let f = files();
        write(&f, &[record(0, 5), record(1, 5)]);
        let bytes = fs::read(&f.features).unwrap();
        fs::write(&f.features, &bytes[..bytes.len() - 2]).unwrap();
        assert!(matches!(
            read_path(&f.index, &f.poses, &f.features),
            Err(NavError::MalformedLog(_))
        ));
    }

    #[test]
    fn index_count_mismatch_is_malformed() {
        let f = files();
        write(&f, &[record(0, 1), record(1, 1)]);
        let bytes = fs::read(&f.index).unwrap();
        fs::write(&f.index, &bytes[..INDEX_RECORD_BYTES]).unwrap();
        assert!(matches!(
            read_path(&f.index, &f.poses, &f.features),
            Err(NavError::MalformedLog(_))
        ));
    }

    #[test]
    fn corrupt_batch_is_skipped_and_rest_loads() {
        let f = files();
        let records: Vec<_> = (0..3).map(|i| record(i, 8)).collect();
        write(&f, &records);

        // Overwrite the body of the first position block with garbage while
        // keeping its length prefix intact.
        let mut bytes = fs::read(&f.features).unwrap();
        let len = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        for b in &mut bytes[4..4 + len] {
            *b = 0xFF;
        }
        fs::write(&f.features, &bytes).unwrap();

        let log = read_path(&f.index, &f.poses, &f.features).unwrap();
        assert_eq!(log.skipped_batches, 1);
        assert_eq!(log.records.len(), 3);
        assert!(log.records[0].features.is_empty());
        assert_eq!(log.records[1], records[1]);
        assert_eq!(log.records[2], records[2]);
    }

    #[test]
    fn short_colour_block_is_skipped() {
        let f = files();
        let r = record(0, 4);
        write(&f, &[r.clone()]);

        // Rebuild the feature log with a colour block covering only one feature.
        let positions: Vec<u8> = r
            .features
            .iter()
            .flat_map(|f| [f.x, f.y, f.disparity])
            .flat_map(f32::to_le_bytes)
            .collect();
        let mut bytes = Vec::new();
        for raw in [positions, vec![1, 2, 3]] {
            let block = deflate(&raw).unwrap();
            bytes.extend_from_slice(&(block.len() as i32).to_le_bytes());
            bytes.extend_from_slice(&block);
        }
        fs::write(&f.features, &bytes).unwrap();

        let log = read_path(&f.index, &f.poses, &f.features).unwrap();
        assert_eq!(log.skipped_batches, 1);
        assert_eq!(log.records[0].features.len(), 4);
        assert!(log.records[0].features.iter().all(|f| f.colour.is_none()));
    }

    #[test]
    fn stop_flag_ends_at_record_boundary() {
        let f = files();
        write(&f, &[record(0, 1), record(1, 1)]);
        let stop = AtomicBool::new(true);
        let log = read_path_until(&f.index, &f.poses, &f.features, &stop).unwrap();
        assert!(log.stopped);
        assert!(log.records.is_empty());
    }
}
