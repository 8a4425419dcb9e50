//! On-disk clip format.
//!
//! A clip is a header followed by one record per frame:
//!
//! ```text
//! header : "MCLP" | version u8 | codec fourcc [u8; 4] | fps f32
//! record : width u32 | height u32 | timestamp_ms i64 | len u32 | payload
//! ```
//!
//! All integers are little endian. A record cut short by a failed write reads
//! as end of stream, so a clip interrupted mid-episode stays playable.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::imaging::{EncodeError, decode_jpeg, encode_jpeg};

pub const CLIP_EXTENSION: &str = "clip";
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

const MAGIC: &[u8; 4] = b"MCLP";
const VERSION: u8 = 1;
const HEADER_LEN: u64 = 13;
const RECORD_HEADER_LEN: u64 = 20;
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Per-frame compression used inside a clip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    /// One JPEG image per frame.
    Mjpg,
    /// Packed RGB, uncompressed.
    Raw,
}

impl Codec {
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Codec::Mjpg => *b"MJPG",
            Codec::Raw => *b"RAW ",
        }
    }

    pub fn from_fourcc(fourcc: [u8; 4]) -> Option<Self> {
        match &fourcc {
            b"MJPG" => Some(Codec::Mjpg),
            b"RAW " => Some(Codec::Raw),
            _ => None,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fourcc = self.fourcc();
        f.write_str(String::from_utf8_lossy(&fourcc).trim_end())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MJPG" | "MJPEG" => Ok(Codec::Mjpg),
            "RAW" => Ok(Codec::Raw),
            other => Err(format!("unsupported codec {other:?} (expected MJPG or RAW)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open clip {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("clip I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("frame encode failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("malformed clip: {0}")]
    Format(String),
    #[error("clip sink already closed")]
    Closed,
}

/// Destination for the frames of one recording episode.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and release the sink. Closing twice is harmless.
    fn close(&mut self) -> Result<(), SinkError>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipHeader {
    pub codec: Codec,
    pub fps: f32,
}

impl ClipHeader {
    fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut out = [0u8; HEADER_LEN as usize];
        out[..4].copy_from_slice(MAGIC);
        out[4] = VERSION;
        out[5..9].copy_from_slice(&self.codec.fourcc());
        out[9..13].copy_from_slice(&self.fps.to_le_bytes());
        out
    }

    fn read(input: &mut impl Read) -> Result<Self, SinkError> {
        let mut raw = [0u8; HEADER_LEN as usize];
        input.read_exact(&mut raw).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => SinkError::Format("clip header truncated".into()),
            _ => SinkError::Io(err),
        })?;
        if &raw[..4] != MAGIC {
            return Err(SinkError::Format("bad magic".into()));
        }
        if raw[4] != VERSION {
            return Err(SinkError::Format(format!("unsupported version {}", raw[4])));
        }
        let fourcc = [raw[5], raw[6], raw[7], raw[8]];
        let codec = Codec::from_fourcc(fourcc).ok_or_else(|| {
            SinkError::Format(format!(
                "unknown codec {:?}",
                String::from_utf8_lossy(&fourcc)
            ))
        })?;
        let fps = f32::from_le_bytes([raw[9], raw[10], raw[11], raw[12]]);
        Ok(Self { codec, fps })
    }
}

/// File-backed [`FrameSink`] writing the clip container.
pub struct ClipWriter {
    out: Option<BufWriter<File>>,
    path: PathBuf,
    header: ClipHeader,
    jpeg_quality: u8,
    frames_written: u64,
}

impl ClipWriter {
    /// Create `path`, or append to it when a clip with the same header is
    /// already there.
    pub fn create(path: &Path, codec: Codec, fps: f32) -> Result<Self, SinkError> {
        let header = ClipHeader { codec, fps };
        let open_err = |source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(open_err)?;

        let existing = file.metadata().map_err(open_err)?.len();
        if existing == 0 {
            file.write_all(&header.encode())?;
        } else {
            let valid_len = {
                let mut reader = ClipReader::new(BufReader::new(&mut file))?;
                if reader.header() != header {
                    return Err(SinkError::Format(format!(
                        "{} holds a different clip format",
                        path.display()
                    )));
                }
                while reader.next_frame_raw()?.is_some() {}
                reader.offset
            };
            if valid_len < existing {
                debug!(path = %path.display(), valid_len, existing, "dropping truncated tail");
                file.set_len(valid_len)?;
            }
            file.seek(SeekFrom::Start(valid_len))?;
        }

        Ok(Self {
            out: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            header,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            frames_written: 0,
        })
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameSink for ClipWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError> {
        let out = self.out.as_mut().ok_or(SinkError::Closed)?;
        let payload = match self.header.codec {
            Codec::Mjpg => encode_jpeg(frame, self.jpeg_quality)?,
            Codec::Raw => match frame.format {
                FrameFormat::Rgb8 => frame.data.clone(),
                FrameFormat::Bgr8 => frame.clone().into_rgb().data,
            },
        };
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_PAYLOAD)
            .ok_or_else(|| SinkError::Format("frame payload too large".into()))?;

        let mut record = [0u8; RECORD_HEADER_LEN as usize];
        record[..4].copy_from_slice(&frame.width.to_le_bytes());
        record[4..8].copy_from_slice(&frame.height.to_le_bytes());
        record[8..16].copy_from_slice(&frame.timestamp_ms.to_le_bytes());
        record[16..20].copy_from_slice(&len.to_le_bytes());
        out.write_all(&record)?;
        out.write_all(&payload)?;
        // Each record reaches the file before the next frame is accepted.
        out.flush()?;
        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl Drop for ClipWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct RawRecord {
    width: u32,
    height: u32,
    timestamp_ms: i64,
    payload: Vec<u8>,
}

/// Sequential reader over a clip container.
pub struct ClipReader<R: Read> {
    input: R,
    header: ClipHeader,
    offset: u64,
}

impl ClipReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = File::open(path).map_err(|source| SinkError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> ClipReader<R> {
    pub fn new(mut input: R) -> Result<Self, SinkError> {
        let header = ClipHeader::read(&mut input)?;
        Ok(Self {
            input,
            header,
            offset: HEADER_LEN,
        })
    }

    pub fn header(&self) -> ClipHeader {
        self.header
    }

    /// Decode the next frame, or `None` at end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, SinkError> {
        let Some(record) = self.next_frame_raw()? else {
            return Ok(None);
        };
        let frame = match self.header.codec {
            Codec::Mjpg => decode_jpeg(&record.payload, record.timestamp_ms)?,
            Codec::Raw => Frame::new(
                record.payload,
                record.width,
                record.height,
                record.timestamp_ms,
                FrameFormat::Rgb8,
            )
            .map_err(|err| SinkError::Format(err.to_string()))?,
        };
        if (frame.width, frame.height) != (record.width, record.height) {
            return Err(SinkError::Format(format!(
                "record declares {}x{} but payload is {}x{}",
                record.width, record.height, frame.width, frame.height
            )));
        }
        Ok(Some(frame))
    }

    fn next_frame_raw(&mut self) -> Result<Option<RawRecord>, SinkError> {
        let mut head = [0u8; RECORD_HEADER_LEN as usize];
        if !read_full(&mut self.input, &mut head)? {
            return Ok(None);
        }
        let width = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let height = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&head[8..16]);
        let timestamp_ms = i64::from_le_bytes(ts);
        let len = u32::from_le_bytes([head[16], head[17], head[18], head[19]]);
        if len > MAX_PAYLOAD {
            return Err(SinkError::Format(format!("record length {len} out of range")));
        }

        let mut payload = vec![0u8; len as usize];
        if !read_full(&mut self.input, &mut payload)? {
            return Ok(None);
        }
        self.offset += RECORD_HEADER_LEN + len as u64;
        Ok(Some(RawRecord {
            width,
            height,
            timestamp_ms,
            payload,
        }))
    }
}

/// Fill `buf` completely. `Ok(false)` means the input ended first.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> Result<bool, SinkError> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(SinkError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn frame(ts: i64, shade: u8) -> Frame {
        Frame::filled(8, 6, [shade, shade, shade], ts)
    }

    #[test]
    fn raw_clip_reproduces_frames_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("20240102-030405.clip");
        let mut writer = ClipWriter::create(&path, Codec::Raw, 20.0).unwrap();
        for ts in 0..3 {
            writer.write_frame(&frame(ts, ts as u8 * 40)).unwrap();
        }
        assert_eq!(writer.frames_written(), 3);
        writer.close().unwrap();

        let mut reader = ClipReader::open(&path).unwrap();
        assert_eq!(
            reader.header(),
            ClipHeader {
                codec: Codec::Raw,
                fps: 20.0
            }
        );
        for ts in 0..3 {
            assert_eq!(reader.next_frame().unwrap().unwrap(), frame(ts, ts as u8 * 40));
        }
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn mjpg_clip_keeps_geometry_and_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.clip");
        let mut writer = ClipWriter::create(&path, Codec::Mjpg, 10.0).unwrap();
        writer.write_frame(&frame(1_000, 200)).unwrap();
        writer.write_frame(&frame(1_050, 10)).unwrap();
        drop(writer);

        let mut reader = ClipReader::open(&path).unwrap();
        let first = reader.next_frame().unwrap().unwrap();
        assert_eq!((first.width, first.height, first.timestamp_ms), (8, 6, 1_000));
        let second = reader.next_frame().unwrap().unwrap();
        assert_eq!(second.timestamp_ms, 1_050);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn records_are_on_disk_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.clip");
        let mut writer = ClipWriter::create(&path, Codec::Mjpg, 20.0).unwrap();
        writer.write_frame(&frame(7, 90)).unwrap();

        let mut reader = ClipReader::open(&path).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap().timestamp_ms, 7);
        assert!(reader.next_frame().unwrap().is_none());

        writer.write_frame(&frame(8, 90)).unwrap();
        let mut reader = ClipReader::open(&path).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap().timestamp_ms, 7);
        assert_eq!(reader.next_frame().unwrap().unwrap().timestamp_ms, 8);
        writer.close().unwrap();
    }

    #[test]
    fn truncated_trailing_record_reads_as_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.clip");
        let mut writer = ClipWriter::create(&path, Codec::Raw, 20.0).unwrap();
        writer.write_frame(&frame(1, 1)).unwrap();
        writer.write_frame(&frame(2, 2)).unwrap();
        writer.close().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();

        let mut reader = ClipReader::open(&path).unwrap();
        assert_eq!(reader.next_frame().unwrap().unwrap().timestamp_ms, 1);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn reopening_appends_after_valid_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("same-second.clip");
        {
            let mut writer = ClipWriter::create(&path, Codec::Raw, 20.0).unwrap();
            writer.write_frame(&frame(1, 1)).unwrap();
            writer.write_frame(&frame(2, 2)).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();
        {
            let mut writer = ClipWriter::create(&path, Codec::Raw, 20.0).unwrap();
            writer.write_frame(&frame(3, 3)).unwrap();
        }

        let mut reader = ClipReader::open(&path).unwrap();
        let stamps: Vec<i64> = std::iter::from_fn(|| reader.next_frame().unwrap())
            .map(|f| f.timestamp_ms)
            .collect();
        assert_eq!(stamps, vec![1, 3]);
    }

    #[test]
    fn reopening_with_other_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.clip");
        ClipWriter::create(&path, Codec::Raw, 20.0).unwrap();
        assert!(matches!(
            ClipWriter::create(&path, Codec::Mjpg, 20.0),
            Err(SinkError::Format(_))
        ));
    }

    #[test]
    fn header_validation() {
        assert!(matches!(
            ClipReader::new(Cursor::new(b"NOPE\x01MJPG\0\0\xa0A".to_vec())),
            Err(SinkError::Format(_))
        ));
        assert!(matches!(
            ClipReader::new(Cursor::new(b"MCLP".to_vec())),
            Err(SinkError::Format(_))
        ));
    }

    #[test]
    fn closed_writer_rejects_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ClipWriter::create(&dir.path().join("c.clip"), Codec::Raw, 5.0).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert!(matches!(
            writer.write_frame(&frame(0, 0)),
            Err(SinkError::Closed)
        ));
    }

    #[test]
    fn codec_parsing() {
        assert_eq!("mjpg".parse::<Codec>().unwrap(), Codec::Mjpg);
        assert_eq!("RAW".parse::<Codec>().unwrap(), Codec::Raw);
        assert!("XVID".parse::<Codec>().is_err());
        assert_eq!(Codec::Raw.to_string(), "RAW");
        assert_eq!(Codec::from_fourcc(*b"MJPG"), Some(Codec::Mjpg));
    }
}
