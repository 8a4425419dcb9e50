//! ffmpeg subprocess readers.
//!
//! ffmpeg decodes whatever the source is and writes a stream of binary PPM
//! images to stdout. PPM carries its own geometry, so the reader does not need
//! to know the native resolution up front.

use std::{
    io::{BufRead, BufReader, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    source::parse_device_index,
    types::{CaptureError, Frame, FrameFormat},
};

const READER_QUEUE: usize = 2;

/// Capture from a V4L2 device (`0`, `/dev/video0`, ...).
pub fn spawn_device_reader(uri: &str) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let device = match parse_device_index(uri) {
        Some(index) => format!("/dev/video{index}"),
        None => uri.to_string(),
    };

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-f")
        .arg("video4linux2")
        .arg("-i")
        .arg(&device);
    push_output_args(&mut cmd);

    spawn_ffmpeg_reader(cmd, uri)
}

/// Capture from an RTSP camera over TCP with low-latency flags.
pub fn spawn_rtsp_reader(uri: &str) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-rtsp_transport")
        .arg("tcp")
        .arg("-fflags")
        .arg("nobuffer")
        .arg("-flags")
        .arg("low_delay")
        .arg("-i")
        .arg(uri)
        .arg("-an");
    push_output_args(&mut cmd);

    spawn_ffmpeg_reader(cmd, uri)
}

/// Replay a video file at its native rate, as if it were a live camera.
pub fn spawn_file_reader(path: &str) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-re")
        .arg("-i")
        .arg(path)
        .arg("-an");
    push_output_args(&mut cmd);

    spawn_ffmpeg_reader(cmd, path)
}

fn push_output_args(cmd: &mut Command) {
    cmd.arg("-pix_fmt")
        .arg("rgb24")
        .arg("-f")
        .arg("image2pipe")
        .arg("-vcodec")
        .arg("ppm")
        .arg("-");
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    uri: &str,
) -> Result<Receiver<Result<Frame, CaptureError>>, CaptureError> {
    let (tx, rx) = bounded(READER_QUEUE);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| {
        warn!("failed to spawn ffmpeg for {uri}: {err}");
        CaptureError::Open {
            uri: uri.to_string(),
        }
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    let label = uri.to_string();
    thread::Builder::new()
        .name("ffmpeg-reader".into())
        .spawn(move || {
            if let Err(err) = ffmpeg_loop(stdout, child, tx.clone()) {
                debug!("ffmpeg reader for {label} stopped: {err}");
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

fn ffmpeg_loop(
    stdout: impl Read,
    mut child: Child,
    tx: Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let mut reader = BufReader::new(stdout);
    let mut result = Ok(());

    loop {
        match read_ppm_frame(&mut reader) {
            Ok(Some(frame)) => {
                // Receiver gone means the source was stopped.
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                result = Err(CaptureError::EndOfStream);
                break;
            }
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }

    let _ = child.kill();
    let _ = child.wait();
    result
}

/// Read one binary PPM (`P6`) image. Returns `Ok(None)` on a clean end of
/// stream between images.
pub fn read_ppm_frame(reader: &mut impl BufRead) -> Result<Option<Frame>, CaptureError> {
    let Some(magic) = next_token(reader)? else {
        return Ok(None);
    };
    if magic != "P6" {
        return Err(CaptureError::Other(anyhow!("unexpected PNM magic {magic:?}")));
    }
    let width = header_number(reader, "width")?;
    let height = header_number(reader, "height")?;
    let max_value = header_number(reader, "max value")?;
    if max_value != 255 {
        return Err(CaptureError::Other(anyhow!(
            "unsupported PNM max value {max_value}"
        )));
    }

    let mut data = vec![0u8; (width as usize) * (height as usize) * 3];
    reader
        .read_exact(&mut data)
        .map_err(|err| CaptureError::Other(err.into()))?;

    let timestamp_ms = Utc::now().timestamp_millis();
    Frame::new(data, width, height, timestamp_ms, FrameFormat::Rgb8).map(Some)
}

fn header_number(reader: &mut impl BufRead, field: &str) -> Result<u32, CaptureError> {
    let token = next_token(reader)?
        .ok_or_else(|| CaptureError::Other(anyhow!("PNM header truncated before {field}")))?;
    token
        .parse::<u32>()
        .map_err(|_| CaptureError::Other(anyhow!("invalid PNM {field} {token:?}")))
}

/// Read a whitespace-delimited header token, consuming exactly one trailing
/// whitespace byte so the pixel payload starts at the reader position.
fn next_token(reader: &mut impl BufRead) -> Result<Option<String>, CaptureError> {
    let mut token = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                let b = byte[0];
                if b == b'#' && token.is_empty() {
                    let mut comment = Vec::new();
                    reader
                        .read_until(b'\n', &mut comment)
                        .map_err(|err| CaptureError::Other(err.into()))?;
                    continue;
                }
                if b.is_ascii_whitespace() {
                    if token.is_empty() {
                        continue;
                    }
                    break;
                }
                token.push(b);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }

    if token.is_empty() {
        return Ok(None);
    }
    String::from_utf8(token)
        .map(Some)
        .map_err(|_| CaptureError::Other(anyhow!("PNM header is not ASCII")))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn ppm(width: u32, height: u32, fill: u8) -> Vec<u8> {
        let mut bytes = format!("P6\n{width} {height}\n255\n").into_bytes();
        bytes.extend(std::iter::repeat_n(fill, (width * height * 3) as usize));
        bytes
    }

    #[test]
    fn reads_consecutive_ppm_frames() {
        let mut stream = ppm(2, 2, 10);
        stream.extend(ppm(3, 1, 200));
        let mut reader = Cursor::new(stream);

        let first = read_ppm_frame(&mut reader).unwrap().unwrap();
        assert_eq!((first.width, first.height), (2, 2));
        assert!(first.data.iter().all(|&b| b == 10));

        let second = read_ppm_frame(&mut reader).unwrap().unwrap();
        assert_eq!((second.width, second.height), (3, 1));
        assert_eq!(second.format, FrameFormat::Rgb8);
        assert!(second.data.iter().all(|&b| b == 200));

        assert!(read_ppm_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn pixel_payload_starting_with_whitespace_byte_is_preserved() {
        let mut stream = b"P6 1 1 255\n".to_vec();
        stream.extend_from_slice(&[b'\n', b' ', 7]);
        let frame = read_ppm_frame(&mut Cursor::new(stream)).unwrap().unwrap();
        assert_eq!(frame.data, vec![b'\n', b' ', 7]);
    }

    #[test]
    fn header_comments_are_skipped() {
        let mut stream = b"P6\n# made by a test\n1 1\n255\n".to_vec();
        stream.extend_from_slice(&[1, 2, 3]);
        let frame = read_ppm_frame(&mut Cursor::new(stream)).unwrap().unwrap();
        assert_eq!(frame.data, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_unknown_magic_and_truncated_payload() {
        let err = read_ppm_frame(&mut Cursor::new(b"P5\n1 1\n255\n\0".to_vec())).unwrap_err();
        assert!(err.to_string().contains("magic"));

        let err = read_ppm_frame(&mut Cursor::new(b"P6\n2 2\n255\n\0\0".to_vec())).unwrap_err();
        assert!(matches!(err, CaptureError::Other(_)));
    }
}
