//! V4L2 capture driver using the v4l crate.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::driver::{frame_path, CaptureDriver, DriverError, Resolution, Result};
use crate::encode::{write_yuyv_as_jpeg, YuyvLayout};

/// Number of mmap buffers per capture stream.
const BUFFER_COUNT: u32 = 4;

/// Frames discarded before a single capture so exposure can settle.
const WARMUP_FRAMES: usize = 3;

/// Compressed formats written to disk as they arrive, in order of preference.
const JPEG_FOURCCS: [&[u8; 4]; 2] = [b"MJPG", b"JPEG"];

/// Raw format encoded to JPEG when the device offers no compressed format.
const RAW_FOURCC: &[u8; 4] = b"YUYV";

/// How frames delivered by the device become JPEG files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameFormat {
    Jpeg,
    Yuyv(YuyvLayout),
}

impl FrameFormat {
    fn write(self, path: &Path, data: &[u8]) -> Result<()> {
        match self {
            Self::Jpeg => write_frame(path, data),
            Self::Yuyv(layout) => {
                create_parent(path)?;
                write_yuyv_as_jpeg(path, data, layout)
            }
        }
    }
}

/// Capture driver for `/dev/video{index}`, producing JPEG frames.
///
/// Devices offering MJPG or JPEG deliver frames that are stored unchanged;
/// YUYV-only devices have their frames encoded on the host.
pub struct V4L2Driver {
    index: u32,
    device: Option<Device>,
    format: FrameFormat,
}

impl V4L2Driver {
    /// Create a closed driver for device `index` (e.g., 0 for /dev/video0).
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            device: None,
            format: FrameFormat::Jpeg,
        }
    }

    fn device(&self) -> Result<&Device> {
        self.device.as_ref().ok_or(DriverError::NotOpen)
    }
}

impl CaptureDriver for V4L2Driver {
    type Sequence<'a> = V4L2Sequence<'a>;

    fn open(&mut self) -> Result<()> {
        let device = Device::new(self.index as usize)
            .map_err(|err| DriverError::OpenFailed(err.to_string()))?;

        let caps = device
            .query_caps()
            .map_err(|err| DriverError::OpenFailed(err.to_string()))?;
        if !caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        {
            return Err(DriverError::OpenFailed(format!(
                "{} ({}) cannot stream video",
                caps.card, caps.driver
            )));
        }

        debug!(
            index = self.index,
            card = %caps.card,
            driver = %caps.driver,
            "device opened"
        );
        self.device = Some(device);
        Ok(())
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        let device = self.device()?;
        let offered: Vec<FourCC> = device
            .enum_formats()
            .map_err(|err| DriverError::Configuration(err.to_string()))?
            .into_iter()
            .map(|desc| desc.fourcc)
            .collect();
        let fourcc = choose_fourcc(&offered).ok_or_else(|| {
            DriverError::Configuration(format!(
                "device offers neither JPEG nor YUYV frames ({})",
                offered
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let mut fmt = device
            .format()
            .map_err(|err| DriverError::Configuration(err.to_string()))?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.fourcc = fourcc;

        let fmt = device
            .set_format(&fmt)
            .map_err(|err| DriverError::Configuration(err.to_string()))?;

        if fmt.fourcc != fourcc {
            return Err(DriverError::Configuration(format!(
                "device switched format from {fourcc} to {}",
                fmt.fourcc
            )));
        }
        if fmt.width != resolution.width || fmt.height != resolution.height {
            warn!(
                requested = %resolution,
                actual = %Resolution::new(fmt.width, fmt.height),
                "device adjusted resolution"
            );
        }

        self.format = if fourcc == FourCC::new(RAW_FOURCC) {
            FrameFormat::Yuyv(YuyvLayout {
                width: fmt.width,
                height: fmt.height,
                stride: fmt.stride,
            })
        } else {
            FrameFormat::Jpeg
        };
        debug!(%fourcc, format = ?self.format, "capture format set");
        Ok(())
    }

    fn capture_single(&mut self, path: &Path) -> Result<()> {
        let device = self.device()?;
        let mut stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| DriverError::CaptureFailed(err.to_string()))?;

        for _ in 0..WARMUP_FRAMES {
            stream
                .next()
                .map_err(|err| DriverError::CaptureFailed(err.to_string()))?;
        }
        let (buf, meta) = stream
            .next()
            .map_err(|err| DriverError::CaptureFailed(err.to_string()))?;

        self.format.write(path, used_bytes(buf, meta.bytesused))
    }

    fn capture_sequence(&mut self, directory: &Path) -> Result<Self::Sequence<'_>> {
        let device = self.device()?;
        fs::create_dir_all(directory)?;
        let stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|err| DriverError::CaptureFailed(err.to_string()))?;

        Ok(V4L2Sequence {
            stream,
            format: self.format,
            directory: directory.to_path_buf(),
            counter: 0,
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!(index = self.index, "device closed");
        }
        Ok(())
    }
}

/// Frame sequence backed by one mmap stream for the whole run.
pub struct V4L2Sequence<'a> {
    stream: Stream<'a>,
    format: FrameFormat,
    directory: PathBuf,
    counter: u32,
}

impl Iterator for V4L2Sequence<'_> {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = match self.stream.next() {
            Ok((buf, meta)) => used_bytes(buf, meta.bytesused),
            Err(err) => return Some(Err(DriverError::CaptureFailed(err.to_string()))),
        };

        self.counter += 1;
        let path = frame_path(&self.directory, self.counter);
        Some(self.format.write(&path, frame).map(|()| path))
    }
}

/// Preferred capture format among those the device offers.
fn choose_fourcc(offered: &[FourCC]) -> Option<FourCC> {
    JPEG_FOURCCS
        .iter()
        .chain(std::iter::once(&RAW_FOURCC))
        .map(|code| FourCC::new(code))
        .find(|fourcc| offered.contains(fourcc))
}

/// Part of a buffer actually filled by the driver.
fn used_bytes(buf: &[u8], bytes_used: u32) -> &[u8] {
    buf.get(..bytes_used as usize).unwrap_or(buf)
}

fn write_frame(path: &Path, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(DriverError::CaptureFailed("empty frame".to_owned()));
    }
    create_parent(path)?;
    fs::write(path, data)?;
    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
