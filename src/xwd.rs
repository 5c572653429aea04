//! Decoding of XWD Images
//!
//! XWD (X Window Dump) is the raster format written by the X11 `xwd` utility. A file
//! is a 100-byte big-endian header, the window name (header size minus 100 bytes,
//! conventionally NUL-terminated), a table of 12-byte color entries, and then the
//! pixel data as padded scanlines.
//!
//! This decoder only handles version 7 files in Z-pixmap format with pixels of at
//! least 3 whole bytes; `xwd -root` on TrueColor displays writes 24 or 32 bits per
//! pixel. Bitmap and XY-pixmap images are rejected.
//!
//! Known limitation: pixels are always read as little-endian packed BGR. The color
//! masks and byte order declared in the header are not applied, bytes past the third
//! one in wider pixels are skipped, and the colormap is parsed but not used to remap
//! pixel values.
//!
//! Streams that end early while pixel data is being read are accepted; the pixels
//! that were not reached are left zeroed. Capture tools sometimes close their
//! output a few bytes short.
//!
//! # Related Links
//! * <https://en.wikipedia.org/wiki/Xwd> - The XWD format on Wikipedia
//! * <https://gitlab.freedesktop.org/xorg/proto/xorgproto/-/blob/master/include/X11/XWDFile.h> - `XWDFile.h`

use std::borrow::Cow;
use std::fmt;
use std::io::{self, BufRead, Read};

use image::error::{
    DecodingError, ImageError, ImageFormatHint, ImageResult, LimitError, LimitErrorKind,
    UnsupportedError, UnsupportedErrorKind,
};
use image::{ColorType, ExtendedColorType, ImageDecoder, LimitSupport, Limits, RgbaImage};

/// Length of the fixed part of the header
const HEADER_LENGTH: usize = 100;

/// Length of one entry in the color table
const COLOR_ENTRY_LENGTH: usize = 12;

/// The only file version written since X11R3
const XWD_FILE_VERSION: u32 = 7;

const XY_BITMAP: u32 = 0;
const XY_PIXMAP: u32 = 1;
const Z_PIXMAP: u32 = 2;

/// X11 drawables cannot exceed a signed 16-bit coordinate
const MAX_DIMENSION: u32 = 0x7FFF;

/// The fixed part of an XWD header, as stored in the file.
///
/// See `XWDFileHeader` in `X11/XWDFile.h`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XwdHeader {
    /// Size of the fixed header plus the window name
    pub header_size: u32,
    pub file_version: u32,
    /// 0 = XYBitmap, 1 = XYPixmap, 2 = ZPixmap
    pub pixmap_format: u32,
    pub pixmap_depth: u32,
    pub pixmap_width: u32,
    pub pixmap_height: u32,
    pub xoffset: u32,
    /// Byte order of the image data (0 = LSBFirst, 1 = MSBFirst)
    pub byte_order: u32,
    /// Number of bits each scanline is padded to
    pub bitmap_unit: u32,
    pub bitmap_bit_order: u32,
    pub bitmap_pad: u32,
    pub bits_per_pixel: u32,
    pub bytes_per_line: u32,
    pub visual_class: u32,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub bits_per_rgb: u32,
    pub colormap_entries: u32,
    /// Number of entries in the color table that follows the window name
    pub ncolors: u32,
    pub window_width: u32,
    pub window_height: u32,
    pub window_x: u32,
    pub window_y: u32,
    pub window_border_width: u32,
}

impl XwdHeader {
    /// Decode the header fields, in file order.
    fn parse(bytes: &[u8; HEADER_LENGTH]) -> XwdHeader {
        let mut fields = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
        let mut next = || fields.next().unwrap_or_default();

        XwdHeader {
            header_size: next(),
            file_version: next(),
            pixmap_format: next(),
            pixmap_depth: next(),
            pixmap_width: next(),
            pixmap_height: next(),
            xoffset: next(),
            byte_order: next(),
            bitmap_unit: next(),
            bitmap_bit_order: next(),
            bitmap_pad: next(),
            bits_per_pixel: next(),
            bytes_per_line: next(),
            visual_class: next(),
            red_mask: next(),
            green_mask: next(),
            blue_mask: next(),
            bits_per_rgb: next(),
            colormap_entries: next(),
            ncolors: next(),
            window_width: next(),
            window_height: next(),
            window_x: next(),
            window_y: next(),
            window_border_width: next(),
        }
    }

    /// Bytes skipped after each scanline
    fn row_padding(&self) -> u64 {
        let unused_bits = self.bitmap_unit.saturating_sub(self.bits_per_pixel);
        u64::from(self.pixmap_width) * u64::from(unused_bits) / 8
    }
}

/// An entry of the color table (`XWDColor` in `X11/XWDFile.h`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XwdColor {
    pub pixel: u32,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
    pub flags: u8,
    pub pad: u8,
}

impl XwdColor {
    fn parse(bytes: &[u8; COLOR_ENTRY_LENGTH]) -> XwdColor {
        XwdColor {
            pixel: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            red: u16::from_be_bytes([bytes[4], bytes[5]]),
            green: u16::from_be_bytes([bytes[6], bytes[7]]),
            blue: u16::from_be_bytes([bytes[8], bytes[9]]),
            flags: bytes[10],
            pad: bytes[11],
        }
    }
}

/// Part of the XWD file in which the stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XwdPart {
    WindowName,
    Colormap,
}

impl fmt::Display for XwdPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WindowName => f.write_str("window name"),
            Self::Colormap => f.write_str("color table"),
        }
    }
}

/// Errors which can occur while decoding an XWD image
#[derive(Debug)]
pub enum XwdError {
    /// The header is shorter than 100 bytes or inconsistent
    MalformedHeader(&'static str),
    UnsupportedVersion(u32),
    /// The pixmap format is not ZPixmap
    UnsupportedFormat(u32),
    /// Bits per pixel is not a whole number of bytes, or less than 3 bytes
    InvalidPixelFormat(u32),
    InvalidDimensions(u32, u32),
    /// The stream ended before the header, window name or color table was complete
    TruncatedStream(XwdPart),
    /// The underlying reader failed
    StreamError(io::Error),
}

impl fmt::Display for XwdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader(reason) => write!(f, "Malformed header: {reason}"),
            Self::UnsupportedVersion(version) => {
                write!(f, "Unsupported file version {version} (expected 7)")
            }
            Self::UnsupportedFormat(XY_BITMAP) => f.write_str("XYBitmap images are not supported"),
            Self::UnsupportedFormat(XY_PIXMAP) => f.write_str("XYPixmap images are not supported"),
            Self::UnsupportedFormat(code) => write!(f, "Unknown pixmap format {code}"),
            Self::InvalidPixelFormat(bpp) => {
                write!(
                    f,
                    "Unsupported bits per pixel {bpp} (expected a multiple of 8, at least 24)"
                )
            }
            Self::InvalidDimensions(width, height) => write!(
                f,
                "Invalid image dimensions {width}x{height} (zero, or too large to allocate)"
            ),
            Self::TruncatedStream(part) => write!(f, "File ended inside the {part}"),
            Self::StreamError(err) => write!(f, "Error reading image data: {err}"),
        }
    }
}

impl std::error::Error for XwdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StreamError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<XwdError> for ImageError {
    fn from(e: XwdError) -> ImageError {
        match e {
            XwdError::UnsupportedVersion(_) | XwdError::UnsupportedFormat(_) => {
                ImageError::Unsupported(UnsupportedError::from_format_and_kind(
                    format_hint(),
                    UnsupportedErrorKind::GenericFeature(e.to_string()),
                ))
            }
            XwdError::InvalidDimensions(..) => {
                ImageError::Limits(LimitError::from_kind(LimitErrorKind::DimensionError))
            }
            XwdError::StreamError(inner) => ImageError::IoError(inner),
            _ => ImageError::Decoding(DecodingError::new(format_hint(), e)),
        }
    }
}

fn format_hint() -> ImageFormatHint {
    ImageFormatHint::Name("XWD".to_string())
}

/// Fill `buf` completely. Returns `Ok(false)` if the stream ended first.
fn read_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, XwdError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(XwdError::StreamError(e)),
    }
}

/// Discard `len` bytes. Returns `Ok(false)` if the stream ended first.
fn skip_or_eof<R: Read>(r: &mut R, len: u64) -> Result<bool, XwdError> {
    let skipped = io::copy(&mut r.take(len), &mut io::sink()).map_err(XwdError::StreamError)?;
    Ok(skipped == len)
}

/// Decoder for XWD images.
pub struct XwdDecoder<R> {
    reader: R,
    header: XwdHeader,
    window_name: Vec<u8>,
    colormap: Vec<XwdColor>,
}

impl<R> XwdDecoder<R>
where
    R: BufRead,
{
    /// Create a new `XwdDecoder`, reading everything up to the pixel data.
    ///
    /// The reader does not need to be seekable; data piped from a capture tool works.
    pub fn new(r: R) -> Result<XwdDecoder<R>, ImageError> {
        Ok(Self::read_metadata(r)?)
    }

    fn read_metadata(mut r: R) -> Result<XwdDecoder<R>, XwdError> {
        let mut header_buf = [0_u8; HEADER_LENGTH];
        if !read_or_eof(&mut r, &mut header_buf)? {
            return Err(XwdError::MalformedHeader("file is shorter than 100 bytes"));
        }
        let header = XwdHeader::parse(&header_buf);

        if header.file_version != XWD_FILE_VERSION {
            return Err(XwdError::UnsupportedVersion(header.file_version));
        }
        if header.pixmap_format != Z_PIXMAP {
            return Err(XwdError::UnsupportedFormat(header.pixmap_format));
        }

        let name_len = header
            .header_size
            .checked_sub(HEADER_LENGTH as u32)
            .ok_or(XwdError::MalformedHeader("header size is less than 100"))?;
        let mut window_name = Vec::new();
        (&mut r)
            .take(u64::from(name_len))
            .read_to_end(&mut window_name)
            .map_err(XwdError::StreamError)?;
        if window_name.len() != name_len as usize {
            return Err(XwdError::TruncatedStream(XwdPart::WindowName));
        }

        let mut colormap = Vec::new();
        for _ in 0..header.ncolors {
            let mut entry = [0_u8; COLOR_ENTRY_LENGTH];
            if !read_or_eof(&mut r, &mut entry)? {
                return Err(XwdError::TruncatedStream(XwdPart::Colormap));
            }
            colormap.push(XwdColor::parse(&entry));
        }

        // Pixels are read as BGR, so anything narrower than 3 bytes cannot be mapped
        let bpp = header.bits_per_pixel;
        if bpp % 8 != 0 || bpp < 24 {
            return Err(XwdError::InvalidPixelFormat(bpp));
        }

        let (width, height) = (header.pixmap_width, header.pixmap_height);
        if !(1..=MAX_DIMENSION).contains(&width) || !(1..=MAX_DIMENSION).contains(&height) {
            return Err(XwdError::InvalidDimensions(width, height));
        }

        Ok(XwdDecoder {
            reader: r,
            header,
            window_name,
            colormap,
        })
    }

    /// The fixed header fields.
    pub fn header(&self) -> &XwdHeader {
        &self.header
    }

    /// The window name, up to its terminating NUL.
    pub fn window_name(&self) -> Cow<'_, str> {
        let end = self
            .window_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.window_name.len());
        String::from_utf8_lossy(&self.window_name[..end])
    }

    /// The raw window name field, including the terminator and anything after it.
    pub fn window_name_bytes(&self) -> &[u8] {
        &self.window_name
    }

    /// The color table. It is not applied to the decoded pixels.
    pub fn colormap(&self) -> &[XwdColor] {
        &self.colormap
    }

    /// Read the scanlines into an RGBA8 buffer of `total_bytes()` length.
    fn read_pixels(&mut self, buf: &mut [u8]) -> Result<(), XwdError> {
        // Pixels after an early end of stream stay zeroed
        buf.fill(0);

        let width = self.header.pixmap_width as usize;
        // Only the low three bytes of each pixel are used
        let unused_pixel_bytes = u64::from(self.header.bits_per_pixel / 8 - 3);
        let padding = self.header.row_padding();

        let mut pixel = [0_u8; 3];
        for row in buf.chunks_exact_mut(width * 4) {
            for px in row.chunks_exact_mut(4) {
                if !read_or_eof(&mut self.reader, &mut pixel)? {
                    return Ok(());
                }
                if unused_pixel_bytes > 0 && !skip_or_eof(&mut self.reader, unused_pixel_bytes)? {
                    return Ok(());
                }
                px.copy_from_slice(&[pixel[2], pixel[1], pixel[0], 0xFF]);
            }
            if padding > 0 && !skip_or_eof(&mut self.reader, padding)? {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Decode an XWD image from `r` into an RGBA raster.
///
/// If the stream ends while pixel data is being read, the image decoded so far is
/// returned and the remaining pixels are zero.
///
/// The raster is limited to the image crate's default `max_alloc` (512 MiB); use
/// [`XwdDecoder`] with [`ImageDecoder::set_limits`] to decode larger images.
pub fn decode<R: BufRead>(r: R) -> Result<RgbaImage, XwdError> {
    let mut decoder = XwdDecoder::read_metadata(r)?;
    let (width, height) = (decoder.header.pixmap_width, decoder.header.pixmap_height);

    let len = width as usize * height as usize * 4;
    if Limits::default()
        .max_alloc
        .is_some_and(|max_alloc| len as u64 > max_alloc)
    {
        return Err(XwdError::InvalidDimensions(width, height));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| XwdError::InvalidDimensions(width, height))?;
    buf.resize(len, 0);

    decoder.read_pixels(&mut buf)?;
    RgbaImage::from_raw(width, height, buf).ok_or(XwdError::InvalidDimensions(width, height))
}

impl<R: BufRead> ImageDecoder for XwdDecoder<R> {
    fn dimensions(&self) -> (u32, u32) {
        (self.header.pixmap_width, self.header.pixmap_height)
    }

    fn color_type(&self) -> ColorType {
        ColorType::Rgba8
    }

    fn original_color_type(&self) -> ExtendedColorType {
        if self.header.pixmap_depth == 32 {
            ExtendedColorType::Rgba8
        } else {
            ExtendedColorType::Rgb8
        }
    }

    fn read_image(mut self, buf: &mut [u8]) -> ImageResult<()> {
        assert_eq!(u64::try_from(buf.len()), Ok(self.total_bytes()));

        Ok(self.read_pixels(buf)?)
    }

    fn read_image_boxed(self: Box<Self>, buf: &mut [u8]) -> ImageResult<()> {
        (*self).read_image(buf)
    }

    fn set_limits(&mut self, limits: Limits) -> ImageResult<()> {
        limits.check_support(&LimitSupport::default())?;
        let (width, height) = self.dimensions();
        limits.check_dimensions(width, height)?;

        let max_alloc = limits.max_alloc.unwrap_or(u64::MAX);
        if max_alloc < self.total_bytes() {
            return Err(ImageError::Limits(LimitError::from_kind(
                LimitErrorKind::InsufficientMemory,
            )));
        }
        Ok(())
    }
}
