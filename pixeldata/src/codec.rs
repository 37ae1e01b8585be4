//! Bit-level packing and unpacking of native pixel samples.
//!
//! Samples are stored in cells of _bits allocated_ bits,
//! packed least significant bit first into little endian 16-bit words.
//! When the cell width does not divide 16,
//! the bits left over from one word carry over into the next cell.
//! Within a cell, the sample occupies the _bits stored_ bits
//! ending at _high bit_;
//! the remaining bits may hold overlay data.
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::trace;

use crate::buffer::PixelSampleBuffer;
use crate::layout::{LayoutError, PixelLayout};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid pixel layout"))]
    Layout {
        #[snafu(backtrace)]
        source: LayoutError,
    },

    #[snafu(display("Pixel data ended after {} of {} samples", read, expected))]
    Truncated {
        read: u64,
        expected: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read pixel data"))]
    ReadWord {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write pixel data"))]
    WriteWord {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not reposition the pixel data stream"))]
    Seek {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Sample value {} does not fit in {} stored bits", value, bits_stored))]
    SampleOutOfRange {
        value: i32,
        bits_stored: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("No sample at frame {}, plane {}, pixel {}", frame, plane, pixel))]
    OutOfBounds {
        frame: u32,
        plane: u16,
        pixel: u32,
        backtrace: Backtrace,
    },

    /// Sample buffer shape does not match the pixel layout
    ShapeMismatch { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1 << bits) - 1
    }
}

/// Extract the stored sample from a cell.
///
/// The window of `bits_stored` bits ending at `high_bit`
/// is shifted to the top of a 32-bit integer and back down,
/// so that signed samples are sign extended
/// and unsigned samples are zero extended.
pub fn sample_bits_from_cell(cell: u16, high_bit: u16, bits_stored: u16, signed: bool) -> i32 {
    let v = (u32::from(cell) << (32 - u32::from(high_bit) - 1)) as i32;
    let shift = 32 - u32::from(bits_stored);
    if signed {
        v >> shift
    } else {
        ((v as u32) >> shift) as i32
    }
}

/// The bits of a cell outside of the stored sample window.
pub fn overlay_bits_from_cell(cell: u16, layout: &PixelLayout) -> u16 {
    let low_bit = u32::from(layout.high_bit()) + 1 - u32::from(layout.bits_stored());
    let window = mask(u32::from(layout.bits_stored())) << low_bit;
    (u32::from(cell) & mask(u32::from(layout.bits_allocated())) & !window) as u16
}

/// Reads native pixel samples from a byte stream.
#[derive(Debug)]
pub struct BitUnpacker<R> {
    reader: R,
    layout: PixelLayout,
    /// bits read from the stream but not yet consumed, lowest first
    bits: u32,
    bit_count: u32,
    cells_read: u64,
    bytes_read: u64,
}

impl<R> BitUnpacker<R>
where
    R: Read,
{
    /// Create an unpacker for the pixel data starting
    /// at the current position of the reader.
    pub fn new(reader: R, layout: PixelLayout) -> Result<Self> {
        let layout = layout.validate().context(LayoutSnafu)?;
        Ok(BitUnpacker {
            reader,
            layout,
            bits: 0,
            bit_count: 0,
            cells_read: 0,
            bytes_read: 0,
        })
    }

    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next 16-bit word into the bit accumulator.
    ///
    /// A lone trailing byte counts as a word with 8 bits,
    /// for pixel data stored without its padding byte.
    fn fetch_word(&mut self) -> Result<()> {
        let mut word = [0_u8; 2];
        let mut filled = 0;
        while filled < 2 {
            match self.reader.read(&mut word[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(ReadWordSnafu),
            }
        }
        ensure!(
            filled > 0,
            TruncatedSnafu {
                read: self.cells_read,
                expected: self.layout.total_samples(),
            }
        );
        self.bytes_read += filled as u64;
        let value = u32::from(u16::from_le_bytes(word));
        self.bits |= value << self.bit_count;
        self.bit_count += 8 * filled as u32;
        Ok(())
    }

    /// Read the next whole cell of _bits allocated_ bits.
    pub fn read_sample_cell(&mut self) -> Result<u16> {
        let width = u32::from(self.layout.bits_allocated());
        while self.bit_count < width {
            let before = self.bit_count;
            self.fetch_word()?;
            // a partial word which still does not complete the cell
            ensure!(
                self.bit_count - before == 16 || self.bit_count >= width,
                TruncatedSnafu {
                    read: self.cells_read,
                    expected: self.layout.total_samples(),
                }
            );
        }
        let cell = self.bits & mask(width);
        self.bits >>= width;
        self.bit_count -= width;
        self.cells_read += 1;
        Ok(cell as u16)
    }

    /// Interpret a cell according to the layout of this unpacker.
    pub fn sample_from_cell(&self, cell: u16) -> i32 {
        sample_bits_from_cell(
            cell,
            self.layout.high_bit(),
            self.layout.bits_stored(),
            self.layout.is_signed(),
        )
    }

    pub fn read_sample(&mut self) -> Result<i32> {
        let cell = self.read_sample_cell()?;
        Ok(self.sample_from_cell(cell))
    }

    /// Decode every sample of the pixel data, in stream order.
    ///
    /// When `grab_overlay_bits` is set,
    /// the bits of each cell outside of the sample window are kept as well,
    /// see [`PixelSampleBuffer::overlay`].
    pub fn read_pixel_data(&mut self, grab_overlay_bits: bool) -> Result<PixelSampleBuffer> {
        let layout = self.layout;
        let mut buffer = PixelSampleBuffer::zeros(&layout);
        if grab_overlay_bits {
            buffer = buffer.with_overlay();
        }
        let total = layout.total_samples();
        trace!("Decoding {} samples of {} bits", total, layout.bits_allocated());
        for i in 0..total {
            let cell = self.read_sample_cell()?;
            let (frame, plane, pixel) = layout.coordinates(i);
            buffer.set(frame, plane, pixel, self.sample_from_cell(cell));
            if grab_overlay_bits {
                buffer.set_overlay(frame, plane, pixel, overlay_bits_from_cell(cell, &layout));
            }
        }
        Ok(buffer)
    }
}

impl<R> BitUnpacker<R>
where
    R: Read + Seek,
{
    /// Read one sample anywhere in the pixel data,
    /// leaving the unpacker where it was.
    ///
    /// The stream is rewound to the start of the pixel data
    /// and moved forward to the sample on every call,
    /// which is slow when done repeatedly.
    /// Prefer [`read_pixel_data`](Self::read_pixel_data) to visit many samples.
    pub fn sample_at(&mut self, frame: u32, plane: u16, pixel: u32) -> Result<i32> {
        let layout = self.layout;
        ensure!(
            frame < layout.number_of_frames()
                && plane < layout.samples_per_pixel()
                && pixel < layout.pixels_per_frame(),
            OutOfBoundsSnafu {
                frame,
                plane,
                pixel
            }
        );

        let mark = self.reader.stream_position().context(SeekSnafu)?;
        let saved = (self.bits, self.bit_count, self.cells_read, self.bytes_read);
        let start = mark - self.bytes_read;

        let target = layout.stream_index(frame, plane, pixel);
        let skip_bits = target * u64::from(layout.bits_allocated());
        let skip_bytes = skip_bits / 16 * 2;
        let result = self
            .reader
            .seek(SeekFrom::Start(start + skip_bytes))
            .context(SeekSnafu)
            .and_then(|_| {
                self.bits = 0;
                self.bit_count = 0;
                self.cells_read = target;
                self.bytes_read = skip_bytes;
                let remainder = (skip_bits % 16) as u32;
                if remainder > 0 {
                    self.fetch_word()?;
                    self.bits >>= remainder;
                    self.bit_count -= remainder;
                }
                self.read_sample()
            });

        self.reader
            .seek(SeekFrom::Start(mark))
            .context(SeekSnafu)?;
        let (bits, bit_count, cells_read, bytes_read) = saved;
        self.bits = bits;
        self.bit_count = bit_count;
        self.cells_read = cells_read;
        self.bytes_read = bytes_read;
        result
    }
}

/// Decode a whole native pixel data value.
///
/// The length of `data` is checked against the layout
/// before anything is decoded.
pub fn decode(
    data: &[u8],
    layout: &PixelLayout,
    grab_overlay_bits: bool,
) -> Result<PixelSampleBuffer> {
    let layout = layout.validate().context(LayoutSnafu)?;
    layout.check_length(data.len() as u64).context(LayoutSnafu)?;
    BitUnpacker::new(data, layout)?.read_pixel_data(grab_overlay_bits)
}

/// Writes native pixel samples into a byte stream.
///
/// At most one partial word is held back at any time.
/// Call [`finish`](Self::finish) to write it out.
#[derive(Debug)]
pub struct BitPacker<W> {
    writer: W,
    layout: PixelLayout,
    bits: u32,
    bit_count: u32,
}

impl<W> BitPacker<W>
where
    W: Write,
{
    pub fn new(writer: W, layout: PixelLayout) -> Result<Self> {
        let layout = layout.validate().context(LayoutSnafu)?;
        Ok(BitPacker {
            writer,
            layout,
            bits: 0,
            bit_count: 0,
        })
    }

    pub fn layout(&self) -> &PixelLayout {
        &self.layout
    }

    /// Place a sample in its cell, next to the given overlay bits.
    pub fn cell_from_sample(&self, sample: i32, overlay_bits: u16) -> Result<u16> {
        let bits_stored = self.layout.bits_stored();
        let (min, max) = if self.layout.is_signed() {
            (-(1_i32 << (bits_stored - 1)), (1_i32 << (bits_stored - 1)) - 1)
        } else {
            (0, (1_i32 << bits_stored) - 1)
        };
        ensure!(
            sample >= min && sample <= max,
            SampleOutOfRangeSnafu {
                value: sample,
                bits_stored,
            }
        );
        let low_bit = u32::from(self.layout.high_bit()) + 1 - u32::from(bits_stored);
        let window = mask(u32::from(bits_stored)) << low_bit;
        let sample_bits = ((sample as u32) & mask(u32::from(bits_stored))) << low_bit;
        let overlay = u32::from(overlay_bits) & !window;
        Ok(((sample_bits | overlay) & mask(u32::from(self.layout.bits_allocated()))) as u16)
    }

    /// Append one cell of _bits allocated_ bits.
    pub fn write_sample_cell(&mut self, cell: u16) -> Result<()> {
        let width = u32::from(self.layout.bits_allocated());
        self.bits |= (u32::from(cell) & mask(width)) << self.bit_count;
        self.bit_count += width;
        while self.bit_count >= 16 {
            self.writer
                .write_u16::<LittleEndian>(self.bits as u16)
                .context(WriteWordSnafu)?;
            self.bits >>= 16;
            self.bit_count -= 16;
        }
        Ok(())
    }

    pub fn write_sample(&mut self, sample: i32) -> Result<()> {
        let cell = self.cell_from_sample(sample, 0)?;
        self.write_sample_cell(cell)
    }

    /// Encode every sample of the buffer, in stream order.
    pub fn write_pixel_data(&mut self, buffer: &PixelSampleBuffer) -> Result<()> {
        let layout = self.layout;
        ensure!(
            buffer.frames() == layout.number_of_frames()
                && buffer.planes() == layout.samples_per_pixel()
                && buffer.pixels() == layout.pixels_per_frame(),
            ShapeMismatchSnafu
        );
        for i in 0..layout.total_samples() {
            let (frame, plane, pixel) = layout.coordinates(i);
            let sample = buffer.get(frame, plane, pixel).unwrap_or_default();
            let overlay = buffer.overlay(frame, plane, pixel).unwrap_or_default();
            let cell = self.cell_from_sample(sample, overlay)?;
            self.write_sample_cell(cell)?;
        }
        Ok(())
    }

    /// Write out the last partial word, padded with zeros,
    /// and hand back the writer.
    pub fn finish(mut self) -> Result<W> {
        if self.bit_count > 0 {
            self.writer
                .write_u16::<LittleEndian>(self.bits as u16)
                .context(WriteWordSnafu)?;
            self.bits = 0;
            self.bit_count = 0;
        }
        self.writer.flush().context(WriteWordSnafu)?;
        Ok(self.writer)
    }
}

/// Encode a whole sample buffer into native pixel data,
/// padded to a whole number of 16-bit words.
pub fn encode(buffer: &PixelSampleBuffer, layout: &PixelLayout) -> Result<Vec<u8>> {
    let mut packer = BitPacker::new(Vec::new(), *layout)?;
    packer.write_pixel_data(buffer)?;
    packer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{PixelRepresentation, PlanarConfiguration};
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    #[case(0x800, true, -2048)]
    #[case(0x800, false, 2048)]
    #[case(0xFFF, true, -1)]
    #[case(0xFFF, false, 4095)]
    #[case(0x7FF, true, 2047)]
    fn twelve_bit_sign_extension(#[case] cell: u16, #[case] signed: bool, #[case] expected: i32) {
        assert_eq!(sample_bits_from_cell(cell, 11, 12, signed), expected);
    }

    #[test]
    fn bits_above_high_bit_are_not_part_of_the_sample() {
        // overlay bit at position 15, sample window 11..=0
        assert_eq!(sample_bits_from_cell(0x8800, 11, 12, true), -2048);
        assert_eq!(sample_bits_from_cell(0x8800, 11, 12, false), 2048);

        // window 13..=2 within a 16-bit cell
        assert_eq!(sample_bits_from_cell(0b0010_0000_0000_0100, 13, 12, true), -2047);
    }

    #[test]
    fn eight_bit_cells_follow_byte_order() {
        let layout = PixelLayout::new(1, 3, 8);
        let mut unpacker = BitUnpacker::new(&[1_u8, 2, 3, 0][..], layout).unwrap();
        assert_eq!(unpacker.read_sample().unwrap(), 1);
        assert_eq!(unpacker.read_sample().unwrap(), 2);
        assert_eq!(unpacker.read_sample().unwrap(), 3);
    }

    #[test]
    fn twelve_bit_cells_carry_over_between_words() {
        // cells 0xABC, 0xDEF, 0x123, 0x456 packed into three words
        let words: [u16; 3] = [0xFABC, 0x23DE, 0x4561];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let layout = PixelLayout::new(2, 2, 12);
        let mut unpacker = BitUnpacker::new(&bytes[..], layout).unwrap();
        let cells: Vec<u16> = (0..4)
            .map(|_| unpacker.read_sample_cell().unwrap())
            .collect();
        assert_eq!(cells, vec![0xABC, 0xDEF, 0x123, 0x456]);

        let mut packer = BitPacker::new(Vec::new(), layout).unwrap();
        for cell in cells {
            packer.write_sample_cell(cell).unwrap();
        }
        assert_eq!(packer.finish().unwrap(), bytes);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let layout = PixelLayout::new(2, 2, 16);
        let mut unpacker = BitUnpacker::new(&[1_u8, 0, 2, 0, 3][..], layout).unwrap();
        let err = unpacker.read_pixel_data(false).unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                read: 2,
                expected: 4,
                ..
            }
        ));
    }

    #[test]
    fn length_is_checked_before_decoding() {
        let layout = PixelLayout::new(4, 4, 16);
        assert!(matches!(
            decode(&[0; 30], &layout, false),
            Err(Error::Layout {
                source: LayoutError::LengthMismatch { .. }
            })
        ));
        // odd 8-bit pixel data without its padding byte
        let layout = PixelLayout::new(1, 3, 8);
        let buffer = decode(&[7, 8, 9], &layout, false).unwrap();
        assert_eq!(buffer.samples(), &[7, 8, 9]);
    }

    #[test]
    fn out_of_range_samples_are_rejected() {
        let layout = PixelLayout::new(1, 1, 16)
            .with_bits_stored(12, 11)
            .with_pixel_representation(PixelRepresentation::Signed);
        let mut packer = BitPacker::new(Vec::new(), layout).unwrap();
        assert!(packer.write_sample(-2048).is_ok());
        assert!(matches!(
            packer.write_sample(2048),
            Err(Error::SampleOutOfRange {
                value: 2048,
                bits_stored: 12,
                ..
            })
        ));
    }

    #[test]
    fn overlay_bits_survive_a_round_trip() {
        let layout = PixelLayout::new(1, 2, 16).with_bits_stored(12, 11);
        let mut buffer = PixelSampleBuffer::zeros(&layout).with_overlay();
        buffer.set(0, 0, 0, 0xABC);
        buffer.set_overlay(0, 0, 0, 0x8000);
        buffer.set(0, 0, 1, 0x123);
        buffer.set_overlay(0, 0, 1, 0x1000);

        let bytes = encode(&buffer, &layout).unwrap();
        assert_eq!(bytes, vec![0xBC, 0x8A, 0x23, 0x11]);

        let decoded = decode(&bytes, &layout, true).unwrap();
        assert_eq!(decoded, buffer);
        let plain = decode(&bytes, &layout, false).unwrap();
        assert_eq!(plain.get(0, 0, 0), Some(0xABC));
        assert_eq!(plain.overlay(0, 0, 0), None);
    }

    #[rstest]
    #[case(PlanarConfiguration::Interleaved)]
    #[case(PlanarConfiguration::Planar)]
    fn random_access_matches_sequential_decoding(#[case] planar: PlanarConfiguration) {
        let layout = PixelLayout::new(3, 2, 12)
            .with_samples_per_pixel(3)
            .with_frames(2)
            .with_planar_configuration(planar)
            .validate()
            .unwrap();
        let samples: Vec<i32> = (0..layout.total_samples() as i32)
            .map(|i| (i * 97) % 4096)
            .collect();
        let buffer = PixelSampleBuffer::from_samples(2, 3, 6, samples).unwrap();
        let bytes = encode(&buffer, &layout).unwrap();

        let mut unpacker = BitUnpacker::new(Cursor::new(bytes), layout).unwrap();
        let first = unpacker.read_sample().unwrap();
        assert_eq!(unpacker.sample_at(1, 2, 5).unwrap(), buffer.get(1, 2, 5).unwrap());
        assert_eq!(unpacker.sample_at(0, 1, 3).unwrap(), buffer.get(0, 1, 3).unwrap());
        assert!(unpacker.sample_at(2, 0, 0).is_err());

        // sequential reading resumes where it was left
        let (f, s, p) = layout.coordinates(0);
        assert_eq!(first, buffer.get(f, s, p).unwrap());
        let (f, s, p) = layout.coordinates(1);
        assert_eq!(unpacker.read_sample().unwrap(), buffer.get(f, s, p).unwrap());
    }
}
