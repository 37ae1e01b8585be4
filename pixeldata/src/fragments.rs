//! Encapsulated pixel data fragments.
//!
//! Encapsulated pixel data is a sequence of items,
//! each holding one fragment of the encoded frames:
//!
//! ```text
//! (FFFE,E000) len  basic offset table (possibly empty)
//! (FFFE,E000) len  fragment
//! ...
//! (FFFE,E0DD) 0    sequence delimitation
//! ```
//!
//! The [`FragmentIndex`] discovers the fragments lazily,
//! scanning the stream forward only as far as each request needs,
//! and figures out which fragment starts each frame.
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use snafu::{ensure, Backtrace, IntoError, ResultExt, Snafu};
use tracing::{debug, warn};

const ITEM: (u16, u16) = (0xFFFE, 0xE000);
const SEQUENCE_DELIMITATION: (u16, u16) = (0xFFFE, 0xE0DD);
const ITEM_HEADER_LENGTH: u64 = 8;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Truncated fragment stream: {}", detail))]
    Truncated { detail: String, backtrace: Backtrace },

    #[snafu(display(
        "Unexpected tag ({:04X},{:04X}) at position {} of the fragment stream",
        group,
        element,
        position
    ))]
    UnexpectedTag {
        group: u16,
        element: u16,
        position: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Undefined length item at position {}", position))]
    UndefinedLength { position: u64, backtrace: Backtrace },

    #[snafu(display("Frame #{} out of {} frames", frame, frames))]
    FrameOutOfRange {
        frame: u32,
        frames: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Frame #{} starts beyond the reach of a 32-bit offset table",
        frame
    ))]
    OffsetOverflow { frame: usize, backtrace: Backtrace },

    #[snafu(display("Fragment of {} bytes does not fit in an item", length))]
    FragmentTooLong { length: u64, backtrace: Backtrace },

    #[snafu(display("Could not read the fragment stream"))]
    Read {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not write the fragment stream"))]
    Write {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The compression family of an encapsulated transfer syntax,
/// as far as frame boundary detection is concerned.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Compression {
    /// JPEG and JPEG-LS, frames start with an SOI marker
    Jpeg,
    /// JPEG 2000 and HTJ2K code streams, frames start with an SOC marker
    Jpeg2000,
    /// RLE lossless, one fragment per frame
    RunLength,
    /// anything else, assumed to have one fragment per frame
    Other,
}

impl Compression {
    pub fn from_transfer_syntax(uid: &str) -> Self {
        match uid.trim_end_matches(|c: char| c == '\0' || c == ' ') {
            "1.2.840.10008.1.2.4.50" | "1.2.840.10008.1.2.4.51" | "1.2.840.10008.1.2.4.57"
            | "1.2.840.10008.1.2.4.70" | "1.2.840.10008.1.2.4.80" | "1.2.840.10008.1.2.4.81" => {
                Compression::Jpeg
            }
            "1.2.840.10008.1.2.4.90" | "1.2.840.10008.1.2.4.91" | "1.2.840.10008.1.2.4.201"
            | "1.2.840.10008.1.2.4.202" | "1.2.840.10008.1.2.4.203" => Compression::Jpeg2000,
            "1.2.840.10008.1.2.5" => Compression::RunLength,
            _ => Compression::Other,
        }
    }

    /// The two bytes every frame of this compression family starts with.
    pub fn start_marker(self) -> Option<[u8; 2]> {
        match self {
            Compression::Jpeg => Some([0xFF, 0xD8]),
            Compression::Jpeg2000 => Some([0xFF, 0x4F]),
            Compression::RunLength | Compression::Other => None,
        }
    }
}

/// How the first fragment of each frame is recognized.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FrameBoundaries {
    /// byte offsets of each frame's first item, from the basic offset table
    OffsetTable(Vec<u32>),
    /// a fragment starting with this marker starts a frame
    StartMarker([u8; 2]),
    /// each fragment is a whole frame
    OneFragmentPerFrame,
}

/// One fragment of the stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Fragment {
    /// position of the fragment in the stream, the offset table not included
    pub index: usize,
    /// offset of the data in the reassembled stream of all fragments
    pub logical_offset: u64,
    /// offset of the data in the underlying stream
    pub physical_offset: u64,
    pub length: u32,
    /// the frame this fragment belongs to
    pub frame: u32,
}

impl Fragment {
    fn logical_end(&self) -> u64 {
        self.logical_offset + u64::from(self.length)
    }
}

/// A piece of the underlying stream backing a range of the reassembled stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamSegment {
    Data { offset: u64, length: u64 },
    /// the requested position lies in a later frame, or past the last one
    EndOfFrame,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ScanState {
    Scanning,
    AllItemsSeen,
}

/// A lazily built index of the fragments of encapsulated pixel data.
///
/// Fragments are discovered in stream order:
/// scanning never moves backwards in the underlying stream.
/// Only reading fragment data with [`read_frame`](Self::read_frame)
/// repositions the stream freely.
#[derive(Debug)]
pub struct FragmentIndex<R> {
    reader: R,
    number_of_frames: u32,
    boundaries: FrameBoundaries,
    stream_end: u64,
    /// position of the header of the first fragment
    first_item_offset: u64,
    next_header: u64,
    next_logical: u64,
    state: ScanState,
    fragments: Vec<Fragment>,
    /// index of the first fragment of each frame found so far
    frame_starts: Vec<usize>,
    current_frame: u32,
}

impl<R> FragmentIndex<R>
where
    R: Read + Seek,
{
    /// Start indexing the encapsulated pixel data
    /// beginning at the current position of the reader,
    /// right after the pixel data element header.
    ///
    /// The basic offset table is read right away.
    /// A table not holding exactly one offset per frame is ignored,
    /// falling back to detecting frame boundaries from the content.
    pub fn new(mut reader: R, number_of_frames: u32, compression: Compression) -> Result<Self> {
        let start = reader.stream_position().context(ReadSnafu)?;
        let stream_end = reader.seek(SeekFrom::End(0)).context(ReadSnafu)?;
        reader.seek(SeekFrom::Start(start)).context(ReadSnafu)?;

        ensure!(
            start + ITEM_HEADER_LENGTH <= stream_end,
            TruncatedSnafu {
                detail: "missing basic offset table item",
            }
        );
        let (tag, length) = read_item_header(&mut reader)?;
        ensure!(
            tag == ITEM,
            UnexpectedTagSnafu {
                group: tag.0,
                element: tag.1,
                position: start,
            }
        );
        ensure!(
            length != u32::MAX,
            UndefinedLengthSnafu { position: start }
        );
        let first_item_offset = start + ITEM_HEADER_LENGTH + u64::from(length);
        ensure!(
            first_item_offset <= stream_end,
            TruncatedSnafu {
                detail: format!(
                    "basic offset table of {} bytes with {} bytes left",
                    length,
                    stream_end - start - ITEM_HEADER_LENGTH
                ),
            }
        );

        let mut offset_table = None;
        if length > 0 {
            if u64::from(length) == 4 * u64::from(number_of_frames) {
                let mut table = Vec::with_capacity(number_of_frames as usize);
                for _ in 0..number_of_frames {
                    table.push(reader.read_u32::<LittleEndian>().context(ReadSnafu)?);
                }
                if table.first() == Some(&0) && table.windows(2).all(|w| w[0] < w[1]) {
                    offset_table = Some(table);
                } else {
                    warn!("Ignoring basic offset table with unordered offsets");
                }
            } else {
                warn!(
                    "Ignoring basic offset table of {} bytes for {} frames",
                    length, number_of_frames
                );
            }
        }

        let boundaries = match (offset_table, compression.start_marker()) {
            (Some(table), _) => FrameBoundaries::OffsetTable(table),
            (None, Some(marker)) => FrameBoundaries::StartMarker(marker),
            (None, None) => FrameBoundaries::OneFragmentPerFrame,
        };
        debug!(
            "Indexing {} frame(s) of {:?} fragments by {:?}",
            number_of_frames, compression, boundaries
        );

        Ok(FragmentIndex {
            reader,
            number_of_frames,
            boundaries,
            stream_end,
            first_item_offset,
            next_header: first_item_offset,
            next_logical: 0,
            state: ScanState::Scanning,
            fragments: Vec::new(),
            frame_starts: Vec::new(),
            current_frame: 0,
        })
    }

    pub fn number_of_frames(&self) -> u32 {
        self.number_of_frames
    }

    pub fn boundaries(&self) -> &FrameBoundaries {
        &self.boundaries
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// The fragments discovered so far.
    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Index the next fragment.
    /// Returns `false` once every item was seen.
    fn scan_next(&mut self) -> Result<bool> {
        if self.state == ScanState::AllItemsSeen {
            return Ok(false);
        }
        let position = self.next_header;
        if position == self.stream_end {
            // no sequence delimitation item
            self.state = ScanState::AllItemsSeen;
            return Ok(false);
        }
        ensure!(
            position + ITEM_HEADER_LENGTH <= self.stream_end,
            TruncatedSnafu {
                detail: format!("incomplete item header at position {}", position),
            }
        );

        self.reader
            .seek(SeekFrom::Start(position))
            .context(ReadSnafu)?;
        let (tag, length) = read_item_header(&mut self.reader)?;
        if tag == SEQUENCE_DELIMITATION {
            self.state = ScanState::AllItemsSeen;
            return Ok(false);
        }
        ensure!(
            tag == ITEM,
            UnexpectedTagSnafu {
                group: tag.0,
                element: tag.1,
                position,
            }
        );
        ensure!(length != u32::MAX, UndefinedLengthSnafu { position });

        let physical_offset = position + ITEM_HEADER_LENGTH;
        ensure!(
            physical_offset + u64::from(length) <= self.stream_end,
            TruncatedSnafu {
                detail: format!(
                    "item at position {} claims {} bytes, only {} available",
                    position,
                    length,
                    self.stream_end - physical_offset
                ),
            }
        );

        let index = self.fragments.len();
        let frame = match self.fragments.last() {
            None => {
                self.frame_starts.push(0);
                0
            }
            Some(previous) => {
                let previous_frame = previous.frame;
                if self.starts_frame(position, length)? {
                    self.frame_starts.push(index);
                    previous_frame + 1
                } else {
                    previous_frame
                }
            }
        };

        self.fragments.push(Fragment {
            index,
            logical_offset: self.next_logical,
            physical_offset,
            length,
            frame,
        });
        self.next_header = physical_offset + u64::from(length);
        self.next_logical += u64::from(length);
        Ok(true)
    }

    /// Whether the item at this position, not the first one, starts a frame.
    fn starts_frame(&mut self, position: u64, length: u32) -> Result<bool> {
        if self.frame_starts.len() >= self.number_of_frames as usize {
            return Ok(false);
        }
        match &self.boundaries {
            FrameBoundaries::OffsetTable(table) => Ok(table
                .get(self.frame_starts.len())
                .map_or(false, |&offset| {
                    u64::from(offset) == position - self.first_item_offset
                })),
            FrameBoundaries::StartMarker(marker) => {
                if length < 2 {
                    return Ok(false);
                }
                let marker = *marker;
                let mut start = [0_u8; 2];
                self.reader.read_exact(&mut start).context(ReadSnafu)?;
                Ok(start == marker)
            }
            FrameBoundaries::OneFragmentPerFrame => Ok(true),
        }
    }

    /// The index of the first fragment of the given frame,
    /// scanning forward as far as needed.
    pub fn first_item_of_frame(&mut self, frame: u32) -> Result<usize> {
        ensure!(
            frame < self.number_of_frames,
            FrameOutOfRangeSnafu {
                frame,
                frames: self.number_of_frames,
            }
        );
        while self.frame_starts.len() <= frame as usize {
            if !self.scan_next()? {
                return TruncatedSnafu {
                    detail: format!(
                        "found {} of {} frames",
                        self.frame_starts.len(),
                        self.number_of_frames
                    ),
                }
                .fail();
            }
        }
        Ok(self.frame_starts[frame as usize])
    }

    /// The range of fragment indices making up the given frame.
    pub fn frame_fragments(&mut self, frame: u32) -> Result<std::ops::Range<usize>> {
        let first = self.first_item_of_frame(frame)?;
        let end = if frame + 1 < self.number_of_frames {
            self.first_item_of_frame(frame + 1)?
        } else {
            while self.scan_next()? {}
            self.fragments.len()
        };
        Ok(first..end)
    }

    /// Make the given frame the current one,
    /// returning where it starts in the reassembled stream.
    pub fn seek_frame(&mut self, frame: u32) -> Result<u64> {
        let first = self.first_item_of_frame(frame)?;
        self.current_frame = frame;
        Ok(self.fragments[first].logical_offset)
    }

    /// Map a range of the reassembled stream to the underlying stream.
    ///
    /// The segment returned ends at the end of the fragment
    /// containing `logical_position`, so it may be shorter than `length`.
    /// [`StreamSegment::EndOfFrame`] is returned once the position
    /// lies in a frame after the current one (see [`seek_frame`](Self::seek_frame)),
    /// or past the last fragment.
    pub fn stream_segment(&mut self, logical_position: u64, length: u64) -> Result<StreamSegment> {
        loop {
            let i = self
                .fragments
                .partition_point(|f| f.logical_end() <= logical_position);
            if let Some(fragment) = self.fragments.get(i) {
                if fragment.frame > self.current_frame {
                    return Ok(StreamSegment::EndOfFrame);
                }
                let within = logical_position - fragment.logical_offset;
                let available = u64::from(fragment.length) - within;
                return Ok(StreamSegment::Data {
                    offset: fragment.physical_offset + within,
                    length: length.min(available),
                });
            }
            if !self.scan_next()? {
                ensure!(
                    self.frame_starts.len() >= self.number_of_frames as usize,
                    TruncatedSnafu {
                        detail: format!(
                            "stream ended after {} of {} frames",
                            self.frame_starts.len(),
                            self.number_of_frames
                        ),
                    }
                );
                return Ok(StreamSegment::EndOfFrame);
            }
        }
    }

    /// Read the whole data of one frame, its fragments concatenated.
    pub fn read_frame(&mut self, frame: u32) -> Result<Vec<u8>> {
        let range = self.frame_fragments(frame)?;
        let fragments = &self.fragments[range];
        let total: u64 = fragments.iter().map(|f| u64::from(f.length)).sum();
        let mut data = Vec::with_capacity(total as usize);
        for fragment in fragments {
            self.reader
                .seek(SeekFrom::Start(fragment.physical_offset))
                .context(ReadSnafu)?;
            let read = (&mut self.reader)
                .take(u64::from(fragment.length))
                .read_to_end(&mut data)
                .context(ReadSnafu)?;
            ensure!(
                read == fragment.length as usize,
                TruncatedSnafu {
                    detail: format!("fragment #{} is incomplete", fragment.index),
                }
            );
        }
        Ok(data)
    }
}

fn read_item_header<R: Read>(reader: &mut R) -> Result<((u16, u16), u32)> {
    let mut header = [0_u8; ITEM_HEADER_LENGTH as usize];
    reader.read_exact(&mut header).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TruncatedSnafu {
                detail: "incomplete item header",
            }
            .build()
        } else {
            ReadSnafu.into_error(e)
        }
    })?;
    let mut header = &header[..];
    let group = header.read_u16::<LittleEndian>().context(ReadSnafu)?;
    let element = header.read_u16::<LittleEndian>().context(ReadSnafu)?;
    let length = header.read_u32::<LittleEndian>().context(ReadSnafu)?;
    Ok(((group, element), length))
}

/// Write frames as encapsulated pixel data,
/// from the basic offset table item to the sequence delimitation item.
///
/// Each frame is split into fragments of at most `fragment_size` bytes,
/// or kept whole if `fragment_size` is 0.
/// Fragments of odd length are padded with a zero byte.
/// Frames split in several fragments can only be told apart
/// with the offset table or with start markers.
///
/// Fails if a fragment does not fit in an item,
/// or if an offset table entry does not fit in 32 bits.
pub fn encapsulate<W, F>(
    mut writer: W,
    frames: &[F],
    fragment_size: u32,
    with_offset_table: bool,
) -> Result<()>
where
    W: Write,
    F: AsRef<[u8]>,
{
    let chunk = if fragment_size == 0 {
        usize::MAX
    } else {
        // keep fragments even
        (fragment_size as usize + 1) & !1
    };

    let parts: Vec<Vec<&[u8]>> = frames
        .iter()
        .map(|frame| {
            let frame = frame.as_ref();
            if frame.is_empty() {
                vec![frame]
            } else {
                frame.chunks(chunk.min(frame.len())).collect()
            }
        })
        .collect();

    let offsets = if with_offset_table {
        frame_offsets(parts.iter().map(|frame| frame.iter().map(|part| part.len())))?
    } else {
        Vec::new()
    };

    write_item_header(&mut writer, ITEM, 4 * offsets.len() as u32)?;
    for offset in offsets {
        writer.write_u32::<LittleEndian>(offset).context(WriteSnafu)?;
    }
    for fragment in parts.into_iter().flatten() {
        write_item_header(&mut writer, ITEM, padded_length(fragment.len())?)?;
        writer.write_all(fragment).context(WriteSnafu)?;
        if fragment.len() & 1 == 1 {
            writer.write_u8(0).context(WriteSnafu)?;
        }
    }
    write_item_header(&mut writer, SEQUENCE_DELIMITATION, 0)
}

/// Item length of a fragment, padded to even length.
fn padded_length(length: usize) -> Result<u32> {
    let padded = length as u64 + (length as u64 & 1);
    // 0xFFFF_FFFF would read as undefined length
    ensure!(
        padded < u64::from(u32::MAX),
        FragmentTooLongSnafu {
            length: length as u64
        }
    );
    Ok(padded as u32)
}

/// Basic offset table entries, given the fragment lengths of each frame.
fn frame_offsets<I, J>(frames: I) -> Result<Vec<u32>>
where
    I: IntoIterator<Item = J>,
    J: IntoIterator<Item = usize>,
{
    let mut offsets = Vec::new();
    let mut offset = 0_u64;
    for (frame, fragments) in frames.into_iter().enumerate() {
        ensure!(
            offset <= u64::from(u32::MAX),
            OffsetOverflowSnafu { frame }
        );
        offsets.push(offset as u32);
        for length in fragments {
            offset += ITEM_HEADER_LENGTH + u64::from(padded_length(length)?);
        }
    }
    Ok(offsets)
}

fn write_item_header<W: Write>(writer: &mut W, tag: (u16, u16), length: u32) -> Result<()> {
    writer.write_u16::<LittleEndian>(tag.0).context(WriteSnafu)?;
    writer.write_u16::<LittleEndian>(tag.1).context(WriteSnafu)?;
    writer.write_u32::<LittleEndian>(length).context(WriteSnafu)
}
