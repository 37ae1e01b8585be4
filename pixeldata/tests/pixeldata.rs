use std::io::Cursor;

use dicomnet_pixeldata::codec::{self, sample_bits_from_cell};
use dicomnet_pixeldata::fragments::{self, Error};
use dicomnet_pixeldata::{
    BitUnpacker, Compression, FragmentIndex, PixelLayout, PixelRepresentation,
    PixelSampleBuffer, PlanarConfiguration, StreamSegment,
};
use rstest::rstest;

/// Deterministic sample values spread over the whole stored range.
fn sample_grid(layout: &PixelLayout, seed: u32) -> PixelSampleBuffer {
    let bits_stored = u32::from(layout.bits_stored());
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let samples = (0..layout.total_samples())
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let raw = (state >> 8) & ((1 << bits_stored) - 1);
            if layout.is_signed() {
                // sign extend the random bit pattern
                ((raw << (32 - bits_stored)) as i32) >> (32 - bits_stored)
            } else {
                raw as i32
            }
        })
        .collect();
    PixelSampleBuffer::from_samples(
        layout.number_of_frames(),
        layout.samples_per_pixel(),
        layout.pixels_per_frame(),
        samples,
    )
    .unwrap()
}

#[rstest]
fn write_then_read_reproduces_samples(
    #[values(8, 16)] bits_allocated: u16,
    #[values(1, 7, 8, 12, 16)] bits_stored: u16,
    #[values(0, 3)] high_bit_offset: u16,
    #[values(false, true)] signed: bool,
) {
    if bits_stored > bits_allocated || bits_stored + high_bit_offset > bits_allocated {
        return;
    }
    let high_bit = bits_stored - 1 + high_bit_offset;
    let representation = if signed {
        PixelRepresentation::Signed
    } else {
        PixelRepresentation::Unsigned
    };
    let layout = PixelLayout::new(5, 3, bits_allocated)
        .with_frames(2)
        .with_samples_per_pixel(3)
        .with_planar_configuration(PlanarConfiguration::Planar)
        .with_bits_stored(bits_stored, high_bit)
        .with_pixel_representation(representation)
        .validate()
        .unwrap();

    let original = sample_grid(&layout, u32::from(bits_stored) * 31 + u32::from(high_bit));
    let bytes = codec::encode(&original, &layout).unwrap();
    assert_eq!(bytes.len() as u64, layout.expected_length());

    let decoded = codec::decode(&bytes, &layout, false).unwrap();
    assert_eq!(decoded, original);
}

#[rstest]
#[case(3, 1)]
#[case(5, 3)]
#[case(10, 10)]
#[case(12, 11)]
fn odd_cell_widths_round_trip(#[case] bits_allocated: u16, #[case] bits_stored: u16) {
    let layout = PixelLayout::new(7, 3, bits_allocated)
        .with_bits_stored(bits_stored, bits_stored - 1)
        .with_pixel_representation(PixelRepresentation::Signed)
        .validate()
        .unwrap();
    let original = sample_grid(&layout, 7);
    let bytes = codec::encode(&original, &layout).unwrap();
    assert_eq!(bytes.len() as u64, layout.expected_length());

    let mut unpacker = BitUnpacker::new(Cursor::new(&bytes), layout).unwrap();
    assert_eq!(unpacker.sample_at(0, 0, 20).unwrap(), original.get(0, 0, 20).unwrap());
    assert_eq!(unpacker.read_pixel_data(false).unwrap(), original);
}

#[test]
fn stored_pattern_0x800_sign_extends() {
    assert_eq!(sample_bits_from_cell(0x800, 11, 12, true), -2048);
    assert_eq!(sample_bits_from_cell(0x800, 11, 12, false), 2048);

    let signed = PixelLayout::new(1, 1, 16)
        .with_bits_stored(12, 11)
        .with_pixel_representation(PixelRepresentation::Signed);
    let unsigned = PixelLayout::new(1, 1, 16).with_bits_stored(12, 11);
    let data = 0x0800_u16.to_le_bytes();
    assert_eq!(codec::decode(&data, &signed, false).unwrap().samples(), &[-2048]);
    assert_eq!(codec::decode(&data, &unsigned, false).unwrap().samples(), &[2048]);
}

fn item(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFE, 0xFF, 0x00, 0xE0];
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

fn delimiter() -> Vec<u8> {
    vec![0xFE, 0xFF, 0xDD, 0xE0, 0, 0, 0, 0]
}

/// Two JPEG frames in five fragments, without an offset table:
/// fragments 0 and 1 hold frame 0, fragments 2 to 4 hold frame 1.
fn two_jpeg_frames() -> Vec<u8> {
    let mut stream = item(&[]);
    stream.extend(item(&[0xFF, 0xD8, 0x01, 0x02]));
    stream.extend(item(&[0x03, 0x04]));
    stream.extend(item(&[0xFF, 0xD8, 0x05, 0x06]));
    stream.extend(item(&[0x07, 0x08]));
    stream.extend(item(&[0x09, 0xFF, 0xD9, 0x00]));
    stream.extend(delimiter());
    stream
}

#[test]
fn frame_boundaries_are_found_by_start_marker() {
    let mut index = FragmentIndex::new(Cursor::new(two_jpeg_frames()), 2, Compression::Jpeg)
        .unwrap();
    assert_eq!(index.first_item_of_frame(0).unwrap(), 0);
    assert_eq!(index.first_item_of_frame(1).unwrap(), 2);
    // no more than needed was scanned
    assert_eq!(index.fragments().len(), 3);

    assert_eq!(
        index.read_frame(0).unwrap(),
        vec![0xFF, 0xD8, 0x01, 0x02, 0x03, 0x04]
    );
    assert_eq!(
        index.read_frame(1).unwrap(),
        vec![0xFF, 0xD8, 0x05, 0x06, 0x07, 0x08, 0x09, 0xFF, 0xD9, 0x00]
    );
}

#[test]
fn stream_segments_stop_at_the_end_of_the_frame() {
    let mut index = FragmentIndex::new(Cursor::new(two_jpeg_frames()), 2, Compression::Jpeg)
        .unwrap();
    assert_eq!(index.seek_frame(0).unwrap(), 0);

    // the empty offset table item takes 8 bytes, each item header another 8
    assert_eq!(
        index.stream_segment(0, 100).unwrap(),
        StreamSegment::Data {
            offset: 16,
            length: 4
        }
    );
    assert_eq!(
        index.stream_segment(5, 100).unwrap(),
        StreamSegment::Data {
            offset: 29,
            length: 1
        }
    );
    assert_eq!(index.stream_segment(6, 100).unwrap(), StreamSegment::EndOfFrame);

    assert_eq!(index.seek_frame(1).unwrap(), 6);
    assert_eq!(
        index.stream_segment(6, 2).unwrap(),
        StreamSegment::Data {
            offset: 38,
            length: 2
        }
    );
    assert_eq!(
        index.stream_segment(15, 100).unwrap(),
        StreamSegment::Data {
            offset: 63,
            length: 1
        }
    );
    assert_eq!(index.stream_segment(16, 100).unwrap(), StreamSegment::EndOfFrame);
}

#[test]
fn short_item_is_a_truncated_stream() {
    let mut stream = item(&[]);
    stream.extend_from_slice(&[0xFE, 0xFF, 0x00, 0xE0]);
    stream.extend_from_slice(&100_u32.to_le_bytes());
    stream.extend_from_slice(&[0xAB; 50]);

    let mut index = FragmentIndex::new(Cursor::new(stream), 1, Compression::Other).unwrap();
    assert!(matches!(
        index.stream_segment(0, 10),
        Err(Error::Truncated { .. })
    ));
    assert!(matches!(index.read_frame(0), Err(Error::Truncated { .. })));
}

#[test]
fn encapsulated_frames_read_back() {
    let frames = vec![vec![0xFF, 0xD8, 1, 2, 3, 4, 5], vec![0xFF, 0xD8, 6, 7]];
    let mut stream = Vec::new();
    fragments::encapsulate(&mut stream, &frames, 4, false).unwrap();

    let mut index = FragmentIndex::new(Cursor::new(stream), 2, Compression::Jpeg).unwrap();
    assert_eq!(index.first_item_of_frame(1).unwrap(), 2);
    assert_eq!(index.read_frame(0).unwrap(), vec![0xFF, 0xD8, 1, 2, 3, 4, 5, 0]);
    assert_eq!(index.read_frame(1).unwrap(), vec![0xFF, 0xD8, 6, 7]);
}
