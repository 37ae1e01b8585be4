#![no_main]
use byteorder::{LittleEndian as LE, ReadBytesExt};
use dicomnet_pixeldata::{codec, PixelLayout, PixelRepresentation, PlanarConfiguration};
use libfuzzer_sys::fuzz_target;
use std::error::Error;

fuzz_target!(|data: &[u8]| {
    let _ = fuzz(data);
});

/// Build a small pixel layout from the first bytes of the input,
/// leaving the rest of the input to decode as native pixel data.
fn layout_from(reader: &mut &[u8]) -> Result<PixelLayout, Box<dyn Error>> {
    let rows = reader.read_u8()? as u16 + 1;
    let columns = reader.read_u8()? as u16 + 1;
    let frames = u32::from(reader.read_u8()? & 0x07) + 1;
    let spp: u16 = if reader.read_u8()? < 0x80 { 1 } else { 3 };
    let bits_allocated = u16::from(reader.read_u8()? % 16) + 1;
    let bits_stored = u16::from(reader.read_u8()?) % bits_allocated + 1;
    let high_bit = bits_stored - 1 + u16::from(reader.read_u8()?) % (bits_allocated - bits_stored + 1);
    let flags = reader.read_u16::<LE>()?;

    Ok(PixelLayout::new(rows, columns, bits_allocated)
        .with_frames(frames)
        .with_samples_per_pixel(spp)
        .with_bits_stored(bits_stored, high_bit)
        .with_pixel_representation(if flags & 1 == 1 {
            PixelRepresentation::Signed
        } else {
            PixelRepresentation::Unsigned
        })
        .with_planar_configuration(if flags & 2 == 2 {
            PlanarConfiguration::Planar
        } else {
            PlanarConfiguration::Interleaved
        })
        .validate()?)
}

fn fuzz(data: &[u8]) -> Result<(), Box<dyn Error>> {
    let mut reader = data;
    let layout = layout_from(&mut reader)?;
    let decoded = codec::decode(reader, &layout, true)?;
    assert_eq!(decoded.samples().len() as u64, layout.total_samples());

    // overlay bits included, decoded samples survive re-encoding
    let encoded = codec::encode(&decoded, &layout)?;
    let redecoded = codec::decode(&encoded, &layout, true)?;
    assert_eq!(decoded, redecoded);
    Ok(())
}
