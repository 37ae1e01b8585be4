#![no_main]
use dicomnet_pixeldata::{Compression, FragmentIndex, StreamSegment};
use libfuzzer_sys::fuzz_target;
use std::error::Error;
use std::io::Cursor;

fuzz_target!(|input: (u8, bool, &[u8])| {
    let (frames, jpeg, bytes) = input;
    let _ = fuzz(u32::from(frames % 8) + 1, jpeg, bytes);
});

fn fuzz(frames: u32, jpeg: bool, bytes: &[u8]) -> Result<(), Box<dyn Error>> {
    let compression = if jpeg {
        Compression::Jpeg
    } else {
        Compression::RunLength
    };
    let mut index = FragmentIndex::new(Cursor::new(bytes), frames, compression)?;
    for frame in 0..frames {
        let start = index.seek_frame(frame)?;
        let data = index.read_frame(frame)?;
        if let StreamSegment::Data { length, .. } = index.stream_segment(start, u64::MAX)? {
            assert!(length <= data.len() as u64);
        }
    }
    Ok(())
}
