#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u32, bool, &[u8])| {
    let (max_pdu_length, strict, bytes) = input;
    let _ = reencode(max_pdu_length, strict, bytes);
});

/// Any PDU accepted by the reader must be written back
/// into bytes which the reader accepts again, yielding the same PDU.
fn reencode(max_pdu_length: u32, strict: bool, mut bytes: &[u8]) -> Result<(), Box<dyn Error>> {
    let pdu = dicomnet_ul::read_pdu(&mut bytes, max_pdu_length, strict)?;

    let mut written = Vec::new();
    dicomnet_ul::write_pdu(&mut written, &pdu)?;

    let reread = dicomnet_ul::read_pdu(&mut written.as_slice(), max_pdu_length, false)
        .expect("a written PDU should be readable");
    assert_eq!(pdu, reread, "PDU changed after being written and read again");
    Ok(())
}
