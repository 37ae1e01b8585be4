//! P-Data fragmentation and reassembly.
use std::collections::VecDeque;
use std::io::Write;

use snafu::{ensure, Backtrace, Snafu};

use crate::pdu::{PDataValue, PDataValueType, PDU_HEADER_SIZE};

/// The size of a presentation data value item header:
/// item length (4 bytes), presentation context ID and message control header.
const PDV_HEADER_SIZE: u32 = 6;

/// Default upper bound for the size of a reassembled command or data set.
pub const DEFAULT_MAX_MESSAGE_LENGTH: u64 = 1 << 30;

/// Maximum number of payload bytes which fit in a single P-DATA-TF PDU
/// with a single PDV, given the maximum PDU length accepted by the receiver.
pub(crate) fn max_pdv_payload(max_pdu_length: u32) -> u32 {
    max_pdu_length.saturating_sub(PDV_HEADER_SIZE).max(1)
}

/// Fill in the lengths and control header of a P-DATA-TF PDU in `buffer`,
/// which holds the PDU and PDV headers followed by the payload.
fn setup_pdata_header(buffer: &mut [u8], value_type: PDataValueType, is_last: bool) {
    let data_len = (buffer.len() - 12) as u32;

    // PDU length excludes the PDU type and reserved byte
    let pdu_len = data_len + PDV_HEADER_SIZE;
    buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

    // PDV item length covers the context ID, control header and data
    let pdv_len = data_len + 2;
    buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());

    let mut header = 0x00;
    if value_type == PDataValueType::Command {
        header |= 0x01;
    }
    if is_last {
        header |= 0x02;
    }
    buffer[11] = header;
}

/// A P-Data value writer.
///
/// Bytes written through this writer are split
/// into as many P-DATA-TF PDUs as needed,
/// each holding a single PDV no larger than the receiver's maximum PDU length.
/// The last fragment is sent by [`finish`](PDataWriter::finish).
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: Vec<u8>,
    stream: W,
    value_type: PDataValueType,
    max_data_len: u32,
    finished: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum PDU length accepted by the receiver.
    pub fn new(
        stream: W,
        presentation_context_id: u8,
        value_type: PDataValueType,
        max_pdu_length: u32,
    ) -> Self {
        let max_data_len = max_pdv_payload(max_pdu_length);
        let mut buffer = Vec::with_capacity((max_data_len + PDU_HEADER_SIZE + 6) as usize);
        buffer.extend([
            // PDU-type + reserved byte
            0x04,
            0x00,
            // PDU length, filled in on dispatch
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // PDV item length, filled in on dispatch
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            presentation_context_id,
            // message control header, filled in on dispatch
            0xFF,
        ]);

        PDataWriter {
            buffer,
            stream,
            value_type,
            max_data_len,
            finished: false,
        }
    }

    /// Emit the last P-Data fragment PDU.
    ///
    /// An empty payload still produces one (empty) last fragment.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.finished {
            setup_pdata_header(&mut self.buffer, self.value_type, true);
            self.stream.write_all(&self.buffer)?;
            self.stream.flush()?;
            self.finished = true;
        }
        Ok(())
    }

    /// Send the buffered fragment as a non-last PDU.
    ///
    /// Pre-condition: the buffer holds a full fragment.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() > 12);
        setup_pdata_header(&mut self.buffer, self.value_type, false);
        self.stream.write_all(&self.buffer)?;
        self.buffer.truncate(12);
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            self.buffer.extend_from_slice(buf);
            Ok(buf.len())
        } else {
            // fill up the fragment and leave the rest for subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend_from_slice(buf);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A complete command or data set received over an association,
/// reassembled from its PDV fragments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IncomingMessage {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub data: Vec<u8>,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AssembleError {
    #[snafu(display(
        "PDV for {:?} on context {} interleaved with unfinished {:?} on context {}",
        value_type,
        presentation_context_id,
        pending_type,
        pending_context_id
    ))]
    InterleavedFragments {
        presentation_context_id: u8,
        value_type: PDataValueType,
        pending_context_id: u8,
        pending_type: PDataValueType,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{:?} on context {} would reach {} bytes, over the limit of {}",
        value_type,
        presentation_context_id,
        length,
        max_message_length
    ))]
    MessageTooLong {
        presentation_context_id: u8,
        value_type: PDataValueType,
        length: u64,
        max_message_length: u64,
        backtrace: Backtrace,
    },
}

/// Collects PDV fragments into complete commands and data sets.
#[derive(Debug)]
pub struct MessageAssembler {
    current: Option<IncomingMessage>,
    complete: VecDeque<IncomingMessage>,
    max_message_length: u64,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageAssembler {
    /// Create an assembler admitting messages
    /// of up to [`DEFAULT_MAX_MESSAGE_LENGTH`] bytes.
    pub fn new() -> Self {
        Self::with_max_message_length(DEFAULT_MAX_MESSAGE_LENGTH)
    }

    /// Create an assembler admitting messages
    /// of up to `max_message_length` bytes.
    pub fn with_max_message_length(max_message_length: u64) -> Self {
        MessageAssembler {
            current: None,
            complete: VecDeque::new(),
            max_message_length,
        }
    }

    /// Feed one PDV fragment.
    ///
    /// Fragments of one command or data set must not be interleaved
    /// with fragments of another,
    /// and their total length may not exceed the maximum message length.
    /// The partial message is discarded when either rule is broken.
    pub fn push(&mut self, pdv: PDataValue) -> Result<(), AssembleError> {
        let PDataValue {
            presentation_context_id,
            value_type,
            is_last,
            data,
        } = pdv;

        let pending = self.current.as_ref().map_or(0, |m| m.data.len() as u64);
        let length = pending + data.len() as u64;
        if length > self.max_message_length {
            self.current = None;
            return MessageTooLongSnafu {
                presentation_context_id,
                value_type,
                length,
                max_message_length: self.max_message_length,
            }
            .fail();
        }

        match &mut self.current {
            Some(current) => {
                ensure!(
                    current.presentation_context_id == presentation_context_id
                        && current.value_type == value_type,
                    InterleavedFragmentsSnafu {
                        presentation_context_id,
                        value_type,
                        pending_context_id: current.presentation_context_id,
                        pending_type: current.value_type,
                    }
                );
                current.data.extend_from_slice(&data);
            }
            None => {
                self.current = Some(IncomingMessage {
                    presentation_context_id,
                    value_type,
                    data,
                });
            }
        }

        if is_last {
            if let Some(message) = self.current.take() {
                self.complete.push_back(message);
            }
        }
        Ok(())
    }

    /// Retrieve the next complete command or data set, if any.
    pub fn pop(&mut self) -> Option<IncomingMessage> {
        self.complete.pop_front()
    }

    /// Whether a command or data set is partially received.
    pub fn is_incomplete(&self) -> bool {
        self.current.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{read_pdu, Pdu, MINIMUM_PDU_SIZE};
    use std::io::Cursor;

    fn read_all_pdus(bytes: Vec<u8>, max_pdu_length: u32) -> Vec<Pdu> {
        let len = bytes.len() as u64;
        let mut cursor = Cursor::new(bytes);
        let mut pdus = vec![];
        while cursor.position() < len {
            pdus.push(read_pdu(&mut cursor, max_pdu_length, true).unwrap());
        }
        pdus
    }

    #[test]
    fn write_large_pdata_in_fragments() {
        let presentation_context_id = 3;
        let my_data: Vec<u8> = (0..9000).map(|x: u32| x as u8).collect();

        let mut buf = Vec::new();
        {
            let mut writer = PDataWriter::new(
                &mut buf,
                presentation_context_id,
                PDataValueType::Data,
                MINIMUM_PDU_SIZE,
            );
            writer.write_all(&my_data).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(buf, MINIMUM_PDU_SIZE);
        assert_eq!(pdus.len(), 3);

        let mut assembler = MessageAssembler::new();
        for (i, pdu) in pdus.into_iter().enumerate() {
            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data.len(), 1);
                    assert_eq!(data[0].is_last, i == 2);
                    assert_eq!(data[0].value_type, PDataValueType::Data);
                    if i < 2 {
                        assert_eq!(data[0].data.len(), (MINIMUM_PDU_SIZE - 6) as usize);
                    }
                    for pdv in data {
                        assembler.push(pdv).unwrap();
                    }
                }
                pdu => panic!("unexpected PDU {:?}", pdu),
            }
        }

        let message = assembler.pop().unwrap();
        assert_eq!(message.presentation_context_id, 3);
        assert_eq!(message.data, my_data);
        assert!(assembler.pop().is_none());
    }

    #[test]
    fn empty_command_still_sends_last_fragment() {
        let mut buf = Vec::new();
        PDataWriter::new(&mut buf, 1, PDataValueType::Command, MINIMUM_PDU_SIZE)
            .finish()
            .unwrap();
        assert_eq!(buf, vec![0x04, 0x00, 0, 0, 0, 6, 0, 0, 0, 2, 1, 0x03]);
    }

    #[test]
    fn interleaved_fragments_are_refused() {
        let mut assembler = MessageAssembler::new();
        assembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: false,
                data: vec![1, 2],
            })
            .unwrap();
        assert!(assembler.is_incomplete());
        let err = assembler
            .push(PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![3],
            })
            .unwrap_err();
        assert!(matches!(err, AssembleError::InterleavedFragments { .. }));
    }

    #[test]
    fn oversized_message_is_refused() {
        let mut assembler = MessageAssembler::with_max_message_length(8);
        let fragment = |is_last, len| PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last,
            data: vec![0x55; len],
        };
        assembler.push(fragment(false, 4)).unwrap();
        assembler.push(fragment(false, 4)).unwrap();
        let err = assembler.push(fragment(true, 1)).unwrap_err();
        assert!(matches!(
            err,
            AssembleError::MessageTooLong {
                length: 9,
                max_message_length: 8,
                ..
            }
        ));
        assert!(!assembler.is_incomplete());
        assert!(assembler.pop().is_none());

        // a message at the limit is still admitted
        assembler.push(fragment(true, 8)).unwrap();
        assert_eq!(assembler.pop().unwrap().data.len(), 8);
    }
}
