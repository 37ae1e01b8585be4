//! PDU decoding from byte streams.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read};
use tracing::warn;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes:
/// PDU type (1 byte), reserved (1 byte) and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// The stream ended before a new PDU started
    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Unexpected variable item {:?} in PDU", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result reason {}", reason))]
    InvalidPresentationContextResultReason { reason: u8, backtrace: Backtrace },

    #[snafu(display("Unexpected presentation context sub-item type {:#04x}", item_type))]
    UnknownPresentationContextSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

impl Error {
    /// Whether this error stems from a read timeout on the underlying stream.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadPduField { source, .. } => {
                matches!(source.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
            }
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read a single PDU from the given reader.
///
/// `max_pdu_length` is the maximum PDU length negotiated for this side.
/// In strict mode, any PDU larger than that is an error.
/// Otherwise, PDUs up to [`MAXIMUM_PDU_SIZE`] are accepted with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // EOF on the first bytes means the peer closed the stream between PDUs
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadPduFieldSnafu { field: "PDU-type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "PDU-length" })?;

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming PDU was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduFieldSnafu { field: "PDU" })?;
    let mut cursor = Cursor::new(bytes);

    match pdu_type {
        0x01 => {
            let header = read_association_header(&mut cursor)?;
            let mut application_context_name = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            while !at_end(&cursor) {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(name) => {
                        application_context_name = Some(name)
                    }
                    PduVariableItem::PresentationContextProposed(pc) => {
                        presentation_contexts.push(pc)
                    }
                    PduVariableItem::UserVariables(items) => user_variables = items,
                    var_item => return InvalidPduVariableSnafu { var_item }.fail(),
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version: header.protocol_version,
                calling_ae_title: header.calling_ae_title,
                called_ae_title: header.called_ae_title,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            let header = read_association_header(&mut cursor)?;
            let mut application_context_name = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            while !at_end(&cursor) {
                match read_pdu_variable(&mut cursor)? {
                    PduVariableItem::ApplicationContext(name) => {
                        application_context_name = Some(name)
                    }
                    PduVariableItem::PresentationContextResult(pc) => {
                        presentation_contexts.push(pc)
                    }
                    PduVariableItem::UserVariables(items) => user_variables = items,
                    var_item => return InvalidPduVariableSnafu { var_item }.fail(),
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version: header.protocol_version,
                calling_ae_title: header.calling_ae_title,
                called_ae_title: header.called_ae_title,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            let mut fields = [0u8; 4];
            cursor
                .read_exact(&mut fields)
                .context(ReadPduFieldSnafu {
                    field: "A-ASSOCIATE-RJ body",
                })?;
            // fields[0] is reserved
            let result =
                AssociationRJResult::from_u8(fields[1]).context(InvalidRejectSourceOrReasonSnafu)?;
            let source = AssociationRJSource::from_u8(fields[2], fields[3])
                .context(InvalidRejectSourceOrReasonSnafu)?;
            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            let mut values = vec![];
            while !at_end(&cursor) {
                let item_length = cursor
                    .read_u32::<BigEndian>()
                    .context(ReadPduFieldSnafu { field: "Item-length" })?;
                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );
                let presentation_context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;
                // bit 0: command (1) or data set (0); bit 1: last fragment
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message-control-header",
                })?;
                let data = read_n(&mut cursor, (item_length - 2) as usize).context(
                    ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    },
                )?;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type: if header & 0x01 != 0 {
                        PDataValueType::Command
                    } else {
                        PDataValueType::Data
                    },
                    is_last: header & 0x02 != 0,
                    data,
                });
            }
            Ok(Pdu::PData { data: values })
        }
        // reserved fields are not tested on reception
        0x05 => Ok(Pdu::ReleaseRQ),
        0x06 => Ok(Pdu::ReleaseRP),
        0x07 => {
            let mut fields = [0u8; 4];
            cursor
                .read_exact(&mut fields)
                .context(ReadPduFieldSnafu {
                    field: "A-ABORT body",
                })?;
            let source = AbortRQSource::from_u8(fields[2], fields[3])
                .context(InvalidAbortSourceOrReasonSnafu)?;
            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        }),
    }
}

struct AssociationHeader {
    protocol_version: u16,
    called_ae_title: String,
    calling_ae_title: String,
}

/// Read the fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
fn read_association_header(cursor: &mut Cursor<Vec<u8>>) -> Result<AssociationHeader> {
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;
    cursor
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let called_ae_title = read_ae_title(cursor, "Called-AE-title")?;
    let calling_ae_title = read_ae_title(cursor, "Calling-AE-title")?;
    let mut reserved = [0u8; 32];
    cursor
        .read_exact(&mut reserved)
        .context(ReadPduFieldSnafu { field: "Reserved" })?;

    Ok(AssociationHeader {
        protocol_version,
        called_ae_title,
        calling_ae_title,
    })
}

fn read_ae_title(cursor: &mut Cursor<Vec<u8>>, field: &'static str) -> Result<String> {
    let mut ae_bytes = [0; 16];
    cursor
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    decode_text(&ae_bytes, field)
}

fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    let text = DefaultCharacterSetCodec
        .decode(bytes)
        .context(DecodeTextSnafu { field })?;
    // UIDs may be padded with a trailing null byte
    Ok(text.trim_matches(|c: char| c == ' ' || c == '\0').to_string())
}

fn read_text_of_len<R: Read>(reader: &mut R, len: usize, field: &'static str) -> Result<String> {
    let bytes = read_n(reader, len).context(ReadPduFieldSnafu { field })?;
    decode_text(&bytes, field)
}

fn at_end(cursor: &Cursor<Vec<u8>>) -> bool {
    cursor.position() >= cursor.get_ref().len() as u64
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::with_capacity(bytes_to_read);
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    if result.len() < bytes_to_read {
        return Err(ErrorKind::UnexpectedEof.into());
    }
    Ok(result)
}

/// Read the type and length of an item or sub-item.
fn read_item_header<R: Read>(reader: &mut R) -> Result<(u8, u16)> {
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;
    reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Reserved" })?;
    let item_length = reader
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "Item-length" })?;
    Ok((item_type, item_length))
}

fn read_pdu_variable<R>(reader: &mut R) -> Result<PduVariableItem>
where
    R: Read,
{
    let (item_type, item_length) = read_item_header(reader)?;
    let bytes = read_n(reader, item_length as usize).context(ReadPduFieldSnafu { field: "Item" })?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => Ok(PduVariableItem::ApplicationContext(decode_text(
            cursor.get_ref(),
            "Application-context-name",
        )?)),
        0x20 => {
            let (id, _) = read_presentation_context_prefix(&mut cursor)?;
            let mut abstract_syntax = None;
            let mut transfer_syntaxes = vec![];

            while !at_end(&cursor) {
                let (sub_type, sub_length) = read_item_header(&mut cursor)?;
                match sub_type {
                    0x30 => {
                        abstract_syntax = Some(read_text_of_len(
                            &mut cursor,
                            sub_length as usize,
                            "Abstract-syntax-name",
                        )?)
                    }
                    0x40 => transfer_syntaxes.push(read_text_of_len(
                        &mut cursor,
                        sub_length as usize,
                        "Transfer-syntax-name",
                    )?),
                    item_type => {
                        return UnknownPresentationContextSubItemSnafu { item_type }.fail()
                    }
                }
            }

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            let (id, reason) = read_presentation_context_prefix(&mut cursor)?;
            let reason = PresentationContextResultReason::from_u8(reason)
                .context(InvalidPresentationContextResultReasonSnafu { reason })?;
            let mut transfer_syntax = None;

            while !at_end(&cursor) {
                let (sub_type, sub_length) = read_item_header(&mut cursor)?;
                ensure!(
                    sub_type == 0x40,
                    UnknownPresentationContextSubItemSnafu { item_type: sub_type }
                );
                ensure!(
                    transfer_syntax.is_none(),
                    MultipleTransferSyntaxesAcceptedSnafu
                );
                transfer_syntax = Some(read_text_of_len(
                    &mut cursor,
                    sub_length as usize,
                    "Transfer-syntax-name",
                )?);
            }

            // the transfer syntax is not significant when rejected
            let transfer_syntax = match (transfer_syntax, reason) {
                (Some(ts), _) => ts,
                (None, PresentationContextResultReason::Acceptance) => {
                    return MissingTransferSyntaxSnafu.fail()
                }
                (None, _) => String::new(),
            };

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            let mut user_variables = vec![];
            while !at_end(&cursor) {
                if let Some(item) = read_user_variable(&mut cursor)? {
                    user_variables.push(item);
                }
            }
            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

/// Read the presentation context ID and the result/reason byte,
/// skipping the reserved bytes around them.
fn read_presentation_context_prefix<R: Read>(reader: &mut R) -> Result<(u8, u8)> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).context(ReadPduFieldSnafu {
        field: "Presentation-context-ID",
    })?;
    Ok((prefix[0], prefix[2]))
}

fn read_user_variable(cursor: &mut Cursor<Vec<u8>>) -> Result<Option<UserVariableItem>> {
    let (item_type, item_length) = read_item_header(cursor)?;
    let item = match item_type {
        0x51 => UserVariableItem::MaxLength(cursor.read_u32::<BigEndian>().context(
            ReadPduFieldSnafu {
                field: "Maximum-length-received",
            },
        )?),
        0x52 => UserVariableItem::ImplementationClassUid(read_text_of_len(
            cursor,
            item_length as usize,
            "Implementation-class-uid",
        )?),
        0x55 => UserVariableItem::ImplementationVersionName(read_text_of_len(
            cursor,
            item_length as usize,
            "Implementation-version-name",
        )?),
        0x56 => {
            let uid_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "SOP-class-uid-length",
            })?;
            let sop_class_uid = read_text_of_len(cursor, uid_length as usize, "SOP-class-uid")?;
            // the application information spans the rest of the sub-item
            let info_length = (item_length as usize).saturating_sub(2 + uid_length as usize);
            let data = read_n(cursor, info_length).context(ReadPduFieldSnafu {
                field: "Service-class-application-information",
            })?;
            UserVariableItem::SopClassExtendedNegotiation(sop_class_uid, data)
        }
        0x58 => {
            let identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "User-Identity-Type",
            })?;
            let positive_response_requested = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Positive-response-requested",
            })?;
            let primary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Primary-field-length",
            })?;
            let primary_field = read_n(cursor, primary_length as usize).context(
                ReadPduFieldSnafu {
                    field: "Primary-field",
                },
            )?;
            let secondary_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Secondary-field-length",
            })?;
            let secondary_field = read_n(cursor, secondary_length as usize).context(
                ReadPduFieldSnafu {
                    field: "Secondary-field",
                },
            )?;

            match UserIdentityType::from_u8(identity_type) {
                Some(identity_type) => UserVariableItem::UserIdentity(UserIdentity {
                    positive_response_requested: positive_response_requested == 1,
                    identity_type,
                    primary_field,
                    secondary_field,
                }),
                None => {
                    warn!("Unknown user identity type code {}", identity_type);
                    return Ok(None);
                }
            }
        }
        _ => UserVariableItem::Unknown(
            item_type,
            read_n(cursor, item_length as usize).context(ReadPduFieldSnafu {
                field: "Unknown sub-item",
            })?,
        ),
    };
    Ok(Some(item))
}
