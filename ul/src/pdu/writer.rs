//! PDU encoding into byte streams.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    #[snafu(display("Item `{}` is too long ({} bytes)", field, length))]
    ItemTooLong {
        field: &'static str,
        length: usize,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Write the given bytes prefixed by their length as a big endian `u32`.
fn write_chunk_u32<W, F>(writer: &mut W, field: &'static str, func: F) -> Result<()>
where
    W: ?Sized + Write,
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;
    writer
        .write_u32::<BigEndian>(data.len() as u32)
        .context(WriteFieldSnafu { field })?;
    writer.write_all(&data).context(WriteFieldSnafu { field })
}

/// Write the given bytes prefixed by their length as a big endian `u16`.
fn write_chunk_u16<W, F>(writer: &mut W, field: &'static str, func: F) -> Result<()>
where
    W: ?Sized + Write,
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data)?;
    if data.len() > u16::MAX as usize {
        return ItemTooLongSnafu {
            field,
            length: data.len(),
        }
        .fail();
    }
    writer
        .write_u16::<BigEndian>(data.len() as u16)
        .context(WriteFieldSnafu { field })?;
    writer.write_all(&data).context(WriteFieldSnafu { field })
}

/// Write an item header (type, reserved byte) followed by its `u16`-length-prefixed content.
fn write_item<F>(writer: &mut Vec<u8>, item_type: u8, field: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    writer.push(item_type);
    writer.push(0x00);
    write_chunk_u16(writer, field, func)
}

fn encode_text(text: &str, field: &'static str) -> Result<Vec<u8>> {
    DefaultCharacterSetCodec
        .encode(text)
        .context(EncodeFieldSnafu { field })
}

fn write_text_item(writer: &mut Vec<u8>, item_type: u8, text: &str, field: &'static str) -> Result<()> {
    let bytes = encode_text(text, field)?;
    write_item(writer, item_type, field, |w| {
        w.extend_from_slice(&bytes);
        Ok(())
    })
}

fn write_ae_title(writer: &mut Vec<u8>, ae_title: &str, field: &'static str) -> Result<()> {
    let mut bytes = encode_text(ae_title, field)?;
    bytes.resize(16, b' ');
    writer.extend_from_slice(&bytes);
    Ok(())
}

/// Write a PDU into the given writer.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: ?Sized + Write,
{
    match pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            writer
                .write_all(&[0x01, 0x00])
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            write_chunk_u32(writer, "A-ASSOCIATE-RQ", |w| {
                write_association_header(w, *protocol_version, called_ae_title, calling_ae_title)?;
                write_text_item(
                    w,
                    0x10,
                    application_context_name,
                    "Application-context-name",
                )?;
                for pc in presentation_contexts {
                    write_item(w, 0x20, "Presentation-context", |w| {
                        w.extend_from_slice(&[pc.id, 0, 0, 0]);
                        write_text_item(w, 0x30, &pc.abstract_syntax, "Abstract-syntax-name")?;
                        for ts in &pc.transfer_syntaxes {
                            write_text_item(w, 0x40, ts, "Transfer-syntax-name")?;
                        }
                        Ok(())
                    })?;
                }
                write_user_variables(w, user_variables)
            })
        }
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        }) => {
            writer
                .write_all(&[0x02, 0x00])
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            write_chunk_u32(writer, "A-ASSOCIATE-AC", |w| {
                write_association_header(w, *protocol_version, called_ae_title, calling_ae_title)?;
                write_text_item(
                    w,
                    0x10,
                    application_context_name,
                    "Application-context-name",
                )?;
                for pc in presentation_contexts {
                    write_item(w, 0x21, "Presentation-context", |w| {
                        w.extend_from_slice(&[pc.id, 0, pc.reason as u8, 0]);
                        write_text_item(w, 0x40, &pc.transfer_syntax, "Transfer-syntax-name")
                    })?;
                }
                write_user_variables(w, user_variables)
            })
        }
        Pdu::AssociationRJ(AssociationRJ { result, source }) => {
            let (source, reason) = source.to_u8_pair();
            writer
                .write_all(&[0x03, 0x00, 0, 0, 0, 4, 0x00, result.to_u8(), source, reason])
                .context(WriteFieldSnafu {
                    field: "A-ASSOCIATE-RJ",
                })
        }
        Pdu::PData { data } => {
            writer
                .write_all(&[0x04, 0x00])
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            write_chunk_u32(writer, "P-DATA-TF", |w| {
                for pdv in data {
                    write_chunk_u32(w, "Presentation-data-value", |w| {
                        let mut header = 0x00;
                        if pdv.value_type == PDataValueType::Command {
                            header |= 0x01;
                        }
                        if pdv.is_last {
                            header |= 0x02;
                        }
                        w.push(pdv.presentation_context_id);
                        w.push(header);
                        w.extend_from_slice(&pdv.data);
                        Ok(())
                    })?;
                }
                Ok(())
            })
        }
        Pdu::ReleaseRQ => writer
            .write_all(&[0x05, 0x00, 0, 0, 0, 4, 0, 0, 0, 0])
            .context(WriteFieldSnafu {
                field: "A-RELEASE-RQ",
            }),
        Pdu::ReleaseRP => writer
            .write_all(&[0x06, 0x00, 0, 0, 0, 4, 0, 0, 0, 0])
            .context(WriteFieldSnafu {
                field: "A-RELEASE-RP",
            }),
        Pdu::AbortRQ { source } => {
            let (source, reason) = source.to_u8_pair();
            writer
                .write_all(&[0x07, 0x00, 0, 0, 0, 4, 0, 0, source, reason])
                .context(WriteFieldSnafu { field: "A-ABORT" })
        }
        Pdu::Unknown { pdu_type, data } => {
            writer
                .write_all(&[*pdu_type, 0x00])
                .context(WriteFieldSnafu { field: "PDU-type" })?;
            write_chunk_u32(writer, "Unknown", |w| {
                w.extend_from_slice(data);
                Ok(())
            })
        }
    }
}

fn write_association_header(
    writer: &mut Vec<u8>,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    writer.extend_from_slice(&protocol_version.to_be_bytes());
    writer.extend_from_slice(&[0, 0]);
    write_ae_title(writer, called_ae_title, "Called-AE-title")?;
    write_ae_title(writer, calling_ae_title, "Calling-AE-title")?;
    writer.extend_from_slice(&[0; 32]);
    Ok(())
}

fn write_user_variables(writer: &mut Vec<u8>, user_variables: &[UserVariableItem]) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    write_item(writer, 0x50, "User-information", |w| {
        for item in user_variables {
            match item {
                UserVariableItem::MaxLength(max_length) => {
                    write_item(w, 0x51, "Maximum-length-received", |w| {
                        w.extend_from_slice(&max_length.to_be_bytes());
                        Ok(())
                    })?;
                }
                UserVariableItem::ImplementationClassUid(uid) => {
                    write_text_item(w, 0x52, uid, "Implementation-class-uid")?;
                }
                UserVariableItem::ImplementationVersionName(name) => {
                    write_text_item(w, 0x55, name, "Implementation-version-name")?;
                }
                UserVariableItem::SopClassExtendedNegotiation(sop_class_uid, data) => {
                    let uid_bytes = encode_text(sop_class_uid, "SOP-class-uid")?;
                    write_item(w, 0x56, "SOP-class-extended-negotiation", |w| {
                        write_chunk_u16(w, "SOP-class-uid", |w| {
                            w.extend_from_slice(&uid_bytes);
                            Ok(())
                        })?;
                        w.extend_from_slice(data);
                        Ok(())
                    })?;
                }
                UserVariableItem::UserIdentity(identity) => {
                    write_item(w, 0x58, "User-identity", |w| {
                        w.push(identity.identity_type.to_u8());
                        w.push(identity.positive_response_requested as u8);
                        write_chunk_u16(w, "Primary-field", |w| {
                            w.extend_from_slice(&identity.primary_field);
                            Ok(())
                        })?;
                        write_chunk_u16(w, "Secondary-field", |w| {
                            w.extend_from_slice(&identity.secondary_field);
                            Ok(())
                        })
                    })?;
                }
                UserVariableItem::Unknown(item_type, data) => {
                    write_item(w, *item_type, "Unknown", |w| {
                        w.extend_from_slice(data);
                        Ok(())
                    })?;
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::reader::read_pdu;
    use std::io::Cursor;

    fn round_trip(pdu: &Pdu) -> Pdu {
        let mut bytes = vec![];
        write_pdu(&mut bytes, pdu).unwrap();
        read_pdu(&mut Cursor::new(bytes), MAXIMUM_PDU_SIZE, true).unwrap()
    }

    #[test]
    fn association_rq_survives_the_wire() {
        let pdu = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            }],
            user_variables: vec![
                UserVariableItem::MaxLength(16_384),
                UserVariableItem::ImplementationClassUid(crate::IMPLEMENTATION_CLASS_UID.into()),
                UserVariableItem::ImplementationVersionName(
                    crate::IMPLEMENTATION_VERSION_NAME.into(),
                ),
                UserVariableItem::SopClassExtendedNegotiation(
                    "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                    vec![1, 0, 1],
                ),
                UserVariableItem::UserIdentity(UserIdentity {
                    positive_response_requested: true,
                    identity_type: UserIdentityType::UsernamePassword,
                    primary_field: b"user".to_vec(),
                    secondary_field: b"secret".to_vec(),
                }),
            ],
        });
        assert_eq!(round_trip(&pdu), pdu);
    }

    #[test]
    fn rejected_context_may_omit_transfer_syntax() {
        // A-ASSOCIATE-AC with one rejected context that carries no transfer syntax sub-item
        let mut body = vec![0x00, 0x01, 0x00, 0x00];
        body.extend_from_slice(b"ANY-SCP         ");
        body.extend_from_slice(b"ECHO-SCU        ");
        body.extend_from_slice(&[0; 32]);
        let context_name = DICOM_APPLICATION_CONTEXT_NAME.as_bytes();
        body.extend_from_slice(&[0x10, 0x00, 0x00, context_name.len() as u8]);
        body.extend_from_slice(context_name);
        body.extend_from_slice(&[0x21, 0x00, 0x00, 0x04, 0x03, 0x00, 0x03, 0x00]);

        let mut bytes = vec![0x02, 0x00];
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&body);

        let pdu = read_pdu(&mut Cursor::new(bytes), DEFAULT_MAX_PDU, true).unwrap();
        match pdu {
            Pdu::AssociationAC(ac) => {
                assert_eq!(ac.called_ae_title, "ANY-SCP");
                assert_eq!(ac.presentation_contexts.len(), 1);
                assert_eq!(
                    ac.presentation_contexts[0].reason,
                    PresentationContextResultReason::AbstractSyntaxNotSupported
                );
                assert_eq!(ac.presentation_contexts[0].transfer_syntax, "");
            }
            pdu => panic!("unexpected PDU {:?}", pdu),
        }
    }

    #[test]
    fn pdata_control_header_bits() {
        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![1, 2, 3, 4],
                },
                PDataValue {
                    presentation_context_id: 3,
                    value_type: PDataValueType::Data,
                    is_last: false,
                    data: vec![5, 6],
                },
            ],
        };
        let mut bytes = vec![];
        write_pdu(&mut bytes, &pdu).unwrap();
        // type, reserved, length; then first PDV: length, context, header
        assert_eq!(&bytes[..6], &[0x04, 0x00, 0, 0, 0, 18]);
        assert_eq!(&bytes[6..12], &[0, 0, 0, 6, 3, 0x03]);
        assert_eq!(bytes[21], 0x00);
        assert_eq!(round_trip(&pdu), pdu);
    }

    #[test]
    fn abort_reason_codes() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ),
        };
        let mut bytes = vec![];
        write_pdu(&mut bytes, &pdu).unwrap();
        assert_eq!(bytes, vec![0x07, 0x00, 0, 0, 0, 4, 0, 0, 2, 0]);
        assert_eq!(round_trip(&pdu), pdu);

        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu),
        };
        let mut bytes = vec![];
        write_pdu(&mut bytes, &pdu).unwrap();
        assert_eq!(bytes[9], 1);
    }

    #[test]
    fn strict_mode_refuses_oversized_pdu() {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 5_000],
            }],
        };
        let mut bytes = vec![];
        write_pdu(&mut bytes, &pdu).unwrap();

        let err = read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, true).unwrap_err();
        assert!(matches!(err, crate::pdu::reader::Error::PduTooLarge { .. }));
        // lenient mode accepts it
        assert_eq!(
            read_pdu(&mut Cursor::new(&bytes), MINIMUM_PDU_SIZE, false).unwrap(),
            pdu
        );
    }

    #[test]
    fn empty_stream_has_no_pdu() {
        let err = read_pdu(&mut Cursor::new(Vec::new()), DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(matches!(
            err,
            crate::pdu::reader::Error::NoPduAvailable { .. }
        ));
    }
}
