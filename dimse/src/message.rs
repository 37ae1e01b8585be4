//! Complete DIMSE messages: a command set and an optional data set.
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::command::Command;
use crate::status::Status;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum DataSetError {
    #[snafu(display("unsupported transfer syntax {}", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },
    /// could not read the data set
    ReadDataSet {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
    /// could not write the data set
    WriteDataSet {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },
}

/// A DIMSE message received or to be sent over an association.
///
/// The data set is kept in its encoded form.
/// It is only parsed on demand through [`data_set`](DimseMessage::data_set),
/// so that large payloads can also be streamed out as they are.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    /// transfer syntax of the data set, as negotiated for the presentation context
    pub transfer_syntax: String,
    pub command: Command,
    pub data: Option<Vec<u8>>,
}

/// Responses are ordinary messages.
pub type DimseResponse = DimseMessage;

impl DimseMessage {
    /// The status of a response message.
    pub fn status(&self) -> Status {
        self.command.status()
    }

    /// The encoded data set, if any.
    pub fn raw_data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Parse the data set with the negotiated transfer syntax.
    pub fn data_set(&self) -> Result<Option<InMemDicomObject>, DataSetError> {
        match &self.data {
            Some(data) => read_data_set(data, &self.transfer_syntax).map(Some),
            None => Ok(None),
        }
    }
}

/// Parse a data set encoded in the given transfer syntax.
pub fn read_data_set(data: &[u8], transfer_syntax: &str) -> Result<InMemDicomObject, DataSetError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .filter(|ts| !ts.is_unsupported())
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    InMemDicomObject::read_dataset_with_ts(data, ts).context(ReadDataSetSnafu)
}

/// Encode a data set in the given transfer syntax.
pub fn write_data_set(
    obj: &InMemDicomObject,
    transfer_syntax: &str,
) -> Result<Vec<u8>, DataSetError> {
    let ts = TransferSyntaxRegistry
        .get(transfer_syntax)
        .filter(|ts| !ts.is_unsupported())
        .context(UnsupportedTransferSyntaxSnafu {
            uid: transfer_syntax,
        })?;
    let mut buffer = Vec::new();
    obj.write_dataset_with_ts(&mut buffer, ts)
        .context(WriteDataSetSnafu)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::value::PrimitiveValue;
    use dicom_core::{DataElement, VR};
    use dicom_dictionary_std::tags;

    #[test]
    fn data_set_is_parsed_on_demand() {
        let obj = InMemDicomObject::from_element_iter(vec![DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from("Doe^John"),
        )]);
        let data = write_data_set(&obj, "1.2.840.10008.1.2.1").unwrap();

        let message = DimseMessage {
            presentation_context_id: 1,
            transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            command: Command::c_store_rq("1.2.840.10008.5.1.4.1.1.7", "1.2.3", Default::default()),
            data: Some(data),
        };
        let parsed = message.data_set().unwrap().unwrap();
        assert_eq!(
            parsed.get(tags::PATIENT_NAME).unwrap().to_str().unwrap(),
            "Doe^John"
        );
    }

    #[test]
    fn unknown_transfer_syntax_is_refused() {
        assert!(matches!(
            read_data_set(&[], "1.2.3.4.5.6"),
            Err(DataSetError::UnsupportedTransferSyntax { .. })
        ));
    }
}
