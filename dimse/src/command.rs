//! DIMSE command sets.
//!
//! A [`Command`] is the typed view of a DIMSE command set,
//! covering every field used by the composite (C-) and normalized (N-) services.
//! Command sets are always encoded in _Implicit VR Little Endian_.
use dicom_core::value::PrimitiveValue;
use dicom_core::{DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

use crate::status::Status;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not encode the command set
    EncodeCommand {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },
    /// could not decode the command set
    DecodeCommand {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
    #[snafu(display("missing command field {}", name))]
    MissingField {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("invalid value in command field {}", name))]
    InvalidField {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },
    #[snafu(display("invalid text in command field {}", name))]
    InvalidText {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },
    #[snafu(display("unknown command field {:04X}H", value))]
    UnknownCommandField { value: u16, backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The value of the Command Field (0000,0100).
#[allow(non_camel_case_types)]
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandField {
    C_STORE_RQ = 0x0001,
    C_STORE_RSP = 0x8001,
    C_GET_RQ = 0x0010,
    C_GET_RSP = 0x8010,
    C_FIND_RQ = 0x0020,
    C_FIND_RSP = 0x8020,
    C_MOVE_RQ = 0x0021,
    C_MOVE_RSP = 0x8021,
    C_ECHO_RQ = 0x0030,
    C_ECHO_RSP = 0x8030,
    N_EVENT_REPORT_RQ = 0x0100,
    N_EVENT_REPORT_RSP = 0x8100,
    N_GET_RQ = 0x0110,
    N_GET_RSP = 0x8110,
    N_SET_RQ = 0x0120,
    N_SET_RSP = 0x8120,
    N_ACTION_RQ = 0x0130,
    N_ACTION_RSP = 0x8130,
    N_CREATE_RQ = 0x0140,
    N_CREATE_RSP = 0x8140,
    N_DELETE_RQ = 0x0150,
    N_DELETE_RSP = 0x8150,
    C_CANCEL_RQ = 0x0FFF,
}

impl CommandField {
    pub fn from_u16(value: u16) -> Option<Self> {
        use CommandField::*;
        let field = match value {
            0x0001 => C_STORE_RQ,
            0x8001 => C_STORE_RSP,
            0x0010 => C_GET_RQ,
            0x8010 => C_GET_RSP,
            0x0020 => C_FIND_RQ,
            0x8020 => C_FIND_RSP,
            0x0021 => C_MOVE_RQ,
            0x8021 => C_MOVE_RSP,
            0x0030 => C_ECHO_RQ,
            0x8030 => C_ECHO_RSP,
            0x0100 => N_EVENT_REPORT_RQ,
            0x8100 => N_EVENT_REPORT_RSP,
            0x0110 => N_GET_RQ,
            0x8110 => N_GET_RSP,
            0x0120 => N_SET_RQ,
            0x8120 => N_SET_RSP,
            0x0130 => N_ACTION_RQ,
            0x8130 => N_ACTION_RSP,
            0x0140 => N_CREATE_RQ,
            0x8140 => N_CREATE_RSP,
            0x0150 => N_DELETE_RQ,
            0x8150 => N_DELETE_RSP,
            0x0FFF => C_CANCEL_RQ,
            _ => return None,
        };
        Some(field)
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this is the field of a response message.
    pub fn is_response(self) -> bool {
        self.to_u16() & 0x8000 != 0
    }

    /// The response field matching this request field.
    /// `None` for responses and for C-CANCEL, which has no response.
    pub fn response(self) -> Option<CommandField> {
        if self.is_response() || self == CommandField::C_CANCEL_RQ {
            return None;
        }
        CommandField::from_u16(self.to_u16() | 0x8000)
    }
}

/// The value of the Priority (0000,0700) field.
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    Medium = 0x0000,
    High = 0x0001,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0002 => Some(Priority::Low),
            0x0000 => Some(Priority::Medium),
            0x0001 => Some(Priority::High),
            _ => None,
        }
    }
}

/// Values of the Command Data Set Type (0000,0800) field.
pub mod data_set_type {
    /// A data set follows the command.
    pub const PRESENT: u16 = 0x0001;
    /// No data set follows the command.
    pub const ABSENT: u16 = 0x0101;
}

/// Sub-operation counters of C-GET and C-MOVE responses.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// A DIMSE command set.
///
/// Fields which do not apply to the command's type are left empty.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    pub command_field: CommandField,
    pub message_id: Option<u16>,
    pub message_id_being_responded_to: Option<u16>,
    pub affected_sop_class_uid: Option<String>,
    pub requested_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    pub requested_sop_instance_uid: Option<String>,
    pub priority: Option<Priority>,
    pub has_data_set: bool,
    pub status: Option<Status>,
    pub error_comment: Option<String>,
    pub move_destination: Option<String>,
    pub move_originator_ae_title: Option<String>,
    pub move_originator_message_id: Option<u16>,
    pub event_type_id: Option<u16>,
    pub action_type_id: Option<u16>,
    pub sub_operations: Option<SubOperations>,
}

impl Command {
    fn new(command_field: CommandField) -> Self {
        Command {
            command_field,
            message_id: None,
            message_id_being_responded_to: None,
            affected_sop_class_uid: None,
            requested_sop_class_uid: None,
            affected_sop_instance_uid: None,
            requested_sop_instance_uid: None,
            priority: None,
            has_data_set: false,
            status: None,
            error_comment: None,
            move_destination: None,
            move_originator_ae_title: None,
            move_originator_message_id: None,
            event_type_id: None,
            action_type_id: None,
            sub_operations: None,
        }
    }

    pub fn c_echo_rq(sop_class_uid: impl Into<String>) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            ..Command::new(CommandField::C_ECHO_RQ)
        }
    }

    pub fn c_store_rq(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            affected_sop_instance_uid: Some(sop_instance_uid.into()),
            priority: Some(priority),
            has_data_set: true,
            ..Command::new(CommandField::C_STORE_RQ)
        }
    }

    pub fn c_find_rq(sop_class_uid: impl Into<String>, priority: Priority) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            priority: Some(priority),
            has_data_set: true,
            ..Command::new(CommandField::C_FIND_RQ)
        }
    }

    pub fn c_get_rq(sop_class_uid: impl Into<String>, priority: Priority) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            priority: Some(priority),
            has_data_set: true,
            ..Command::new(CommandField::C_GET_RQ)
        }
    }

    pub fn c_move_rq(
        sop_class_uid: impl Into<String>,
        priority: Priority,
        move_destination: impl Into<String>,
    ) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            priority: Some(priority),
            move_destination: Some(move_destination.into()),
            has_data_set: true,
            ..Command::new(CommandField::C_MOVE_RQ)
        }
    }

    /// Request the cancellation of the operation with the given message ID.
    pub fn c_cancel_rq(message_id_being_responded_to: u16) -> Self {
        Command {
            message_id_being_responded_to: Some(message_id_being_responded_to),
            ..Command::new(CommandField::C_CANCEL_RQ)
        }
    }

    pub fn n_event_report_rq(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        event_type_id: u16,
    ) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            affected_sop_instance_uid: Some(sop_instance_uid.into()),
            event_type_id: Some(event_type_id),
            ..Command::new(CommandField::N_EVENT_REPORT_RQ)
        }
    }

    pub fn n_get_rq(sop_class_uid: impl Into<String>, sop_instance_uid: impl Into<String>) -> Self {
        Command {
            requested_sop_class_uid: Some(sop_class_uid.into()),
            requested_sop_instance_uid: Some(sop_instance_uid.into()),
            ..Command::new(CommandField::N_GET_RQ)
        }
    }

    pub fn n_set_rq(sop_class_uid: impl Into<String>, sop_instance_uid: impl Into<String>) -> Self {
        Command {
            requested_sop_class_uid: Some(sop_class_uid.into()),
            requested_sop_instance_uid: Some(sop_instance_uid.into()),
            has_data_set: true,
            ..Command::new(CommandField::N_SET_RQ)
        }
    }

    pub fn n_action_rq(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
        action_type_id: u16,
    ) -> Self {
        Command {
            requested_sop_class_uid: Some(sop_class_uid.into()),
            requested_sop_instance_uid: Some(sop_instance_uid.into()),
            action_type_id: Some(action_type_id),
            ..Command::new(CommandField::N_ACTION_RQ)
        }
    }

    /// The SOP instance UID may be left for the performer to assign.
    pub fn n_create_rq(sop_class_uid: impl Into<String>, sop_instance_uid: Option<String>) -> Self {
        Command {
            affected_sop_class_uid: Some(sop_class_uid.into()),
            affected_sop_instance_uid: sop_instance_uid,
            ..Command::new(CommandField::N_CREATE_RQ)
        }
    }

    pub fn n_delete_rq(
        sop_class_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Command {
            requested_sop_class_uid: Some(sop_class_uid.into()),
            requested_sop_instance_uid: Some(sop_instance_uid.into()),
            ..Command::new(CommandField::N_DELETE_RQ)
        }
    }

    /// Build the response to this request with the given status.
    ///
    /// The affected SOP class and instance are carried over,
    /// taken from the requested ones for normalized services.
    /// Returns `None` if this command is not a request expecting a response.
    pub fn response_to(&self, status: Status) -> Option<Command> {
        let command_field = self.command_field.response()?;
        Some(Command {
            message_id_being_responded_to: self.message_id,
            affected_sop_class_uid: self
                .affected_sop_class_uid
                .clone()
                .or_else(|| self.requested_sop_class_uid.clone()),
            affected_sop_instance_uid: self
                .affected_sop_instance_uid
                .clone()
                .or_else(|| self.requested_sop_instance_uid.clone()),
            event_type_id: self.event_type_id,
            action_type_id: self.action_type_id,
            status: Some(status),
            ..Command::new(command_field)
        })
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_data_set(mut self, has_data_set: bool) -> Self {
        self.has_data_set = has_data_set;
        self
    }

    pub fn with_error_comment(mut self, comment: impl Into<String>) -> Self {
        self.error_comment = Some(comment.into());
        self
    }

    pub fn with_sub_operations(mut self, sub_operations: SubOperations) -> Self {
        self.sub_operations = Some(sub_operations);
        self
    }

    pub fn with_move_originator(mut self, ae_title: impl Into<String>, message_id: u16) -> Self {
        self.move_originator_ae_title = Some(ae_title.into());
        self.move_originator_message_id = Some(message_id);
        self
    }

    pub fn is_response(&self) -> bool {
        self.command_field.is_response()
    }

    /// The status of a response, success if not specified.
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::SUCCESS)
    }

    /// The SOP class this command refers to, affected or requested.
    pub fn sop_class_uid(&self) -> Option<&str> {
        self.affected_sop_class_uid
            .as_deref()
            .or(self.requested_sop_class_uid.as_deref())
    }

    /// Build the command set as a DICOM object.
    pub fn to_object(&self) -> InMemDicomObject {
        let mut elements = vec![us(tags::COMMAND_FIELD, self.command_field.to_u16())];
        let mut push_uid = |tag: Tag, value: &Option<String>| {
            if let Some(uid) = value {
                elements.push(DataElement::new(tag, VR::UI, uid_value(uid)));
            }
        };
        push_uid(tags::AFFECTED_SOP_CLASS_UID, &self.affected_sop_class_uid);
        push_uid(tags::REQUESTED_SOP_CLASS_UID, &self.requested_sop_class_uid);
        push_uid(tags::AFFECTED_SOP_INSTANCE_UID, &self.affected_sop_instance_uid);
        push_uid(
            tags::REQUESTED_SOP_INSTANCE_UID,
            &self.requested_sop_instance_uid,
        );

        if let Some(id) = self.message_id {
            elements.push(us(tags::MESSAGE_ID, id));
        }
        if let Some(id) = self.message_id_being_responded_to {
            elements.push(us(tags::MESSAGE_ID_BEING_RESPONDED_TO, id));
        }
        if let Some(destination) = &self.move_destination {
            elements.push(ae(tags::MOVE_DESTINATION, destination));
        }
        if let Some(priority) = self.priority {
            elements.push(us(tags::PRIORITY, priority as u16));
        }
        elements.push(us(
            tags::COMMAND_DATA_SET_TYPE,
            if self.has_data_set {
                data_set_type::PRESENT
            } else {
                data_set_type::ABSENT
            },
        ));
        if let Some(status) = self.status {
            elements.push(us(tags::STATUS, status.code()));
        }
        if let Some(comment) = &self.error_comment {
            let mut comment = comment.clone();
            if comment.len() % 2 == 1 {
                comment.push(' ');
            }
            elements.push(DataElement::new(
                tags::ERROR_COMMENT,
                VR::LO,
                PrimitiveValue::from(comment),
            ));
        }
        if let Some(id) = self.event_type_id {
            elements.push(us(tags::EVENT_TYPE_ID, id));
        }
        if let Some(id) = self.action_type_id {
            elements.push(us(tags::ACTION_TYPE_ID, id));
        }
        if let Some(counters) = self.sub_operations {
            if let Some(remaining) = counters.remaining {
                elements.push(us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, remaining));
            }
            elements.push(us(
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                counters.completed,
            ));
            elements.push(us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, counters.failed));
            elements.push(us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, counters.warning));
        }
        if let Some(ae_title) = &self.move_originator_ae_title {
            elements.push(ae(
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                ae_title,
            ));
        }
        if let Some(id) = self.move_originator_message_id {
            elements.push(us(tags::MOVE_ORIGINATOR_MESSAGE_ID, id));
        }

        InMemDicomObject::command_from_element_iter(elements)
    }

    /// Encode the command set in Implicit VR Little Endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        self.to_object()
            .write_dataset_with_ts(&mut buffer, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(EncodeCommandSnafu)?;
        Ok(buffer)
    }

    /// Decode a command set from Implicit VR Little Endian bytes.
    pub fn decode(bytes: &[u8]) -> Result<Command> {
        let obj = InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(DecodeCommandSnafu)?;
        Command::from_object(&obj)
    }

    /// Interpret a DICOM object as a command set.
    pub fn from_object(obj: &InMemDicomObject) -> Result<Command> {
        let value = read_u16(obj, tags::COMMAND_FIELD, "Command Field")?.context(
            MissingFieldSnafu {
                name: "Command Field",
            },
        )?;
        let command_field =
            CommandField::from_u16(value).context(UnknownCommandFieldSnafu { value })?;

        let has_data_set = read_u16(obj, tags::COMMAND_DATA_SET_TYPE, "Command Data Set Type")?
            .map(|v| v != data_set_type::ABSENT)
            .unwrap_or(false);

        let sub_operations = {
            let remaining = read_u16(
                obj,
                tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
                "Number of Remaining Sub-operations",
            )?;
            let completed = read_u16(
                obj,
                tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
                "Number of Completed Sub-operations",
            )?;
            let failed = read_u16(
                obj,
                tags::NUMBER_OF_FAILED_SUBOPERATIONS,
                "Number of Failed Sub-operations",
            )?;
            let warning = read_u16(
                obj,
                tags::NUMBER_OF_WARNING_SUBOPERATIONS,
                "Number of Warning Sub-operations",
            )?;
            if remaining.is_some() || completed.is_some() || failed.is_some() || warning.is_some()
            {
                Some(SubOperations {
                    remaining,
                    completed: completed.unwrap_or(0),
                    failed: failed.unwrap_or(0),
                    warning: warning.unwrap_or(0),
                })
            } else {
                None
            }
        };

        Ok(Command {
            command_field,
            message_id: read_u16(obj, tags::MESSAGE_ID, "Message ID")?,
            message_id_being_responded_to: read_u16(
                obj,
                tags::MESSAGE_ID_BEING_RESPONDED_TO,
                "Message ID Being Responded To",
            )?,
            affected_sop_class_uid: read_str(
                obj,
                tags::AFFECTED_SOP_CLASS_UID,
                "Affected SOP Class UID",
            )?,
            requested_sop_class_uid: read_str(
                obj,
                tags::REQUESTED_SOP_CLASS_UID,
                "Requested SOP Class UID",
            )?,
            affected_sop_instance_uid: read_str(
                obj,
                tags::AFFECTED_SOP_INSTANCE_UID,
                "Affected SOP Instance UID",
            )?,
            requested_sop_instance_uid: read_str(
                obj,
                tags::REQUESTED_SOP_INSTANCE_UID,
                "Requested SOP Instance UID",
            )?,
            priority: read_u16(obj, tags::PRIORITY, "Priority")?.and_then(Priority::from_u16),
            has_data_set,
            status: read_u16(obj, tags::STATUS, "Status")?.map(Status),
            error_comment: read_str(obj, tags::ERROR_COMMENT, "Error Comment")?,
            move_destination: read_str(obj, tags::MOVE_DESTINATION, "Move Destination")?,
            move_originator_ae_title: read_str(
                obj,
                tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE,
                "Move Originator AE Title",
            )?,
            move_originator_message_id: read_u16(
                obj,
                tags::MOVE_ORIGINATOR_MESSAGE_ID,
                "Move Originator Message ID",
            )?,
            event_type_id: read_u16(obj, tags::EVENT_TYPE_ID, "Event Type ID")?,
            action_type_id: read_u16(obj, tags::ACTION_TYPE_ID, "Action Type ID")?,
            sub_operations,
        })
    }
}

fn us(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn ae(tag: Tag, value: &str) -> InMemElement {
    let mut value = value.to_string();
    if value.len() % 2 == 1 {
        value.push(' ');
    }
    DataElement::new(tag, VR::AE, PrimitiveValue::from(value))
}

/// UIDs are padded to even length with a null character.
fn uid_value(uid: &str) -> PrimitiveValue {
    let mut uid = uid.to_string();
    if uid.len() % 2 == 1 {
        uid.push('\0');
    }
    PrimitiveValue::from(uid)
}

fn read_u16(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Option<u16>> {
    obj.get(tag)
        .map(|e| e.to_int::<u16>().context(InvalidFieldSnafu { name }))
        .transpose()
}

fn read_str(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<Option<String>> {
    obj.get(tag)
        .map(|e| {
            e.to_str()
                .map(|s| {
                    s.trim_end_matches(|c: char| c == '\0' || c == ' ')
                        .to_string()
                })
                .context(InvalidTextSnafu { name })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::uids;

    #[test]
    fn response_fields_follow_requests() {
        assert_eq!(
            CommandField::C_FIND_RQ.response(),
            Some(CommandField::C_FIND_RSP)
        );
        assert_eq!(
            CommandField::N_DELETE_RQ.response(),
            Some(CommandField::N_DELETE_RSP)
        );
        assert_eq!(CommandField::C_CANCEL_RQ.response(), None);
        assert_eq!(CommandField::C_ECHO_RSP.response(), None);
        assert!(CommandField::N_EVENT_REPORT_RSP.is_response());
        assert!(!CommandField::C_CANCEL_RQ.is_response());
    }

    #[test]
    fn echo_request_encodes_and_decodes() {
        let request = Command::c_echo_rq(uids::VERIFICATION).with_message_id(7);
        let bytes = request.encode().unwrap();

        // starts with the command group length element
        assert_eq!(&bytes[..8], &[0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00]);

        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded, request);
        assert!(!decoded.has_data_set);
    }

    #[test]
    fn non_textual_uid_is_rejected() {
        use dicom_core::value::{DataSetSequence, Value};
        use dicom_core::Length;

        let obj = InMemDicomObject::from_element_iter([
            us(tags::COMMAND_FIELD, CommandField::C_ECHO_RQ.to_u16()),
            DataElement::new(
                tags::AFFECTED_SOP_CLASS_UID,
                VR::SQ,
                Value::Sequence(DataSetSequence::new(
                    Vec::<InMemDicomObject>::new(),
                    Length::UNDEFINED,
                )),
            ),
        ]);
        assert!(matches!(
            Command::from_object(&obj),
            Err(Error::InvalidText {
                name: "Affected SOP Class UID",
                ..
            })
        ));
    }

    #[test]
    fn move_response_keeps_sub_operations() {
        let request = Command::c_move_rq(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            Priority::High,
            "STORE-SCP",
        )
        .with_message_id(3);
        let response = request
            .response_to(Status::PENDING)
            .unwrap()
            .with_sub_operations(SubOperations {
                remaining: Some(4),
                completed: 1,
                failed: 0,
                warning: 0,
            });

        let decoded = Command::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.command_field, CommandField::C_MOVE_RSP);
        assert_eq!(decoded.message_id_being_responded_to, Some(3));
        assert_eq!(decoded.status(), Status::PENDING);
        assert_eq!(
            decoded.sub_operations,
            Some(SubOperations {
                remaining: Some(4),
                completed: 1,
                failed: 0,
                warning: 0,
            })
        );
        assert_eq!(
            decoded.affected_sop_class_uid.as_deref(),
            Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
        );
    }

    #[test]
    fn normalized_response_uses_requested_uids() {
        let request = Command::n_action_rq("1.2.840.10008.1.20.1", "1.2.3.4", 1).with_message_id(9);
        let response = request.response_to(Status::SUCCESS).unwrap();
        assert_eq!(response.command_field, CommandField::N_ACTION_RSP);
        assert_eq!(response.affected_sop_class_uid.as_deref(), Some("1.2.840.10008.1.20.1"));
        assert_eq!(response.affected_sop_instance_uid.as_deref(), Some("1.2.3.4"));
        assert_eq!(response.action_type_id, Some(1));
    }

    #[test]
    fn missing_command_field_is_an_error() {
        let obj = InMemDicomObject::command_from_element_iter(vec![us(tags::MESSAGE_ID, 1)]);
        assert!(matches!(
            Command::from_object(&obj),
            Err(Error::MissingField { .. })
        ));
    }
}
