//! DIMSE status codes.
use std::fmt;

/// The general kind of a DIMSE status code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StatusType {
    Success,
    /// more responses follow for the same request
    Pending,
    Cancel,
    Warning,
    Failure,
}

/// A DIMSE status code, as carried in the Status (0000,0900) command field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    /// pending, with one or more optional keys not supported
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);

    pub const ATTRIBUTE_LIST_ERROR: Status = Status(0x0107);
    pub const ATTRIBUTE_VALUE_OUT_OF_RANGE: Status = Status(0x0116);
    pub const COERCION_OF_DATA_ELEMENTS: Status = Status(0xB000);
    pub const SUB_OPERATIONS_COMPLETE_WITH_FAILURES: Status = Status(0xB000);

    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    pub const DUPLICATE_SOP_INSTANCE: Status = Status(0x0111);
    pub const NO_SUCH_SOP_INSTANCE: Status = Status(0x0112);
    pub const NO_SUCH_EVENT_TYPE: Status = Status(0x0113);
    pub const NO_SUCH_ARGUMENT: Status = Status(0x0114);
    pub const INVALID_ATTRIBUTE_VALUE: Status = Status(0x0106);
    pub const INVALID_OBJECT_INSTANCE: Status = Status(0x0117);
    pub const NO_SUCH_SOP_CLASS: Status = Status(0x0118);
    pub const CLASS_INSTANCE_CONFLICT: Status = Status(0x0119);
    pub const MISSING_ATTRIBUTE: Status = Status(0x0120);
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    pub const NO_SUCH_ACTION: Status = Status(0x0123);
    pub const NOT_AUTHORIZED: Status = Status(0x0124);
    pub const DUPLICATE_INVOCATION: Status = Status(0x0210);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const MISTYPED_ARGUMENT: Status = Status(0x0212);
    pub const RESOURCE_LIMITATION: Status = Status(0x0213);
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    pub const IDENTIFIER_DOES_NOT_MATCH_SOP_CLASS: Status = Status(0xA900);
    pub const UNABLE_TO_PROCESS: Status = Status(0xC000);

    pub fn code(self) -> u16 {
        self.0
    }

    /// Classify the status code.
    pub fn status_type(self) -> StatusType {
        match self.0 {
            0x0000 => StatusType::Success,
            0xFF00 | 0xFF01 => StatusType::Pending,
            0xFE00 => StatusType::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => StatusType::Warning,
            _ => StatusType::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self.status_type() == StatusType::Success
    }

    pub fn is_pending(self) -> bool {
        self.status_type() == StatusType::Pending
    }

    pub fn is_failure(self) -> bool {
        self.status_type() == StatusType::Failure
    }

    /// Whether this status ends an operation,
    /// meaning that no more responses follow.
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}H ({:?})", self.0, self.status_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x0000, StatusType::Success)]
    #[case(0xFF00, StatusType::Pending)]
    #[case(0xFF01, StatusType::Pending)]
    #[case(0xFE00, StatusType::Cancel)]
    #[case(0x0001, StatusType::Warning)]
    #[case(0xB007, StatusType::Warning)]
    #[case(0x0122, StatusType::Failure)]
    #[case(0xA701, StatusType::Failure)]
    #[case(0xC123, StatusType::Failure)]
    fn status_classification(#[case] code: u16, #[case] expected: StatusType) {
        assert_eq!(Status(code).status_type(), expected);
        assert_eq!(Status(code).is_terminal(), expected != StatusType::Pending);
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::SOP_CLASS_NOT_SUPPORTED.to_string(), "0122H (Failure)");
    }
}
