//! Protocol Data Unit module
//!
//! In-memory representations of every PDU type of the upper layer protocol,
//! together with [`read_pdu`] and [`write_pdu`]
//! for (de)serializing them from arbitrary byte streams.
pub mod reader;
pub mod writer;

use std::fmt::{self, Display};

pub use reader::{read_pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE};
pub use writer::write_pdu;

/// The application context name of every DICOM association.
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// A presentation context as proposed by the association requester.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier (odd, 1..=255)
    pub id: u8,
    /// the abstract syntax UID, usually a SOP class
    pub abstract_syntax: String,
    /// candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context as answered by the association acceptor.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

/// A presentation context after negotiation,
/// pairing the proposed abstract syntax with the acceptor's answer.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

impl PresentationContextNegotiated {
    /// Whether the acceptor accepted this presentation context.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from_u8(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(Self::Acceptance),
            1 => Some(Self::UserRejection),
            2 => Some(Self::NoReason),
            3 => Some(Self::AbstractSyntaxNotSupported),
            4 => Some(Self::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Acceptance => "acceptance",
            Self::UserRejection => "user rejection",
            Self::NoReason => "no reason",
            Self::AbstractSyntaxNotSupported => "abstract syntax not supported",
            Self::TransferSyntaxesNotSupported => "transfer syntaxes not supported",
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Permanent),
            2 => Some(Self::Transient),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Permanent => 1,
            Self::Transient => 2,
        }
    }
}

impl Display for AssociationRJResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permanent => "rejected-permanent",
            Self::Transient => "rejected-transient",
        })
    }
}

/// The source of an association rejection, with its reason.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAcse(AssociationRJServiceProviderAcseReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from_u8(source: u8, reason: u8) -> Option<Self> {
        use AssociationRJServiceProviderAcseReason as Acse;
        use AssociationRJServiceProviderPresentationReason as Presentation;
        use AssociationRJServiceUserReason as User;
        let out = match (source, reason) {
            (1, 1) => Self::ServiceUser(User::NoReasonGiven),
            (1, 2) => Self::ServiceUser(User::ApplicationContextNameNotSupported),
            (1, 3) => Self::ServiceUser(User::CallingAeTitleNotRecognized),
            (1, 7) => Self::ServiceUser(User::CalledAeTitleNotRecognized),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Self::ServiceUser(User::Reserved(x)),
            (2, 1) => Self::ServiceProviderAcse(Acse::NoReasonGiven),
            (2, 2) => Self::ServiceProviderAcse(Acse::ProtocolVersionNotSupported),
            (3, 1) => Self::ServiceProviderPresentation(Presentation::TemporaryCongestion),
            (3, 2) => Self::ServiceProviderPresentation(Presentation::LocalLimitExceeded),
            (3, x @ 0) | (3, x @ 3..=7) => {
                Self::ServiceProviderPresentation(Presentation::Reserved(x))
            }
            _ => return None,
        };
        Some(out)
    }

    /// The (source, reason/diag) byte pair of this rejection.
    pub(crate) fn to_u8_pair(self) -> (u8, u8) {
        use AssociationRJServiceProviderAcseReason as Acse;
        use AssociationRJServiceProviderPresentationReason as Presentation;
        use AssociationRJServiceUserReason as User;
        match self {
            Self::ServiceUser(reason) => (
                1,
                match reason {
                    User::NoReasonGiven => 1,
                    User::ApplicationContextNameNotSupported => 2,
                    User::CallingAeTitleNotRecognized => 3,
                    User::CalledAeTitleNotRecognized => 7,
                    User::Reserved(x) => x,
                },
            ),
            Self::ServiceProviderAcse(reason) => (
                2,
                match reason {
                    Acse::NoReasonGiven => 1,
                    Acse::ProtocolVersionNotSupported => 2,
                },
            ),
            Self::ServiceProviderPresentation(reason) => (
                3,
                match reason {
                    Presentation::TemporaryCongestion => 1,
                    Presentation::LocalLimitExceeded => 2,
                    Presentation::Reserved(x) => x,
                },
            ),
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceUser(r) => write!(f, "service user: {}", r),
            Self::ServiceProviderAcse(r) => write!(f, "service provider (ACSE): {}", r),
            Self::ServiceProviderPresentation(r) => {
                write!(f, "service provider (presentation): {}", r)
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReasonGiven => f.write_str("no reason given"),
            Self::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            Self::CallingAeTitleNotRecognized => f.write_str("calling AE title not recognized"),
            Self::CalledAeTitleNotRecognized => f.write_str("called AE title not recognized"),
            Self::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAcseReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderAcseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoReasonGiven => "no reason given",
            Self::ProtocolVersionNotSupported => "protocol version not supported",
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemporaryCongestion => f.write_str("temporary congestion"),
            Self::LocalLimitExceeded => f.write_str("local limit exceeded"),
            Self::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// One presentation data value (PDV) item of a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the command or data set
    pub is_last: bool,
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from_u8(source: u8, reason: u8) -> Option<Self> {
        use AbortRQServiceProviderReason as R;
        let out = match (source, reason) {
            (0, _) => Self::ServiceUser,
            (1, _) => Self::Reserved,
            (2, 0) => Self::ServiceProvider(R::ReasonNotSpecified),
            (2, 1) => Self::ServiceProvider(R::UnrecognizedPdu),
            (2, 2) => Self::ServiceProvider(R::UnexpectedPdu),
            (2, 3) => Self::ServiceProvider(R::Reserved),
            (2, 4) => Self::ServiceProvider(R::UnrecognizedPduParameter),
            (2, 5) => Self::ServiceProvider(R::UnexpectedPduParameter),
            (2, 6) => Self::ServiceProvider(R::InvalidPduParameter),
            _ => return None,
        };
        Some(out)
    }

    pub(crate) fn to_u8_pair(self) -> (u8, u8) {
        use AbortRQServiceProviderReason as R;
        match self {
            Self::ServiceUser => (0, 0),
            Self::Reserved => (1, 0),
            Self::ServiceProvider(reason) => (
                2,
                match reason {
                    R::ReasonNotSpecified => 0,
                    R::UnrecognizedPdu => 1,
                    R::UnexpectedPdu => 2,
                    R::Reserved => 3,
                    R::UnrecognizedPduParameter => 4,
                    R::UnexpectedPduParameter => 5,
                    R::InvalidPduParameter => 6,
                },
            ),
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceUser => f.write_str("service user"),
            Self::Reserved => f.write_str("reserved"),
            Self::ServiceProvider(reason) => write!(f, "service provider: {}", reason),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReasonNotSpecified => "reason not specified",
            Self::UnrecognizedPdu => "unrecognized PDU",
            Self::UnexpectedPdu => "unexpected PDU",
            Self::Reserved => "reserved code",
            Self::UnrecognizedPduParameter => "unrecognized PDU parameter",
            Self::UnexpectedPduParameter => "unexpected PDU parameter",
            Self::InvalidPduParameter => "invalid PDU parameter",
        })
    }
}

/// A variable item of an association request or acknowledgement.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    Unknown(u8, Vec<u8>),
    MaxLength(u32),
    ImplementationClassUid(String),
    ImplementationVersionName(String),
    /// SOP class UID and its service-class application information
    SopClassExtendedNegotiation(String, Vec<u8>),
    UserIdentity(UserIdentity),
}

#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    pub positive_response_requested: bool,
    pub identity_type: UserIdentityType,
    pub primary_field: Vec<u8>,
    pub secondary_field: Vec<u8>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Pdu {
    /// Unrecognized PDU type
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// Provide a short description of the PDU,
    /// which does not dump P-Data payloads.
    pub fn short_description(&self) -> impl Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => write!(
                f,
                "Unknown {{pdu_type: {}, data: {} bytes }}",
                pdu_type,
                data.len()
            ),
            Pdu::PData { data } => {
                f.write_str("PData [")?;
                for (i, pdv) in data.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(
                        f,
                        "(#{} {:?}{}, {} bytes)",
                        pdv.presentation_context_id,
                        pdv.value_type,
                        if pdv.is_last { " last" } else { "" },
                        pdv.data.len()
                    )?;
                }
                f.write_str("]")
            }
            pdu => fmt::Debug::fmt(pdu, f),
        }
    }
}

/// An in-memory representation of an association request.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl Display for AssociationRJ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.result, self.source)
    }
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// Retrieve the maximum length sub-item from a list of user variables.
pub(crate) fn max_length_of(user_variables: &[UserVariableItem]) -> Option<u32> {
    user_variables.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_short_description() {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRQ { source: ServiceUser }",
        );

        let pdu = Pdu::PData {
            data: vec![
                PDataValue {
                    is_last: true,
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    data: vec![0x55; 76],
                },
                PDataValue {
                    is_last: false,
                    presentation_context_id: 1,
                    value_type: PDataValueType::Data,
                    data: vec![0x55; 384],
                },
            ],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(#1 Command last, 76 bytes), (#1 Data, 384 bytes)]",
        );
    }

    #[test]
    fn reject_source_codes_are_symmetric() {
        for (source, reason) in [(1, 1), (1, 2), (1, 3), (1, 7), (1, 9), (2, 2), (3, 1), (3, 5)] {
            let rj = AssociationRJSource::from_u8(source, reason).unwrap();
            assert_eq!(rj.to_u8_pair(), (source, reason));
        }
        assert_eq!(AssociationRJSource::from_u8(2, 9), None);
    }
}
