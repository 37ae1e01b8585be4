//! This crate contains the types and methods needed to negotiate
//! and drive DICOM associations through the upper layer protocol.
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_,
//!   as well as readers and writers of PDUs from arbitrary byte streams.
//! - The [`transport`] module
//!   abstracts over the duplex byte stream an association runs on,
//!   so that plain TCP and encrypted connections can be plugged in alike.
//! - The [`association`] module
//!   comprises the association state machine,
//!   from negotiation (as requester or acceptor)
//!   to release and abort.
//!
//! Higher-level message exchange (DIMSE) is built on top of
//! [`Association`] and [`AssociationReader`].

pub mod association;
pub mod pdu;
pub mod transport;

/// The implementation class UID sent in every association negotiation.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.301893572615903711024871263150983729251";

/// The implementation version name sent in every association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOMNET 0.3";

// re-exports

pub use association::client::{ClientAssociationOptions, NegotiationError};
pub use association::server::{AcceptError, ServerAssociationOptions};
pub use association::{
    Association, AssociationListener, AssociationReader, AssociationState, CloseReason,
    IncomingMessage, ReleaseOutcome, StateTransition,
};
pub use pdu::{read_pdu, write_pdu, Pdu};
pub use transport::{TcpTransportFactory, Transport, TransportFactory};
