//! Association requester module
//!
//! The module provides the negotiation procedure
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::{
    notify_listeners, trim_uid, Association, AssociationListener, AssociationReader,
    AssociationState, Behavior, CloseReason, Negotiated, StateTransition,
};
use crate::pdu::{
    max_length_of, read_pdu, write_pdu, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRQ, Pdu, PresentationContextNegotiated, PresentationContextProposed,
    PresentationContextResultReason, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    DICOM_APPLICATION_CONTEXT_NAME, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};
use crate::association::DEFAULT_MAX_MESSAGE_LENGTH;
use crate::transport::{Transport, TransportFactory};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Why an association request did not produce an open association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum NegotiationError {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("too many presentation contexts ({}, maximum is 128)", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// could not connect to the peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode the association request
    SendRequest {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send the association request
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive the association response
    ReceiveResponse {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("no association response within {:?}", timeout))]
    Timeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the peer: {}", association_rj))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    /// no presentation context was accepted by the peer
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("unexpected response from the peer: {}", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = NegotiationError> = std::result::Result<T, E>;

/// A DICOM association builder for a client node.
/// The final outcome is an open [`Association`] and its [`AssociationReader`].
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// At least one presentation context must be specified,
/// using the method [`with_abstract_syntax`](Self::with_abstract_syntax)
/// or [`with_presentation_context`](Self::with_presentation_context).
///
/// ## Example
///
/// ```no_run
/// # use dicomnet_ul::association::client::ClientAssociationOptions;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let (association, mut reader) = ClientAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .called_ae_title("STORE-SCP")
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// Listeners registered here observe every transition of the association,
/// starting with `Idle -> Requesting`.
#[derive(Clone)]
pub struct ClientAssociationOptions<'a> {
    calling_ae_title: Cow<'a, str>,
    called_ae_title: Cow<'a, str>,
    application_context_name: Cow<'a, str>,
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    extended_negotiation: Vec<(Cow<'a, str>, Vec<u8>)>,
    user_identity: Option<UserIdentity>,
    protocol_version: u16,
    max_pdu_length: u32,
    max_message_length: u64,
    strict: bool,
    accept_timeout: Duration,
    release_timeout: Duration,
    pack_pdvs: bool,
    listeners: Vec<Arc<dyn AssociationListener>>,
}

impl std::fmt::Debug for ClientAssociationOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientAssociationOptions")
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("max_message_length", &self.max_message_length)
            .field("strict", &self.strict)
            .field("accept_timeout", &self.accept_timeout)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            extended_negotiation: Vec::new(),
            user_identity: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            strict: true,
            accept_timeout: Duration::from_secs(30),
            release_timeout: Duration::from_secs(10),
            pack_pdvs: false,
            listeners: Vec::new(),
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    ///
    /// Transfer syntaxes are listed in order of preference.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes = transfer_syntax_uids
            .into_iter()
            .map(|t| owned_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((owned_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    ///
    /// The default transfer syntaxes are
    /// _Explicit VR Little Endian_ and _Implicit VR Little Endian_.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.with_presentation_context(
            abstract_syntax_uid.into(),
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()],
        )
    }

    /// Propose SOP class extended negotiation for the given SOP class.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiation
            .push((owned_uid(sop_class_uid.into()), info));
        self
    }

    /// Identify the user of this node to the peer.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the maximum size of a command or data set
    /// reassembled from incoming fragments.
    /// A peer sending a larger message gets the association aborted.
    pub fn max_message_length(mut self, value: u64) -> Self {
        self.max_message_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set how long to wait for the association response.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Set how long a release waits for the peer's reply.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Send a command and its data set in a single PDU when both fit.
    pub fn pack_pdvs(mut self, pack_pdvs: bool) -> Self {
        self.pack_pdvs = pack_pdvs;
        self
    }

    /// Register a listener of association state transitions.
    pub fn with_listener(mut self, listener: Arc<dyn AssociationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(
        self,
        address: A,
    ) -> Result<(Arc<Association>, AssociationReader)> {
        self.validate()?;
        let socket = TcpStream::connect(address).context(ConnectSnafu)?;
        self.negotiate(Box::new(socket))
    }

    /// Open a connection through the given transport factory
    /// and request a new DICOM association.
    pub fn connect<F>(
        self,
        factory: &F,
        host: &str,
        port: u16,
    ) -> Result<(Arc<Association>, AssociationReader)>
    where
        F: ?Sized + TransportFactory,
    {
        self.validate()?;
        let transport = factory.connect(host, port).context(ConnectSnafu)?;
        self.negotiate(transport)
    }

    /// Request a new DICOM association over an already connected transport.
    pub fn establish_with(
        self,
        transport: Box<dyn Transport>,
    ) -> Result<(Arc<Association>, AssociationReader)> {
        self.validate()?;
        self.negotiate(transport)
    }

    fn validate(&self) -> Result<()> {
        // presentation contexts represent intent and cannot be omitted
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            self.presentation_contexts.len() <= 128,
            TooManyPresentationContextsSnafu {
                count: self.presentation_contexts.len()
            }
        );
        ensure!(
            (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );
        Ok(())
    }

    fn negotiate(
        self,
        mut transport: Box<dyn Transport>,
    ) -> Result<(Arc<Association>, AssociationReader)> {
        let listeners = self.listeners.clone();
        notify_listeners(
            &listeners,
            &StateTransition {
                from: AssociationState::Idle,
                to: AssociationState::Requesting,
                reason: None,
            },
        );

        match self.negotiate_impl(&mut transport) {
            Ok((negotiated, behavior)) => {
                let (association, reader) =
                    Association::open(transport, negotiated, behavior, listeners.clone())
                        .context(ConnectSnafu)?;
                notify_listeners(
                    &listeners,
                    &StateTransition {
                        from: AssociationState::Requesting,
                        to: AssociationState::Open,
                        reason: None,
                    },
                );
                Ok((association, reader))
            }
            Err(e) => {
                let _ = transport.shutdown();
                notify_listeners(
                    &listeners,
                    &StateTransition {
                        from: AssociationState::Requesting,
                        to: AssociationState::Closed,
                        reason: Some(CloseReason::NegotiationFailed(e.to_string())),
                    },
                );
                Err(e)
            }
        }
    }

    fn negotiate_impl(&self, transport: &mut Box<dyn Transport>) -> Result<(Negotiated, Behavior)> {
        let proposed: Vec<PresentationContextProposed> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                // presentation context IDs are odd
                id: (i * 2 + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.extend(self.extended_negotiation.iter().map(|(uid, info)| {
            UserVariableItem::SopClassExtendedNegotiation(uid.to_string(), info.clone())
        }));
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentity(identity.clone()));
        }

        let request = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables,
        });

        let mut buffer = Vec::with_capacity(self.max_pdu_length as usize);
        write_pdu(&mut buffer, &request).context(SendRequestSnafu)?;
        transport.write_all(&buffer).context(WireSendSnafu)?;
        transport.flush().context(WireSendSnafu)?;
        debug!("Sent {}", request.short_description());

        transport
            .set_read_timeout(Some(self.accept_timeout))
            .context(ConnectSnafu)?;
        let response = match read_pdu(transport, MAXIMUM_PDU_SIZE, self.strict) {
            Ok(pdu) => pdu,
            Err(e) if e.is_timeout() => {
                send_abort(transport);
                return TimeoutSnafu {
                    timeout: self.accept_timeout,
                }
                .fail();
            }
            Err(e) => return Err(e).context(ReceiveResponseSnafu),
        };
        transport.set_read_timeout(None).context(ConnectSnafu)?;
        debug!("Received {}", response.short_description());

        match response {
            Pdu::AssociationAC(AssociationAC {
                protocol_version,
                calling_ae_title: _,
                called_ae_title,
                application_context_name: _,
                presentation_contexts,
                user_variables,
            }) => {
                if protocol_version != self.protocol_version {
                    send_abort(transport);
                    return ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: protocol_version,
                    }
                    .fail();
                }

                let presentation_contexts: Vec<_> = presentation_contexts
                    .into_iter()
                    .filter_map(|result| {
                        let Some(proposed) = proposed.iter().find(|pc| pc.id == result.id) else {
                            warn!("Peer answered unknown presentation context {}", result.id);
                            return None;
                        };
                        let mut reason = result.reason;
                        if reason == PresentationContextResultReason::Acceptance
                            && !proposed.transfer_syntaxes.contains(&result.transfer_syntax)
                        {
                            warn!(
                                "Presentation context {} accepted under unproposed transfer syntax {}, treating as not accepted",
                                result.id, result.transfer_syntax
                            );
                            reason = PresentationContextResultReason::TransferSyntaxesNotSupported;
                        }
                        Some(PresentationContextNegotiated {
                            id: result.id,
                            reason,
                            abstract_syntax: proposed.abstract_syntax.clone(),
                            transfer_syntax: result.transfer_syntax,
                        })
                    })
                    .collect();

                if !presentation_contexts.iter().any(|pc| pc.is_accepted()) {
                    send_abort(transport);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                // a maximum length of 0 means unlimited
                let peer_max_pdu_length = match max_length_of(&user_variables) {
                    Some(0) => MAXIMUM_PDU_SIZE,
                    Some(len) => len,
                    None => DEFAULT_MAX_PDU,
                };

                let mut extended_negotiation = HashMap::new();
                let mut peer_implementation_class_uid = None;
                let mut peer_implementation_version_name = None;
                for item in user_variables {
                    match item {
                        UserVariableItem::SopClassExtendedNegotiation(uid, info) => {
                            extended_negotiation.insert(uid, info);
                        }
                        UserVariableItem::ImplementationClassUid(uid) => {
                            peer_implementation_class_uid = Some(uid)
                        }
                        UserVariableItem::ImplementationVersionName(name) => {
                            peer_implementation_version_name = Some(name)
                        }
                        _ => {}
                    }
                }

                let negotiated = Negotiated {
                    local_ae_title: self.calling_ae_title.to_string(),
                    peer_ae_title: if called_ae_title.is_empty() {
                        self.called_ae_title.to_string()
                    } else {
                        called_ae_title
                    },
                    presentation_contexts,
                    extended_negotiation,
                    local_max_pdu_length: self.max_pdu_length,
                    peer_max_pdu_length,
                    peer_implementation_class_uid,
                    peer_implementation_version_name,
                };
                let behavior = Behavior {
                    strict: self.strict,
                    pack_pdvs: self.pack_pdvs,
                    release_timeout: self.release_timeout,
                    max_message_length: self.max_message_length,
                };
                Ok((negotiated, behavior))
            }
            Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
            pdu => {
                send_abort(transport);
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

fn owned_uid(uid: Cow<'_, str>) -> Cow<'static, str> {
    Cow::Owned(trim_uid(&uid))
}

/// Send an A-ABORT PDU, ignoring failures.
fn send_abort(transport: &mut Box<dyn Transport>) {
    let mut buffer = Vec::new();
    if write_pdu(
        &mut buffer,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        },
    )
    .is_ok()
    {
        let _ = transport.write_all(&buffer);
    }
}
