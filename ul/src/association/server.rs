//! Association acceptor module
//!
//! The module provides the negotiation procedure
//! in which this application entity accepts incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to accept an association.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::association::{
    notify_listeners, trim_uid, Association, AssociationListener, AssociationReader,
    AssociationState, Behavior, CloseReason, Negotiated, StateTransition,
};
use crate::pdu::{
    max_length_of, read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource,
    AssociationAC, AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason,
    AssociationRJSource, AssociationRQ, Pdu, PresentationContextNegotiated,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU, DICOM_APPLICATION_CONTEXT_NAME, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE,
};
use crate::association::DEFAULT_MAX_MESSAGE_LENGTH;
use crate::transport::Transport;
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Why an incoming association request did not produce an open association.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum AcceptError {
    /// missing abstract syntax to accept associations
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// could not configure or clone the transport
    Transport {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("no association request within {:?}", timeout))]
    Timeout {
        timeout: Duration,
        backtrace: Backtrace,
    },

    /// failed to receive the association request
    ReceiveRequest {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to encode the association response
    SendResponse {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send the association response
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected: {}", association_rj))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected PDU from the peer: {}", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },
}

pub type Result<T, E = AcceptError> = std::result::Result<T, E>;

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns `Ok(())` if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAeTitleNotRecognized)
        }
    }
}

/// Check that the main transfer syntax registry
/// can parse and decode data sets in the given transfer syntax.
///
/// ```
/// # use dicomnet_ul::association::server::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// The outcome is an open [`Association`] and its [`AssociationReader`].
///
/// At least one abstract syntax must be specified,
/// using the method [`with_abstract_syntax`](Self::with_abstract_syntax),
/// unless promiscuous mode is enabled.
/// The transfer syntaxes accepted default to
/// every syntax supported by the transfer syntax registry.
///
/// ## Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicomnet_ul::association::server::ServerAssociationOptions;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// let (association, mut reader) = scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServerAssociationOptions<'a, A> {
    ae_access_control: A,
    ae_title: Cow<'a, str>,
    application_context_name: Cow<'a, str>,
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    extended_negotiation_replies: HashMap<String, Vec<u8>>,
    protocol_version: u16,
    max_pdu_length: u32,
    max_message_length: u64,
    strict: bool,
    promiscuous: bool,
    request_timeout: Option<Duration>,
    release_timeout: Duration,
    pack_pdvs: bool,
    listeners: Vec<Arc<dyn AssociationListener>>,
}

impl<A: std::fmt::Debug> std::fmt::Debug for ServerAssociationOptions<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerAssociationOptions")
            .field("ae_access_control", &self.ae_access_control)
            .field("ae_title", &self.ae_title)
            .field("abstract_syntax_uids", &self.abstract_syntax_uids)
            .field("transfer_syntax_uids", &self.transfer_syntax_uids)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("max_message_length", &self.max_message_length)
            .field("promiscuous", &self.promiscuous)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            extended_negotiation_replies: HashMap::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            strict: true,
            promiscuous: false,
            request_timeout: None,
            release_timeout: Duration::from_secs(10),
            pack_pdvs: false,
            listeners: Vec::new(),
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy to a custom one.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            extended_negotiation_replies,
            protocol_version,
            max_pdu_length,
            max_message_length,
            strict,
            promiscuous,
            request_timeout,
            release_timeout,
            pack_pdvs,
            listeners,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            extended_negotiation_replies,
            protocol_version,
            max_pdu_length,
            max_message_length,
            strict,
            promiscuous,
            request_timeout,
            release_timeout,
            pack_pdvs,
            listeners,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the list of abstract syntaxes accepted.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(Cow::Owned(trim_uid(&abstract_syntax_uid.into())));
        self
    }

    /// Include this transfer syntax in the list of transfer syntaxes accepted.
    ///
    /// Only registry-supported syntaxes are accepted when none is given.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(Cow::Owned(trim_uid(&transfer_syntax_uid.into())));
        self
    }

    /// Answer SOP class extended negotiation for the given SOP class
    /// with the given application information.
    ///
    /// Only requested SOP classes are answered.
    pub fn with_extended_negotiation_reply<T>(mut self, sop_class_uid: T, info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiation_replies
            .insert(trim_uid(&sop_class_uid.into()), info);
        self
    }

    /// Override the maximum expected PDU length.
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

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set how long to wait for the association request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
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

    /// Negotiate an association over the given transport,
    /// such as a freshly accepted TCP stream.
    pub fn establish<T>(&self, transport: T) -> Result<(Arc<Association>, AssociationReader)>
    where
        T: Transport + 'static,
    {
        self.establish_with(Box::new(transport))
    }

    /// Negotiate an association over the given boxed transport.
    pub fn establish_with(
        &self,
        mut transport: Box<dyn Transport>,
    ) -> Result<(Arc<Association>, AssociationReader)> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&self.max_pdu_length),
            InvalidMaxPduSnafu {
                max_pdu_length: self.max_pdu_length
            }
        );

        notify_listeners(
            &self.listeners,
            &StateTransition {
                from: AssociationState::Idle,
                to: AssociationState::Requesting,
                reason: None,
            },
        );

        match self.negotiate(&mut transport) {
            Ok(negotiated) => {
                let behavior = Behavior {
                    strict: self.strict,
                    pack_pdvs: self.pack_pdvs,
                    release_timeout: self.release_timeout,
                    max_message_length: self.max_message_length,
                };
                let (association, reader) =
                    Association::open(transport, negotiated, behavior, self.listeners.clone())
                        .context(TransportSnafu)?;
                notify_listeners(
                    &self.listeners,
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
                    &self.listeners,
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

    fn negotiate(&self, transport: &mut Box<dyn Transport>) -> Result<Negotiated> {
        transport
            .set_read_timeout(self.request_timeout)
            .context(TransportSnafu)?;
        let request = match read_pdu(transport, self.max_pdu_length, self.strict) {
            Ok(pdu) => pdu,
            Err(e) if e.is_timeout() => {
                return TimeoutSnafu {
                    timeout: self.request_timeout.unwrap_or_default(),
                }
                .fail()
            }
            Err(e) => return Err(e).context(ReceiveRequestSnafu),
        };
        transport.set_read_timeout(None).context(TransportSnafu)?;
        debug!("Received {}", request.short_description());

        match self.process_association_rq(request) {
            Ok((response, negotiated)) => {
                send_pdu(transport, &response)?;
                Ok(negotiated)
            }
            Err((response, err)) => {
                send_pdu(transport, &response)?;
                Err(err)
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn process_association_rq(
        &self,
        request: Pdu,
    ) -> std::result::Result<(Pdu, Negotiated), (Pdu, AcceptError)> {
        let AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } = match request {
            Pdu::AssociationRQ(rq) => rq,
            pdu => {
                let reason = match pdu {
                    Pdu::Unknown { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
                    _ => AbortRQServiceProviderReason::UnexpectedPdu,
                };
                return Err((
                    Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(reason),
                    },
                    UnexpectedPduSnafu { pdu: Box::new(pdu) }.build(),
                ));
            }
        };

        let reject = |source: AssociationRJSource| {
            let association_rj = AssociationRJ {
                result: AssociationRJResult::Permanent,
                source,
            };
            (
                Pdu::AssociationRJ(association_rj),
                RejectedSnafu { association_rj }.build(),
            )
        };

        // only bit 0 of the protocol version is tested
        if protocol_version & 0x0001 == 0 {
            return Err(reject(AssociationRJSource::ServiceProviderAcse(
                crate::pdu::AssociationRJServiceProviderAcseReason::ProtocolVersionNotSupported,
            )));
        }

        if application_context_name != self.application_context_name {
            return Err(reject(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )));
        }

        let user_identity = user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentity(identity) => Some(identity),
            _ => None,
        });
        if let Err(reason) = self.ae_access_control.check_access(
            &self.ae_title,
            &calling_ae_title,
            &called_ae_title,
            user_identity,
        ) {
            return Err(reject(AssociationRJSource::ServiceUser(reason)));
        }

        // a maximum length of 0 means unlimited
        let peer_max_pdu_length = match max_length_of(&user_variables) {
            Some(0) => MAXIMUM_PDU_SIZE,
            Some(len) => len,
            None => DEFAULT_MAX_PDU,
        };

        let presentation_contexts: Vec<_> = presentation_contexts
            .into_iter()
            .map(|pc| {
                let abstract_syntax = trim_uid(&pc.abstract_syntax);
                if !self.promiscuous
                    && !self
                        .abstract_syntax_uids
                        .iter()
                        .any(|uid| *uid == abstract_syntax)
                {
                    return PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                        abstract_syntax,
                        transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    };
                }

                match self.choose_ts(&pc.transfer_syntaxes) {
                    Some(ts) => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        abstract_syntax,
                        transfer_syntax: ts,
                    },
                    None => PresentationContextNegotiated {
                        id: pc.id,
                        reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                        abstract_syntax,
                        transfer_syntax: "1.2.840.10008.1.2".to_string(),
                    },
                }
            })
            .collect();

        let mut extended_negotiation = HashMap::new();
        let mut peer_implementation_class_uid = None;
        let mut peer_implementation_version_name = None;
        let mut reply_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        for item in user_variables {
            match item {
                UserVariableItem::SopClassExtendedNegotiation(uid, info) => {
                    if let Some(reply) = self.extended_negotiation_replies.get(&uid) {
                        reply_variables.push(UserVariableItem::SopClassExtendedNegotiation(
                            uid.clone(),
                            reply.clone(),
                        ));
                    }
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

        if !presentation_contexts.iter().any(|pc| pc.is_accepted()) {
            warn!(
                "No presentation context proposed by {} was accepted",
                calling_ae_title
            );
        }

        let response = Pdu::AssociationAC(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: calling_ae_title.clone(),
            called_ae_title,
            application_context_name,
            presentation_contexts: presentation_contexts
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason,
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            user_variables: reply_variables,
        });

        let negotiated = Negotiated {
            local_ae_title: self.ae_title.to_string(),
            peer_ae_title: calling_ae_title,
            presentation_contexts,
            extended_negotiation,
            local_max_pdu_length: self.max_pdu_length,
            peer_max_pdu_length,
            peer_implementation_class_uid,
            peer_implementation_version_name,
        };
        Ok((response, negotiated))
    }

    /// Choose the first proposed transfer syntax which is accepted.
    fn choose_ts(&self, proposed: &[String]) -> Option<String> {
        proposed
            .iter()
            .map(|ts| trim_uid(ts))
            .find(|ts| {
                if self.transfer_syntax_uids.is_empty() {
                    is_supported(ts)
                } else {
                    self.transfer_syntax_uids.iter().any(|uid| uid == ts)
                }
            })
    }
}

fn send_pdu(transport: &mut Box<dyn Transport>, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::new();
    write_pdu(&mut buffer, pdu).context(SendResponseSnafu)?;
    transport.write_all(&buffer).context(WireSendSnafu)?;
    transport.flush().context(WireSendSnafu)?;
    debug!("Sent {}", pdu.short_description());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(called_ae_title: &str, transfer_syntaxes: &[&str]) -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![
                crate::pdu::PresentationContextProposed {
                    id: 1,
                    abstract_syntax: "1.2.840.10008.1.1".to_string(),
                    transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
                },
                crate::pdu::PresentationContextProposed {
                    id: 3,
                    abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                    transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
                },
            ],
            user_variables: vec![
                UserVariableItem::MaxLength(0),
                UserVariableItem::SopClassExtendedNegotiation(
                    "1.2.840.10008.1.1".to_string(),
                    vec![1],
                ),
            ],
        })
    }

    #[test]
    fn evaluates_each_presentation_context() {
        let options = ServerAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_transfer_syntax("1.2.840.10008.1.2")
            .with_extended_negotiation_reply("1.2.840.10008.1.1", vec![0]);

        let (response, negotiated) = options
            .process_association_rq(request(
                "THIS-SCP",
                &["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
            ))
            .unwrap();

        assert_eq!(negotiated.peer_ae_title, "STORE-SCU");
        assert_eq!(negotiated.peer_max_pdu_length, MAXIMUM_PDU_SIZE);
        assert_eq!(negotiated.presentation_contexts.len(), 2);
        assert!(negotiated.presentation_contexts[0].is_accepted());
        assert_eq!(
            negotiated.presentation_contexts[0].transfer_syntax,
            "1.2.840.10008.1.2"
        );
        assert_eq!(
            negotiated.presentation_contexts[1].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
        assert_eq!(
            negotiated.extended_negotiation.get("1.2.840.10008.1.1"),
            Some(&vec![1])
        );

        match response {
            Pdu::AssociationAC(ac) => {
                assert!(ac.user_variables.contains(
                    &UserVariableItem::SopClassExtendedNegotiation(
                        "1.2.840.10008.1.1".to_string(),
                        vec![0]
                    )
                ));
            }
            pdu => panic!("unexpected response {:?}", pdu),
        }
    }

    #[test]
    fn rejects_unknown_called_ae_title() {
        let options = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title("THIS-SCP")
            .with_abstract_syntax("1.2.840.10008.1.1");

        let (response, err) = options
            .process_association_rq(request("OTHER-SCP", &["1.2.840.10008.1.2"]))
            .unwrap_err();

        assert!(matches!(err, AcceptError::Rejected { .. }));
        assert_eq!(
            response,
            Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAeTitleNotRecognized
                ),
            })
        );
    }

    #[test]
    fn unsupported_transfer_syntaxes_reject_the_context() {
        let options = ServerAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_transfer_syntax("1.2.840.10008.1.2.1");
        let (_, negotiated) = options
            .process_association_rq(request("THIS-SCP", &["1.2.840.10008.1.2"]))
            .unwrap();
        assert_eq!(
            negotiated.presentation_contexts[0].reason,
            PresentationContextResultReason::TransferSyntaxesNotSupported
        );
    }
}
