//! DICOM association module
//!
//! This module contains the association state machine,
//! which negotiates a logical connection between two DICOM nodes
//! and exposes send and receive primitives once established.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! As an association acceptor, usually taking the role of
//! a service class provider (SCP), a freshly accepted [transport][2]
//! can be passed to a previously prepared [`ServerAssociationOptions`][3].
//!
//! Either way, negotiation yields two halves:
//! an [`Association`] handle, shared between threads,
//! for sending messages, releasing and aborting;
//! and an [`AssociationReader`], owned by a single receiving thread,
//! which reassembles incoming messages
//! and reacts to release and abort requests from the peer.
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: crate::transport::Transport
//! [3]: crate::association::server::ServerAssociationOptions
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, PDataValue,
    PDataValueType, Pdu, PresentationContextNegotiated, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::transport::Transport;

pub mod client;
pub mod pdata;
pub mod server;

pub use client::{ClientAssociationOptions, NegotiationError};
pub use pdata::{IncomingMessage, MessageAssembler, PDataWriter, DEFAULT_MAX_MESSAGE_LENGTH};
pub use server::{AcceptAny, AcceptCalledAeTitle, AccessControl, ServerAssociationOptions};

use pdata::max_pdv_payload;

/// Time allowed to write the A-ABORT PDU before closing anyway.
const ABORT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the presentation context was not accepted by the peer,
    /// or not under the expected transfer syntax
    #[snafu(display(
        "presentation context {} not accepted{}",
        presentation_context_id,
        detail
    ))]
    ContextNotAccepted {
        presentation_context_id: u8,
        detail: String,
        backtrace: Backtrace,
    },

    #[snafu(display("association is not open (state: {})", state))]
    NotOpen {
        state: AssociationState,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to encode PDU"))]
    SendPdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    #[snafu(display("failed to send data to the peer"))]
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the peer (maximum is {})",
        length,
        max_pdu_length
    ))]
    SendTooLongPdu {
        length: usize,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to receive PDU"))]
    ReceivePdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("connection closed by the peer without release or abort"))]
    ConnectionClosed { backtrace: Backtrace },

    #[snafu(display("unexpected PDU from the peer: {}", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu>, backtrace: Backtrace },

    #[snafu(display("malformed P-Data fragment sequence"))]
    Fragments {
        #[snafu(backtrace)]
        source: pdata::AssembleError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The life cycle states of an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssociationState {
    /// nothing was sent yet
    Idle,
    /// the association request was sent, waiting for a reply
    Requesting,
    /// negotiated and ready for message exchange
    Open,
    /// a release request was sent or received
    Releasing,
    /// an abort is being sent
    Aborting,
    /// terminal state, the association cannot be reused
    Closed,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Idle => "idle",
            AssociationState::Requesting => "requesting",
            AssociationState::Open => "open",
            AssociationState::Releasing => "releasing",
            AssociationState::Aborting => "aborting",
            AssociationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why an association reached the closed state.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum CloseReason {
    /// orderly release, initiated by either side
    Released,
    /// abort, initiated by either side
    Aborted(AbortRQSource),
    /// negotiation did not succeed
    NegotiationFailed(String),
    /// the underlying transport failed
    TransportFailure(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Released => f.write_str("released"),
            CloseReason::Aborted(source) => write!(f, "aborted by {}", source),
            CloseReason::NegotiationFailed(msg) => write!(f, "negotiation failed: {}", msg),
            CloseReason::TransportFailure(msg) => write!(f, "transport failure: {}", msg),
        }
    }
}

/// A change of association state, as seen by listeners.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StateTransition {
    pub from: AssociationState,
    pub to: AssociationState,
    /// set when `to` is [`AssociationState::Closed`]
    pub reason: Option<CloseReason>,
}

/// Observer of association state transitions.
///
/// Listeners are called synchronously on the thread causing the transition,
/// before the closed state is considered final.
/// They must not block, nor call back into the same association
/// waiting for it to change state.
pub trait AssociationListener: Send + Sync {
    fn on_transition(&self, transition: &StateTransition);
}

impl<F> AssociationListener for F
where
    F: Fn(&StateTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &StateTransition) {
        self(transition)
    }
}

/// Call each listener with the given transition.
pub(crate) fn notify_listeners(
    listeners: &[Arc<dyn AssociationListener>],
    transition: &StateTransition,
) {
    debug!(
        "Association state: {} -> {}{}",
        transition.from,
        transition.to,
        transition
            .reason
            .as_ref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default()
    );
    for listener in listeners {
        listener.on_transition(transition);
    }
}

/// The outcome of [`Association::release`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ReleaseOutcome {
    /// the peer acknowledged the release
    Acknowledged,
    /// the release request was sent without waiting for the reply
    NotAwaited,
    /// no reply arrived in time, the association was closed anyway
    TimedOut,
    /// the association was already closed, nothing was done
    AlreadyClosed,
}

/// Properties fixed at negotiation time.
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub local_ae_title: String,
    pub peer_ae_title: String,
    pub presentation_contexts: Vec<PresentationContextNegotiated>,
    pub extended_negotiation: HashMap<String, Vec<u8>>,
    /// maximum PDU length this node receives
    pub local_max_pdu_length: u32,
    /// maximum PDU length the peer receives
    pub peer_max_pdu_length: u32,
    pub peer_implementation_class_uid: Option<String>,
    pub peer_implementation_version_name: Option<String>,
}

/// Association behavior options shared by requesters and acceptors.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Behavior {
    pub strict: bool,
    pub pack_pdvs: bool,
    pub release_timeout: Duration,
    pub max_message_length: u64,
}

#[derive(Debug)]
struct StateData {
    state: AssociationState,
    close_reason: Option<CloseReason>,
    /// listeners were notified of the closed state
    finalized: bool,
}

/// An established association.
///
/// The handle is shared (`Arc`) between the threads
/// sending messages and the thread owning the [`AssociationReader`].
/// Messages are written whole under an internal lock,
/// so fragments of different messages never interleave.
pub struct Association {
    negotiated: Negotiated,
    behavior: Behavior,
    writer: Mutex<Box<dyn Transport>>,
    /// separate handle to shut down the connection
    /// while a write may be blocked
    control: Box<dyn Transport>,
    state: Mutex<StateData>,
    state_changed: Condvar,
    listeners: Mutex<Vec<Arc<dyn AssociationListener>>>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("local_ae_title", &self.negotiated.local_ae_title)
            .field("peer_ae_title", &self.negotiated.peer_ae_title)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Association {
    /// Build an open association and its reader
    /// over a freshly negotiated transport.
    pub(crate) fn open(
        transport: Box<dyn Transport>,
        negotiated: Negotiated,
        behavior: Behavior,
        listeners: Vec<Arc<dyn AssociationListener>>,
    ) -> std::io::Result<(Arc<Association>, AssociationReader)> {
        let read_half = transport.try_clone_transport()?;
        let control = transport.try_clone_transport()?;
        let local_max_pdu_length = negotiated.local_max_pdu_length;
        let association = Arc::new(Association {
            negotiated,
            behavior,
            writer: Mutex::new(transport),
            control,
            state: Mutex::new(StateData {
                state: AssociationState::Open,
                close_reason: None,
                finalized: false,
            }),
            state_changed: Condvar::new(),
            listeners: Mutex::new(listeners),
        });
        let reader = AssociationReader {
            association: Arc::clone(&association),
            transport: read_half,
            max_pdu_length: local_max_pdu_length,
            assembler: MessageAssembler::with_max_message_length(behavior.max_message_length),
        };
        Ok((association, reader))
    }

    /// The current state of the association.
    pub fn state(&self) -> AssociationState {
        lock(&self.state).state
    }

    /// Why the association closed, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.state).close_reason.clone()
    }

    /// Register a new state listener.
    pub fn add_listener(&self, listener: Arc<dyn AssociationListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn local_ae_title(&self) -> &str {
        &self.negotiated.local_ae_title
    }

    pub fn peer_ae_title(&self) -> &str {
        &self.negotiated.peer_ae_title
    }

    /// Every negotiated presentation context, accepted or not.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.negotiated.presentation_contexts
    }

    /// The accepted presentation context with the given ID.
    pub fn accepted_context(&self, presentation_context_id: u8) -> Option<&PresentationContextNegotiated> {
        self.negotiated
            .presentation_contexts
            .iter()
            .find(|pc| pc.id == presentation_context_id && pc.is_accepted())
    }

    /// The transfer syntax accepted for the given presentation context,
    /// or `None` if the context was not accepted.
    pub fn accepted_transfer_syntax(&self, presentation_context_id: u8) -> Option<&str> {
        self.accepted_context(presentation_context_id)
            .map(|pc| pc.transfer_syntax.as_str())
    }

    /// The abstract syntax of the given accepted presentation context.
    pub fn abstract_syntax(&self, presentation_context_id: u8) -> Option<&str> {
        self.accepted_context(presentation_context_id)
            .map(|pc| pc.abstract_syntax.as_str())
    }

    /// Find the first accepted presentation context for an abstract syntax.
    pub fn context_for_abstract_syntax(&self, abstract_syntax: &str) -> Option<&PresentationContextNegotiated> {
        self.negotiated
            .presentation_contexts
            .iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax)
    }

    /// Ensure that the presentation context was accepted,
    /// and under the given transfer syntax if one is specified.
    pub fn require_context(
        &self,
        presentation_context_id: u8,
        transfer_syntax: Option<&str>,
    ) -> Result<&PresentationContextNegotiated> {
        let pc = self
            .accepted_context(presentation_context_id)
            .context(ContextNotAcceptedSnafu {
                presentation_context_id,
                detail: String::new(),
            })?;
        if let Some(ts) = transfer_syntax {
            ensure!(
                pc.transfer_syntax == ts,
                ContextNotAcceptedSnafu {
                    presentation_context_id,
                    detail: format!(
                        " under transfer syntax {} (accepted {})",
                        ts, pc.transfer_syntax
                    ),
                }
            );
        }
        Ok(pc)
    }

    /// The extended negotiation information received from the peer
    /// for the given SOP class.
    pub fn extended_negotiation(&self, sop_class_uid: &str) -> Option<&[u8]> {
        self.negotiated
            .extended_negotiation
            .get(sop_class_uid)
            .map(|v| v.as_slice())
    }

    /// The maximum PDU length this node accepts.
    pub fn local_max_pdu_length(&self) -> u32 {
        self.negotiated.local_max_pdu_length
    }

    /// The maximum PDU length the peer accepts.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.negotiated.peer_max_pdu_length
    }

    pub fn peer_implementation_class_uid(&self) -> Option<&str> {
        self.negotiated.peer_implementation_class_uid.as_deref()
    }

    pub fn peer_implementation_version_name(&self) -> Option<&str> {
        self.negotiated.peer_implementation_version_name.as_deref()
    }

    /// Send a single PDU to the peer.
    ///
    /// P-Data may only be sent while the association is open.
    pub fn send_pdu(&self, pdu: &Pdu) -> Result<()> {
        let state = self.state();
        match pdu {
            Pdu::ReleaseRP | Pdu::AbortRQ { .. } => {}
            _ => ensure!(state == AssociationState::Open, NotOpenSnafu { state }),
        }

        let mut buffer = Vec::new();
        write_pdu(&mut buffer, pdu).context(SendPduSnafu)?;
        let max_pdu_length = self.negotiated.peer_max_pdu_length;
        let length = buffer.len() - PDU_HEADER_SIZE as usize;
        ensure!(
            length <= max_pdu_length as usize,
            SendTooLongPduSnafu {
                length,
                max_pdu_length
            }
        );
        debug!("Sending {}", pdu.short_description());

        let mut writer = lock(&self.writer);
        let out = writer.write_all(&buffer).and_then(|_| writer.flush());
        drop(writer);
        if let Err(e) = out {
            self.fail_transport(e.to_string());
            return Err(e).context(WireSendSnafu);
        }
        Ok(())
    }

    /// Send a complete DIMSE message:
    /// a command and optionally a data set,
    /// fragmented according to the peer's maximum PDU length.
    ///
    /// Fails fast if the presentation context was not accepted.
    pub fn send_message(
        &self,
        presentation_context_id: u8,
        command: &[u8],
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.require_context(presentation_context_id, None)?;
        let state = self.state();
        ensure!(state == AssociationState::Open, NotOpenSnafu { state });

        let max_pdu_length = self.negotiated.peer_max_pdu_length;
        let max_payload = max_pdv_payload(max_pdu_length) as usize;

        let mut writer = lock(&self.writer);
        let out = match data {
            Some(data)
                if self.behavior.pack_pdvs
                    && command.len() + data.len() + 12 <= max_pdu_length as usize =>
            {
                // command and data set share a single PDU
                let pdu = Pdu::PData {
                    data: vec![
                        PDataValue {
                            presentation_context_id,
                            value_type: PDataValueType::Command,
                            is_last: true,
                            data: command.to_vec(),
                        },
                        PDataValue {
                            presentation_context_id,
                            value_type: PDataValueType::Data,
                            is_last: true,
                            data: data.to_vec(),
                        },
                    ],
                };
                debug!("Sending {}", pdu.short_description());
                let mut buffer = Vec::with_capacity(max_pdu_length as usize);
                write_pdu(&mut buffer, &pdu).context(SendPduSnafu)?;
                writer.write_all(&buffer)
            }
            data => {
                debug!(
                    "Sending message on context {}: command of {} bytes, data set of {} bytes (fragments of {} bytes)",
                    presentation_context_id,
                    command.len(),
                    data.map(|d| d.len()).unwrap_or(0),
                    max_payload
                );
                write_fragments(
                    &mut **writer,
                    presentation_context_id,
                    PDataValueType::Command,
                    command,
                    max_pdu_length,
                )
                .and_then(|_| match data {
                    Some(data) => write_fragments(
                        &mut **writer,
                        presentation_context_id,
                        PDataValueType::Data,
                        data,
                        max_pdu_length,
                    ),
                    None => Ok(()),
                })
            }
        }
        .and_then(|_| writer.flush());
        drop(writer);

        if let Err(e) = out {
            self.fail_transport(e.to_string());
            return Err(e).context(WireSendSnafu);
        }
        Ok(())
    }

    /// Gracefully release the association.
    ///
    /// Sends a release request, then either closes right away
    /// or waits for the peer's reply (received by the [`AssociationReader`])
    /// up to the configured release timeout.
    /// Releasing a closed association does nothing
    /// and reports [`ReleaseOutcome::AlreadyClosed`].
    pub fn release(&self, wait_for_peer_ack: bool) -> Result<ReleaseOutcome> {
        let transition = {
            let mut state = lock(&self.state);
            match state.state {
                AssociationState::Closed => return Ok(ReleaseOutcome::AlreadyClosed),
                AssociationState::Open => {
                    state.state = AssociationState::Releasing;
                    Some(StateTransition {
                        from: AssociationState::Open,
                        to: AssociationState::Releasing,
                        reason: None,
                    })
                }
                // release or abort already in progress
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.notify(&transition);
            let mut buffer = Vec::new();
            write_pdu(&mut buffer, &Pdu::ReleaseRQ).context(SendPduSnafu)?;
            let mut writer = lock(&self.writer);
            let out = writer.write_all(&buffer).and_then(|_| writer.flush());
            drop(writer);
            if let Err(e) = out {
                self.fail_transport(e.to_string());
                return Err(e).context(WireSendSnafu);
            }
            debug!("Sent A-RELEASE-RQ");
        }

        if !wait_for_peer_ack {
            self.close(CloseReason::Released);
            return Ok(ReleaseOutcome::NotAwaited);
        }

        if self.wait_closed(self.behavior.release_timeout) {
            Ok(ReleaseOutcome::Acknowledged)
        } else {
            warn!(
                "No release reply within {:?}, closing association",
                self.behavior.release_timeout
            );
            self.close(CloseReason::Released);
            Ok(ReleaseOutcome::TimedOut)
        }
    }

    /// Abort the association.
    ///
    /// The A-ABORT PDU is sent on a best-effort basis,
    /// and the association is closed regardless of the outcome.
    /// If another thread is in the middle of writing a message,
    /// no A-ABORT is sent: the connection is shut down right away,
    /// failing that write.
    pub fn abort(&self, source: AbortRQSource) {
        let transition = {
            let mut state = lock(&self.state);
            match state.state {
                AssociationState::Closed | AssociationState::Aborting => None,
                from => {
                    state.state = AssociationState::Aborting;
                    Some(StateTransition {
                        from,
                        to: AssociationState::Aborting,
                        reason: None,
                    })
                }
            }
        };
        let Some(transition) = transition else {
            return;
        };
        self.notify(&transition);

        // a message write may be stuck on a peer which stopped reading:
        // then the A-ABORT is skipped and closing releases the writer
        let writer = match self.writer.try_lock() {
            Ok(writer) => Some(writer),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match writer {
            Some(mut writer) => {
                let mut buffer = Vec::new();
                if write_pdu(&mut buffer, &Pdu::AbortRQ { source }).is_ok() {
                    if let Err(e) = writer.set_write_timeout(Some(ABORT_WRITE_TIMEOUT)) {
                        debug!("Could not set write timeout: {}", e);
                    }
                    if let Err(e) = writer.write_all(&buffer).and_then(|_| writer.flush()) {
                        debug!("Could not send A-ABORT: {}", e);
                    }
                }
            }
            None => debug!("Writer busy, closing without sending A-ABORT"),
        }
        self.close(CloseReason::Aborted(source));
    }

    /// Close the association after a transport failure.
    pub fn fail_transport(&self, message: String) {
        warn!("Association transport failure: {}", message);
        self.close(CloseReason::TransportFailure(message));
    }

    /// Block until the association is closed
    /// and every listener saw it, up to the given timeout.
    /// Returns whether the association is closed.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while !state.finalized {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = match self.state_changed.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }

    /// Move to the given state if not closed yet,
    /// notifying listeners on change.
    pub(crate) fn transition_to(&self, to: AssociationState) {
        let transition = {
            let mut state = lock(&self.state);
            if state.state == AssociationState::Closed || state.state == to {
                return;
            }
            let from = std::mem::replace(&mut state.state, to);
            StateTransition {
                from,
                to,
                reason: None,
            }
        };
        self.notify(&transition);
    }

    /// Transition to the closed state, exactly once.
    pub(crate) fn close(&self, reason: CloseReason) {
        let transition = {
            let mut state = lock(&self.state);
            if state.state == AssociationState::Closed {
                return;
            }
            let from = std::mem::replace(&mut state.state, AssociationState::Closed);
            state.close_reason = Some(reason.clone());
            StateTransition {
                from,
                to: AssociationState::Closed,
                reason: Some(reason),
            }
        };

        self.notify(&transition);
        if let Err(e) = self.control.shutdown() {
            debug!("Could not shut down transport: {}", e);
        }

        lock(&self.state).finalized = true;
        self.state_changed.notify_all();
    }

    fn notify(&self, transition: &StateTransition) {
        // listeners run without holding any lock
        let listeners = lock(&self.listeners).clone();
        notify_listeners(&listeners, transition);
    }
}

/// Send a command or data set as P-Data fragments.
fn write_fragments(
    writer: &mut dyn Transport,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_pdu_length: u32,
) -> std::io::Result<()> {
    let mut pdata = PDataWriter::new(writer, presentation_context_id, value_type, max_pdu_length);
    pdata.write_all(bytes)?;
    pdata.finish()
}

/// The receiving half of an association.
///
/// Only one thread reads from an association.
/// Besides reassembling messages,
/// the reader answers release requests from the peer
/// and closes the association on release replies, aborts
/// and transport failures.
pub struct AssociationReader {
    association: Arc<Association>,
    transport: Box<dyn Transport>,
    max_pdu_length: u32,
    assembler: MessageAssembler,
}

impl fmt::Debug for AssociationReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationReader")
            .field("association", &self.association)
            .field("max_pdu_length", &self.max_pdu_length)
            .finish()
    }
}

impl AssociationReader {
    /// The association this reader belongs to.
    pub fn association(&self) -> &Arc<Association> {
        &self.association
    }

    /// Receive the next complete command or data set.
    ///
    /// Returns `Ok(None)` once the association is closed,
    /// be it by release or abort from either side.
    /// An error means that the association failed
    /// and is now closed.
    pub fn next_message(&mut self) -> Result<Option<IncomingMessage>> {
        loop {
            if let Some(message) = self.assembler.pop() {
                return Ok(Some(message));
            }
            if self.association.state() == AssociationState::Closed {
                return Ok(None);
            }

            let pdu = match self.receive_pdu() {
                Ok(pdu) => pdu,
                Err(_) if self.association.state() == AssociationState::Closed => {
                    // the connection was shut down locally
                    return Ok(None);
                }
                Err(e) => {
                    self.association.fail_transport(e.to_string());
                    return Err(e);
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        if let Err(e) = self.assembler.push(pdv) {
                            let reason = match e {
                                pdata::AssembleError::MessageTooLong { .. } => {
                                    AbortRQServiceProviderReason::InvalidPduParameter
                                }
                                _ => AbortRQServiceProviderReason::UnexpectedPdu,
                            };
                            warn!("Aborting association: {}", e);
                            self.association
                                .abort(AbortRQSource::ServiceProvider(reason));
                            return Err(e).context(FragmentsSnafu);
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    debug!("Release requested by the peer");
                    self.association.transition_to(AssociationState::Releasing);
                    if let Err(e) = self.association.send_pdu(&Pdu::ReleaseRP) {
                        debug!("Could not send A-RELEASE-RP: {}", e);
                    }
                    self.association.close(CloseReason::Released);
                    return Ok(None);
                }
                Pdu::ReleaseRP => {
                    if self.association.state() != AssociationState::Releasing {
                        warn!("Unsolicited A-RELEASE-RP, closing association");
                    }
                    self.association.close(CloseReason::Released);
                    return Ok(None);
                }
                Pdu::AbortRQ { source } => {
                    debug!("Association aborted by the peer: {}", source);
                    self.association.close(CloseReason::Aborted(source));
                    return Ok(None);
                }
                pdu => {
                    let reason = match pdu {
                        Pdu::Unknown { .. } => AbortRQServiceProviderReason::UnrecognizedPdu,
                        _ => AbortRQServiceProviderReason::UnexpectedPdu,
                    };
                    self.association
                        .abort(AbortRQSource::ServiceProvider(reason));
                    return UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail();
                }
            }
        }
    }

    fn receive_pdu(&mut self) -> Result<Pdu> {
        // lenient readers still cap at the absolute maximum
        let max_pdu_length = self.max_pdu_length.min(MAXIMUM_PDU_SIZE);
        match read_pdu(
            &mut self.transport,
            max_pdu_length,
            self.association.behavior.strict,
        ) {
            Ok(pdu) => {
                debug!("Received {}", pdu.short_description());
                Ok(pdu)
            }
            Err(crate::pdu::reader::Error::NoPduAvailable { .. }) => ConnectionClosedSnafu.fail(),
            Err(e) => Err(e).context(ReceivePduSnafu),
        }
    }
}

/// Trim trailing null characters and whitespace from a UID.
pub(crate) fn trim_uid(uid: &str) -> String {
    uid.trim_end_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
