//! DIMSE message exchange over an open association.
//!
//! A [`DimseAssociation`] owns the receiving half of an association
//! and runs two threads:
//! - the receive thread routes responses
//!   to the [`PendingInvocation`] of the request they answer,
//!   in arrival order;
//! - the service thread hands incoming requests to the [`ServiceRegistry`],
//!   one at a time.
//!
//! Requests are sent with [`DimseAssociation::invoke`],
//! which does not wait for the responses.
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dicom_dictionary_std::uids;
use dicom_object::InMemDicomObject;
use dicomnet_ul::pdu::{AbortRQSource, PDataValueType};
use dicomnet_ul::{
    Association, AssociationReader, AssociationState, CloseReason, IncomingMessage,
    ReleaseOutcome, StateTransition,
};
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, error, warn};

use crate::command::{Command, CommandField};
use crate::dispatch::ServiceRegistry;
use crate::message::{write_data_set, DataSetError, DimseMessage, DimseResponse};
use crate::status::Status;

/// Why a pending invocation ended without a final response.
///
/// The same condition is delivered to every invocation
/// pending when the association closed.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
#[non_exhaustive]
pub enum InvocationError {
    /// the association was aborted
    Aborted,
    /// the association was released before the final response
    Released,
    #[snafu(display("transport failure: {}", message))]
    TransportFailure { message: String },
    /// no final response arrived in time
    TimedOut,
}

impl InvocationError {
    fn from_close_reason(reason: Option<CloseReason>) -> Self {
        match reason {
            Some(CloseReason::Aborted(_)) => InvocationError::Aborted,
            Some(CloseReason::Released) => InvocationError::Released,
            Some(CloseReason::TransportFailure(message)) => {
                InvocationError::TransportFailure { message }
            }
            Some(CloseReason::NegotiationFailed(message)) => {
                InvocationError::TransportFailure { message }
            }
            None => InvocationError::TransportFailure {
                message: "association closed".to_string(),
            },
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not send the message
    Send {
        #[snafu(backtrace)]
        source: dicomnet_ul::association::Error,
    },
    /// could not encode the command set
    EncodeCommand {
        #[snafu(backtrace)]
        source: crate::command::Error,
    },
    /// could not encode the data set
    EncodeDataSet {
        #[snafu(backtrace)]
        source: DataSetError,
    },
    #[snafu(display("association closed: {}", source))]
    Closed {
        source: InvocationError,
        backtrace: Backtrace,
    },
    /// the operation did not complete
    Invocation { source: InvocationError },
    #[snafu(display("no accepted presentation context for {}", abstract_syntax))]
    NoPresentationContext {
        abstract_syntax: String,
        backtrace: Backtrace,
    },
    /// every message ID is in use
    NoFreeMessageId { backtrace: Backtrace },
    /// could not start a message exchange thread
    SpawnThread {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Receives every response of one invocation as it arrives.
///
/// Listeners run on the receive thread of the association,
/// so a slow listener stalls every other exchange on it.
pub trait ResponseListener: Send + Sync {
    fn on_response(&self, response: &DimseResponse);
}

impl<F> ResponseListener for F
where
    F: Fn(&DimseResponse) + Send + Sync,
{
    fn on_response(&self, response: &DimseResponse) {
        self(response)
    }
}

/// Options of the message exchange layer.
#[derive(Debug, Default, Clone)]
pub struct DimseOptions {
    response_timeout: Option<Duration>,
}

impl DimseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default time [`PendingInvocation::get`] waits for the final response.
    /// Waits forever if not set.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct SlotState {
    pending: Vec<DimseResponse>,
    outcome: Option<Result<DimseResponse, InvocationError>>,
}

/// Completion slot of one invocation.
struct Slot {
    state: Mutex<SlotState>,
    fulfilled: Condvar,
    listener: Option<Arc<dyn ResponseListener>>,
}

impl Slot {
    fn new(listener: Option<Arc<dyn ResponseListener>>) -> Self {
        Slot {
            state: Mutex::new(SlotState::default()),
            fulfilled: Condvar::new(),
            listener,
        }
    }

    fn push_pending(&self, response: DimseResponse) {
        lock(&self.state).pending.push(response);
    }

    /// Set the outcome, unless one was set before.
    fn fulfill(&self, outcome: Result<DimseResponse, InvocationError>) -> bool {
        let mut state = lock(&self.state);
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.fulfilled.notify_all();
        true
    }
}

#[derive(Default)]
struct PendingTable {
    next_id: u16,
    entries: HashMap<u16, Arc<Slot>>,
    /// set once the association closed, failing later invocations
    closed: Option<InvocationError>,
}

impl PendingTable {
    /// Allocate the next odd message ID not in use.
    fn allocate(&mut self) -> Option<u16> {
        if self.next_id % 2 == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        for _ in 0..=u16::MAX / 2 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(2);
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }
}

type IncomingRequest = (DimseMessage, Arc<AtomicBool>);

struct Shared {
    association: Arc<Association>,
    table: Mutex<PendingTable>,
    /// cancellation flags of the requests queued or being handled, by message ID
    in_progress: Mutex<HashMap<u16, Arc<AtomicBool>>>,
    options: DimseOptions,
}

impl Shared {
    fn remove(&self, message_id: u16) -> Option<Arc<Slot>> {
        lock(&self.table).entries.remove(&message_id)
    }

    /// Remove the slot of an invocation whose waiter gave up,
    /// unless a response fulfilled it meanwhile.
    fn expire(&self, message_id: u16, slot: &Arc<Slot>) {
        let mut table = lock(&self.table);
        if let Some(current) = table.entries.get(&message_id) {
            if Arc::ptr_eq(current, slot) {
                table.entries.remove(&message_id);
            }
        }
        drop(table);
        if slot.fulfill(Err(InvocationError::TimedOut)) {
            debug!("Invocation {} timed out", message_id);
        }
    }

    /// Fail every pending invocation and refuse new ones.
    fn fail_all(&self, error: InvocationError) {
        let (error, slots) = {
            let mut table = lock(&self.table);
            let error = table.closed.get_or_insert(error).clone();
            let slots: Vec<_> = table.entries.drain().collect();
            (error, slots)
        };
        if !slots.is_empty() {
            debug!(
                "Failing {} pending invocation(s): {}",
                slots.len(),
                error
            );
        }
        for (_, slot) in slots {
            slot.fulfill(Err(error.clone()));
        }
    }

    fn route_response(&self, response: DimseResponse) {
        let Some(message_id) = response.command.message_id_being_responded_to else {
            warn!("Dropping response without Message ID Being Responded To");
            return;
        };
        let terminal = response.status().is_terminal();
        let slot = {
            let mut table = lock(&self.table);
            if terminal {
                table.entries.remove(&message_id)
            } else {
                table.entries.get(&message_id).cloned()
            }
        };
        let Some(slot) = slot else {
            warn!(
                "Dropping {:?} to message {}: no such pending invocation",
                response.command.command_field, message_id
            );
            return;
        };

        if let Some(listener) = &slot.listener {
            listener.on_response(&response);
        }
        if terminal {
            slot.fulfill(Ok(response));
        } else {
            slot.push_pending(response);
        }
    }
}

/// Fails the pending invocations as soon as the association closes.
struct CloseWatcher {
    shared: Weak<Shared>,
}

impl dicomnet_ul::AssociationListener for CloseWatcher {
    fn on_transition(&self, transition: &StateTransition) {
        if transition.to != AssociationState::Closed {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.fail_all(InvocationError::from_close_reason(
                transition.reason.clone(),
            ));
        }
    }
}

/// An outstanding request, waiting for its final response.
pub struct PendingInvocation {
    message_id: u16,
    presentation_context_id: u8,
    slot: Arc<Slot>,
    shared: Arc<Shared>,
}

impl fmt::Debug for PendingInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingInvocation")
            .field("message_id", &self.message_id)
            .field("presentation_context_id", &self.presentation_context_id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl PendingInvocation {
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn presentation_context_id(&self) -> u8 {
        self.presentation_context_id
    }

    /// Whether the final response arrived or the invocation failed.
    pub fn is_done(&self) -> bool {
        lock(&self.slot.state).outcome.is_some()
    }

    /// Wait for the final response,
    /// up to the response timeout of the [`DimseOptions`].
    pub fn get(&self) -> Result<DimseResponse, InvocationError> {
        match self.shared.options.response_timeout {
            Some(timeout) => self.get_timeout(timeout),
            None => {
                let mut state = lock(&self.slot.state);
                loop {
                    if let Some(outcome) = &state.outcome {
                        return outcome.clone();
                    }
                    state = self
                        .slot
                        .fulfilled
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    /// Wait for the final response up to the given time.
    ///
    /// On timeout the invocation fails with [`InvocationError::TimedOut`]
    /// and later responses to it are dropped.
    pub fn get_timeout(&self, timeout: Duration) -> Result<DimseResponse, InvocationError> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = lock(&self.slot.state);
            loop {
                if let Some(outcome) = &state.outcome {
                    return outcome.clone();
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = match self.slot.fulfilled.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(e) => e.into_inner().0,
                };
            }
        }
        self.shared.expire(self.message_id, &self.slot);
        lock(&self.slot.state)
            .outcome
            .clone()
            .unwrap_or(Err(InvocationError::TimedOut))
    }

    /// The final outcome, if already known.
    pub fn try_get(&self) -> Option<Result<DimseResponse, InvocationError>> {
        lock(&self.slot.state).outcome.clone()
    }

    /// The pending responses received so far, in arrival order.
    pub fn list_pending(&self) -> Vec<DimseResponse> {
        lock(&self.slot.state).pending.clone()
    }
}

/// DIMSE message exchange over an open association.
///
/// Serves both roles at once:
/// requests are sent with [`invoke`](Self::invoke),
/// incoming requests are handled by the bound [`ServiceRegistry`].
pub struct DimseAssociation {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl fmt::Debug for DimseAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimseAssociation")
            .field("association", &self.shared.association)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl DimseAssociation {
    /// Start exchanging messages over an open association.
    ///
    /// Spawns the receive thread, which owns the reader
    /// until the association closes,
    /// and the service thread running the handlers of the registry.
    pub fn new(
        reader: AssociationReader,
        registry: Arc<ServiceRegistry>,
        options: DimseOptions,
    ) -> Result<Self> {
        let association = Arc::clone(reader.association());
        let shared = Arc::new(Shared {
            association: Arc::clone(&association),
            table: Mutex::new(PendingTable {
                next_id: 1,
                ..Default::default()
            }),
            in_progress: Mutex::new(HashMap::new()),
            options,
        });

        association.add_listener(Arc::new(CloseWatcher {
            shared: Arc::downgrade(&shared),
        }));
        if association.state() == AssociationState::Closed {
            shared.fail_all(InvocationError::from_close_reason(
                association.close_reason(),
            ));
        }

        let (requests, queue) = mpsc::channel();
        let service_shared = Arc::clone(&shared);
        let service = std::thread::Builder::new()
            .name(format!("dimse-service-{}", association.peer_ae_title()))
            .spawn(move || service_loop(service_shared, queue, registry))
            .context(SpawnThreadSnafu)?;

        let receiver_shared = Arc::clone(&shared);
        let receiver = std::thread::Builder::new()
            .name(format!("dimse-{}", association.peer_ae_title()))
            .spawn(move || receive_loop(receiver_shared, reader, requests))
            .context(SpawnThreadSnafu)?;

        Ok(DimseAssociation {
            shared,
            threads: vec![receiver, service],
        })
    }

    pub fn association(&self) -> &Arc<Association> {
        &self.shared.association
    }

    /// Number of invocations waiting for their final response.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.table).entries.len()
    }

    /// Send a request, returning right away.
    ///
    /// A fresh odd message ID is assigned to the command.
    /// The data set must be encoded in the transfer syntax
    /// accepted for the presentation context.
    /// Every response is passed to `listener` as it arrives.
    pub fn invoke(
        &self,
        presentation_context_id: u8,
        command: Command,
        data: Option<&[u8]>,
        listener: Option<Arc<dyn ResponseListener>>,
    ) -> Result<PendingInvocation> {
        let association = &self.shared.association;
        association
            .require_context(presentation_context_id, None)
            .context(SendSnafu)?;

        let slot = Arc::new(Slot::new(listener));
        let message_id = {
            let mut table = lock(&self.shared.table);
            if let Some(error) = &table.closed {
                return Err(error.clone()).context(ClosedSnafu);
            }
            let message_id = table.allocate().context(NoFreeMessageIdSnafu)?;
            // registered before sending, the response may come back right away
            table.entries.insert(message_id, Arc::clone(&slot));
            message_id
        };

        let command = command
            .with_message_id(message_id)
            .with_data_set(data.is_some());
        let sent = command
            .encode()
            .context(EncodeCommandSnafu)
            .and_then(|bytes| {
                association
                    .send_message(presentation_context_id, &bytes, data)
                    .context(SendSnafu)
            });
        if let Err(e) = sent {
            self.shared.remove(message_id);
            return Err(e);
        }
        debug!(
            "Invoked {:?} as message {} on context {}",
            command.command_field, message_id, presentation_context_id
        );

        Ok(PendingInvocation {
            message_id,
            presentation_context_id,
            slot,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Send a request with a data set,
    /// encoded in the transfer syntax accepted for the presentation context.
    pub fn invoke_with_object(
        &self,
        presentation_context_id: u8,
        command: Command,
        data_set: &InMemDicomObject,
        listener: Option<Arc<dyn ResponseListener>>,
    ) -> Result<PendingInvocation> {
        let transfer_syntax = self
            .shared
            .association
            .require_context(presentation_context_id, None)
            .context(SendSnafu)?
            .transfer_syntax
            .clone();
        let data = write_data_set(data_set, &transfer_syntax).context(EncodeDataSetSnafu)?;
        self.invoke(presentation_context_id, command, Some(&data), listener)
    }

    /// Ask the peer to cancel a pending C-FIND, C-GET or C-MOVE.
    ///
    /// The invocation stays pending:
    /// the peer still ends it with a final response, usually with a cancel status.
    /// Returns `false` if the invocation was already done.
    pub fn cancel(&self, invocation: &PendingInvocation) -> Result<bool> {
        if invocation.is_done() {
            return Ok(false);
        }
        let bytes = Command::c_cancel_rq(invocation.message_id)
            .encode()
            .context(EncodeCommandSnafu)?;
        self.shared
            .association
            .send_message(invocation.presentation_context_id, &bytes, None)
            .context(SendSnafu)?;
        debug!("Requested cancellation of message {}", invocation.message_id);
        Ok(true)
    }

    /// Verify the peer with a C-ECHO.
    pub fn echo(&self) -> Result<Status> {
        let pc = self
            .shared
            .association
            .context_for_abstract_syntax(uids::VERIFICATION)
            .context(NoPresentationContextSnafu {
                abstract_syntax: uids::VERIFICATION,
            })?
            .id;
        let invocation = self.invoke(pc, Command::c_echo_rq(uids::VERIFICATION), None, None)?;
        let response = invocation.get().context(InvocationSnafu)?;
        Ok(response.status())
    }

    /// Release the association, waiting for the peer's reply.
    ///
    /// Invocations still pending fail with [`InvocationError::Released`].
    pub fn release(&self) -> Result<ReleaseOutcome> {
        self.shared.association.release(true).context(SendSnafu)
    }

    /// Abort the association.
    ///
    /// Invocations still pending fail with [`InvocationError::Aborted`].
    pub fn abort(&self) {
        self.shared.association.abort(AbortRQSource::ServiceUser);
        self.shared.fail_all(InvocationError::Aborted);
    }

    /// Wait for the message exchange threads to finish,
    /// which happens once the association is closed
    /// and the last incoming request was handled.
    pub fn join(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                error!("DIMSE thread panicked");
            }
        }
    }
}

fn service_loop(shared: Arc<Shared>, queue: Receiver<IncomingRequest>, registry: Arc<ServiceRegistry>) {
    for (request, canceled) in queue {
        registry.dispatch(&shared.association, &request, &canceled);
        if let Some(message_id) = request.command.message_id {
            let mut in_progress = lock(&shared.in_progress);
            if in_progress
                .get(&message_id)
                .map_or(false, |flag| Arc::ptr_eq(flag, &canceled))
            {
                in_progress.remove(&message_id);
            }
        }
    }
    debug!("DIMSE service thread finished");
}

fn receive_loop(shared: Arc<Shared>, mut reader: AssociationReader, requests: Sender<IncomingRequest>) {
    let mut awaiting_data: Option<(u8, Command)> = None;
    loop {
        match reader.next_message() {
            Ok(Some(message)) => on_message(&shared, &requests, message, &mut awaiting_data),
            Ok(None) => break,
            Err(e) => {
                error!("DIMSE receive failure: {}", e);
                shared.fail_all(InvocationError::TransportFailure {
                    message: e.to_string(),
                });
                break;
            }
        }
    }
    shared.fail_all(InvocationError::from_close_reason(
        shared.association.close_reason(),
    ));
    debug!("DIMSE receive thread finished");
}

fn on_message(
    shared: &Shared,
    requests: &Sender<IncomingRequest>,
    message: IncomingMessage,
    awaiting_data: &mut Option<(u8, Command)>,
) {
    let IncomingMessage {
        presentation_context_id,
        value_type,
        data,
    } = message;

    match value_type {
        PDataValueType::Command => {
            if let Some((pc, command)) = awaiting_data.take() {
                warn!(
                    "{:?} on context {} ended without its data set",
                    command.command_field, pc
                );
            }
            match Command::decode(&data) {
                Ok(command) if command.has_data_set => {
                    *awaiting_data = Some((presentation_context_id, command));
                }
                Ok(command) => deliver(shared, requests, presentation_context_id, command, None),
                Err(e) => warn!("Dropping undecodable command set: {}", e),
            }
        }
        PDataValueType::Data => match awaiting_data.take() {
            Some((pc, command)) if pc == presentation_context_id => {
                deliver(shared, requests, pc, command, Some(data))
            }
            other => {
                warn!(
                    "Dropping data set on context {} with no command",
                    presentation_context_id
                );
                *awaiting_data = other;
            }
        },
    }
}

fn deliver(
    shared: &Shared,
    requests: &Sender<IncomingRequest>,
    presentation_context_id: u8,
    command: Command,
    data: Option<Vec<u8>>,
) {
    let transfer_syntax = shared
        .association
        .accepted_transfer_syntax(presentation_context_id)
        .unwrap_or(uids::IMPLICIT_VR_LITTLE_ENDIAN)
        .to_string();
    let message = DimseMessage {
        presentation_context_id,
        transfer_syntax,
        command,
        data,
    };

    if message.command.is_response() {
        shared.route_response(message);
    } else if message.command.command_field == CommandField::C_CANCEL_RQ {
        let target = message.command.message_id_being_responded_to;
        let flag = target.and_then(|id| lock(&shared.in_progress).get(&id).cloned());
        match flag {
            Some(flag) => {
                debug!("C-CANCEL for message {:?}", target);
                flag.store(true, Ordering::Release);
            }
            None => debug!("C-CANCEL for message {:?} with no operation in progress", target),
        }
    } else {
        let canceled = Arc::new(AtomicBool::new(false));
        if let Some(message_id) = message.command.message_id {
            lock(&shared.in_progress).insert(message_id, Arc::clone(&canceled));
        }
        if requests.send((message, canceled)).is_err() {
            warn!("Dropping request: service thread is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_odd_and_unique() {
        let mut table = PendingTable {
            next_id: 1,
            ..Default::default()
        };
        let a = table.allocate().unwrap();
        table.entries.insert(a, Arc::new(Slot::new(None)));
        let b = table.allocate().unwrap();
        assert_eq!((a, b), (1, 3));

        // wrap around, skipping IDs still in use
        table.next_id = u16::MAX;
        table.entries.insert(u16::MAX, Arc::new(Slot::new(None)));
        let c = table.allocate().unwrap();
        assert_eq!(c, 3);
        assert!(c % 2 == 1);
    }

    #[test]
    fn slots_are_fulfilled_once() {
        let slot = Slot::new(None);
        assert!(slot.fulfill(Err(InvocationError::Aborted)));
        assert!(!slot.fulfill(Err(InvocationError::Released)));
        assert_eq!(
            lock(&slot.state).outcome,
            Some(Err(InvocationError::Aborted))
        );
    }

    #[test]
    fn close_reasons_map_to_invocation_errors() {
        assert_eq!(
            InvocationError::from_close_reason(Some(CloseReason::Aborted(
                AbortRQSource::ServiceUser
            ))),
            InvocationError::Aborted
        );
        assert_eq!(
            InvocationError::from_close_reason(Some(CloseReason::Released)),
            InvocationError::Released
        );
        assert_eq!(
            InvocationError::from_close_reason(Some(CloseReason::TransportFailure(
                "reset".into()
            ))),
            InvocationError::TransportFailure {
                message: "reset".into()
            }
        );
    }
}
