//! Service dispatch.
//!
//! Incoming requests are routed to a [`ServiceHandler`]
//! by the abstract syntax of the presentation context they arrived on.
//! Handlers are registered in a [`ServiceRegistry`].
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dicom_dictionary_std::uids;
use dicomnet_ul::Association;
use snafu::Snafu;
use tracing::{debug, error, warn};

use crate::command::{Command, CommandField, SubOperations};
use crate::message::DimseMessage;
use crate::status::Status;

/// A typed failure reported by a service handler.
///
/// The failure is turned into the status of the final response.
#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
#[non_exhaustive]
pub enum ServiceFailure {
    /// the handler does not implement this operation
    UnsupportedOperation,

    #[snafu(display("operation failed with status {}: {}", status, comment))]
    WithStatus { status: Status, comment: String },

    #[snafu(display("could not process the request: {}", message))]
    Processing { message: String },

    #[snafu(display("could not send a response: {}", message))]
    Transport { message: String },
}

impl ServiceFailure {
    /// Fail with a specific status code.
    pub fn with_status(status: Status, comment: impl Into<String>) -> Self {
        ServiceFailure::WithStatus {
            status,
            comment: comment.into(),
        }
    }

    /// The status code sent to the requester.
    pub fn status(&self) -> Status {
        match self {
            ServiceFailure::UnsupportedOperation => Status::UNRECOGNIZED_OPERATION,
            ServiceFailure::WithStatus { status, .. } => *status,
            ServiceFailure::Processing { .. } | ServiceFailure::Transport { .. } => {
                Status::PROCESSING_FAILURE
            }
        }
    }

    fn comment(&self) -> Option<String> {
        match self {
            ServiceFailure::UnsupportedOperation => None,
            ServiceFailure::WithStatus { comment, .. } if comment.is_empty() => None,
            ServiceFailure::WithStatus { comment, .. } => Some(comment.clone()),
            ServiceFailure::Processing { message } | ServiceFailure::Transport { message } => {
                Some(message.clone())
            }
        }
    }
}

/// The final outcome of a handled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: Status,
    /// encoded in the transfer syntax of the request's presentation context
    pub data: Option<Vec<u8>>,
    pub affected_sop_instance_uid: Option<String>,
    pub sub_operations: Option<SubOperations>,
}

impl ServiceResponse {
    pub fn new(status: Status) -> Self {
        ServiceResponse {
            status,
            data: None,
            affected_sop_instance_uid: None,
            sub_operations: None,
        }
    }

    pub fn success() -> Self {
        Self::new(Status::SUCCESS)
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_affected_sop_instance_uid(mut self, uid: impl Into<String>) -> Self {
        self.affected_sop_instance_uid = Some(uid.into());
        self
    }

    pub fn with_sub_operations(mut self, sub_operations: SubOperations) -> Self {
        self.sub_operations = Some(sub_operations);
        self
    }
}

pub type ServiceResult = Result<ServiceResponse, ServiceFailure>;

/// Sends intermediate responses while a request is being handled.
pub struct Responder<'a> {
    association: &'a Association,
    request: &'a DimseMessage,
    canceled: &'a AtomicBool,
    pending_sent: usize,
}

impl<'a> Responder<'a> {
    pub(crate) fn new(
        association: &'a Association,
        request: &'a DimseMessage,
        canceled: &'a AtomicBool,
    ) -> Self {
        Responder {
            association,
            request,
            canceled,
            pending_sent: 0,
        }
    }

    /// Whether the requester asked to cancel the operation with a C-CANCEL.
    ///
    /// A handler noticing this should stop
    /// and return a final response with [`Status::CANCEL`].
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Send a pending response, such as one C-FIND match.
    pub fn send_pending(
        &mut self,
        data: Option<Vec<u8>>,
        sub_operations: Option<SubOperations>,
    ) -> Result<(), ServiceFailure> {
        let mut response = ServiceResponse::new(Status::PENDING);
        response.data = data;
        response.sub_operations = sub_operations;
        send_response(self.association, self.request, &response, None).map_err(|e| {
            ServiceFailure::Transport {
                message: e.to_string(),
            }
        })?;
        self.pending_sent += 1;
        Ok(())
    }

    /// How many pending responses were sent so far.
    pub fn pending_sent(&self) -> usize {
        self.pending_sent
    }
}

/// A provider of one DIMSE service.
///
/// Each operation has a default implementation
/// failing with _unrecognized operation_,
/// so a handler only implements the operations of its service.
/// Handlers run on the service thread of the association,
/// one request at a time.
/// Responses to requests sent over the same association
/// keep being received while a handler runs.
#[allow(unused_variables)]
pub trait ServiceHandler: Send + Sync {
    fn c_echo(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn c_store(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    /// Matches are sent with [`Responder::send_pending`],
    /// the returned response is the final one.
    fn c_find(&self, request: &DimseMessage, responder: &mut Responder<'_>) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn c_get(&self, request: &DimseMessage, responder: &mut Responder<'_>) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn c_move(&self, request: &DimseMessage, responder: &mut Responder<'_>) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_event_report(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_get(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_set(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_action(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_create(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }

    fn n_delete(&self, request: &DimseMessage) -> ServiceResult {
        Err(ServiceFailure::UnsupportedOperation)
    }
}

/// The Verification service, answering C-ECHO requests with success.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VerificationService;

impl ServiceHandler for VerificationService {
    fn c_echo(&self, _request: &DimseMessage) -> ServiceResult {
        Ok(ServiceResponse::success())
    }
}

/// A mapping of abstract syntaxes to service handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ServiceHandler>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ServiceRegistry")
            .field("abstract_syntaxes", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the [`VerificationService`] already bound.
    pub fn with_verification() -> Self {
        let registry = Self::new();
        registry.bind(uids::VERIFICATION, Arc::new(VerificationService));
        registry
    }

    /// Bind a handler to an abstract syntax,
    /// replacing and returning any handler bound before.
    pub fn bind(
        &self,
        abstract_syntax_uid: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> Option<Arc<dyn ServiceHandler>> {
        let uid = abstract_syntax_uid.trim_end_matches('\0').to_string();
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uid, handler)
    }

    pub fn unbind(&self, abstract_syntax_uid: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(abstract_syntax_uid)
    }

    pub fn handler(&self, abstract_syntax_uid: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(abstract_syntax_uid)
            .cloned()
    }

    /// Handle an incoming request and send its final response.
    ///
    /// Requests on a context without a bound handler
    /// are answered with _SOP class not supported_.
    /// A panicking handler is answered with _processing failure_.
    pub(crate) fn dispatch(
        &self,
        association: &Association,
        request: &DimseMessage,
        canceled: &AtomicBool,
    ) {
        let field = request.command.command_field;
        if field == CommandField::C_CANCEL_RQ {
            debug!(
                "Ignoring C-CANCEL for message {:?}",
                request.command.message_id_being_responded_to
            );
            return;
        }

        let handler = association
            .abstract_syntax(request.presentation_context_id)
            .and_then(|uid| self.handler(uid));

        let result = match handler {
            None => {
                warn!(
                    "No service for {:?} on presentation context {}",
                    association.abstract_syntax(request.presentation_context_id),
                    request.presentation_context_id
                );
                Ok(ServiceResponse::new(Status::SOP_CLASS_NOT_SUPPORTED))
            }
            Some(handler) => {
                let mut responder = Responder::new(association, request, canceled);
                catch_unwind(AssertUnwindSafe(|| {
                    invoke_handler(&*handler, request, &mut responder)
                }))
                .unwrap_or_else(|panic| {
                    let message = panic_message(&*panic);
                    error!("Service handler panicked on {:?}: {}", field, message);
                    Err(ServiceFailure::Processing { message })
                })
            }
        };

        let (response, comment) = match result {
            Ok(response) => (response, None),
            Err(failure) => {
                debug!("Service failure on {:?}: {}", field, failure);
                (ServiceResponse::new(failure.status()), failure.comment())
            }
        };
        if let Err(e) = send_response(association, request, &response, comment) {
            warn!("Could not send response to {:?}: {}", field, e);
        }
    }
}

fn invoke_handler(
    handler: &dyn ServiceHandler,
    request: &DimseMessage,
    responder: &mut Responder<'_>,
) -> ServiceResult {
    match request.command.command_field {
        CommandField::C_ECHO_RQ => handler.c_echo(request),
        CommandField::C_STORE_RQ => handler.c_store(request),
        CommandField::C_FIND_RQ => handler.c_find(request, responder),
        CommandField::C_GET_RQ => handler.c_get(request, responder),
        CommandField::C_MOVE_RQ => handler.c_move(request, responder),
        CommandField::N_EVENT_REPORT_RQ => handler.n_event_report(request),
        CommandField::N_GET_RQ => handler.n_get(request),
        CommandField::N_SET_RQ => handler.n_set(request),
        CommandField::N_ACTION_RQ => handler.n_action(request),
        CommandField::N_CREATE_RQ => handler.n_create(request),
        CommandField::N_DELETE_RQ => handler.n_delete(request),
        _ => Err(ServiceFailure::UnsupportedOperation),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Build the response command to a request.
pub(crate) fn response_command(
    request: &Command,
    response: &ServiceResponse,
    comment: Option<String>,
) -> Option<Command> {
    let mut command = request
        .response_to(response.status)?
        .with_data_set(response.data.is_some());
    if let Some(uid) = &response.affected_sop_instance_uid {
        command.affected_sop_instance_uid = Some(uid.clone());
    }
    command.sub_operations = response.sub_operations;
    command.error_comment = comment;
    Some(command)
}

fn send_response(
    association: &Association,
    request: &DimseMessage,
    response: &ServiceResponse,
    comment: Option<String>,
) -> Result<(), crate::exchange::Error> {
    let Some(command) = response_command(&request.command, response, comment) else {
        return Ok(());
    };
    let bytes = command
        .encode()
        .map_err(|source| crate::exchange::Error::EncodeCommand { source })?;
    association
        .send_message(
            request.presentation_context_id,
            &bytes,
            response.data.as_deref(),
        )
        .map_err(|source| crate::exchange::Error::Send { source })
}
