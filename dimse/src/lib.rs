//! DICOM message service element (DIMSE) exchange
//! on top of the upper layer associations of [`dicomnet_ul`].
//!
//! - The [`command`] module
//!   holds command sets and their implicit VR little endian encoding.
//! - The [`status`] module
//!   classifies DIMSE status codes.
//! - The [`exchange`] module
//!   sends requests over an association and correlates their responses,
//!   through [`DimseAssociation`] and [`PendingInvocation`].
//! - The [`dispatch`] module
//!   routes incoming requests to [`ServiceHandler`]s
//!   by abstract syntax.
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! use dicomnet_dimse::{DimseAssociation, DimseOptions, ServiceRegistry};
//! use dicomnet_ul::ClientAssociationOptions;
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (_association, reader) = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .establish("129.168.0.5:104")?;
//! let dimse = DimseAssociation::new(
//!     reader,
//!     Arc::new(ServiceRegistry::new()),
//!     DimseOptions::new(),
//! )?;
//! let status = dimse.echo()?;
//! assert!(status.is_success());
//! dimse.release()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod dispatch;
pub mod exchange;
pub mod message;
pub mod status;

pub use command::{Command, CommandField, Priority, SubOperations};
pub use dispatch::{
    Responder, ServiceFailure, ServiceHandler, ServiceRegistry, ServiceResponse, ServiceResult,
    VerificationService,
};
pub use exchange::{
    DimseAssociation, DimseOptions, InvocationError, PendingInvocation, ResponseListener,
};
pub use message::{DimseMessage, DimseResponse};
pub use status::{Status, StatusType};
