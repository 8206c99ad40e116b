//! Transport dispatcher for the sync core.
//!
//! Two transports carry operations:
//! - request/response ([`RequestResponse`], [`ReqwestClient`])
//! - a long-lived channel ([`PersistentChannel`], [`MpscChannel`]) whose
//!   replies are matched to requests by [`ChannelCorrelator`]
//!
//! [`Dispatcher::dispatch`] sends one operation and classifies the result
//! into a [`DispatchOutcome`] the queue understands.

mod channel;
mod client;
mod dispatcher;
mod error;
mod request;

pub use channel::{ChannelCorrelator, ChannelEnvelope, ChannelReply, MpscChannel, PersistentChannel};
pub use client::{ReqwestClient, RequestResponse};
pub use dispatcher::{classify_status, DispatchOutcome, Dispatcher, PermanentCause, PermanentKind};
pub use error::{TransportError, TransportResult};
pub use request::{HttpRequest, HttpResponse, RequestNormalizer};
