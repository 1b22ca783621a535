// ABOUTME: The Transport capability trait and its variants (CLI process, in-process API, scripted).
// ABOUTME: Every variant yields the same RecordReceiver shape to the dispatcher.

pub mod cli;
pub mod mock;
pub mod sdk;

use crate::bridge::RecordReceiver;
use crate::error::QueryError;
use crate::invocation::InvocationParams;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

pub use cli::CliTransport;
pub use mock::ScriptedTransport;
pub use sdk::{SdkConfig, SdkTransport};

/// Core trait every backend transport implements.
pub trait Transport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Start one query and return its record stream.
    ///
    /// An `Err` here means nothing was produced (e.g. the executable could
    /// not be started). Failures after output began arrive through the
    /// receiver, after every record that preceded them.
    fn stream_query<'a>(
        &'a self,
        params: InvocationParams,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<RecordReceiver, QueryError>>;

    /// Drop any state held for a continuation token that will not be resumed.
    /// Transports that keep nothing in memory need not override this.
    fn forget(&self, _token: &str) {}
}
