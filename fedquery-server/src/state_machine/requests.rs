//! This module provides the [`StateMachine`]'s result inbox: the
//! `RequestSender` and `RequestReceiver` types.
//!
//! All result submissions for a batch flow through one unbounded channel
//! into the single task that owns the batch. The collector therefore never
//! sees two submissions concurrently; the single-writer requirement is
//! structural rather than a property the transport has to guarantee.
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::From;
use displaydoc::Display;
use futures::{future::FutureExt, Stream};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, Span};

use fedquery_core::{result::SiteResult, CorrelationKey};

/// Errors which can occur while the state machine handles a result
/// submission.
#[derive(Debug, Display, Error)]
pub enum CollectError {
    /// The correlation key is not known for this batch.
    UnknownKey,
    /// A result was already accepted under this correlation key.
    DuplicateKey,
    /// A result references a cohort outside the batch's cohort set.
    UnknownCohort,
    /// A payload does not match the batch's query mode.
    ModeMismatch,
    /// The batch is not collecting results.
    NotCollecting,
    /// The request could not be processed due to an internal error: {0}.
    InternalError(&'static str),
}

/// One participant's complete result submission: everything the site reports
/// for this batch, under its correlation key.
///
/// Correlation keys are write-once; a second submission under the same key
/// is rejected, not merged.
#[derive(Debug)]
pub struct ResultSubmission {
    /// The correlation key assigned to the submitting participant.
    pub correlation_key: CorrelationKey,
    /// One result per cohort the site evaluated.
    pub results: Vec<SiteResult>,
}

/// A channel for the state machine to send the response to a
/// [`ResultSubmission`].
pub(in crate::state_machine) type ResponseSender = oneshot::Sender<Result<(), CollectError>>;

/// A handle to submit results to the [`StateMachine`].
///
/// [`StateMachine`]: crate::state_machine
#[derive(Clone, Debug, From)]
pub struct RequestSender(mpsc::UnboundedSender<(ResultSubmission, Span, ResponseSender)>);

impl RequestSender {
    /// Records one participant's results under its correlation key.
    ///
    /// # Errors
    /// Fails if the submission is rejected by the collector, or if the batch
    /// has already reached a terminal state and the channel has been closed
    /// as a result.
    pub async fn record(
        &self,
        correlation_key: CorrelationKey,
        results: Vec<SiteResult>,
        span: Span,
    ) -> Result<(), CollectError> {
        let (resp_tx, resp_rx) = oneshot::channel::<Result<(), CollectError>>();
        let submission = ResultSubmission {
            correlation_key,
            results,
        };
        self.0.send((submission, span, resp_tx)).map_err(|_| {
            CollectError::InternalError(
                "failed to send submission to the state machine: batch has terminated",
            )
        })?;
        resp_rx
            .await
            .map_err(|_| CollectError::InternalError("failed to receive collector response"))?
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiver half of the request channel that is used by the
/// [`StateMachine`] to receive result submissions.
///
/// [`StateMachine`]: crate::state_machine
#[derive(Debug, From)]
pub struct RequestReceiver(mpsc::UnboundedReceiver<(ResultSubmission, Span, ResponseSender)>);

impl Stream for RequestReceiver {
    type Item = (ResultSubmission, Span, ResponseSender);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        trace!("RequestReceiver: polling");
        self.get_mut().0.poll_recv(cx)
    }
}

impl RequestReceiver {
    /// Creates a new request channel and returns the [`RequestReceiver`] as
    /// well as the [`RequestSender`] half.
    pub fn new() -> (Self, RequestSender) {
        let (tx, rx) = mpsc::unbounded_channel::<(ResultSubmission, Span, ResponseSender)>();
        let receiver = RequestReceiver::from(rx);
        let handle = RequestSender::from(tx);
        (receiver, handle)
    }

    /// Closes the request channel; pending submissions can still be drained.
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next submission.
    pub async fn recv(&mut self) -> Option<(ResultSubmission, Span, ResponseSender)> {
        self.0.recv().await
    }

    /// Tries to retrieve the next submission without blocking.
    pub fn try_recv(&mut self) -> Option<(ResultSubmission, Span, ResponseSender)> {
        self.0.recv().now_or_never().flatten()
    }
}
