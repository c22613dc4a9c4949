//! One lifecycle attempt: connection, channel, and the collapse of their
//! termination signals into a single outcome.
//!
//! ## Signal collapsing
//!
//! Four raw signals can end an attempt: connection close, connection error,
//! channel close and channel error. Each source is watched by a small
//! listener task that forwards into one signal queue; the first terminal
//! signal decides the outcome.
//!
//! A channel can report its close before the owning connection reports the
//! error that actually caused it. Channel closes are therefore held back for
//! a short grace window. A connection failure arriving inside that window
//! takes priority and supplies the real terminal error. This is a documented
//! race, not a scheduler guarantee: a connection error arriving after the
//! window loses to the clean channel close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::cleanup::CleanupSet;
use super::{cancelled, LifecycleEvent, LifecycleHooks};
use crate::{
    //
    log_debug,
    log_info,
    ChannelEvent,
    ConnectionEvent,
    PublishError,
    SupplierPtr,
};

/// Per-attempt state machine.
///
/// `Init → Connecting → Connected → Open → Closing → Closed`. Any live state
/// may jump to `Closing`; `Closed` is terminal for the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Nothing requested yet.
    Init,
    /// Waiting on the connection supplier.
    Connecting,
    /// Connection acquired, channel creation pending.
    Connected,
    /// Channel ready and handed to the subscriber. Drain signals do not
    /// change this state.
    Open,
    /// Cleanup running.
    Closing,
    /// Terminal.
    Closed,
}

impl AttemptState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: AttemptState) -> bool {
        // ---
        use AttemptState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Connected)
                | (Connected, Open)
                | (Init | Connecting | Connected | Open, Closing)
                | (Closing, Closed)
        )
    }

    /// Whether the attempt is over.
    pub fn is_terminal(self) -> bool {
        self == AttemptState::Closed
    }
}

/// How an attempt ended.
#[derive(Debug)]
pub(super) enum AttemptOutcome {
    /// The connection or channel closed without an error.
    Completed,
    /// One of the four signals carried an error, or setup failed.
    Failed(PublishError),
    /// The subscriber unsubscribed; nothing is reported.
    Cancelled,
}

pub(super) struct AttemptReport {
    pub(super) outcome: AttemptOutcome,
    pub(super) opened: bool,
}

/// Settings shared by every attempt of one supervisor.
pub(super) struct AttemptContext {
    pub(super) supplier: SupplierPtr,
    pub(super) hooks: LifecycleHooks,
    pub(super) close_grace: Duration,
}

#[derive(Debug)]
enum Signal {
    ConnectionClose(Option<PublishError>),
    ConnectionError(PublishError),
    ChannelCloseRequested(Option<PublishError>),
    ChannelClosed(Option<PublishError>),
    ChannelError(PublishError),
}

impl Signal {
    /// Outcome decided by this signal, or `None` for a channel close that
    /// still has to sit out the grace window.
    fn into_outcome(self) -> Option<AttemptOutcome> {
        // ---
        let outcome = match self {
            Signal::ChannelCloseRequested(_) => return None,
            Signal::ConnectionClose(Some(cause)) | Signal::ConnectionError(cause) => {
                AttemptOutcome::Failed(PublishError::connection_closed(cause))
            }
            Signal::ConnectionClose(None) | Signal::ChannelClosed(None) => {
                AttemptOutcome::Completed
            }
            Signal::ChannelClosed(Some(err)) | Signal::ChannelError(err) => {
                AttemptOutcome::Failed(err)
            }
        };
        Some(outcome)
    }
}

struct Attempt {
    number: u64,
    state: AttemptState,
    opened: bool,
    cleanup: CleanupSet,
}

impl Attempt {
    fn new(number: u64) -> Self {
        Self {
            number,
            state: AttemptState::Init,
            opened: false,
            cleanup: CleanupSet::new(),
        }
    }

    fn advance(&mut self, next: AttemptState) {
        // ---
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal attempt transition {:?} -> {next:?}",
            self.state
        );
        log_debug!("attempt {}: {:?} -> {next:?}", self.number, self.state);
        self.state = next;
        if next == AttemptState::Open {
            self.opened = true;
        }
    }

    fn finish(mut self, outcome: AttemptOutcome) -> AttemptReport {
        // ---
        self.advance(AttemptState::Closing);
        self.cleanup.run();
        debug_assert!(self.cleanup.has_run());
        self.advance(AttemptState::Closed);

        log_debug!("attempt {} finished: {outcome:?}", self.number);

        AttemptReport {
            outcome,
            opened: self.opened,
        }
    }
}

/// Run a single attempt until one of its termination signals fires or the
/// subscriber cancels.
pub(super) async fn run(
    ctx: &AttemptContext,
    number: u64,
    events: &mpsc::Sender<LifecycleEvent>,
    cancel: &mut watch::Receiver<bool>,
) -> AttemptReport {
    // ---
    let mut attempt = Attempt::new(number);
    attempt.advance(AttemptState::Connecting);

    let connection = tokio::select! {
        biased;
        _ = cancelled(cancel) => return attempt.finish(AttemptOutcome::Cancelled),
        res = ctx.supplier.get_connection() => match res {
            Ok(connection) => connection,
            Err(err) => return attempt.finish(AttemptOutcome::Failed(err)),
        },
    };

    (ctx.hooks.on_opened)();
    let on_closed = Arc::clone(&ctx.hooks.on_closed);
    attempt.cleanup.push(move || on_closed());
    attempt.advance(AttemptState::Connected);
    log_info!("attempt {number}: connection acquired");

    let (signal_tx, mut signals) = mpsc::unbounded_channel();

    let listener = forward_connection_events(connection.events(), signal_tx.clone());
    attempt.cleanup.push(move || listener.abort());

    let channel = tokio::select! {
        biased;
        _ = cancelled(cancel) => return attempt.finish(AttemptOutcome::Cancelled),
        Some(signal) = signals.recv() => {
            let outcome = signal.into_outcome().unwrap_or(AttemptOutcome::Completed);
            return attempt.finish(outcome);
        }
        res = connection.create_channel() => match res {
            Ok(channel) => channel,
            Err(err) => return attempt.finish(AttemptOutcome::Failed(err)),
        },
    };

    let listener = forward_channel_events(channel.events(), signal_tx.clone());
    attempt.cleanup.push(move || listener.abort());
    attempt.advance(AttemptState::Open);
    log_info!("attempt {number}: channel open");

    tokio::select! {
        biased;
        _ = cancelled(cancel) => return attempt.finish(AttemptOutcome::Cancelled),
        sent = events.send(LifecycleEvent::Opened(channel)) => {
            if sent.is_err() {
                return attempt.finish(AttemptOutcome::Cancelled);
            }
        }
    }

    let mut deferred_close = false;

    loop {
        let signal = tokio::select! {
            biased;
            _ = cancelled(cancel) => return attempt.finish(AttemptOutcome::Cancelled),
            Some(signal) = signals.recv() => signal,
            else => return attempt.finish(AttemptOutcome::Completed),
        };

        match signal {
            Signal::ChannelCloseRequested(cause) => {
                if deferred_close {
                    continue;
                }
                deferred_close = true;
                log_debug!(
                    "attempt {number}: channel closed, waiting {:?} for a connection error",
                    ctx.close_grace
                );

                let signal_tx = signal_tx.clone();
                let grace = ctx.close_grace;
                let deferred = tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = signal_tx.send(Signal::ChannelClosed(cause));
                });
                attempt.cleanup.push(move || deferred.abort());
            }
            other => {
                if let Some(outcome) = other.into_outcome() {
                    return attempt.finish(outcome);
                }
            }
        }
    }
}

fn forward_connection_events(
    mut rx: broadcast::Receiver<ConnectionEvent>,
    signals: mpsc::UnboundedSender<Signal>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        loop {
            let (signal, last) = match rx.recv().await {
                Ok(ConnectionEvent::Close(cause)) => (Signal::ConnectionClose(cause), true),
                Ok(ConnectionEvent::Error(err)) => (Signal::ConnectionError(err), false),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => (Signal::ConnectionClose(None), true),
            };
            if signals.send(signal).is_err() || last {
                break;
            }
        }
    })
}

fn forward_channel_events(
    mut rx: broadcast::Receiver<ChannelEvent>,
    signals: mpsc::UnboundedSender<Signal>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        loop {
            let (signal, last) = match rx.recv().await {
                Ok(ChannelEvent::Close(cause)) => (Signal::ChannelCloseRequested(cause), true),
                Ok(ChannelEvent::Error(err)) => (Signal::ChannelError(err), false),
                Ok(ChannelEvent::Drain) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    (Signal::ChannelCloseRequested(None), true)
                }
            };
            if signals.send(signal).is_err() || last {
                break;
            }
        }
    })
}
