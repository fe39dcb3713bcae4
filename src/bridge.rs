//! One-shot bridge from driver callbacks to `.await` points.
//!
//! [`create`] returns a [`Resolver`] handed to the callback side and an
//! [`Awaitable`] held by the caller. Only the first `resolve`/`fail` on a
//! resolver is observed; later calls (including ones arriving after
//! [`Awaitable::cancel`]) are dropped with a debug log. The awaiting task
//! resumes on whatever thread the runtime polls it from, which is not the
//! thread that delivered the callback.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::camera::CameraError;

type Outcome<T> = Result<T, CameraError>;

/// Owned by resolvers only; the sender drops with the last resolver clone.
struct ResolverShared<T> {
    sender: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    canceled: Arc<AtomicBool>,
}

impl<T> ResolverShared<T> {
    fn take_sender(&self) -> Option<oneshot::Sender<Outcome<T>>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Callback side of a bridge. Cheap to clone so success and failure
/// callbacks can each hold one.
pub struct Resolver<T> {
    shared: Arc<ResolverShared<T>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

impl<T> Resolver<T> {
    /// Complete the bridge with a value.
    ///
    /// Returns `true` if the waiting side will observe this value.
    pub fn resolve(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Complete the bridge with an error.
    ///
    /// Returns `true` if the waiting side will observe this error.
    pub fn fail(&self, error: CameraError) -> bool {
        self.complete(Err(error))
    }

    /// Whether the awaitable side has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::SeqCst)
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let Some(sender) = self.shared.take_sender() else {
            if self.is_canceled() {
                log::debug!("Bridge already canceled, discarding result");
            } else {
                log::debug!("Bridge already resolved, ignoring repeat callback");
            }
            return false;
        };
        // The receiver may have been dropped by a caller that stopped waiting.
        sender.send(outcome).is_ok()
    }
}

/// Cancellation path into a bridge that does not keep the resolvers alive.
struct CancelState<T> {
    canceled: Arc<AtomicBool>,
    resolvers: Weak<ResolverShared<T>>,
}

/// Caller side of a bridge.
#[must_use = "an awaitable does nothing unless awaited"]
pub struct Awaitable<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
    cancel: Arc<CancelState<T>>,
}

impl<T: Send + 'static> Awaitable<T> {
    /// Handle that can cancel this awaitable from another task or thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            inner: Arc::clone(&self.cancel) as Arc<dyn Cancel>,
        }
    }

    /// Cancel the awaitable. A pending `.await` completes with
    /// [`CameraError::Canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<T> Future for Awaitable<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // Sender dropped: either canceled or every resolver went away.
            Poll::Ready(Err(_)) => Poll::Ready(Err(CameraError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_canceled(&self) -> bool;
}

impl<T: Send> Cancel for CancelState<T> {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the waiter with a receive error.
        if let Some(resolvers) = self.resolvers.upgrade() {
            drop(resolvers.take_sender());
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Type-erased cancellation for a pending [`Awaitable`].
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<dyn Cancel>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Create a connected resolver/awaitable pair.
pub fn create<T: Send + 'static>() -> (Resolver<T>, Awaitable<T>) {
    let (tx, rx) = oneshot::channel();
    let canceled = Arc::new(AtomicBool::new(false));
    let shared = Arc::new(ResolverShared {
        sender: Mutex::new(Some(tx)),
        canceled: Arc::clone(&canceled),
    });
    let cancel = Arc::new(CancelState {
        canceled,
        resolvers: Arc::downgrade(&shared),
    });
    (
        Resolver { shared },
        Awaitable {
            receiver: rx,
            cancel,
        },
    )
}
