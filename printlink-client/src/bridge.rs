//! Push-to-pull bridge between the frame scanner and waiting callers.
//!
//! The scanner pushes decoded records as frames arrive; a caller awaits them
//! at its own pace. One primitive serves both one-shot replies and ongoing
//! streams, with the buffering policy chosen per use site:
//!
//! - [`Buffering::Unbounded`] queues every value. Used for streams, which
//!   must not lose events that arrive between two awaits.
//! - [`Buffering::Latest`] keeps a single slot; a new value replaces an
//!   unconsumed one. Used for notifications where only the newest matters.
//!
//! [`Bridge::once`] is a single-slot bridge that accepts exactly one value.

use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

/// Buffering policy for values pushed before the consumer awaits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buffering {
    /// Queue every value.
    Unbounded,
    /// Keep only the newest value.
    Latest,
}

/// The bridge was cancelled before a value was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bridge cancelled")]
pub struct Cancelled;

#[derive(Debug)]
struct State<T> {
    values: VecDeque<T>,
    cancelled: bool,
    /// A one-shot bridge has accepted its value.
    sealed: bool,
}

/// A resettable single-consumer awaitable fed by [`Bridge::push`].
#[derive(Debug)]
pub struct Bridge<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    buffering: Buffering,
    once: bool,
}

impl<T> Bridge<T> {
    pub fn new(buffering: Buffering) -> Self {
        Self::build(buffering, false)
    }

    /// A bridge that queues every value (streams).
    pub fn unbounded() -> Self {
        Self::new(Buffering::Unbounded)
    }

    /// A bridge that keeps only the newest value.
    pub fn latest() -> Self {
        Self::new(Buffering::Latest)
    }

    /// A bridge that resolves once and then rejects further values.
    pub fn once() -> Self {
        Self::build(Buffering::Latest, true)
    }

    fn build(buffering: Buffering, once: bool) -> Self {
        Self {
            state: Mutex::new(State {
                values: VecDeque::new(),
                cancelled: false,
                sealed: false,
            }),
            notify: Notify::new(),
            buffering,
            once,
        }
    }

    /// Hands `value` to the waiting consumer, or buffers it for the next
    /// [`recv`](Self::recv).
    ///
    /// Returns `false` if the value was rejected because the bridge was
    /// cancelled or, for a one-shot bridge, already resolved.
    pub fn push(&self, value: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.sealed {
                return false;
            }
            if self.buffering == Buffering::Latest {
                state.values.clear();
            }
            state.values.push_back(value);
            state.sealed = self.once;
        }
        self.notify.notify_one();
        true
    }

    /// Waits for the next value.
    ///
    /// Fails with [`Cancelled`] once [`cancel`](Self::cancel) was called,
    /// even if values are still buffered.
    pub async fn recv(&self) -> Result<T, Cancelled> {
        loop {
            {
                let mut state = self.state.lock();
                if state.cancelled {
                    return Err(Cancelled);
                }
                if let Some(value) = state.values.pop_front() {
                    return Ok(value);
                }
            }
            // notify_one stores a permit when nobody waits, so a push
            // between the check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Takes a buffered value without waiting.
    pub fn try_recv(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.cancelled {
            return None;
        }
        state.values.pop_front()
    }

    /// Cancels the bridge, failing the current or next `recv`.
    ///
    /// Has no effect on a one-shot bridge that already resolved.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.sealed || state.cancelled {
                return;
            }
            state.cancelled = true;
            state.values.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Returns whether a one-shot bridge has received its value.
    pub fn is_resolved(&self) -> bool {
        self.state.lock().sealed
    }

    /// Number of values waiting to be received.
    pub fn buffered(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn buffering(&self) -> Buffering {
        self.buffering
    }
}
