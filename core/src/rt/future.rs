use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, watch};

use crate::val::{Exception, Val};

pub type Completion = Result<Val, Exception>;

struct FutureCell {
    state: watch::Sender<Option<Completion>>,
    /// Context wakers to poke once the cell completes.
    subscribers: Mutex<Vec<Arc<Notify>>>,
}

/// Result of a cross-context request.
///
/// A handle with a `slot` is derived from an N-result completion and resolves to
/// element `slot` of the completed tuple.
#[derive(Clone)]
pub struct FutureHandle {
    cell: Arc<FutureCell>,
    slot: Option<usize>,
}

impl fmt::Debug for FutureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureHandle")
            .field("slot", &self.slot)
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Default for FutureHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FutureHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            cell: Arc::new(FutureCell {
                state,
                subscribers: Mutex::new(Vec::new()),
            }),
            slot: None,
        }
    }

    /// Future of element `index` of this future's tuple result.
    pub fn slot(&self, index: usize) -> FutureHandle {
        FutureHandle {
            cell: self.cell.clone(),
            slot: Some(index),
        }
    }

    pub fn ptr_eq(&self, other: &FutureHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell) && self.slot == other.slot
    }

    pub fn is_done(&self) -> bool {
        self.cell.state.borrow().is_some()
    }

    pub fn is_pending(&self) -> bool {
        !self.is_done()
    }

    fn project(&self, completion: &Completion) -> Completion {
        let Some(index) = self.slot else {
            return completion.clone();
        };
        match completion {
            Ok(Val::Tuple(items)) => items
                .get(index)
                .cloned()
                .ok_or_else(|| Exception::internal(format!("result slot {index} out of range"))),
            Ok(v) if index == 0 => Ok(v.clone()),
            Ok(_) => Err(Exception::internal(format!("result slot {index} of a single value"))),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn peek(&self) -> Option<Completion> {
        self.cell.state.borrow().as_ref().map(|c| self.project(c))
    }

    /// Complete the shared cell. Only the first completion counts.
    pub fn complete(&self, completion: Completion) -> bool {
        let mut completion = Some(completion);
        let changed = self.cell.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = completion.take();
            true
        });
        if changed {
            let waiting = std::mem::take(&mut *self.subscribers());
            for waker in waiting {
                waker.notify_one();
            }
        }
        changed
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Notify>>> {
        self.cell.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake `waker` when this future completes (immediately if it already has).
    pub fn subscribe(&self, waker: &Arc<Notify>) {
        let mut subscribers = self.subscribers();
        if self.is_done() {
            waker.notify_one();
            return;
        }
        if !subscribers.iter().any(|w| Arc::ptr_eq(w, waker)) {
            subscribers.push(waker.clone());
        }
    }

    /// Wait for completion from host code.
    pub async fn wait(&self) -> Completion {
        let mut rx = self.cell.state.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => match state.as_ref() {
                Some(c) => self.project(c),
                None => Err(Exception::internal("future woke without a result")),
            },
            Err(_) => Err(Exception::internal("future dropped")),
        }
    }
}
