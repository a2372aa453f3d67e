use std::collections::BTreeSet;

use crate::sync::Signal;
use crate::types::ScriptAddress;

pub type RegistrationCallback = Box<dyn FnOnce(bool) + Send>;

/// Named set of addresses submitted for registration.
pub struct AddressBatch {
    pub id: String,
    pub addresses: BTreeSet<ScriptAddress>,
    pub callback: RegistrationCallback,
}

impl AddressBatch {
    pub fn new<F>(id: impl Into<String>, addresses: BTreeSet<ScriptAddress>, callback: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        Self {
            id: id.into(),
            addresses,
            callback: Box::new(callback),
        }
    }
}

/// Addresses claimed by a batch whose side-scan has not merged yet.
pub(crate) struct InFlight {
    pub id: String,
    pub addresses: BTreeSet<ScriptAddress>,
    pub done: Signal<bool>,
}

/// A batch callback, held back until every batch it was chained to has fired.
pub(crate) struct PendingCallback {
    pub id: String,
    callback: RegistrationCallback,
    gates: Vec<Signal<bool>>,
    done: Signal<bool>,
}

impl PendingCallback {
    pub fn new(
        id: String,
        callback: RegistrationCallback,
        gates: Vec<Signal<bool>>,
        done: Signal<bool>,
    ) -> Self {
        Self {
            id,
            callback,
            gates,
            done,
        }
    }

    pub fn is_gated(&self) -> bool {
        !self.gates.is_empty()
    }

    /// Fires the callback with `success`, after the gates if any are still open.
    ///
    /// A failed gate turns the result into a failure: the chained addresses
    /// were never indexed.
    pub fn fire(self, success: bool) {
        if self.gates.iter().all(|g| g.is_set()) {
            let gated_ok = self.gates.iter().all(|g| g.peek().unwrap_or(false));
            self.complete(success && gated_ok);
            return;
        }

        log::debug!(
            "[REGISTRY] batch {} waits for {} in-flight scans",
            self.id,
            self.gates.len()
        );
        std::thread::spawn(move || {
            let gated_ok = self.gates.iter().fold(true, |ok, g| g.wait() && ok);
            self.complete(success && gated_ok);
        });
    }

    fn complete(self, success: bool) {
        log::debug!("[REGISTRY] batch {} completed (success={})", self.id, success);
        (self.callback)(success);
        self.done.set(success);
    }
}
