//! Operation registry
//!
//! Maps action names to operation constructors for the two places the engine
//! has to conjure an operation from a string: inbound CALLs and restoring
//! persisted requests at boot. First registration for an action wins, so a
//! late-loading extension cannot silently override protocol behavior. Vendor
//! actions go through the custom table, which is consulted first.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::frame::CallFrame;
use crate::operation::{NotImplemented, Operation};

type OperationFactory = Box<dyn Fn() -> Box<dyn Operation> + Send>;

/// Action-name dispatch for operation construction.
#[derive(Default)]
pub struct OperationRegistry {
    builtin: HashMap<String, OperationFactory>,
    custom: HashMap<String, OperationFactory>,
    restore: HashMap<String, OperationFactory>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an action to a constructor for inbound CALLs. The first
    /// registration wins; later ones are logged and ignored.
    pub fn register<F>(&mut self, action: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Operation> + Send + 'static,
    {
        let action = action.into();
        if self.builtin.contains_key(&action) {
            warn!(action, "operation already registered, ignoring");
            return;
        }
        self.builtin.insert(action, Box::new(factory));
    }

    /// Vendor-action path for host-firmware-defined operations. Checked
    /// before the built-in table; same first-wins rule.
    pub fn register_custom<F>(&mut self, action: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Operation> + Send + 'static,
    {
        let action = action.into();
        if self.custom.contains_key(&action) {
            warn!(action, "custom operation already registered, ignoring");
            return;
        }
        self.custom.insert(action, Box::new(factory));
    }

    /// Bind an action to a constructor used when replaying persisted
    /// requests at boot. The constructed operation is handed the stored
    /// state blob via [`Operation::restore`].
    pub fn register_restore<F>(&mut self, action: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Operation> + Send + 'static,
    {
        let action = action.into();
        if self.restore.contains_key(&action) {
            warn!(action, "restore factory already registered, ignoring");
            return;
        }
        self.restore.insert(action, Box::new(factory));
    }

    /// Construct the operation for an inbound CALL and feed it the payload.
    /// Unknown actions get the `NotImplemented` fallback.
    pub fn make_inbound(&self, call: &CallFrame) -> Box<dyn Operation> {
        let factory = self
            .custom
            .get(&call.action)
            .or_else(|| self.builtin.get(&call.action));

        let mut operation = match factory {
            Some(f) => f(),
            None => {
                debug!(action = call.action, "no operation registered");
                Box::new(NotImplemented::new(call.action.clone()))
            }
        };
        operation.process_request(&call.payload);
        operation
    }

    /// Construct an operation for a persisted record. `None` when no restore
    /// factory exists for the action (the record is skipped).
    pub fn make_restored(&self, action: &str) -> Option<Box<dyn Operation>> {
        self.restore.get(action).map(|f| f())
    }
}
