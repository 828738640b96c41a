//! Connected switches and the records that own their state.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::gateway::{FlowMod, Gateway, Instruction, Match, Output, FORWARD_TABLE, PRIORITY_MISS, QOS_TABLE};
use crate::ledger::SwitchLedger;
use crate::types::SwitchId;
use crate::Qos;

pub type SwitchRecord = Arc<Mutex<SwitchLedger>>;
/// A handle on one connection's record. It dies with the connection: a
/// reconnected switch gets a new record that old handles never reach.
pub type SwitchRef = Weak<Mutex<SwitchLedger>>;

/// Registered switches, keyed by datapath id.
///
/// Each record is behind its own lock; the map lock is only held long enough
/// to find, insert or remove a record.
#[derive(Clone, Debug, Default)]
pub struct Registry(Arc<RwLock<HashMap<SwitchId, SwitchRecord>>>);

impl Registry {
    /// Insert a fresh record for `switch`. Returns `None` if the switch is
    /// already registered.
    pub fn register(&self, switch: SwitchId) -> Option<SwitchRecord> {
        let mut map = self.0.write();
        if map.contains_key(&switch) {
            return None;
        }

        let rec = Arc::new(Mutex::new(SwitchLedger::new(switch)));
        map.insert(switch, rec.clone());
        Some(rec)
    }

    /// Remove `switch` and mark its record gone, so jobs still holding it
    /// turn into no-ops.
    pub fn unregister(&self, switch: SwitchId) -> bool {
        let rec = self.0.write().remove(&switch);
        match rec {
            Some(rec) => {
                rec.lock().retire();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, switch: SwitchId) -> Option<SwitchRecord> {
        self.0.read().get(&switch).cloned()
    }

    /// A handle that does not keep the record alive past a disconnect.
    pub fn weak(&self, switch: SwitchId) -> Option<SwitchRef> {
        self.0.read().get(&switch).map(Arc::downgrade)
    }

    pub fn contains(&self, switch: SwitchId) -> bool {
        self.0.read().contains_key(&switch)
    }

    /// Registered switch ids, in ascending order.
    pub fn switches(&self) -> Vec<SwitchId> {
        let mut ids: Vec<SwitchId> = self.0.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// A copy of a switch's ledger.
    pub fn snapshot(&self, switch: SwitchId) -> Option<SwitchLedger> {
        self.get(switch).map(|rec| rec.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Run `f` with the record locked, unless its switch disconnected in the
/// meantime. The lock is held for the whole of `f`.
pub fn with_live<T, F>(rec: &SwitchRef, f: F) -> Option<T>
where
    F: FnOnce(&mut SwitchLedger) -> T,
{
    let rec = rec.upgrade()?;
    let mut ledger = rec.lock();
    if !ledger.is_live() {
        return None;
    }

    Some(f(&mut *ledger))
}

impl<G: Gateway> Qos<G> {
    /// Register a new switch and install its baseline rules: unmatched
    /// traffic in the forwarding table goes to the controller, and everything
    /// entering the QoS table continues to the forwarding table.
    pub fn on_connect(&self, switch: SwitchId) {
        let rec = match self.registry.register(switch) {
            Some(rec) => rec,
            None => {
                debug!(switch = %switch, "switch already registered");
                return;
            }
        };

        info!(switch = %switch, "register switch");
        let mut ledger = rec.lock();
        let sw = self.handle(switch);
        sw.install_flow(FlowMod {
            table: FORWARD_TABLE,
            priority: PRIORITY_MISS,
            matches: Match::all(),
            instructions: vec![Instruction::Output(Output::Controller)],
            idle_timeout: 0,
            buffer_id: None,
        });
        sw.install_flow(FlowMod {
            table: QOS_TABLE,
            priority: PRIORITY_MISS,
            matches: Match::all(),
            instructions: vec![Instruction::GotoTable(FORWARD_TABLE)],
            idle_timeout: 0,
            buffer_id: None,
        });
        ledger.activate();
    }

    pub fn on_disconnect(&self, switch: SwitchId) {
        if self.registry.unregister(switch) {
            info!(switch = %switch, "unregister switch");
        } else {
            debug!(switch = %switch, "disconnect from unknown switch");
        }
    }
}
