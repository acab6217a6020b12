//! Monitor relation.
//!
//! The set lives at the monitored engine. Other engines add themselves from
//! their own threads, the monitored engine seals it when it terminates and
//! delivers one notice per distinct monitor.

use std::collections::BTreeSet;

use vm_store::Value;

use crate::engine::EngineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddMonitor {
    Added,
    AlreadyPresent,
    /// Notices were already sent; the caller must deliver one itself.
    Sealed,
}

#[derive(Debug, Default)]
pub(crate) struct MonitorSet {
    monitors: BTreeSet<EngineId>,
    sealed: bool,
}

impl MonitorSet {
    pub(crate) fn add(&mut self, monitor: EngineId) -> AddMonitor {
        if self.sealed {
            AddMonitor::Sealed
        } else if self.monitors.insert(monitor) {
            AddMonitor::Added
        } else {
            AddMonitor::AlreadyPresent
        }
    }

    /// Close the set and return every monitor exactly once.
    pub(crate) fn seal(&mut self) -> Vec<EngineId> {
        self.sealed = true;
        std::mem::take(&mut self.monitors).into_iter().collect()
    }
}

/// The notice appended to a monitor's VM Port when `dead` terminates.
#[must_use]
pub fn death_notice(dead: EngineId) -> Value {
    Value::record("terminated", vec![Value::from(dead)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_monitor_is_deduplicated() {
        let mut set = MonitorSet::default();
        assert_eq!(set.add(EngineId(2)), AddMonitor::Added);
        assert_eq!(set.add(EngineId(2)), AddMonitor::AlreadyPresent);
        assert_eq!(set.add(EngineId(3)), AddMonitor::Added);
        assert_eq!(set.seal(), vec![EngineId(2), EngineId(3)]);
    }

    #[test]
    fn test_add_after_seal() {
        let mut set = MonitorSet::default();
        assert!(set.seal().is_empty());
        assert_eq!(set.add(EngineId(4)), AddMonitor::Sealed);
        assert!(set.seal().is_empty());
    }

    #[test]
    fn test_death_notice_names_engine() {
        assert_eq!(
            death_notice(EngineId(9)),
            Value::record("terminated", vec![Value::Int(9)])
        );
    }
}
