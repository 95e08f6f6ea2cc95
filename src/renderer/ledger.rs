/// Records how to release every GPU resource the renderer acquires.
///
/// Acquisition order encodes dependency order (a view depends on its image, a pipeline
/// on its layout), so entries are always released from the most recent to the earliest.
pub struct ResourceLedger {
    entries: Vec<LedgerEntry>,
}

struct LedgerEntry {
    label: &'static str,
    release: Box<dyn FnOnce()>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends a teardown action. The action must own every handle it needs.
    pub fn register<F>(&mut self, label: &'static str, release: F)
    where
        F: FnOnce() + 'static,
    {
        log::debug!("Ledger: registered {}", label);
        self.entries.push(LedgerEntry {
            label,
            release: Box::new(release),
        });
    }

    /// Registers every entry of `other` as a single entry of this ledger.
    pub fn absorb(&mut self, label: &'static str, mut other: ResourceLedger) {
        let entries = std::mem::take(&mut other.entries);
        if entries.is_empty() {
            return;
        }
        self.register(label, move || {
            let mut scope = ResourceLedger { entries };
            scope.flush();
        });
    }

    /// Runs every registered action in reverse registration order and clears the ledger.
    ///
    /// The caller must make sure the GPU no longer uses any of the resources.
    pub fn flush(&mut self) {
        while let Some(entry) = self.entries.pop() {
            log::debug!("Ledger: releasing {}", entry.label);
            (entry.release)();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|entry| entry.label)
    }
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResourceLedger {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::warn!("Dropping ResourceLedger with {} unreleased entries", self.entries.len());
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let make = move |id: u32| {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(id)) as Box<dyn FnOnce()>
        };
        (calls, make)
    }

    #[test]
    fn test_flush_runs_entries_in_reverse() {
        let (calls, make) = recorder();
        let mut ledger = ResourceLedger::new();
        for id in 1..=5 {
            ledger.register("entry", make(id));
        }
        assert_eq!(ledger.len(), 5);

        ledger.flush();

        assert_eq!(*calls.borrow(), vec![5, 4, 3, 2, 1]);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_flush_runs_each_entry_once() {
        let (calls, make) = recorder();
        let mut ledger = ResourceLedger::new();
        ledger.register("a", make(1));
        ledger.register("b", make(2));

        ledger.flush();
        ledger.flush();

        assert_eq!(*calls.borrow(), vec![2, 1]);
    }

    #[test]
    fn test_flush_on_empty_ledger_is_noop() {
        let mut ledger = ResourceLedger::new();
        ledger.flush();
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_absorb_registers_single_entry() {
        let (calls, make) = recorder();
        let mut scope = ResourceLedger::new();
        scope.register("inner-1", make(10));
        scope.register("inner-2", make(11));

        let mut ledger = ResourceLedger::new();
        ledger.register("before", make(1));
        ledger.absorb("scope", scope);
        ledger.register("after", make(2));
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.labels().collect::<Vec<_>>(), vec!["before", "scope", "after"]);

        ledger.flush();

        assert_eq!(*calls.borrow(), vec![2, 11, 10, 1]);
    }

    #[test]
    fn test_absorb_empty_scope_adds_nothing() {
        let mut ledger = ResourceLedger::new();
        ledger.absorb("empty", ResourceLedger::new());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_drop_releases_remaining_entries() {
        let (calls, make) = recorder();
        {
            let mut ledger = ResourceLedger::new();
            ledger.register("a", make(1));
            ledger.register("b", make(2));
        }
        assert_eq!(*calls.borrow(), vec![2, 1]);
    }
}
