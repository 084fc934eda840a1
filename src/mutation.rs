use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverId(pub(crate) usize);

/// What a single mutation record reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// An attribute was written. `name` is the attribute; the new value is
    /// read off the target when the record is processed.
    Attributes { name: String },
    /// Children were inserted under the target.
    ChildList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub kind: MutationKind,
}

/// Queues mutation records per observed document root. At most one observer
/// exists per root; re-observing returns the existing one so a re-patched
/// frame never reports twice.
#[derive(Debug, Default)]
pub struct MutationRegistry {
    observers: HashMap<NodeId, ObserverId>,
    queues: HashMap<ObserverId, Vec<MutationRecord>>,
    next: usize,
}

impl MutationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts observing `root`, or returns the observer already attached.
    pub fn observe(&mut self, root: NodeId) -> ObserverId {
        if let Some(id) = self.observers.get(&root) {
            return *id;
        }
        self.next += 1;
        let id = ObserverId(self.next);
        self.observers.insert(root, id);
        self.queues.insert(id, Vec::new());
        id
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Records a mutation under whichever observed root contains the target.
    /// Mutations in unobserved trees are dropped, matching an observer that
    /// was never attached.
    pub fn enqueue(&mut self, dom: &Dom, record: MutationRecord) {
        let root = dom.tree_root(record.target);
        let Some(id) = self.observers.get(&root) else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(id) {
            queue.push(record);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.queues.values().any(|queue| !queue.is_empty())
    }

    /// Drains every queue, oldest observer first, preserving record order
    /// within each queue.
    pub fn take_batches(&mut self) -> Vec<MutationRecord> {
        let mut ids: Vec<ObserverId> = self.queues.keys().copied().collect();
        ids.sort();
        let mut records = Vec::new();
        for id in ids {
            if let Some(queue) = self.queues.get_mut(&id) {
                records.append(queue);
            }
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_child(dom: &mut Dom) -> (NodeId, NodeId) {
        let root = dom.create_document();
        let div = dom.create_element(root, "div".to_string(), Vec::new());
        (root, div)
    }

    #[test]
    fn observe_is_idempotent_per_root() {
        let mut dom = Dom::new();
        let (root, _) = doc_with_child(&mut dom);
        let mut registry = MutationRegistry::new();
        let first = registry.observe(root);
        let second = registry.observe(root);
        assert_eq!(first, second);
        assert_eq!(registry.observer_count(), 1);
    }

    #[test]
    fn records_route_to_the_containing_root() {
        let mut dom = Dom::new();
        let (root, div) = doc_with_child(&mut dom);
        let (_, other_div) = doc_with_child(&mut dom);
        let mut registry = MutationRegistry::new();
        registry.observe(root);

        registry.enqueue(
            &dom,
            MutationRecord {
                target: div,
                added: Vec::new(),
                kind: MutationKind::Attributes { name: "src".to_string() },
            },
        );
        // Unobserved tree, dropped.
        registry.enqueue(
            &dom,
            MutationRecord {
                target: other_div,
                added: Vec::new(),
                kind: MutationKind::ChildList,
            },
        );

        let records = registry.take_batches();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, div);
    }

    #[test]
    fn take_batches_drains_in_order() {
        let mut dom = Dom::new();
        let (root, div) = doc_with_child(&mut dom);
        let mut registry = MutationRegistry::new();
        registry.observe(root);

        for name in ["a", "b"] {
            registry.enqueue(
                &dom,
                MutationRecord {
                    target: div,
                    added: Vec::new(),
                    kind: MutationKind::Attributes { name: name.to_string() },
                },
            );
        }
        assert!(registry.has_pending());
        let records = registry.take_batches();
        assert_eq!(
            records
                .iter()
                .map(|r| match &r.kind {
                    MutationKind::Attributes { name } => name.as_str(),
                    MutationKind::ChildList => "childlist",
                })
                .collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(!registry.has_pending());
        assert!(registry.take_batches().is_empty());
    }
}
