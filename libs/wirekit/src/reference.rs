//! Per-reference binding engine.
//!
//! A [`ReferenceManager`] exists for every declared reference of every
//! component instance. It tracks the matching providers currently visible in
//! the registry (`tracked`, the candidate set), the providers actually bound
//! to a live instance (`bound`), and the satisfaction flag derived from the
//! cardinality floor. Registry events are translated into a [`RefOutcome`]
//! that the owning component manager turns into callbacks and state-machine
//! transitions; the manager itself never invokes component code.
//!
//! Reference managers are owned exclusively by their component manager and
//! are only touched from its serialized task loop, so all methods take
//! `&mut self` without further locking.

use std::sync::Arc;
use std::sync::OnceLock;

use crate::filter::TargetFilter;
use crate::metadata::{BindingPolicy, ReferenceMetadata};
use crate::registry::{
    sort_by_ranking, ProviderHandle, ProviderObject, ServiceRegistry,
};

/// A bound provider: handle plus lazily-resolved, cached object.
///
/// Owned by exactly one reference manager at a time; the cached object is
/// released against the registry when the pair leaves the bound set.
pub struct RefPair {
    handle: ProviderHandle,
    object: OnceLock<Option<ProviderObject>>,
}

impl RefPair {
    pub(crate) fn new(handle: ProviderHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            object: OnceLock::new(),
        })
    }

    pub fn handle(&self) -> &ProviderHandle {
        &self.handle
    }

    /// Resolve the provider object, caching the result (including a failed
    /// resolution, which stays failed for this pair).
    pub fn object(&self, registry: &ServiceRegistry) -> Option<ProviderObject> {
        self.object
            .get_or_init(|| registry.resolve(&self.handle))
            .clone()
    }

    /// True once a resolution attempt happened and produced an object.
    pub fn is_resolved(&self) -> bool {
        matches!(self.object.get(), Some(Some(_)))
    }

    /// Give back the use acquired by a successful resolution.
    pub(crate) fn release(&self, registry: &ServiceRegistry) {
        if self.is_resolved() {
            registry.release(&self.handle);
        }
    }
}

impl std::fmt::Debug for RefPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefPair")
            .field("handle", &self.handle)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// What the owning component manager must do in response to a registry
/// event on this reference.
#[derive(Debug)]
pub(crate) enum RefOutcome {
    /// Nothing to do.
    Ignored,
    /// The satisfaction flag flipped while no instance was live; the owner
    /// re-evaluates its state.
    SatisfactionChanged,
    /// Dynamic policy, live instance: bind `bind` (if any), then unbind
    /// `unbind` (if any), in that order. The owner re-checks satisfaction
    /// afterwards.
    Rebind {
        bind: Option<Arc<RefPair>>,
        unbind: Option<Arc<RefPair>>,
    },
    /// A bound provider's properties changed; fire the updated callback.
    Updated(Arc<RefPair>),
    /// Static policy: the instance can no longer keep its captured binding
    /// (or greedy found a better one); deactivate and reactivate.
    Reactivate,
}

pub(crate) struct ReferenceManager {
    meta: ReferenceMetadata,
    /// Configuration-supplied filter overriding the declared one.
    target_override: Option<TargetFilter>,
    /// All currently matching providers, ranking order.
    tracked: Vec<ProviderHandle>,
    /// Providers bound to the live instance, in bind order.
    bound: Vec<Arc<RefPair>>,
    satisfied: bool,
}

impl ReferenceManager {
    pub fn new(meta: ReferenceMetadata) -> Self {
        let satisfied = !meta.cardinality().is_mandatory();
        Self {
            meta,
            target_override: None,
            tracked: Vec::new(),
            bound: Vec::new(),
            satisfied,
        }
    }

    pub fn meta(&self) -> &ReferenceMetadata {
        &self.meta
    }

    fn effective_filter(&self) -> Option<&TargetFilter> {
        self.target_override.as_ref().or(self.meta.filter())
    }

    /// Seed the candidate set from the registry (on enable).
    pub fn init(&mut self, registry: &ServiceRegistry) {
        self.tracked = registry.find_matching(self.meta.capability(), self.effective_filter());
        self.recompute_satisfaction();
    }

    /// Drop all candidate state (on disable). The bound set must already be
    /// empty at this point.
    pub fn reset(&mut self) {
        debug_assert!(self.bound.is_empty());
        self.tracked.clear();
        self.satisfied = !self.meta.cardinality().is_mandatory();
    }

    /// O(1) satisfaction query.
    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    pub fn tracked(&self) -> &[ProviderHandle] {
        &self.tracked
    }

    pub fn bound(&self) -> &[Arc<RefPair>] {
        &self.bound
    }

    /// Bound pairs in ranking order (the order value resolution sees).
    pub fn bound_in_ranking_order(&self) -> Vec<Arc<RefPair>> {
        let mut pairs = self.bound.clone();
        pairs.sort_by(|a, b| {
            b.handle()
                .ranking()
                .cmp(&a.handle().ranking())
                .then_with(|| a.handle().id().cmp(&b.handle().id()))
        });
        pairs
    }

    /// The providers an activation happening now would bind: the best one
    /// for unary cardinality, the whole candidate set for multiple.
    pub fn selection(&self) -> Vec<ProviderHandle> {
        if self.meta.cardinality().is_multiple() {
            self.tracked.clone()
        } else {
            self.tracked.first().cloned().into_iter().collect()
        }
    }

    /// Materialize the bound set from the current selection (during
    /// activation). Returns the pairs in bind order.
    pub fn bind_initial(&mut self) -> Vec<Arc<RefPair>> {
        debug_assert!(self.bound.is_empty());
        self.bound = self
            .selection()
            .into_iter()
            .map(RefPair::new)
            .collect();
        self.bound.clone()
    }

    /// Drain the bound set (during deactivation), in bind order. The caller
    /// fires unbind callbacks in reverse and releases each pair.
    pub fn take_bound(&mut self) -> Vec<Arc<RefPair>> {
        std::mem::take(&mut self.bound)
    }

    /// Apply (or clear) a configuration-supplied target filter. Returns true
    /// when the candidate set changed.
    pub fn set_target_override(
        &mut self,
        filter: Option<TargetFilter>,
        registry: &ServiceRegistry,
    ) -> bool {
        if self.target_override == filter {
            return false;
        }
        self.target_override = filter;
        let before: Vec<u64> = self.tracked.iter().map(|h| h.id()).collect();
        self.init(registry);
        let after: Vec<u64> = self.tracked.iter().map(|h| h.id()).collect();
        before != after
    }

    fn recompute_satisfaction(&mut self) -> bool {
        let now = self.tracked.len() >= self.meta.cardinality().floor();
        let changed = now != self.satisfied;
        self.satisfied = now;
        changed
    }

    fn matches(&self, handle: &ProviderHandle) -> bool {
        handle.capability() == self.meta.capability()
            && self
                .effective_filter()
                .map(|f| f.matches(handle.properties()))
                .unwrap_or(true)
    }

    fn tracked_position(&self, handle: &ProviderHandle) -> Option<usize> {
        self.tracked.iter().position(|h| h == handle)
    }

    fn bound_position(&self, handle: &ProviderHandle) -> Option<usize> {
        self.bound.iter().position(|p| p.handle() == handle)
    }

    /// Would binding `candidate` change what an activation selects?
    fn changes_selection(&self, candidate: &ProviderHandle) -> bool {
        if self.meta.cardinality().is_multiple() {
            return true;
        }
        match self.bound.first() {
            Some(current) => candidate.outranks(current.handle()),
            None => true,
        }
    }

    pub fn on_provider_added(&mut self, handle: ProviderHandle, active: bool) -> RefOutcome {
        if !self.matches(&handle) || self.tracked_position(&handle).is_some() {
            return RefOutcome::Ignored;
        }
        self.tracked.push(handle.clone());
        sort_by_ranking(&mut self.tracked);
        let changed = self.recompute_satisfaction();

        if !active {
            return if changed {
                RefOutcome::SatisfactionChanged
            } else {
                RefOutcome::Ignored
            };
        }

        match self.meta.policy() {
            BindingPolicy::Dynamic => {
                if self.meta.cardinality().is_multiple() {
                    let pair = RefPair::new(handle);
                    self.bound.push(Arc::clone(&pair));
                    RefOutcome::Rebind {
                        bind: Some(pair),
                        unbind: None,
                    }
                } else if self.bound.is_empty() {
                    let pair = RefPair::new(handle);
                    self.bound.push(Arc::clone(&pair));
                    RefOutcome::Rebind {
                        bind: Some(pair),
                        unbind: None,
                    }
                } else if self.meta.is_greedy() && self.changes_selection(&handle) {
                    let old = self.bound.remove(0);
                    let pair = RefPair::new(handle);
                    self.bound.push(Arc::clone(&pair));
                    RefOutcome::Rebind {
                        bind: Some(pair),
                        unbind: Some(old),
                    }
                } else {
                    // reluctant: keep the current binding
                    RefOutcome::Ignored
                }
            }
            BindingPolicy::Static => {
                // A static binding is fixed at activation time; a new
                // provider only matters to a greedy reference.
                if self.meta.is_greedy() && self.changes_selection(&handle) {
                    RefOutcome::Reactivate
                } else {
                    RefOutcome::Ignored
                }
            }
        }
    }

    pub fn on_provider_removed(&mut self, handle: &ProviderHandle, active: bool) -> RefOutcome {
        let was_tracked = match self.tracked_position(handle) {
            Some(pos) => {
                self.tracked.remove(pos);
                true
            }
            None => false,
        };
        let changed = self.recompute_satisfaction();

        if let Some(pos) = self.bound_position(handle) {
            if active {
                return match self.meta.policy() {
                    BindingPolicy::Static => RefOutcome::Reactivate,
                    BindingPolicy::Dynamic => {
                        let old = self.bound.remove(pos);
                        let bind = if self.meta.cardinality().is_multiple() {
                            None
                        } else {
                            // best remaining candidate replaces the binding
                            self.tracked.first().cloned().map(|h| {
                                let pair = RefPair::new(h);
                                self.bound.push(Arc::clone(&pair));
                                pair
                            })
                        };
                        RefOutcome::Rebind {
                            bind,
                            unbind: Some(old),
                        }
                    }
                };
            }
            self.bound.remove(pos);
        }

        if was_tracked && changed {
            RefOutcome::SatisfactionChanged
        } else {
            RefOutcome::Ignored
        }
    }

    pub fn on_provider_modified(&mut self, handle: ProviderHandle, active: bool) -> RefOutcome {
        if handle.capability() != self.meta.capability() {
            return RefOutcome::Ignored;
        }
        let matches_now = self
            .effective_filter()
            .map(|f| f.matches(handle.properties()))
            .unwrap_or(true);
        let tracked_pos = self.tracked_position(&handle);

        match (tracked_pos, matches_now) {
            (None, true) => self.on_provider_added(handle, active),
            (Some(_), false) => self.on_provider_removed(&handle, active),
            (None, false) => RefOutcome::Ignored,
            (Some(pos), true) => {
                // refresh the property snapshot and re-rank
                self.tracked[pos] = handle.clone();
                sort_by_ranking(&mut self.tracked);

                if !active {
                    return RefOutcome::Ignored;
                }
                if let Some(bpos) = self.bound_position(&handle) {
                    if self.meta.has_updated_callback() {
                        return RefOutcome::Updated(Arc::clone(&self.bound[bpos]));
                    }
                    return RefOutcome::Ignored;
                }
                // An unbound provider whose ranking rose is handled like a
                // freshly added better candidate.
                if self.meta.is_greedy() && self.changes_selection(&handle) {
                    match self.meta.policy() {
                        BindingPolicy::Static => RefOutcome::Reactivate,
                        BindingPolicy::Dynamic => {
                            if self.meta.cardinality().is_multiple() {
                                return RefOutcome::Ignored;
                            }
                            let old = (!self.bound.is_empty()).then(|| self.bound.remove(0));
                            let pair = RefPair::new(handle);
                            self.bound.push(Arc::clone(&pair));
                            RefOutcome::Rebind {
                                bind: Some(pair),
                                unbind: old,
                            }
                        }
                    }
                } else {
                    RefOutcome::Ignored
                }
            }
        }
    }
}
