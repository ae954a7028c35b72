//! In-process bookkeeping of creates and deletes a reconciler has issued but
//! not yet seen back on its watch.
//!
//! The store is eventually consistent from the controller's point of view: a
//! list issued right after a create can miss the new object, and a reconciler
//! trusting that list would create again. Until an owner's expectations are
//! satisfied its reconciler early-returns with a requeue. A staleness valve
//! unblocks the owner if a watch event is lost for good.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

const DEFAULT_STALENESS: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Expectation {
    pending_creates: u32,
    pending_deletes: HashSet<String>,
    recorded_at: Instant,
}

impl Expectation {
    fn fresh() -> Expectation {
        Expectation {
            pending_creates: 0,
            pending_deletes: HashSet::new(),
            recorded_at: Instant::now(),
        }
    }

    fn fulfilled(&self) -> bool {
        self.pending_creates == 0 && self.pending_deletes.is_empty()
    }
}

/// Tracker owned by the controller context; tests instantiate their own.
#[derive(Debug)]
pub struct Expectations {
    inner: Mutex<HashMap<String, Expectation>>,
    staleness: Duration,
}

impl Default for Expectations {
    fn default() -> Expectations {
        Expectations::with_staleness(DEFAULT_STALENESS)
    }
}

impl Expectations {
    pub fn with_staleness(staleness: Duration) -> Expectations {
        Expectations {
            inner: Mutex::new(HashMap::new()),
            staleness,
        }
    }

    /// Record that `count` creates were just issued for `owner`.
    pub fn expect_creates(&self, owner: &str, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(owner.to_string())
            .or_insert_with(Expectation::fresh);
        entry.pending_creates += count;
        entry.recorded_at = Instant::now();
    }

    /// Record that a delete of `child` was just issued for `owner`.
    pub fn expect_delete(&self, owner: &str, child: &str) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(owner.to_string())
            .or_insert_with(Expectation::fresh);
        entry.pending_deletes.insert(child.to_string());
        entry.recorded_at = Instant::now();
    }

    /// A watch delivered a create for one of `owner`'s children.
    pub fn observe_create(&self, owner: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(owner) {
            entry.pending_creates = entry.pending_creates.saturating_sub(1);
            if entry.fulfilled() {
                inner.remove(owner);
            }
        }
    }

    /// A watch delivered a delete for one of `owner`'s children.
    pub fn observe_delete(&self, owner: &str, child: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(owner) {
            entry.pending_deletes.remove(child);
            if entry.fulfilled() {
                inner.remove(owner);
            }
        }
    }

    /// Whether `owner` may trust its next list.
    ///
    /// True once every recorded create and delete has been observed, or once
    /// the record is older than the staleness valve.
    pub fn satisfied(&self, owner: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(owner) {
            None => true,
            Some(entry) if entry.fulfilled() => true,
            Some(entry) if entry.recorded_at.elapsed() > self.staleness => {
                warn!(owner, "expectations went stale; assuming a lost watch event");
                inner.remove(owner);
                true
            }
            Some(_) => false,
        }
    }

    /// Drop everything recorded for `owner`, e.g. when it is being deleted.
    pub fn forget(&self, owner: &str) {
        self.inner.lock().unwrap().remove(owner);
    }
}

/// Owner key (`namespace/name`) of the controlling owner reference.
pub fn controller_owner_key<K: kube::Resource>(obj: &K) -> Option<String> {
    let namespace = obj.meta().namespace.as_deref()?;
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
        .map(|o| format!("{}/{}", namespace, o.name))
}

/// Watch one child kind and lower expectations as events arrive.
///
/// Runs for the life of the process next to the controller that raises the
/// expectations. Creates are recognised by first sight of a uid, so the
/// replayed objects of a restarted watch do not double-lower.
pub async fn observe_children<K>(api: Api<K>, expectations: Arc<Expectations>)
where
    K: kube::Resource + Clone + std::fmt::Debug + DeserializeOwned + Send + 'static,
    K::DynamicType: Default,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                if let Some(uid) = obj.uid() {
                    if seen.insert(uid) {
                        if let Some(owner) = controller_owner_key(&obj) {
                            debug!(owner, child = %obj.name_any(), "observed create");
                            expectations.observe_create(&owner);
                        }
                    }
                }
            }
            Ok(Event::Delete(obj)) => {
                if let Some(uid) = obj.uid() {
                    seen.remove(&uid);
                }
                if let Some(owner) = controller_owner_key(&obj) {
                    debug!(owner, child = %obj.name_any(), "observed delete");
                    expectations.observe_delete(&owner, &obj.name_any());
                }
            }
            Ok(Event::Init) | Ok(Event::InitDone) => {}
            Err(err) => {
                warn!(error = %err, "expectation watch hiccup");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_owners_are_satisfied() {
        let exp = Expectations::default();
        assert!(exp.satisfied("default/example"));
    }

    #[test]
    fn creates_block_until_observed() {
        let exp = Expectations::default();
        exp.expect_creates("default/example", 2);
        assert!(!exp.satisfied("default/example"));
        exp.observe_create("default/example");
        assert!(!exp.satisfied("default/example"));
        exp.observe_create("default/example");
        assert!(exp.satisfied("default/example"));
    }

    #[test]
    fn deletes_block_until_their_child_disappears() {
        let exp = Expectations::default();
        exp.expect_delete("default/example", "example-abc12-xk9f2");
        assert!(!exp.satisfied("default/example"));
        // unrelated delete observation changes nothing
        exp.observe_delete("default/example", "example-abc12-other");
        assert!(!exp.satisfied("default/example"));
        exp.observe_delete("default/example", "example-abc12-xk9f2");
        assert!(exp.satisfied("default/example"));
    }

    #[test]
    fn unsolicited_observations_do_not_underflow() {
        let exp = Expectations::default();
        exp.observe_create("default/example");
        exp.expect_creates("default/example", 1);
        assert!(!exp.satisfied("default/example"));
        exp.observe_create("default/example");
        assert!(exp.satisfied("default/example"));
    }

    #[test]
    fn stale_expectations_unblock_the_owner() {
        let exp = Expectations::with_staleness(Duration::from_millis(1));
        exp.expect_creates("default/example", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(exp.satisfied("default/example"));
        // the stale record is dropped, not resurrected
        assert!(exp.satisfied("default/example"));
    }

    #[test]
    fn owners_are_tracked_independently() {
        let exp = Expectations::default();
        exp.expect_creates("default/a", 1);
        assert!(!exp.satisfied("default/a"));
        assert!(exp.satisfied("default/b"));
    }
}
