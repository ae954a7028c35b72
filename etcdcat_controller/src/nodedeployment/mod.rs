//! The roll-out engine: one EtcdNodeDeployment drives a chain of
//! EtcdNodeSets, at most two of them populated at any instant.
//!
//! The current set is recognised by a stable hash of the node template; the
//! bootstrap flag is excluded from the hash so demoting the first node does
//! not read as a new revision and replace it. Replicas move between the
//! current and the old set inside the surge/unavailable budgets, and drained
//! old sets are pruned down to the revision history limit.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use etcdcat_definitions::names;
use etcdcat_definitions::node::{semantic_eq, EtcdNodeTemplateSpec};
use etcdcat_definitions::{
    EtcdNodeDeployment, EtcdNodeDeploymentStatus, EtcdNodeSet, EtcdNodeSetSpec, RollingUpdate,
};

use crate::expectations;
use crate::k8s;
use crate::{Context, Error, Result};

const RESYNC: Duration = Duration::from_secs(300);
const ROLL_RESYNC: Duration = Duration::from_secs(5);

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    tokio::spawn(expectations::observe_children(
        Api::<EtcdNodeSet>::all(client.clone()),
        ctx.set_expectations.clone(),
    ));
    let deployments = Api::<EtcdNodeDeployment>::all(client.clone());
    Controller::new(deployments, watcher::Config::default())
        .owns(
            Api::<EtcdNodeSet>::all(client),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "reconciled"),
                Err(err) => warn!(error = %err, "node deployment reconcile failed"),
            }
        })
        .await;
}

fn error_policy(dep: Arc<EtcdNodeDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        kind = "EtcdNodeDeployment",
        namespace = %dep.namespace().unwrap_or_default(),
        name = %dep.name_any(),
        reason = %error,
        "reconcile failed"
    );
    Action::requeue(Duration::from_secs(15))
}

/// The template as it participates in revision hashing: the first-node flag
/// is a latch, not a revision.
fn roll_template(template: &EtcdNodeTemplateSpec) -> EtcdNodeTemplateSpec {
    let mut t = template.clone();
    t.spec.as_first_node = false;
    t
}

/// Stable, version-independent revision hash.
///
/// The collision count participates, so a name collision self-heals by
/// producing a fresh suffix on the next pass.
pub fn template_hash(template: &EtcdNodeTemplateSpec, collision_count: i32) -> String {
    let canonical = serde_json::to_string(&roll_template(template)).unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical.as_bytes());
    hasher.update(&collision_count.to_le_bytes());
    hasher.finalize().to_hex()[..10].to_string()
}

fn roll_equal(a: &EtcdNodeTemplateSpec, b: &EtcdNodeTemplateSpec) -> bool {
    semantic_eq(&roll_template(a), &roll_template(b))
}

/// Resolve surge/unavailable to plain counts for `desired` replicas.
///
/// Percentages round up for surge and down for unavailable; when both come
/// out zero, unavailable becomes one so the roll can make progress at all.
pub fn resolve_budgets(desired: i32, rolling: Option<&RollingUpdate>) -> Result<(i32, i32)> {
    let default = IntOrString::String("25%".to_string());
    let surge_spec = rolling
        .and_then(|r| r.max_surge.clone())
        .unwrap_or_else(|| default.clone());
    let unavailable_spec = rolling
        .and_then(|r| r.max_unavailable.clone())
        .unwrap_or(default);
    let max_surge = resolve_bound(&surge_spec, desired, true)?;
    let mut max_unavailable = resolve_bound(&unavailable_spec, desired, false)?;
    if max_surge == 0 && max_unavailable == 0 {
        max_unavailable = 1;
    }
    Ok((max_surge, max_unavailable))
}

fn resolve_bound(value: &IntOrString, desired: i32, round_up: bool) -> Result<i32> {
    match value {
        IntOrString::Int(i) => Ok((*i).max(0)),
        IntOrString::String(s) => {
            let Some(percent) = s.strip_suffix('%') else {
                return Err(Error::InvalidRollingUpdate(s.clone()));
            };
            let percent: i64 = percent
                .trim()
                .parse()
                .map_err(|_| Error::InvalidRollingUpdate(s.clone()))?;
            if !(0..=100).contains(&percent) {
                return Err(Error::InvalidRollingUpdate(s.clone()));
            }
            let scaled = desired as i64 * percent;
            let resolved = if round_up {
                (scaled + 99) / 100
            } else {
                scaled / 100
            };
            Ok(resolved as i32)
        }
    }
}

#[instrument(skip(dep, ctx), fields(
    kind = "EtcdNodeDeployment",
    namespace = %dep.namespace().unwrap_or_default(),
    name = %dep.name_any(),
))]
async fn reconcile(dep: Arc<EtcdNodeDeployment>, ctx: Arc<Context>) -> Result<Action> {
    if dep.meta().deletion_timestamp.is_some() {
        // owner references cascade the sets and their nodes
        ctx.set_expectations.forget(&k8s::owner_key(dep.as_ref()));
        return Ok(Action::await_change());
    }
    let namespace = k8s::namespace_of(dep.as_ref())?;
    let name = dep.name_any();
    let owner_key = k8s::owner_key(dep.as_ref());
    if !ctx.set_expectations.satisfied(&owner_key) {
        debug!(reason = "expectations pending", "requeueing");
        return Ok(Action::requeue(ROLL_RESYNC));
    }
    let uid = dep.uid().ok_or_else(|| Error::MissingUid {
        kind: "EtcdNodeDeployment".to_string(),
        name: name.clone(),
    })?;

    let sets_api: Api<EtcdNodeSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let sets = k8s::list_owned(&sets_api, &dep.spec.selector, &uid).await?;

    let mut collision_count = dep
        .status
        .as_ref()
        .map(|s| s.collision_count)
        .unwrap_or(0);
    let hash = template_hash(&dep.spec.template, collision_count);
    let set_name = names::node_set_name(&name, &hash);
    let hashed = hashed_template(&dep.spec.template, &hash);

    let current = match sets.iter().find(|s| roll_equal(&s.spec.template, &hashed)) {
        Some(existing) => {
            // a latch flip (asFirstNode true -> false) is the one in-place
            // template edit a set may receive
            if !semantic_eq(&existing.spec.template, &hashed) {
                info!(set = %existing.name_any(), "updating set template latch");
                let patch = serde_json::json!({"spec": {"template": hashed}});
                sets_api
                    .patch(&existing.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
                    .await?
            } else {
                existing.clone()
            }
        }
        None => {
            if sets.iter().any(|s| s.name_any() == set_name) {
                collision_count += 1;
                warn!(set = %set_name, collision_count, "set name collision; re-hashing");
                let api: Api<EtcdNodeDeployment> =
                    Api::namespaced(ctx.client.clone(), &namespace);
                k8s::patch_status(
                    &api,
                    &name,
                    &serde_json::json!({"collisionCount": collision_count}),
                )
                .await?;
                return Ok(Action::requeue(Duration::ZERO));
            }
            create_current_set(&sets_api, dep.as_ref(), &ctx, &owner_key, &set_name, &hashed)
                .await?
        }
    };
    let current_name = current.name_any();

    let mut old: Vec<&EtcdNodeSet> = sets
        .iter()
        .filter(|s| s.name_any() != current_name)
        .collect();
    old.sort_by(|a, b| {
        a.creation_timestamp()
            .cmp(&b.creation_timestamp())
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let desired = dep.spec.replicas;
    let (max_surge, max_unavailable) = resolve_budgets(desired, dep.spec.rolling_update.as_ref())?;

    // scale up (or directly in) the current set
    let total: i32 = current.spec.replicas + old.iter().map(|s| s.spec.replicas).sum::<i32>();
    let target = current_set_target(current.spec.replicas, total, desired, max_surge);
    if target != current.spec.replicas {
        info!(set = %current_name, from = current.spec.replicas, to = target, "scaling current set");
        scale_set(&sets_api, &current_name, target).await?;
    }

    // scale down old sets, oldest first, inside the availability budget
    let total_ready: i32 = sets
        .iter()
        .map(|s| s.status.as_ref().map(|st| st.ready_replicas).unwrap_or(0))
        .sum();
    let mut budget = scale_down_budget(total_ready, desired, max_unavailable);
    for old_set in &old {
        if budget == 0 {
            break;
        }
        if old_set.spec.replicas == 0 {
            continue;
        }
        let reduce = old_set.spec.replicas.min(budget);
        let to = old_set.spec.replicas - reduce;
        info!(set = %old_set.name_any(), from = old_set.spec.replicas, to, "scaling down old set");
        scale_set(&sets_api, &old_set.name_any(), to).await?;
        budget -= reduce;
    }

    prune_history(&sets_api, &ctx, &owner_key, &old, dep.spec.revision_history_limit).await?;

    let ready_current = current
        .status
        .as_ref()
        .map(|s| s.ready_replicas)
        .unwrap_or(0);
    let observed: i32 = sets
        .iter()
        .map(|s| s.status.as_ref().map(|st| st.replicas).unwrap_or(0))
        .sum();
    let status = EtcdNodeDeploymentStatus {
        replicas: observed,
        ready_replicas: total_ready,
        updated_replicas: ready_current,
        unavailable_replicas: (desired - total_ready).max(0),
        collision_count,
    };
    let api: Api<EtcdNodeDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
    k8s::patch_status(&api, &name, &status).await?;

    let rolling = old.iter().any(|s| s.spec.replicas > 0);
    Ok(Action::requeue(if rolling { ROLL_RESYNC } else { RESYNC }))
}

/// How many replicas the current set should run right now: fill whatever
/// room the surge budget leaves, never beyond the desired count, and shrink
/// straight to it when scaling in.
fn current_set_target(current_replicas: i32, total_replicas: i32, desired: i32, max_surge: i32) -> i32 {
    let slack = desired + max_surge - total_replicas;
    (current_replicas + slack).min(desired).max(0)
}

/// How many replicas may come off the old sets without dropping below
/// `desired - maxUnavailable` ready members.
fn scale_down_budget(total_ready: i32, desired: i32, max_unavailable: i32) -> i32 {
    (total_ready - (desired - max_unavailable)).max(0)
}

fn hashed_template(template: &EtcdNodeTemplateSpec, hash: &str) -> EtcdNodeTemplateSpec {
    let mut t = template.clone();
    t.labels
        .insert(names::LABEL_TEMPLATE_HASH.to_string(), hash.to_string());
    t
}

async fn create_current_set(
    sets_api: &Api<EtcdNodeSet>,
    dep: &EtcdNodeDeployment,
    ctx: &Context,
    owner_key: &str,
    set_name: &str,
    template: &EtcdNodeTemplateSpec,
) -> Result<EtcdNodeSet> {
    let namespace = k8s::namespace_of(dep)?;
    let mut selector = dep.spec.selector.clone();
    if let Some(hash) = template.labels.get(names::LABEL_TEMPLATE_HASH) {
        selector.insert(names::LABEL_TEMPLATE_HASH.to_string(), hash.clone());
    }
    let set = EtcdNodeSet {
        metadata: ObjectMeta {
            name: Some(set_name.to_string()),
            namespace: Some(namespace),
            labels: Some(template.labels.clone()),
            owner_references: Some(vec![k8s::owner_reference(dep)?]),
            ..ObjectMeta::default()
        },
        spec: EtcdNodeSetSpec {
            replicas: 0,
            selector,
            template: template.clone(),
        },
        status: None,
    };
    info!(set = %set_name, "creating node set for new revision");
    ctx.set_expectations.expect_creates(owner_key, 1);
    match sets_api.create(&PostParams::default(), &set).await {
        Ok(created) => Ok(created),
        Err(err) => {
            // unwind so the lost create cannot wedge the deployment
            ctx.set_expectations.observe_create(owner_key);
            Err(err.into())
        }
    }
}

async fn scale_set(api: &Api<EtcdNodeSet>, name: &str, replicas: i32) -> Result<()> {
    let patch = serde_json::json!({"spec": {"replicas": replicas}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Delete drained old sets beyond the history limit, oldest first.
async fn prune_history(
    sets_api: &Api<EtcdNodeSet>,
    ctx: &Context,
    owner_key: &str,
    old: &[&EtcdNodeSet],
    limit: i32,
) -> Result<()> {
    let drained: Vec<&&EtcdNodeSet> = old
        .iter()
        .filter(|s| {
            s.spec.replicas == 0
                && s.status.as_ref().map(|st| st.replicas).unwrap_or(0) == 0
        })
        .collect();
    let excess = drained.len() as i32 - limit.max(0);
    if excess <= 0 {
        return Ok(());
    }
    for set in drained.into_iter().take(excess as usize) {
        let set_name = set.name_any();
        info!(set = %set_name, "pruning drained node set beyond history limit");
        ctx.set_expectations.expect_delete(owner_key, &set_name);
        match sets_api.delete(&set_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                ctx.set_expectations.observe_delete(owner_key, &set_name);
            }
            Err(err) => {
                ctx.set_expectations.observe_delete(owner_key, &set_name);
                return Err(err.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use etcdcat_definitions::{EtcdNodeSpec, LocalObjectRef, SecretKeyRef};

    fn template(version: &str, as_first_node: bool) -> EtcdNodeTemplateSpec {
        EtcdNodeTemplateSpec {
            labels: BTreeMap::new(),
            spec: EtcdNodeSpec {
                version: version.into(),
                as_first_node,
                ca_certificate_ref: SecretKeyRef::to("ca-example", "tls.crt"),
                ca_private_key_ref: SecretKeyRef::to("ca-example", "tls.key"),
                client_certificate_ref: SecretKeyRef::to("api-client-example", "tls.crt"),
                client_private_key_ref: SecretKeyRef::to("api-client-example", "tls.key"),
                ssh_private_key_ref: SecretKeyRef::to("ssh-keypair-example", "ssh-privatekey"),
                ssh_public_key_ref: SecretKeyRef::to("ssh-keypair-example", "ssh-publickey"),
                service_ref: LocalObjectRef::to("example"),
                image_persistent_volume_claim_ref: LocalObjectRef::to("image-example"),
                login_password_secret_key_ref: None,
            },
        }
    }

    #[test]
    fn hash_is_stable_across_calls() {
        let t = template("3.5.1", false);
        assert_eq!(template_hash(&t, 0), template_hash(&t, 0));
        assert_eq!(template_hash(&t, 0).len(), 10);
    }

    #[test]
    fn hash_ignores_the_first_node_latch() {
        let plain = template("3.5.1", false);
        let first = template("3.5.1", true);
        assert_eq!(template_hash(&plain, 0), template_hash(&first, 0));
        assert!(roll_equal(&plain, &first));
    }

    #[test]
    fn hash_tracks_version_changes_and_collisions() {
        let old = template("3.5.1", false);
        let new = template("3.5.2", false);
        assert_ne!(template_hash(&old, 0), template_hash(&new, 0));
        assert_ne!(template_hash(&old, 0), template_hash(&old, 1));
        assert!(!roll_equal(&old, &new));
    }

    #[test]
    fn default_budgets_round_like_kubernetes() {
        // 25% of 3: surge rounds up to 1, unavailable rounds down to 0
        let (surge, unavailable) = resolve_budgets(3, None).unwrap();
        assert_eq!((surge, unavailable), (1, 0));

        // 25% of 4 resolves exactly
        let (surge, unavailable) = resolve_budgets(4, None).unwrap();
        assert_eq!((surge, unavailable), (1, 1));
    }

    #[test]
    fn zero_zero_budgets_get_an_unavailable_fencepost() {
        let rolling = RollingUpdate {
            max_surge: Some(IntOrString::Int(0)),
            max_unavailable: Some(IntOrString::Int(0)),
        };
        let (surge, unavailable) = resolve_budgets(3, Some(&rolling)).unwrap();
        assert_eq!((surge, unavailable), (0, 1));
    }

    #[test]
    fn integer_budgets_pass_through() {
        let rolling = RollingUpdate {
            max_surge: Some(IntOrString::Int(2)),
            max_unavailable: Some(IntOrString::String("50%".into())),
        };
        let (surge, unavailable) = resolve_budgets(3, Some(&rolling)).unwrap();
        assert_eq!((surge, unavailable), (2, 1));
    }

    #[test]
    fn malformed_percentages_are_rejected() {
        let rolling = RollingUpdate {
            max_surge: Some(IntOrString::String("banana".into())),
            max_unavailable: None,
        };
        assert!(matches!(
            resolve_budgets(3, Some(&rolling)),
            Err(Error::InvalidRollingUpdate(_))
        ));
    }

    #[test]
    fn version_roll_of_three_moves_one_replica_at_a_time() {
        // surge=1, unavailable=0 for replicas=3 at the 25% defaults
        let (surge, unavailable) = resolve_budgets(3, None).unwrap();

        // fresh revision set next to a full old set: surge room is one
        assert_eq!(current_set_target(0, 3, 3, surge), 1);
        // nothing may come down while only three members are ready
        assert_eq!(scale_down_budget(3, 3, unavailable), 0);
        // the surged member turns ready, so one old replica may go
        assert_eq!(scale_down_budget(4, 3, unavailable), 1);
        // after the old set shrank, the current set may grow again
        assert_eq!(current_set_target(1, 3, 3, surge), 2);
    }

    #[test]
    fn scale_in_goes_straight_to_the_desired_count() {
        let (surge, _) = resolve_budgets(1, None).unwrap();
        assert_eq!(current_set_target(3, 3, 1, surge), 1);
    }

    #[test]
    fn drain_to_zero_empties_every_set() {
        let (surge, unavailable) = resolve_budgets(0, None).unwrap();
        assert_eq!(current_set_target(2, 3, 0, surge), 0);
        // the fencepost keeps the budget positive so old sets drain too
        assert_eq!(unavailable, 1);
        assert!(scale_down_budget(1, 0, unavailable) >= 1);
    }

    #[test]
    fn hashed_template_carries_the_hash_label() {
        let t = template("3.5.1", false);
        let hash = template_hash(&t, 0);
        let hashed = hashed_template(&t, &hash);
        assert_eq!(
            hashed.labels.get(names::LABEL_TEMPLATE_HASH),
            Some(&hash)
        );
    }
}
