//! Stateless fan-out/fan-in: the difference between a set's desired
//! replicas and the nodes it owns becomes creations or deletions, funneled
//! through the expectation tracker so a slow watch can never cause a
//! double-create.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use etcdcat_definitions::{EtcdNode, EtcdNodeSet, EtcdNodeSetStatus};

use crate::expectations;
use crate::k8s;
use crate::{Context, Error, Result};

const RESYNC: Duration = Duration::from_secs(300);
const EXPECTATION_RETRY: Duration = Duration::from_secs(5);

pub async fn run(ctx: Arc<Context>) {
    let client = ctx.client.clone();
    tokio::spawn(expectations::observe_children(
        Api::<EtcdNode>::all(client.clone()),
        ctx.node_expectations.clone(),
    ));
    let sets = Api::<EtcdNodeSet>::all(client.clone());
    Controller::new(sets, watcher::Config::default())
        .owns(Api::<EtcdNode>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => debug!(object = %obj, "reconciled"),
                Err(err) => warn!(error = %err, "node set reconcile failed"),
            }
        })
        .await;
}

fn error_policy(set: Arc<EtcdNodeSet>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        kind = "EtcdNodeSet",
        namespace = %set.namespace().unwrap_or_default(),
        name = %set.name_any(),
        reason = %error,
        "reconcile failed"
    );
    Action::requeue(Duration::from_secs(15))
}

/// Five lowercase alphanumerics, the kubernetes generateName convention.
fn name_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..5)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Deletion order when scaling in: nodes that never provisioned go first,
/// then nodes that are not Ready, then the oldest Ready members.
fn deletion_rank(node: &EtcdNode) -> u8 {
    if !node.is_provisioned() {
        0
    } else if !node.is_ready() {
        1
    } else {
        2
    }
}

fn sort_for_deletion(nodes: &mut [EtcdNode]) {
    nodes.sort_by(|a, b| {
        deletion_rank(a)
            .cmp(&deletion_rank(b))
            .then_with(|| a.creation_timestamp().cmp(&b.creation_timestamp()))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });
}

#[instrument(skip(set, ctx), fields(
    kind = "EtcdNodeSet",
    namespace = %set.namespace().unwrap_or_default(),
    name = %set.name_any(),
))]
async fn reconcile(set: Arc<EtcdNodeSet>, ctx: Arc<Context>) -> Result<Action> {
    if set.meta().deletion_timestamp.is_some() {
        ctx.node_expectations.forget(&k8s::owner_key(set.as_ref()));
        return Ok(Action::await_change());
    }
    let namespace = k8s::namespace_of(set.as_ref())?;
    let name = set.name_any();
    let owner_key = k8s::owner_key(set.as_ref());
    if !ctx.node_expectations.satisfied(&owner_key) {
        debug!(reason = "expectations pending", "requeueing");
        return Ok(Action::requeue(EXPECTATION_RETRY));
    }
    let uid = set.uid().ok_or_else(|| Error::MissingUid {
        kind: "EtcdNodeSet".to_string(),
        name: name.clone(),
    })?;

    let nodes_api: Api<EtcdNode> = Api::namespaced(ctx.client.clone(), &namespace);
    let owned = k8s::list_owned(&nodes_api, &set.spec.selector, &uid).await?;

    let diff = set.spec.replicas - owned.len() as i32;
    if diff > 0 {
        info!(count = diff, "scaling out node set");
        ctx.node_expectations.expect_creates(&owner_key, diff as u32);
        for _ in 0..diff {
            if let Err(err) = create_node(&nodes_api, set.as_ref(), &namespace).await {
                ctx.node_expectations.observe_create(&owner_key);
                return Err(err);
            }
        }
    } else if diff < 0 {
        let mut victims = owned.clone();
        sort_for_deletion(&mut victims);
        victims.truncate((-diff) as usize);
        info!(count = victims.len(), "scaling in node set");
        for victim in &victims {
            let victim_name = victim.name_any();
            ctx.node_expectations.expect_delete(&owner_key, &victim_name);
            match nodes_api.delete(&victim_name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    ctx.node_expectations.observe_delete(&owner_key, &victim_name);
                }
                Err(err) => {
                    ctx.node_expectations.observe_delete(&owner_key, &victim_name);
                    return Err(err.into());
                }
            }
        }
    }

    let template_labels = &set.spec.template.labels;
    let fully_labeled = owned
        .iter()
        .filter(|n| {
            template_labels
                .iter()
                .all(|(k, v)| n.labels().get(k) == Some(v))
        })
        .count() as i32;
    let observed_generation = set
        .status
        .as_ref()
        .map(|s| s.observed_generation)
        .unwrap_or(0)
        .max(set.metadata.generation.unwrap_or(0));
    let status = EtcdNodeSetStatus {
        replicas: owned.len() as i32,
        ready_replicas: owned.iter().filter(|n| n.is_ready()).count() as i32,
        fully_labeled_replicas: fully_labeled,
        observed_generation,
    };
    let api: Api<EtcdNodeSet> = Api::namespaced(ctx.client.clone(), &namespace);
    k8s::patch_status(&api, &name, &status).await?;

    Ok(Action::requeue(RESYNC))
}

async fn create_node(
    nodes_api: &Api<EtcdNode>,
    set: &EtcdNodeSet,
    namespace: &str,
) -> Result<()> {
    let owner = k8s::owner_reference(set)?;
    // regenerate the suffix on a name collision instead of failing the pass
    for _ in 0..3 {
        let node_name = format!("{}-{}", set.name_any(), name_suffix());
        let node = EtcdNode {
            metadata: ObjectMeta {
                name: Some(node_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(set.spec.template.labels.clone()),
                owner_references: Some(vec![owner.clone()]),
                ..ObjectMeta::default()
            },
            spec: set.spec.template.spec.clone(),
            status: None,
        };
        match nodes_api.create(&PostParams::default(), &node).await {
            Ok(_) => {
                debug!(node = %node_name, "created node");
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::requeue(
        Duration::from_secs(1),
        "node name collisions exhausted retry budget",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use etcdcat_definitions::conditions::{
        ConditionStatus, NodeCondition, NodeConditionReason, NodeConditionType,
    };
    use etcdcat_definitions::{EtcdNodeSpec, EtcdNodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn node(name: &str, provisioned: bool, ready: bool, age_secs: i64) -> EtcdNode {
        let mut n = EtcdNode::new(name, EtcdNodeSpec::default());
        let mut status = EtcdNodeStatus::default();
        if provisioned {
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Provisioned,
                ConditionStatus::True,
                Some(NodeConditionReason::ProvisionExecuted),
                None,
            );
        }
        if ready {
            NodeCondition::set(
                &mut status.conditions,
                NodeConditionType::Ready,
                ConditionStatus::True,
                Some(NodeConditionReason::HealthCheckSucceeded),
                None,
            );
        }
        n.status = Some(status);
        n.metadata.creation_timestamp =
            Some(Time(chrono::Utc::now() - chrono::Duration::seconds(age_secs)));
        n
    }

    #[test]
    fn suffixes_are_five_lowercase_alphanumerics() {
        for _ in 0..20 {
            let s = name_suffix();
            assert_eq!(s.len(), 5);
            assert!(s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn deletion_prefers_unprovisioned_then_unready_then_oldest_ready() {
        let mut nodes = vec![
            node("ready-old", true, true, 3600),
            node("ready-new", true, true, 60),
            node("provisioned-only", true, false, 600),
            node("blank", false, false, 10),
        ];
        sort_for_deletion(&mut nodes);
        let order: Vec<String> = nodes.iter().map(|n| n.name_any()).collect();
        assert_eq!(
            order,
            vec!["blank", "provisioned-only", "ready-old", "ready-new"]
        );
    }
}
