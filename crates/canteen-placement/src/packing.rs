//! Oblivious least-loaded-first packing.
//!
//! For each replica the evaluator walks the candidate nodes in id order and
//! keeps an encrypted running best: the eligible node whose load ratio after
//! receiving the replica, `(load + 1) / capacity`, is lowest. The comparison
//! is cross-multiplied so no division happens under encryption, and it is
//! strict, so ties resolve to the lower node id. The winner's load and
//! replica count are bumped through an encrypted one-hot selection vector.
//!
//! Every node's outcome is computed regardless of eligibility, so the
//! sequence of operations depends only on the node count and the replica
//! count, never on the encrypted values.

use std::collections::{BTreeMap, BTreeSet};

use canteen_state::{
    AssignmentOutcome, Ciphertext, ClusterPolicy, DeploymentRequest, NodeId, PlacementConstraints,
    TelemetryRecord,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PlacementResult;
use crate::fhe::FheBackend;

/// Largest replica count a single request may ask for.
pub const MAX_REPLICAS: u32 = 1024;

/// Encrypted result of a packing evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptedAssignment {
    pub request_id: String,
    pub image: String,
    pub replicas: u32,
    /// Encrypted replica count for every candidate node, including zeros.
    pub per_node: BTreeMap<NodeId, Ciphertext>,
    /// Encrypted 1 when every replica found a node.
    pub satisfiable: Ciphertext,
}

/// Outcome for requests that never reach evaluation, or `None` when the
/// request is well-formed.
pub fn precheck(request: &DeploymentRequest) -> Option<AssignmentOutcome> {
    let reason = if request.replicas == 0 {
        "zero replicas requested".to_string()
    } else if request.replicas > MAX_REPLICAS {
        format!(
            "{} replicas exceeds the per-request limit of {MAX_REPLICAS}",
            request.replicas
        )
    } else {
        return None;
    };
    Some(AssignmentOutcome::Unsatisfiable {
        request_id: request.id.clone(),
        image: request.image.clone(),
        reason,
    })
}

/// Request constraints with cluster policy defaults filled in.
pub fn effective_constraints(
    request: &DeploymentRequest,
    policy: &ClusterPolicy,
) -> PlacementConstraints {
    let mut constraints = request.constraints.clone();
    if constraints.max_per_node.is_none() {
        constraints.max_per_node = policy.default_max_per_node;
    }
    constraints
}

/// Pick the packing inputs: the newest fresh record of each ALIVE,
/// non-excluded node, ordered by node id.
pub fn select_inputs<'a>(
    records: impl IntoIterator<Item = &'a TelemetryRecord>,
    alive: &BTreeSet<NodeId>,
    exclude: &[NodeId],
    now: u64,
) -> Vec<TelemetryRecord> {
    let mut newest: BTreeMap<&str, &TelemetryRecord> = BTreeMap::new();
    for record in records {
        if !alive.contains(&record.node_id)
            || exclude.contains(&record.node_id)
            || !record.is_fresh(now)
        {
            continue;
        }
        match newest.get(record.node_id.as_str()) {
            Some(current) if current.timestamp >= record.timestamp => {}
            _ => {
                newest.insert(&record.node_id, record);
            }
        }
    }
    newest.into_values().cloned().collect()
}

/// Run the packing over `inputs` (as returned by [`select_inputs`]).
pub fn evaluate_schedule(
    fhe: &dyn FheBackend,
    request: &DeploymentRequest,
    constraints: &PlacementConstraints,
    inputs: &[TelemetryRecord],
) -> PlacementResult<EncryptedAssignment> {
    let one = fhe.encrypt(1);
    let zero = fhe.encrypt(0);
    let limit = constraints.max_per_node.map(|m| fhe.encrypt(u64::from(m)));

    let candidates: Vec<&TelemetryRecord> = inputs
        .iter()
        .filter(|r| !constraints.exclude.contains(&r.node_id))
        .collect();
    let n = candidates.len();
    let capacity: Vec<&Ciphertext> = candidates.iter().map(|r| &r.capacity).collect();
    let mut load: Vec<Ciphertext> = candidates.iter().map(|r| r.load.clone()).collect();
    let mut assigned: Vec<Ciphertext> = vec![zero.clone(); n];
    let mut placed = zero.clone();

    debug!(
        request_id = %request.id,
        candidates = n,
        replicas = request.replicas,
        "evaluating encrypted schedule"
    );

    for _ in 0..request.replicas {
        let mut have_best = zero.clone();
        let mut best_load = zero.clone();
        let mut best_capacity = zero.clone();
        let mut selection: Vec<Ciphertext> = Vec::with_capacity(n);

        for i in 0..n {
            let mut eligible = fhe.lt(&load[i], capacity[i])?;
            if let Some(limit) = &limit {
                let under = fhe.lt(&assigned[i], limit)?;
                eligible = fhe.and(&eligible, &under)?;
            }

            // (load_i + 1) * best_capacity < (best_load + 1) * capacity_i
            let lhs = fhe.mul(&fhe.add(&load[i], &one)?, &best_capacity)?;
            let rhs = fhe.mul(&fhe.add(&best_load, &one)?, capacity[i])?;
            let lower = fhe.lt(&lhs, &rhs)?;
            let first_or_lower = fhe.or(&fhe.not(&have_best)?, &lower)?;
            let better = fhe.and(&eligible, &first_or_lower)?;

            let keep = fhe.not(&better)?;
            for slot in selection.iter_mut() {
                *slot = fhe.and(slot, &keep)?;
            }
            selection.push(better.clone());

            best_load = fhe.select(&better, &load[i], &best_load)?;
            best_capacity = fhe.select(&better, capacity[i], &best_capacity)?;
            have_best = fhe.or(&have_best, &better)?;
        }

        for (i, chosen) in selection.iter().enumerate() {
            load[i] = fhe.add(&load[i], chosen)?;
            assigned[i] = fhe.add(&assigned[i], chosen)?;
        }
        placed = fhe.add(&placed, &have_best)?;
    }

    let short = fhe.lt(&placed, &fhe.encrypt(u64::from(request.replicas)))?;
    let satisfiable = fhe.not(&short)?;

    let per_node = candidates
        .iter()
        .zip(assigned)
        .map(|(r, count)| (r.node_id.clone(), count))
        .collect();

    Ok(EncryptedAssignment {
        request_id: request.id.clone(),
        image: request.image.clone(),
        replicas: request.replicas,
        per_node,
        satisfiable,
    })
}
