use std::collections::{BTreeMap, HashMap};

use super::{StoreError, StoreResult};
use crate::pki::models::{CertId, Certificate};

/// Characters per path level.
pub(super) const STEPLEN: usize = 4;
const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

type Nodes = BTreeMap<CertId, Certificate>;

fn encode_step(position: usize) -> StoreResult<String> {
    let max = ALPHABET.len().pow(STEPLEN as u32);
    if position == 0 || position >= max {
        return Err(StoreError::Tree(format!(
            "sibling position {position} does not fit in a path step"
        )));
    }
    let mut digits = [b'0'; STEPLEN];
    let mut n = position;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[n % ALPHABET.len()];
        n /= ALPHABET.len();
    }
    Ok(digits.iter().map(|&b| b as char).collect())
}

fn child_index(nodes: &Nodes) -> HashMap<Option<CertId>, Vec<CertId>> {
    let mut index: HashMap<Option<CertId>, Vec<CertId>> = HashMap::new();
    for node in nodes.values() {
        index.entry(node.parent_id).or_default().push(node.id);
    }
    index
}

/// True if `candidate` is `id` or lies below it.
pub(super) fn is_in_subtree(nodes: &Nodes, id: CertId, candidate: CertId) -> bool {
    let mut current = Some(candidate);
    while let Some(c) = current {
        if c == id {
            return true;
        }
        current = nodes.get(&c).and_then(|n| n.parent_id);
    }
    false
}

/// Point `id` at `parent` and renumber the affected sibling levels.
pub(super) fn attach(nodes: &mut Nodes, id: CertId, parent: Option<CertId>) -> StoreResult<()> {
    if let Some(p) = parent {
        if !nodes.contains_key(&p) {
            return Err(StoreError::NotFound {
                entity: "certificate",
                id: p,
            });
        }
        if is_in_subtree(nodes, id, p) {
            return Err(StoreError::Tree(format!(
                "certificate {p} lies below {id}, moving would create a cycle"
            )));
        }
    }

    let node = nodes.get_mut(&id).ok_or(StoreError::NotFound {
        entity: "certificate",
        id,
    })?;
    let previous = node.parent_id;
    node.parent_id = parent;

    renumber(nodes, parent)?;
    if previous != parent {
        renumber(nodes, previous)?;
    }
    Ok(())
}

/// Reassign sibling positions under `parent`, ordered by subject, and
/// rewrite the paths of every subtree whose position changed.
pub(super) fn renumber(nodes: &mut Nodes, parent: Option<CertId>) -> StoreResult<()> {
    let prefix = match parent {
        Some(p) => nodes
            .get(&p)
            .map(|n| n.path.clone())
            .ok_or(StoreError::NotFound {
                entity: "certificate",
                id: p,
            })?,
        None => String::new(),
    };

    let mut siblings: Vec<(String, CertId)> = nodes
        .values()
        .filter(|n| n.parent_id == parent)
        .map(|n| (n.subject.to_string(), n.id))
        .collect();
    siblings.sort();

    if let Some(p) = parent
        && let Some(node) = nodes.get_mut(&p)
    {
        node.numchild = siblings.len();
    }

    let index = child_index(nodes);
    for (position, (_, id)) in siblings.iter().enumerate() {
        let path = format!("{prefix}{}", encode_step(position + 1)?);
        repath(nodes, &index, *id, path);
    }
    Ok(())
}

fn repath(
    nodes: &mut Nodes,
    index: &HashMap<Option<CertId>, Vec<CertId>>,
    id: CertId,
    path: String,
) {
    let mut stack = vec![(id, path)];
    while let Some((id, path)) = stack.pop() {
        let Some(node) = nodes.get_mut(&id) else {
            continue;
        };
        if node.path == path {
            continue;
        }
        node.depth = path.len() / STEPLEN;
        node.path = path.clone();
        for child in index.get(&Some(id)).into_iter().flatten() {
            if let Some(c) = nodes.get(child) {
                let step = c.path[c.path.len().saturating_sub(STEPLEN)..].to_string();
                stack.push((*child, format!("{path}{step}")));
            }
        }
    }
}
