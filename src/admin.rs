//! Read-only lineage graph traversal and unsafe forced-unlock utilities.
//!
//! These are deliberately not exposed through `ResourceManager`: they are
//! meant for an out-of-scope administrative wrapper (a CLI, an on-call
//! runbook) recovering from a job that died without calling `stop()`.

use std::collections::{HashSet, VecDeque};

use redis::Connection;
use serde::Serialize;

use crate::error::Result;
use crate::lineage::sanitize;
use crate::script::{split_key_list, RunningJob};
use crate::store::Store;

/// A sanitized `"left -> right"` lineage edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub left: String,
    pub right: String,
}

fn parse_edges(raw: &[String]) -> Vec<Edge> {
    raw.iter()
        .filter_map(|e| {
            e.split_once(" -> ")
                .map(|(l, r)| Edge {
                    left: l.to_string(),
                    right: r.to_string(),
                })
        })
        .collect()
}

/// All sanitized `input -> job` and `output(job -> output)` edges ever
/// recorded, deduplicated.
pub struct Edges {
    pub inputs: Vec<Edge>,
    pub outputs: Vec<Edge>,
}

/// Fetches the full lineage graph.
pub fn all_edges(store: &Store, con: &mut Connection) -> Result<Edges> {
    let mut inputs: Vec<String> = store.raw_edges(con, "input")?;
    let mut outputs: Vec<String> = store.raw_edges(con, "output")?;
    inputs.sort();
    inputs.dedup();
    outputs.sort();
    outputs.dedup();
    Ok(Edges {
        inputs: parse_edges(&inputs),
        outputs: parse_edges(&outputs),
    })
}

/// Jobs that have ever written (sanitized) `resource`.
pub fn produces(edges: &Edges, resource: &str) -> Vec<String> {
    let target = sanitize(resource);
    edges
        .outputs
        .iter()
        .filter(|e| e.right == target)
        .map(|e| e.left.clone())
        .collect()
}

/// Jobs that have ever read (sanitized) `resource`.
pub fn consumes(edges: &Edges, resource: &str) -> Vec<String> {
    let source = sanitize(resource);
    edges
        .inputs
        .iter()
        .filter(|e| e.left == source)
        .map(|e| e.right.clone())
        .collect()
}

/// Inputs ever declared by (sanitized) job `job_id`.
pub fn inputs_to(edges: &Edges, job_id: &str) -> Vec<String> {
    let target = sanitize(job_id);
    edges
        .inputs
        .iter()
        .filter(|e| e.right == target)
        .map(|e| e.left.clone())
        .collect()
}

/// Outputs ever declared by (sanitized) job `job_id`.
pub fn outputs_from(edges: &Edges, job_id: &str) -> Vec<String> {
    let source = sanitize(job_id);
    edges
        .outputs
        .iter()
        .filter(|e| e.left == source)
        .map(|e| e.right.clone())
        .collect()
}

/// A directed edge discovered during a BFS traversal, in print order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalEdge {
    pub from: String,
    pub to: String,
}

/// Breadth-first traversal upstream from `seeds` (jobs or resources):
/// follows `input -> job` / `job -> output` edges backwards.
pub fn upstream(edges: &Edges, seeds: &[String]) -> Vec<TraversalEdge> {
    traverse(edges, seeds, false)
}

/// Breadth-first traversal downstream from `seeds`: follows edges forwards.
pub fn downstream(edges: &Edges, seeds: &[String]) -> Vec<TraversalEdge> {
    traverse(edges, seeds, true)
}

fn traverse(edges: &Edges, seeds: &[String], out: bool) -> Vec<TraversalEdge> {
    let mut known: HashSet<String> = seeds.iter().cloned().collect();
    let mut queue: VecDeque<String> = seeds.iter().cloned().collect();
    let mut result = Vec::new();

    while let Some(it) = queue.pop_front() {
        if out {
            // downstream: job -> output, then output -> consuming job
            for e in edges.outputs.iter().filter(|e| e.left == it) {
                result.push(TraversalEdge {
                    from: e.left.clone(),
                    to: e.right.clone(),
                });
                for consumer in edges.inputs.iter().filter(|i| i.left == e.right) {
                    if known.insert(consumer.right.clone()) {
                        result.push(TraversalEdge {
                            from: e.right.clone(),
                            to: consumer.right.clone(),
                        });
                        queue.push_back(consumer.right.clone());
                    }
                }
            }
        } else {
            // upstream: input -> job, then producing job -> that input
            for e in edges.inputs.iter().filter(|e| e.right == it) {
                result.push(TraversalEdge {
                    from: e.left.clone(),
                    to: e.right.clone(),
                });
                for producer in edges.outputs.iter().filter(|o| o.right == e.left) {
                    if known.insert(producer.left.clone()) {
                        result.push(TraversalEdge {
                            from: producer.left.clone(),
                            to: e.left.clone(),
                        });
                        queue.push_back(producer.left.clone());
                    }
                }
            }
        }
    }
    result
}

/// Renders traversal edges as Graphviz `dot` input:
/// `digraph { rankdir=LR ... "A" -> "B"; ... }`.
pub fn graphviz(edges: &[TraversalEdge]) -> String {
    let mut out = String::from("digraph {\nrankdir=LR\n\n");
    for e in edges {
        if e.from.trim_matches(|c| c == '*' || c == '.').is_empty()
            || e.to.trim_matches(|c| c == '*' || c == '.').is_empty()
        {
            continue;
        }
        out.push_str(&format!("\"{}\" -> \"{}\";\n", e.from, e.to));
    }
    out.push('}');
    out
}

/// The inputs/outputs currently recorded for a running job id.
pub fn job_io(store: &Store, con: &mut Connection, id: &str) -> Result<(Vec<String>, Vec<String>)> {
    match store.job_io(con, id)? {
        Some(io) => Ok(split_key_list(&io)),
        None => Ok((Vec::new(), Vec::new())),
    }
}

/// A running job with its sentinel-delimited `io` list already split into
/// `inputs`/`outputs`, the shape printed by the admin CLI's job listing.
#[derive(Debug, Clone, Serialize)]
pub struct RunningJobView {
    pub id: String,
    pub exptime: f64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl From<RunningJob> for RunningJobView {
    fn from(job: RunningJob) -> Self {
        let (inputs, outputs) = split_key_list(&job.io);
        RunningJobView {
            id: job.id,
            exptime: job.exptime,
            inputs,
            outputs,
        }
    }
}

/// Fetches every currently running job with its `io` list split into
/// `inputs`/`outputs`, ready to print or serialize.
pub fn list_running(store: &Store, con: &mut Connection, now: f64) -> Result<Vec<RunningJobView>> {
    Ok(store
        .list_running(con, now)?
        .into_iter()
        .map(RunningJobView::from)
        .collect())
}

/// Unsafe: deletes `ilock:`/`olock:` keys directly, bypassing ownership
/// checks. Used only to recover from a job that died without cleanup.
pub fn force_unlock(store: &Store, con: &mut Connection, inputs: &[String], outputs: &[String]) -> Result<()> {
    store.force_unlock(con, inputs, outputs)
}

/// Unsafe: sets output markers to a synthetic identifier without acquiring
/// any lock.
pub fn create_outputs(store: &Store, con: &mut Connection, outputs: &[String], identifier: &str) -> Result<()> {
    store.create_outputs(con, outputs, identifier)
}

/// Equivalent of `--finish <id>`: commits the job's declared outputs under
/// a synthetic identifier and releases its input locks.
pub fn finish_externally(store: &Store, con: &mut Connection, id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let (inputs, outputs) = job_io(store, con, id)?;
    create_outputs(store, con, &outputs, id)?;
    force_unlock(store, con, &inputs, &[])?;
    Ok((inputs, outputs))
}

/// Equivalent of `--fail <id>`: releases both input and output locks
/// without committing any output.
pub fn fail_externally(store: &Store, con: &mut Connection, id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let (inputs, outputs) = job_io(store, con, id)?;
    force_unlock(store, con, &inputs, &outputs)?;
    Ok((inputs, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges_fixture() -> Edges {
        Edges {
            inputs: vec![
                Edge { left: "x".into(), right: "jobB".into() },
            ],
            outputs: vec![
                Edge { left: "jobA".into(), right: "x".into() },
                Edge { left: "jobB".into(), right: "y".into() },
            ],
        }
    }

    #[test]
    fn produces_finds_writer() {
        let edges = edges_fixture();
        assert_eq!(produces(&edges, "x"), vec!["jobA".to_string()]);
    }

    #[test]
    fn consumes_finds_reader() {
        let edges = edges_fixture();
        assert_eq!(consumes(&edges, "x"), vec!["jobB".to_string()]);
    }

    #[test]
    fn inputs_to_and_outputs_from() {
        let edges = edges_fixture();
        assert_eq!(inputs_to(&edges, "jobB"), vec!["x".to_string()]);
        assert_eq!(outputs_from(&edges, "jobA"), vec!["x".to_string()]);
    }

    #[test]
    fn upstream_traversal_chains_producer() {
        let edges = edges_fixture();
        let up = upstream(&edges, &["jobB".to_string()]);
        assert!(up.contains(&TraversalEdge { from: "x".into(), to: "jobB".into() }));
        assert!(up.contains(&TraversalEdge { from: "jobA".into(), to: "x".into() }));
    }

    #[test]
    fn downstream_traversal_chains_consumer() {
        let edges = edges_fixture();
        let down = downstream(&edges, &["jobA".to_string()]);
        assert!(down.contains(&TraversalEdge { from: "jobA".into(), to: "x".into() }));
        assert!(down.contains(&TraversalEdge { from: "x".into(), to: "jobB".into() }));
    }

    #[test]
    fn graphviz_wraps_edges() {
        let out = graphviz(&[TraversalEdge { from: "a".into(), to: "b".into() }]);
        assert!(out.starts_with("digraph {\nrankdir=LR"));
        assert!(out.contains("\"a\" -> \"b\";"));
        assert!(out.ends_with('}'));
    }
}
