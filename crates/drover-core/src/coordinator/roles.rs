//! Role classification and role-workflow expansion.
//!
//! Every declared agent is classified into exactly one of manager,
//! reviewer, or builder. Classification is data-driven: an explicit
//! role-string table first, then keyword stems over the role, name, and
//! file stems. The workflow expansion then appends QA and integration
//! stages behind each development node, gated to the classified roles.

use std::path::Path;

use drover_db::models::{meta, GoalDag, TaskEdge, TaskNode};

use crate::instructions::AgentDescriptor;

/// The three-way workflow role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleClass {
    Manager,
    Reviewer,
    Builder,
}

/// Exact role-string lookup, consulted first.
const ROLE_TABLE: &[(&str, RoleClass)] = &[
    ("manager", RoleClass::Manager),
    ("owner", RoleClass::Manager),
    ("lead", RoleClass::Manager),
    ("team-lead", RoleClass::Manager),
    ("reviewer", RoleClass::Reviewer),
    ("qa", RoleClass::Reviewer),
    ("tester", RoleClass::Reviewer),
    ("builder", RoleClass::Builder),
    ("developer", RoleClass::Builder),
    ("dev", RoleClass::Builder),
];

/// Keyword stems matched against role, name, and file stems. Manager
/// stems take precedence over reviewer stems.
const KEYWORD_TABLE: &[(&str, RoleClass)] = &[
    ("owner", RoleClass::Manager),
    ("lead", RoleClass::Manager),
    ("manager", RoleClass::Manager),
    ("qa", RoleClass::Reviewer),
    ("test", RoleClass::Reviewer),
    ("validator", RoleClass::Reviewer),
    ("review", RoleClass::Reviewer),
];

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Classify a descriptor into its workflow role.
pub fn classify_role(descriptor: &AgentDescriptor) -> RoleClass {
    let role = descriptor.effective_role().to_lowercase();
    for (key, class) in ROLE_TABLE {
        if role == *key {
            return *class;
        }
    }

    let haystacks = [
        role,
        descriptor.name.to_lowercase(),
        file_stem(&descriptor.instructions_path),
        file_stem(&descriptor.heartbeat_path),
    ];
    for (stem, class) in KEYWORD_TABLE {
        if haystacks.iter().any(|haystack| haystack.contains(stem)) {
            return *class;
        }
    }
    RoleClass::Builder
}

/// The effective role of the first descriptor in the given class.
fn first_role_of(descriptors: &[AgentDescriptor], class: RoleClass) -> Option<String> {
    descriptors
        .iter()
        .find(|d| classify_role(d) == class)
        .map(|d| d.effective_role().to_owned())
}

/// Expand an oracle-produced DAG with the role workflow.
///
/// Development nodes get role metadata defaults (builders assigned
/// round-robin); a QA node is appended behind each when a reviewer
/// exists, and an integration node behind that when a manager exists.
pub fn expand_role_workflow(dag: GoalDag, descriptors: &[AgentDescriptor]) -> GoalDag {
    let builders: Vec<String> = descriptors
        .iter()
        .filter(|d| classify_role(d) == RoleClass::Builder)
        .map(|d| d.effective_role().to_owned())
        .collect();
    let reviewer = first_role_of(descriptors, RoleClass::Reviewer);
    let lead = first_role_of(descriptors, RoleClass::Manager);

    let GoalDag {
        goal_id,
        mut nodes,
        mut edges,
    } = dag;

    let mut appended_nodes = Vec::new();
    let mut dev_index = 0usize;

    for node in nodes.iter_mut() {
        // Only development nodes (or nodes with no phase yet) get the
        // expansion; the oracle may already have emitted QA stages.
        if node
            .meta(meta::PHASE)
            .is_some_and(|phase| phase != "development")
        {
            continue;
        }

        if node.meta(meta::PHASE).is_none() {
            node.metadata
                .insert(meta::PHASE.to_owned(), "development".to_owned());
        }
        if node.meta(meta::REVIEW_CYCLE).is_none() {
            node.metadata
                .insert(meta::REVIEW_CYCLE.to_owned(), "0".to_owned());
        }
        if node.required_role().is_none() && !builders.is_empty() {
            let builder = builders[dev_index % builders.len()].clone();
            node.metadata.insert(meta::REQUIRED_ROLE.to_owned(), builder);
        }
        if node.meta(meta::DEV_ROLE).is_none() {
            if let Some(role) = node.required_role() {
                let role = role.to_owned();
                node.metadata.insert(meta::DEV_ROLE.to_owned(), role);
            }
        }
        if node.meta(meta::MANAGER_ROLE).is_none() {
            if let Some(lead) = &lead {
                node.metadata
                    .insert(meta::MANAGER_ROLE.to_owned(), lead.clone());
            }
        }
        dev_index += 1;

        let dev_role = node.meta(meta::DEV_ROLE).map(str::to_owned);
        let mut integration_source = node.id.clone();

        if let Some(reviewer) = &reviewer {
            let qa_id = format!("{}__qa", node.id);
            let mut qa_node = TaskNode::new(
                qa_id.clone(),
                format!("QA review: {}", node.title),
                node.priority,
            )
            .with_meta(meta::PHASE, "qa")
            .with_meta(meta::REQUIRED_ROLE, reviewer.clone())
            .with_meta(meta::PARENT_TASK_ID, node.id.clone())
            .with_meta(meta::REVIEW_CYCLE, "0");
            if let Some(dev_role) = &dev_role {
                qa_node = qa_node.with_meta(meta::DEV_ROLE, dev_role.clone());
            }
            if let Some(lead) = &lead {
                qa_node = qa_node.with_meta(meta::MANAGER_ROLE, lead.clone());
            }
            appended_nodes.push(qa_node);
            edges.push(TaskEdge::new(node.id.clone(), qa_id.clone()));
            integration_source = qa_id;
        }

        if let Some(lead) = &lead {
            let integrate_id = format!("{}__integrate", node.id);
            let integrate_node = TaskNode::new(
                integrate_id.clone(),
                format!("Integrate: {}", node.title),
                node.priority,
            )
            .with_meta(meta::PHASE, "integration")
            .with_meta(meta::REQUIRED_ROLE, lead.clone())
            .with_meta(meta::PARENT_TASK_ID, node.id.clone());
            appended_nodes.push(integrate_node);
            edges.push(TaskEdge::new(integration_source, integrate_id));
        }
    }

    nodes.extend(appended_nodes);
    GoalDag {
        goal_id,
        nodes,
        edges,
    }
}
