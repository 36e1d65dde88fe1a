//! Local assembly of several containers into one in-memory composite.
//!
//! # Invariants
//! - Every input is checked for external links before any composition
//!   starts; a single offending input aborts the whole assembly.
//! - Non-event groups and root attributes come from the first input only.
//! - For event features, the first input providing a name wins.
//! - Nodes are grafted by reference (`Arc`), never deep-copied.

use crate::container::{Container, ContainerError, EVENTS_GROUP};
use log::{error, info};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

/// Local assembly errors.
#[derive(Debug)]
pub enum CombineError {
    /// An input contains a link resolving outside the container.
    ForbiddenExternalLink { source: String, path: String },
    Container(ContainerError),
    NoInputs,
}

impl Display for CombineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForbiddenExternalLink { source, path } => write!(
                f,
                "input `{source}` contains a forbidden external link at `{path}`"
            ),
            Self::Container(err) => write!(f, "{err}"),
            Self::NoInputs => write!(f, "no containers to combine"),
        }
    }
}

impl Error for CombineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Container(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ContainerError> for CombineError {
    fn from(value: ContainerError) -> Self {
        Self::Container(value)
    }
}

/// Combines labelled containers; earlier inputs take precedence.
pub fn combine_containers(inputs: Vec<(String, Container)>) -> Result<Container, CombineError> {
    let started_at = Instant::now();
    let input_count = inputs.len();
    for (label, container) in &inputs {
        if let Some(path) = container.external_links().into_iter().next() {
            error!(
                "event=combine module=dataset status=error error_code=external_link source={} path={}",
                label, path
            );
            return Err(CombineError::ForbiddenExternalLink {
                source: label.clone(),
                path,
            });
        }
    }

    let mut inputs = inputs.into_iter();
    let Some((_, first)) = inputs.next() else {
        return Err(CombineError::NoInputs);
    };

    let mut combined = Container::new();
    combined.root_mut().attrs = first.attrs().clone();
    for (name, node) in first.root().children() {
        if name != EVENTS_GROUP {
            combined.root_mut().insert(name.clone(), node.clone());
        }
    }

    for source in std::iter::once(first).chain(inputs.map(|(_, container)| container)) {
        let Some(events) = source.events() else {
            continue;
        };
        let target = combined.root_mut().ensure_group(EVENTS_GROUP)?;
        for (name, node) in events.children() {
            if !target.contains(name) {
                target.insert(name.clone(), node.clone());
            }
        }
    }

    info!(
        "event=combine module=dataset status=ok inputs={} duration_ms={}",
        input_count,
        started_at.elapsed().as_millis()
    );
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::{combine_containers, CombineError};
    use crate::container::{Array, Container, Node};

    fn container(deform: f64, extra: &str) -> Container {
        let mut container = Container::new();
        container
            .insert_dataset("events/deform", Array::from_f64(vec![deform; 2]))
            .expect("deform");
        container
            .insert_dataset(&format!("events/{extra}"), Array::from_f64(vec![1.0; 2]))
            .expect("extra");
        container
    }

    #[test]
    fn first_input_wins_for_shared_features() {
        let combined = combine_containers(vec![
            ("condensed".to_string(), container(0.5, "volume")),
            ("raw".to_string(), container(0.1, "area_um")),
        ])
        .expect("combine");
        let events = combined.events().expect("events");
        assert_eq!(events.keys(), vec!["area_um", "deform", "volume"]);
        let deform = events.dataset("deform").expect("deform");
        assert_eq!(deform.array.to_f64_vec(), Some(vec![0.5, 0.5]));
    }

    #[test]
    fn rejects_external_link_in_any_input() {
        let mut poisoned = container(0.1, "area_um");
        poisoned
            .insert_node(
                "logs/secret",
                Node::ExternalLink {
                    file: "/etc/passwd".to_string(),
                    target: "/".to_string(),
                },
            )
            .expect("insert");
        let err = combine_containers(vec![
            ("condensed".to_string(), container(0.5, "volume")),
            ("raw".to_string(), poisoned),
        ])
        .expect_err("must abort");
        assert!(matches!(
            err,
            CombineError::ForbiddenExternalLink { ref source, ref path }
                if source == "raw" && path == "logs/secret"
        ));
    }

    #[test]
    fn empty_input_list_is_an_error() {
        assert!(matches!(
            combine_containers(Vec::new()),
            Err(CombineError::NoInputs)
        ));
    }
}
