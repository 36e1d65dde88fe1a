//! Recompute/extract pass producing a condensed container.
//!
//! # Responsibility
//! - Copy every scalar feature of a raw dataset and compute cheap
//!   ancillary features the raw dataset lacks.
//! - Report which raw features stay upstream-only.
//!
//! # Invariants
//! - Problems found during the pass land in the caller's warning list and
//!   are never written to the logging backend.
//! - Every stored feature has exactly one value per event.
//! - Raw basin records are not copied; basins are appended by the caller.

use super::rtdc::{DatasetResult, RtdcDataset};
use crate::container::{
    Array, ArrayData, Container, Group, Node, EVENTS_GROUP, LOGS_GROUP, TABLES_GROUP,
};
use crate::model::feature::scalar_feature_exists;
use serde_json::json;
use std::collections::BTreeSet;

/// Name of the log block recording the condensation summary.
pub const CONDENSE_LOG_NAME: &str = "dcserve-condense";

const ANCILLARY_FEATURES: &[&str] = &[
    "index",
    "time",
    "area_ratio",
    "aspect",
    "deform",
    "area_um",
    "bright_avg",
    "bright_sd",
];

const FRAME_RATE_KEY: &str = "imaging:frame rate";
const PIXEL_SIZE_KEY: &str = "imaging:pixel size";

/// Builds the condensed counterpart of `raw`.
///
/// Scalar features are shared with `raw` by reference. Warnings describing
/// skipped features are appended to `warnings`.
pub fn condense_dataset(raw: &RtdcDataset, warnings: &mut Vec<String>) -> DatasetResult<Container> {
    let event_count = raw.len();
    let source_features = raw.features_loaded();

    let mut condensed = Container::new();
    condensed.root_mut().attrs = raw.container().attrs().clone();

    let mut events = Group::new();
    for name in &source_features {
        if !scalar_feature_exists(name) {
            continue;
        }
        match raw.feature_node(name)? {
            Some(Node::Dataset(dataset))
                if dataset.array.shape().len() == 1 && dataset.array.len() == event_count =>
            {
                events.insert(name.clone(), Node::Dataset(dataset));
            }
            Some(_) => warnings.push(format!(
                "skipped scalar feature `{name}`: expected {event_count} values"
            )),
            None => {}
        }
    }

    for name in ANCILLARY_FEATURES {
        if events.contains(name) {
            continue;
        }
        match compute_ancillary(name, raw, &events, event_count)? {
            Ok(array) => {
                events.insert(*name, Node::dataset(array));
            }
            Err(reason) => warnings.push(format!("skipped ancillary feature `{name}`: {reason}")),
        }
    }
    condensed.root_mut().insert(EVENTS_GROUP, Node::Group(events));

    for group_name in [LOGS_GROUP, TABLES_GROUP] {
        if let Some(group) = raw.container().root().group(group_name) {
            condensed
                .root_mut()
                .insert(group_name, Node::Group(group.clone()));
        }
    }

    let condensed_features = condensed
        .events()
        .map(Group::keys)
        .unwrap_or_default();
    let summary = json!({
        "software": format!("dcserve {}", crate::core_version()),
        "event_count": event_count,
        "source_features": source_features,
        "condensed_features": condensed_features,
        "warnings": warnings,
    });
    let lines = serde_json::to_string_pretty(&summary)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect();
    condensed
        .root_mut()
        .ensure_group(LOGS_GROUP)?
        .insert(CONDENSE_LOG_NAME, Node::dataset(Array::text(lines)));

    Ok(condensed)
}

/// Sorted raw features that the condensed container does not store.
pub fn upstream_features(raw: &RtdcDataset, condensed: &Container) -> Vec<String> {
    let stored: BTreeSet<String> = condensed
        .events()
        .map(|events| events.keys().into_iter().collect())
        .unwrap_or_default();
    raw.features_loaded()
        .into_iter()
        .filter(|name| !stored.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Outer error aborts the pass; inner error is a warning message.
fn compute_ancillary(
    name: &str,
    raw: &RtdcDataset,
    events: &Group,
    event_count: usize,
) -> DatasetResult<Result<Array, String>> {
    let computed = match name {
        "index" => Ok(Array::from_i64((1..=event_count as i64).collect())),
        "time" => time_feature(raw, events),
        "area_ratio" => elementwise(events, "area_cvx", "area_msd", |cvx, msd| cvx / msd),
        "aspect" => elementwise(events, "size_x", "size_y", |x, y| x / y),
        "deform" => scalar(events, "circ")
            .map(|circ| Array::from_f64(circ.iter().map(|value| 1.0 - value).collect())),
        "area_um" => area_um_feature(raw, events),
        "bright_avg" | "bright_sd" => return brightness_feature(name, raw, event_count),
        other => Err(format!("no recipe for `{other}`")),
    };
    Ok(computed.and_then(|array| {
        if array.len() == event_count {
            Ok(array)
        } else {
            Err(format!(
                "computed {} values for {event_count} events",
                array.len()
            ))
        }
    }))
}

fn scalar(events: &Group, name: &str) -> Result<Vec<f64>, String> {
    events
        .dataset(name)
        .and_then(|dataset| dataset.array.to_f64_vec())
        .ok_or_else(|| format!("missing input `{name}`"))
}

fn elementwise(
    events: &Group,
    left: &str,
    right: &str,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Array, String> {
    let left_values = scalar(events, left)?;
    let right_values = scalar(events, right)?;
    if left_values.len() != right_values.len() {
        return Err(format!("length mismatch between `{left}` and `{right}`"));
    }
    Ok(Array::from_f64(
        left_values
            .into_iter()
            .zip(right_values)
            .map(|(a, b)| op(a, b))
            .collect(),
    ))
}

fn config_number(raw: &RtdcDataset, key: &str) -> Result<f64, String> {
    raw.container()
        .attrs()
        .get(key)
        .and_then(|value| value.as_f64())
        .ok_or_else(|| format!("missing metadata `{key}`"))
}

fn time_feature(raw: &RtdcDataset, events: &Group) -> Result<Array, String> {
    let frames = scalar(events, "frame")?;
    let frame_rate = config_number(raw, FRAME_RATE_KEY)?;
    if frame_rate <= 0.0 {
        return Err(format!("non-positive `{FRAME_RATE_KEY}`"));
    }
    let first = frames.first().copied().unwrap_or_default();
    Ok(Array::from_f64(
        frames
            .iter()
            .map(|frame| (frame - first) / frame_rate)
            .collect(),
    ))
}

fn area_um_feature(raw: &RtdcDataset, events: &Group) -> Result<Array, String> {
    let area = scalar(events, "area_cvx")?;
    let pixel_size = config_number(raw, PIXEL_SIZE_KEY)?;
    Ok(Array::from_f64(
        area.iter()
            .map(|pixels| pixels * pixel_size * pixel_size)
            .collect(),
    ))
}

fn brightness_feature(
    name: &str,
    raw: &RtdcDataset,
    event_count: usize,
) -> DatasetResult<Result<Array, String>> {
    let Some(Node::Dataset(image)) = raw.feature_node("image")? else {
        return Ok(Err("missing input `image`".to_string()));
    };
    let Some(Node::Dataset(mask)) = raw.feature_node("mask")? else {
        return Ok(Err("missing input `mask`".to_string()));
    };
    let (image, mask) = (&image.array, &mask.array);
    if image.shape() != mask.shape() || image.len() != event_count {
        return Ok(Err("`image` and `mask` shapes disagree".to_string()));
    }
    let ArrayData::Bool(mask_values) = mask.data() else {
        return Ok(Err("`mask` is not boolean".to_string()));
    };
    let Some(pixels) = image.to_f64_vec() else {
        return Ok(Err("`image` is not numeric".to_string()));
    };

    let size = image.item_size();
    let mut values = Vec::with_capacity(event_count);
    for event in 0..event_count {
        let range = event * size..(event + 1) * size;
        let inside: Vec<f64> = pixels[range.clone()]
            .iter()
            .zip(&mask_values[range])
            .filter(|(_, inside)| **inside)
            .map(|(pixel, _)| *pixel)
            .collect();
        values.push(if name == "bright_avg" {
            mean(&inside)
        } else {
            std_dev(&inside)
        });
    }
    Ok(Ok(Array::from_f64(values)))
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    let avg = mean(values);
    if avg.is_nan() {
        return f64::NAN;
    }
    let variance =
        values.iter().map(|value| (value - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::{condense_dataset, upstream_features, CONDENSE_LOG_NAME};
    use crate::container::{Array, ArrayData, Container};
    use crate::dataset::rtdc::RtdcDataset;

    fn raw_container() -> Container {
        let mut container = Container::new();
        container.set_attr("imaging:frame rate", 100.0);
        container.set_attr("imaging:pixel size", 0.5);
        container
            .insert_dataset("events/circ", Array::from_f64(vec![0.9, 0.8]))
            .expect("circ");
        container
            .insert_dataset("events/frame", Array::from_f64(vec![10.0, 30.0]))
            .expect("frame");
        container
            .insert_dataset("events/area_cvx", Array::from_f64(vec![4.0, 8.0]))
            .expect("area_cvx");
        container
            .insert_dataset(
                "events/image",
                Array::new(vec![2, 2, 2], ArrayData::U8(vec![1, 3, 9, 9, 2, 2, 2, 4]))
                    .expect("image"),
            )
            .expect("image");
        container
            .insert_dataset(
                "events/mask",
                Array::new(
                    vec![2, 2, 2],
                    ArrayData::Bool(vec![true, true, false, false, true, true, true, true]),
                )
                .expect("mask"),
            )
            .expect("mask");
        container
            .insert_dataset("logs/acquisition", Array::text(vec!["ok".to_string()]))
            .expect("log");
        container
    }

    #[test]
    fn computes_ancillary_features_from_inputs() {
        let raw = RtdcDataset::new(raw_container(), None).expect("raw");
        let mut warnings = Vec::new();
        let condensed = condense_dataset(&raw, &mut warnings).expect("condense");
        let events = condensed.events().expect("events");

        let values = |name: &str| {
            events
                .dataset(name)
                .and_then(|dataset| dataset.array.to_f64_vec())
                .expect(name)
        };
        assert_eq!(values("index"), vec![1.0, 2.0]);
        assert_eq!(values("time"), vec![0.0, 0.2]);
        assert_eq!(values("area_um"), vec![1.0, 2.0]);
        assert_eq!(values("bright_avg"), vec![2.0, 2.5]);
        assert_eq!(values("bright_sd")[0], 1.0);
        assert!((values("deform")[0] - 0.1).abs() < 1e-12);
        assert!(!events.contains("image"));

        // area_msd and size_x/size_y are absent
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|warning| warning.contains("area_ratio")));
        assert!(warnings.iter().any(|warning| warning.contains("aspect")));

        let logs = condensed.group("logs").expect("logs");
        assert!(logs.contains("acquisition"));
        assert!(logs.contains(CONDENSE_LOG_NAME));
    }

    #[test]
    fn upstream_features_are_raw_minus_condensed() {
        let raw = RtdcDataset::new(raw_container(), None).expect("raw");
        let condensed = condense_dataset(&raw, &mut Vec::new()).expect("condense");
        assert_eq!(upstream_features(&raw, &condensed), vec!["image", "mask"]);
    }
}
