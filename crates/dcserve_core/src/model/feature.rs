//! Known RT-DC feature names.
//!
//! # Responsibility
//! - Classify feature names into scalar (one value per event) and
//!   non-scalar (one array per event) features.
//!
//! # Invariants
//! - A name is never both scalar and non-scalar.

use once_cell::sync::Lazy;
use regex::Regex;

const SCALAR_FEATURES: &[&str] = &[
    "area_cvx",
    "area_msd",
    "area_ratio",
    "area_um",
    "aspect",
    "bg_med",
    "bright_avg",
    "bright_bc_avg",
    "bright_bc_sd",
    "bright_sd",
    "circ",
    "deform",
    "emodulus",
    "fl1_area",
    "fl1_dist",
    "fl1_max",
    "fl1_max_ctc",
    "fl1_npeaks",
    "fl1_pos",
    "fl1_width",
    "fl2_area",
    "fl2_dist",
    "fl2_max",
    "fl2_max_ctc",
    "fl2_npeaks",
    "fl2_pos",
    "fl2_width",
    "fl3_area",
    "fl3_dist",
    "fl3_max",
    "fl3_max_ctc",
    "fl3_npeaks",
    "fl3_pos",
    "fl3_width",
    "flow_rate",
    "frame",
    "g_force",
    "index",
    "index_online",
    "inert_ratio_cvx",
    "inert_ratio_prnc",
    "inert_ratio_raw",
    "nevents",
    "pc1",
    "pc2",
    "pos_x",
    "pos_y",
    "size_x",
    "size_y",
    "temp",
    "temp_amb",
    "tilt",
    "time",
    "volume",
];

const NON_SCALAR_FEATURES: &[&str] = &[
    "contour",
    "image",
    "image_bg",
    "mask",
    "qpi_amp",
    "qpi_oah",
    "qpi_oah_bg",
    "qpi_pha",
    "trace",
];

static PATTERN_SCALAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(ml_score_[a-z0-9]{3}|userdef[0-9])$").expect("valid scalar feature regex")
});

/// Returns whether `name` is a known scalar feature.
pub fn scalar_feature_exists(name: &str) -> bool {
    SCALAR_FEATURES.contains(&name) || PATTERN_SCALAR_RE.is_match(name)
}

/// Returns whether `name` is any known feature.
pub fn feature_exists(name: &str) -> bool {
    scalar_feature_exists(name) || NON_SCALAR_FEATURES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::{feature_exists, scalar_feature_exists};

    #[test]
    fn classifies_scalar_and_non_scalar_features() {
        assert!(scalar_feature_exists("deform"));
        assert!(!scalar_feature_exists("image"));
        assert!(feature_exists("image"));
        assert!(feature_exists("trace"));
    }

    #[test]
    fn accepts_patterned_scalar_features() {
        assert!(scalar_feature_exists("ml_score_r1c"));
        assert!(scalar_feature_exists("userdef7"));
        assert!(!scalar_feature_exists("ml_score_toolong"));
        assert!(!feature_exists("peter"));
    }
}
