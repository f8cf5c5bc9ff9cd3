//! Pin manifest release and stemcell references to uploaded versions.

use std::cmp::Ordering;

use director_core::manifest::{ReleaseRef, StemcellRef};
use director_state::{ReleaseVersion, StateStore, Stemcell};
use semver::Version;

use crate::error::{PlanError, PlanResult};

pub const LATEST: &str = "latest";

/// Order director version strings. `1.100` and `0.1-dev` are not strict
/// semver, so missing components are padded before parsing; anything that
/// still fails sorts below parseable versions, lexically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (lenient(a), lenient(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

fn lenient(version: &str) -> Option<Version> {
    if let Ok(v) = Version::parse(version) {
        return Some(v);
    }
    let (core, pre) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    let padded = match pre {
        Some(pre) => format!("{}-{pre}", parts.join(".")),
        None => parts.join("."),
    };
    Version::parse(&padded).ok()
}

pub fn find_release(store: &StateStore, reference: &ReleaseRef) -> PlanResult<ReleaseVersion> {
    let found = if reference.version == LATEST {
        store
            .list_release_versions(&reference.name)?
            .into_iter()
            .max_by(|a, b| compare_versions(&a.version, &b.version))
    } else {
        store.get_release(&reference.name, &reference.version)?
    };
    found.ok_or_else(|| PlanError::ReleaseNotFound {
        name: reference.name.clone(),
        version: reference.version.clone(),
    })
}

/// A stemcell reference matches by `name` when given, else by `os`.
pub fn find_stemcell(store: &StateStore, reference: &StemcellRef) -> PlanResult<Stemcell> {
    let matching = store.list_stemcells()?.into_iter().filter(|s| match (&reference.name, &reference.os) {
        (Some(name), _) => &s.name == name,
        (None, Some(os)) => &s.os == os,
        (None, None) => false,
    });
    let found = if reference.version == LATEST {
        matching.max_by(|a, b| compare_versions(&a.version, &b.version))
    } else {
        matching.into_iter().find(|s| s.version == reference.version)
    };
    found.ok_or_else(|| PlanError::StemcellNotFound {
        name: reference
            .name
            .clone()
            .or_else(|| reference.os.clone())
            .unwrap_or_else(|| reference.alias.clone()),
        version: reference.version.clone(),
    })
}
