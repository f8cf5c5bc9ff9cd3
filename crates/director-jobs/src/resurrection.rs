//! Resurrection toggles for single instances.
//!
//! These run inline in the API request rather than as tasks.

use director_state::{Instance, StateStore};
use tracing::info;

use crate::error::{JobError, JobResult};

/// Resolve the target instance and pause or resume its resurrection.
///
/// Without an index the group must have exactly one instance.
pub fn resurrection_state(
    store: &StateStore,
    deployment: &str,
    job: &str,
    index: Option<&str>,
    state: &str,
) -> JobResult<Instance> {
    let paused = match state {
        "on" => false,
        "off" => true,
        other => return Err(JobError::InvalidResurrectionState(other.to_string())),
    };

    let index = match index {
        Some(raw) => raw.parse::<u32>().map_err(|_| JobError::InvalidIndex(raw.to_string()))?,
        None => {
            let instances = store.list_instances_for_group(deployment, job)?;
            match instances.as_slice() {
                [only] => only.index,
                [] => {
                    return Err(JobError::InstanceNotFound {
                        deployment: deployment.to_string(),
                        job: job.to_string(),
                        index: String::new(),
                    });
                }
                _ => return Err(JobError::SpecifyIndex),
            }
        }
    };

    change_vm_resurrection(store, deployment, job, index, paused)
}

pub fn change_vm_resurrection(
    store: &StateStore,
    deployment: &str,
    job: &str,
    index: u32,
    paused: bool,
) -> JobResult<Instance> {
    let mut instance = store
        .list_instances_for_group(deployment, job)?
        .into_iter()
        .find(|i| i.index == index)
        .ok_or_else(|| JobError::InstanceNotFound {
            deployment: deployment.to_string(),
            job: job.to_string(),
            index: index.to_string(),
        })?;
    instance.resurrection_paused = paused;
    store.put_instance(&instance)?;
    info!(deployment = %deployment, instance = %instance.name(), paused, "resurrection changed");
    Ok(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_core::{codes, DirectorError, InstanceState};
    use serde_json::json;

    fn instance(index: u32) -> Instance {
        Instance {
            uuid: format!("uuid-{index}"),
            deployment: "dep".into(),
            job: "dea".into(),
            index,
            state: InstanceState::Started,
            az: None,
            spec: json!({}),
            variable_set_id: None,
            bootstrap: index == 0,
            resurrection_paused: true,
            ignore: false,
            created_at: 0,
        }
    }

    #[test]
    fn explicit_index_resumes_resurrection() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance(1)).unwrap();

        let changed = resurrection_state(&store, "dep", "dea", Some("1"), "on").unwrap();
        assert_eq!(changed.index, 1);
        assert!(!changed.resurrection_paused);
        let stored = store.get_instance("dep", "dea", "uuid-1").unwrap().unwrap();
        assert!(!stored.resurrection_paused);

        let changed = resurrection_state(&store, "dep", "dea", None, "off").unwrap();
        assert!(changed.resurrection_paused);
    }

    #[test]
    fn several_instances_need_an_index() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance(0)).unwrap();
        store.put_instance(&instance(1)).unwrap();

        let err = resurrection_state(&store, "dep", "dea", None, "on").unwrap_err();
        assert!(matches!(err, JobError::SpecifyIndex));
        assert!(err.to_string().contains("specify the job index"));
        assert_eq!(DirectorError::from(err).code(), codes::INSTANCE_INVALID_INDEX);
    }

    #[test]
    fn bad_arguments() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&instance(0)).unwrap();
        assert!(matches!(
            resurrection_state(&store, "dep", "dea", Some("x"), "on"),
            Err(JobError::InvalidIndex(_))
        ));
        assert!(matches!(
            resurrection_state(&store, "dep", "dea", Some("0"), "maybe"),
            Err(JobError::InvalidResurrectionState(_))
        ));
        assert!(matches!(
            resurrection_state(&store, "dep", "dea", Some("3"), "on"),
            Err(JobError::InstanceNotFound { .. })
        ));
    }
}
