//! Per-plan run state
//!
//! Tracks when a plan last fired and how its last task ended. State
//! lives in one small JSON file per plan, replaced atomically under a
//! lock file, so a crash can never leave a half-written record.

use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{
    create_path, file_read_optional_string, open_file_locked, replace_file, CreateOptions,
};

use tvs_api_types::TaskState;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Scheduling state of one plan
pub struct PlanRunState {
    /// Last time a task for this plan was dispatched (epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fire_at: Option<i64>,
    /// Terminal state of the last finished task
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<TaskState>,
}

fn get_path(base_dir: &Path, plan_id: &str) -> PathBuf {
    base_dir.join(format!("plan-{}.json", plan_id))
}

fn get_lock(base_dir: &Path, plan_id: &str) -> Result<std::fs::File, Error> {
    let mut path = get_path(base_dir, plan_id);
    path.set_extension("lck");
    open_file_locked(
        &path,
        std::time::Duration::new(10, 0),
        true,
        CreateOptions::new(),
    )
}

/// Create the jobstate dir
pub fn create_jobstate_dir(base_dir: &Path) -> Result<(), Error> {
    create_path(base_dir, None, None)
        .map_err(|err: Error| format_err!("unable to create job state dir - {}", err))?;
    Ok(())
}

/// Read the state of a plan; missing files yield the default.
pub fn load_plan_state(base_dir: &Path, plan_id: &str) -> Result<PlanRunState, Error> {
    match file_read_optional_string(get_path(base_dir, plan_id))? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(PlanRunState::default()),
    }
}

/// Update the state of a plan under its lock.
pub fn update_plan_state(
    base_dir: &Path,
    plan_id: &str,
    update: impl FnOnce(&mut PlanRunState),
) -> Result<PlanRunState, Error> {
    let _lock = get_lock(base_dir, plan_id)?;

    let mut state = load_plan_state(base_dir, plan_id)?;
    update(&mut state);

    let raw = serde_json::to_string(&state)?;
    replace_file(
        get_path(base_dir, plan_id),
        raw.as_bytes(),
        CreateOptions::new(),
        false,
    )?;

    Ok(state)
}

/// Remove the state files of a deleted plan.
pub fn remove_plan_state(base_dir: &Path, plan_id: &str) -> Result<(), Error> {
    let _lock = get_lock(base_dir, plan_id)?;

    let mut path = get_path(base_dir, plan_id);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(format_err!(
                "cannot remove state file for plan '{}': {}",
                plan_id,
                err
            ));
        }
    }
    path.set_extension("lck");
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(format_err!(
                "cannot remove lock file for plan '{}': {}",
                plan_id,
                err
            ));
        }
    }
    Ok(())
}
