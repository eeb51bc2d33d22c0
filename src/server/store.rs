//! Persistence facade.
//!
//! Bundles the cartridge inventory, the per-task state files and the
//! audit logs behind the handful of operations the engine and the
//! scheduler need. Every operation is a single transaction (lock,
//! reload, mutate, atomic replace) and idempotent on
//! `(entity_id, state)`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, format_err, Error};

use proxmox_sys::fs::{file_read_optional_string, replace_file, CreateOptions};

use tvs_api_types::{
    BackupPlanConfig, BackupTask, CartridgeStatus, TapeCartridge, VolumeLabel,
};

use crate::server::AuditLog;
use crate::tape::Inventory;

pub struct StateStore {
    base_dir: PathBuf,
    inventory: Mutex<Inventory>,
    audit: AuditLog,
}

impl StateStore {
    pub fn open(base_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(base_dir)?;
        std::fs::create_dir_all(base_dir.join("tasks"))?;

        let inventory = Inventory::load(base_dir)?;
        let audit = AuditLog::new(&base_dir.join("logs"))?;

        Ok(Self {
            base_dir: base_dir.to_owned(),
            inventory: Mutex::new(inventory),
            audit,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // cartridge operations

    pub fn upsert_cartridge(&self, cartridge: TapeCartridge) -> Result<(), Error> {
        self.inventory.lock().unwrap().upsert_cartridge(cartridge)
    }

    pub fn update_cartridge_status(
        &self,
        tape_id: &str,
        status: CartridgeStatus,
    ) -> Result<(), Error> {
        self.inventory
            .lock()
            .unwrap()
            .update_cartridge_status(tape_id, status)
    }

    pub fn update_cartridge_label(&self, tape_id: &str, label: VolumeLabel) -> Result<(), Error> {
        self.inventory
            .lock()
            .unwrap()
            .update_cartridge_label(tape_id, label)
    }

    pub fn update_cartridge_usage(
        &self,
        tape_id: &str,
        used_bytes: u64,
        last_health: Option<String>,
    ) -> Result<(), Error> {
        self.inventory
            .lock()
            .unwrap()
            .update_cartridge_usage(tape_id, used_bytes, last_health)
    }

    pub fn lookup_cartridge(&self, tape_id: &str) -> Result<TapeCartridge, Error> {
        let mut inventory = self.inventory.lock().unwrap();
        inventory.reload()?;
        match inventory.lookup_cartridge(tape_id) {
            Some(cartridge) => Ok(cartridge.clone()),
            None => bail!("no such cartridge '{}'", tape_id),
        }
    }

    pub fn list_cartridges(&self) -> Result<Vec<TapeCartridge>, Error> {
        let mut inventory = self.inventory.lock().unwrap();
        inventory.reload()?;
        Ok(inventory.list_cartridges().into_iter().cloned().collect())
    }

    pub fn list_known_labels(&self) -> Result<Vec<VolumeLabel>, Error> {
        let mut inventory = self.inventory.lock().unwrap();
        inventory.reload()?;
        Ok(inventory.list_known_labels())
    }

    // task operations

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.base_dir.join("tasks").join(format!("{}.json", task_id))
    }

    pub fn create_task(&self, task: &BackupTask) -> Result<(), Error> {
        self.write_task(task)
    }

    /// Persist a task record.
    ///
    /// State changes are checked against the monotone task state
    /// machine; re-writing the current state is allowed (idempotence).
    pub fn update_task_state(&self, task: &BackupTask) -> Result<(), Error> {
        if let Ok(current) = self.load_task(&task.task_id.to_string()) {
            if current.state != task.state {
                current.state.check_transition(task.state)?;
            }
        }
        self.write_task(task)
    }

    fn write_task(&self, task: &BackupTask) -> Result<(), Error> {
        let path = self.task_path(&task.task_id.to_string());
        let raw = serde_json::to_string_pretty(task)?;
        replace_file(path, raw.as_bytes(), CreateOptions::new(), false)?;
        Ok(())
    }

    pub fn load_task(&self, task_id: &str) -> Result<BackupTask, Error> {
        let path = self.task_path(task_id);
        let raw = file_read_optional_string(&path)?
            .ok_or_else(|| format_err!("no such task '{}'", task_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    // plan listing (plans live in the section config)

    pub fn list_plans(&self) -> Result<Vec<BackupPlanConfig>, Error> {
        let config = tvs_config::plan::config()?;
        tvs_config::plan::list_plans(&config)
    }
}
