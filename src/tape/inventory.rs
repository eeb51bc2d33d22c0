//! Cartridge inventory
//!
//! Persistently stores the list of known cartridges. Every mutation
//! takes the lock file, reloads, applies one change and atomically
//! replaces the database file, so each state transition is a single
//! transaction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use serde_json::json;

use proxmox_sys::fs::{file_get_json, open_file_locked, replace_file, CreateOptions};

use tvs_api_types::{CartridgeStatus, TapeCartridge, VolumeLabel};

/// Cartridge inventory
pub struct Inventory {
    map: BTreeMap<String, TapeCartridge>,

    inventory_path: PathBuf,
    lockfile_path: PathBuf,
}

impl Inventory {
    pub const INVENTORY_FILENAME: &'static str = "inventory.json";
    pub const INVENTORY_LOCKFILE: &'static str = ".inventory.lck";

    fn new(base_path: &Path) -> Self {
        let mut inventory_path = base_path.to_owned();
        inventory_path.push(Self::INVENTORY_FILENAME);

        let mut lockfile_path = base_path.to_owned();
        lockfile_path.push(Self::INVENTORY_LOCKFILE);

        Self {
            map: BTreeMap::new(),
            inventory_path,
            lockfile_path,
        }
    }

    pub fn load(base_path: &Path) -> Result<Self, Error> {
        let mut me = Self::new(base_path);
        me.reload()?;
        Ok(me)
    }

    /// Reload the database
    pub fn reload(&mut self) -> Result<(), Error> {
        self.map = Self::load_cartridge_db(&self.inventory_path)?;
        Ok(())
    }

    /// Lock the database
    fn lock(&self) -> Result<std::fs::File, Error> {
        open_file_locked(
            &self.lockfile_path,
            std::time::Duration::new(10, 0),
            true,
            CreateOptions::new(),
        )
    }

    fn load_cartridge_db(path: &Path) -> Result<BTreeMap<String, TapeCartridge>, Error> {
        let data = file_get_json(path, Some(json!([])))?;
        let list: Vec<TapeCartridge> = serde_json::from_value(data)?;

        let mut map = BTreeMap::new();
        for item in list.into_iter() {
            map.insert(item.tape_id.clone(), item);
        }

        Ok(map)
    }

    fn replace_file(&self) -> Result<(), Error> {
        let list: Vec<&TapeCartridge> = self.map.values().collect();
        let raw = serde_json::to_string_pretty(&serde_json::to_value(list)?)?;
        let options = CreateOptions::new();
        replace_file(&self.inventory_path, raw.as_bytes(), options, false)?;
        Ok(())
    }

    /// Store a single cartridge persistently (insert or update).
    pub fn upsert_cartridge(&mut self, mut cartridge: TapeCartridge) -> Result<(), Error> {
        cartridge.check()?;

        let _lock = self.lock()?;
        self.map = Self::load_cartridge_db(&self.inventory_path)?;

        cartridge.updated_at = proxmox_time::epoch_i64();
        self.map.insert(cartridge.tape_id.clone(), cartridge);
        self.replace_file()?;
        Ok(())
    }

    /// Update the status of an existing cartridge.
    ///
    /// Idempotent: setting the already-current status is a no-op.
    pub fn update_cartridge_status(
        &mut self,
        tape_id: &str,
        status: CartridgeStatus,
    ) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.map = Self::load_cartridge_db(&self.inventory_path)?;

        match self.map.get_mut(tape_id) {
            Some(cartridge) => {
                if cartridge.status == status {
                    return Ok(());
                }
                cartridge.status = status;
                cartridge.updated_at = proxmox_time::epoch_i64();
            }
            None => bail!("no such cartridge '{}'", tape_id),
        }

        self.replace_file()?;
        Ok(())
    }

    /// Update the volume label after a format.
    pub fn update_cartridge_label(
        &mut self,
        tape_id: &str,
        label: VolumeLabel,
    ) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.map = Self::load_cartridge_db(&self.inventory_path)?;

        match self.map.get_mut(tape_id) {
            Some(cartridge) => {
                cartridge.label = label;
                cartridge.used_bytes = 0;
                cartridge.updated_at = proxmox_time::epoch_i64();
            }
            None => bail!("no such cartridge '{}'", tape_id),
        }

        self.replace_file()?;
        Ok(())
    }

    /// Record usage and health data after a backup.
    pub fn update_cartridge_usage(
        &mut self,
        tape_id: &str,
        used_bytes: u64,
        last_health: Option<String>,
    ) -> Result<(), Error> {
        let _lock = self.lock()?;
        self.map = Self::load_cartridge_db(&self.inventory_path)?;

        match self.map.get_mut(tape_id) {
            Some(cartridge) => {
                cartridge.used_bytes = used_bytes;
                if last_health.is_some() {
                    cartridge.last_health = last_health;
                }
                cartridge.updated_at = proxmox_time::epoch_i64();
            }
            None => bail!("no such cartridge '{}'", tape_id),
        }

        self.replace_file()?;
        Ok(())
    }

    /// Lookup a cartridge
    pub fn lookup_cartridge(&self, tape_id: &str) -> Option<&TapeCartridge> {
        self.map.get(tape_id)
    }

    /// List all cartridges
    pub fn list_cartridges(&self) -> Vec<&TapeCartridge> {
        self.map.values().collect()
    }

    /// All labels ever written, used for sequence allocation.
    pub fn list_known_labels(&self) -> Vec<VolumeLabel> {
        self.map.values().map(|cartridge| cartridge.label).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tvs_api_types::{CartridgeLocation, TapeDensity};

    fn test_cartridge(tape_id: &str, label: &str) -> TapeCartridge {
        let now = proxmox_time::epoch_i64();
        TapeCartridge {
            tape_id: tape_id.to_string(),
            label: label.parse().unwrap(),
            kind: TapeDensity::LTO8,
            capacity_bytes: 12 * 1024 * 1024 * 1024 * 1024,
            used_bytes: 0,
            location: CartridgeLocation::Slot(1),
            manufactured_on: now - 1000,
            expires_on: now + 1000,
            status: CartridgeStatus::Idle,
            last_health: None,
            created_at: now,
            updated_at: now,
        }
    }

    struct TestDir(PathBuf);

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn test_dir(name: &str) -> TestDir {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "tapevault-inventory-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        TestDir(path)
    }

    #[test]
    fn test_upsert_and_labels() -> Result<(), Error> {
        let dir = test_dir("upsert");
        let mut inventory = Inventory::load(&dir.0)?;

        inventory.upsert_cartridge(test_cartridge("tape1", "TP20250101"))?;
        inventory.upsert_cartridge(test_cartridge("tape2", "TP20250102"))?;

        // reload from disk
        let inventory = Inventory::load(&dir.0)?;
        assert_eq!(inventory.list_cartridges().len(), 2);

        let labels = inventory.list_known_labels();
        assert_eq!(labels.len(), 2);

        let next = VolumeLabel::next_in_month(&labels, 2025, 1)?;
        assert_eq!(next.to_string(), "TP20250103");

        Ok(())
    }

    #[test]
    fn test_status_update_idempotent() -> Result<(), Error> {
        let dir = test_dir("status");
        let mut inventory = Inventory::load(&dir.0)?;

        inventory.upsert_cartridge(test_cartridge("tape1", "TP20250101"))?;

        inventory.update_cartridge_status("tape1", CartridgeStatus::Mounted)?;
        inventory.update_cartridge_status("tape1", CartridgeStatus::Mounted)?;

        let mut inventory = Inventory::load(&dir.0)?;
        assert_eq!(
            inventory.lookup_cartridge("tape1").unwrap().status,
            CartridgeStatus::Mounted
        );

        assert!(inventory
            .update_cartridge_status("missing", CartridgeStatus::Idle)
            .is_err());

        Ok(())
    }

    #[test]
    fn test_rejects_bad_expiry() {
        let dir = test_dir("expiry");
        let mut inventory = Inventory::load(&dir.0).unwrap();

        let mut cartridge = test_cartridge("tape1", "TP20250101");
        cartridge.expires_on = cartridge.manufactured_on - 1;

        assert!(inventory.upsert_cartridge(cartridge).is_err());
    }
}
