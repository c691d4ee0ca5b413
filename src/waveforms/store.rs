// src/waveforms/store.rs
//
// Final merged waveform store:
//   store.json                  StoreInfo
//   params.json                 canonical WaveformParams
//   waveforms/                  waveforms_<unit>.bin, sampled_index_<unit>.json
//   templates/template_<unit>.bin

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::array::WaveformArray;
use super::storage::Storage;
use super::{sampled_index_file, waveforms_file, SpikeIndex, WaveformParams, PARAMS_FILE};
use crate::error::{PipelineError, Result};
use crate::recording::UnitId;

pub const STORE_INFO_FILE: &str = "store.json";
pub const TEMPLATES_DIR: &str = "templates";

pub fn template_file(folder: &Path, unit: UnitId) -> PathBuf {
    folder
        .join(TEMPLATES_DIR)
        .join(format!("template_{}.bin", unit))
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoreInfo {
    pub unit_ids: Vec<UnitId>,
    pub ms_before: f64,
    pub ms_after: f64,
    pub sparse: bool,
    pub created_at: DateTime<Utc>,
}

pub struct WaveformStore {
    storage: Arc<dyn Storage>,
    folder: PathBuf,
    info: StoreInfo,
    params: Option<WaveformParams>,
    templates: BTreeMap<UnitId, WaveformArray>,
}

impl std::fmt::Debug for WaveformStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaveformStore")
            .field("folder", &self.folder)
            .field("info", &self.info)
            .field("params", &self.params)
            .field("templates", &self.templates)
            .finish_non_exhaustive()
    }
}

impl WaveformStore {
    /// Starts an empty store at `folder`, replacing whatever was there.
    /// Nothing marks it complete until `save` writes `store.json`.
    pub fn create(
        storage: Arc<dyn Storage>,
        folder: &Path,
        unit_ids: Vec<UnitId>,
        ms_before: f64,
        ms_after: f64,
        sparse: bool,
    ) -> Result<Self> {
        storage.delete(folder)?;
        Ok(Self {
            storage,
            folder: folder.to_path_buf(),
            info: StoreInfo {
                unit_ids,
                ms_before,
                ms_after,
                sparse,
                created_at: Utc::now(),
            },
            params: None,
            templates: BTreeMap::new(),
        })
    }

    pub fn load(storage: Arc<dyn Storage>, folder: &Path) -> Result<Self> {
        let info_path = folder.join(STORE_INFO_FILE);
        let info: StoreInfo = serde_json::from_slice(&storage.read(&info_path)?)
            .map_err(|e| PipelineError::invalid_data(&info_path, e.to_string()))?;
        let params = if storage.exists(&folder.join(PARAMS_FILE)) {
            Some(WaveformParams::read(storage.as_ref(), folder)?)
        } else {
            None
        };
        Ok(Self {
            storage,
            folder: folder.to_path_buf(),
            info,
            params,
            templates: BTreeMap::new(),
        })
    }

    /// Persists every template computed so far, then the store info.
    /// `store.json` goes last so `load` only ever sees finished stores.
    pub fn save(&self) -> Result<()> {
        for (unit, template) in &self.templates {
            self.storage
                .write(&template_file(&self.folder, *unit), &template.to_bytes())?;
        }
        self.write_info()
    }

    fn write_info(&self) -> Result<()> {
        self.storage.write(
            &self.folder.join(STORE_INFO_FILE),
            &serde_json::to_vec_pretty(&self.info)?,
        )?;
        Ok(())
    }

    pub(crate) fn read_params(&mut self) -> Result<()> {
        self.params = Some(WaveformParams::read(self.storage.as_ref(), &self.folder)?);
        Ok(())
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub fn unit_ids(&self) -> &[UnitId] {
        &self.info.unit_ids
    }

    pub fn params(&self) -> Result<&WaveformParams> {
        self.params
            .as_ref()
            .ok_or_else(|| PipelineError::invalid_data(self.folder.join(PARAMS_FILE), "missing"))
    }

    pub fn waveforms(&self, unit: UnitId) -> Result<WaveformArray> {
        let path = waveforms_file(&self.folder, unit);
        WaveformArray::from_bytes(&self.storage.read(&path)?, &path)
    }

    pub fn sampled_index(&self, unit: UnitId) -> Result<Vec<SpikeIndex>> {
        let path = sampled_index_file(&self.folder, unit);
        serde_json::from_slice(&self.storage.read(&path)?)
            .map_err(|e| PipelineError::invalid_data(path, e.to_string()))
    }

    /// Average template of one unit, from the cache, disk or raw waveforms.
    pub fn template(&self, unit: UnitId) -> Result<WaveformArray> {
        if let Some(template) = self.templates.get(&unit) {
            return Ok(template.clone());
        }
        let path = template_file(&self.folder, unit);
        if self.storage.exists(&path) {
            return WaveformArray::from_bytes(&self.storage.read(&path)?, &path);
        }
        Ok(self.waveforms(unit)?.average())
    }

    /// Computes the average template of every unit and keeps them for `save`.
    pub fn get_all_templates(&mut self) -> Result<&BTreeMap<UnitId, WaveformArray>> {
        for unit in self.info.unit_ids.clone() {
            if !self.templates.contains_key(&unit) {
                let template = self.waveforms(unit)?.average();
                self.templates.insert(unit, template);
            }
        }
        Ok(&self.templates)
    }

    /// Copies a subset of units into a new store at `new_folder`.
    pub fn select_units(&self, units: &[UnitId], new_folder: &Path) -> Result<WaveformStore> {
        if let Some(unknown) = units.iter().find(|u| !self.info.unit_ids.contains(*u)) {
            return Err(PipelineError::invalid_data(
                &self.folder,
                format!("unit {} is not in the store", unknown),
            ));
        }
        let mut selected = WaveformStore::create(
            Arc::clone(&self.storage),
            new_folder,
            units.to_vec(),
            self.info.ms_before,
            self.info.ms_after,
            self.info.sparse,
        )?;
        if let Some(params) = &self.params {
            params.write(self.storage.as_ref(), new_folder)?;
            selected.params = Some(params.clone());
        }
        for &unit in units {
            self.storage
                .copy(&waveforms_file(&self.folder, unit), &waveforms_file(new_folder, unit))?;
            self.storage.copy(
                &sampled_index_file(&self.folder, unit),
                &sampled_index_file(new_folder, unit),
            )?;
        }
        selected.get_all_templates()?;
        selected.save()?;
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveforms::storage::MemoryStorage;

    fn seeded(storage: &Arc<MemoryStorage>, folder: &Path, units: &[UnitId]) -> WaveformStore {
        let shared: Arc<dyn Storage> = storage.clone();
        let store = WaveformStore::create(shared, folder, units.to_vec(), 1.0, 2.0, false).unwrap();
        for &unit in units {
            let value = unit as f32;
            let array = WaveformArray::new(2, 1, vec![0], vec![value, value + 2.0]).unwrap();
            storage
                .write(&waveforms_file(folder, unit), &array.to_bytes())
                .unwrap();
            let index = vec![SpikeIndex { segment: 0, frame: 10 }, SpikeIndex { segment: 0, frame: 20 }];
            storage
                .write(&sampled_index_file(folder, unit), &serde_json::to_vec(&index).unwrap())
                .unwrap();
        }
        store
    }

    #[test]
    fn templates_are_saved_and_reloaded() {
        let storage = Arc::new(MemoryStorage::new());
        let folder = Path::new("/wf");
        let mut store = seeded(&storage, folder, &[1, 2]);
        assert_eq!(store.get_all_templates().unwrap().len(), 2);
        store.save().unwrap();

        let reloaded = WaveformStore::load(storage.clone(), folder).unwrap();
        assert_eq!(reloaded.unit_ids(), &[1, 2]);
        assert!(storage.exists(&template_file(folder, 2)));
        assert_eq!(reloaded.template(2).unwrap().data, vec![3.0]);
        assert_eq!(reloaded.sampled_index(1).unwrap().len(), 2);
        assert!(reloaded.params().is_err());
    }

    #[test]
    fn select_units_copies_subset() {
        let storage = Arc::new(MemoryStorage::new());
        let store = seeded(&storage, Path::new("/wf"), &[1, 2, 3]);
        let good = store.select_units(&[3], Path::new("/wf_good")).unwrap();
        assert_eq!(good.unit_ids(), &[3]);
        assert_eq!(good.waveforms(3).unwrap().num_spikes, 2);
        assert!(storage.exists(&template_file(Path::new("/wf_good"), 3)));
        assert!(good.waveforms(1).is_err());
        assert!(store.select_units(&[9], Path::new("/wf_bad")).is_err());
    }

    #[test]
    fn store_is_not_loadable_until_saved() {
        let storage = Arc::new(MemoryStorage::new());
        let folder = Path::new("/wf");
        let mut store = seeded(&storage, folder, &[1]);
        assert!(WaveformStore::load(storage.clone(), folder).is_err());

        store.get_all_templates().unwrap();
        store.save().unwrap();
        assert_eq!(WaveformStore::load(storage.clone(), folder).unwrap().unit_ids(), &[1]);
    }

    #[test]
    fn missing_store_fails_to_load() {
        let storage = Arc::new(MemoryStorage::new());
        assert!(WaveformStore::load(storage, Path::new("/nowhere")).is_err());
    }
}
