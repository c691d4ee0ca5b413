// src/discovery/mod.rs
//
// Locating raw MaxWell recordings and reading what their folder layout
// says about them: <date>/<chip_id>/<scan_type>/<run_id>/data.raw.h5

pub mod maxwell;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::utils::log::LogContext;

pub const RAW_FILE_NAME: &str = "data.raw.h5";

/// Every `data.raw.h5` below the given directories, sorted.
pub fn extract_raw_h5_filepaths<P: AsRef<Path>>(directories: &[P], log: &LogContext) -> Vec<PathBuf> {
    let _span = log.enter();
    info!("Extracting .h5 file paths from {} directories", directories.len());

    let mut found = Vec::new();
    for directory in directories {
        for entry in WalkDir::new(directory.as_ref()).follow_links(false) {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file() && entry.file_name() == RAW_FILE_NAME {
                        found.push(entry.path().to_path_buf());
                    }
                }
                Err(e) => warn!("Error accessing entry: {}", e),
            }
        }
    }
    found.sort();
    info!("{} recordings found", found.len());
    found
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingDetails {
    pub h5_file_path: PathBuf,
    pub run_id: String,
    pub scan_type: String,
    pub chip_id: String,
    pub date: String,
}

impl RecordingDetails {
    pub fn from_path(h5_file_path: &Path) -> Self {
        let mut ancestors = h5_file_path
            .ancestors()
            .skip(1)
            .map(|dir| {
                dir.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
        let mut next = || ancestors.next().unwrap_or_default();
        let run_id = next();
        let scan_type = next();
        let chip_id = next();
        let date = next();
        Self {
            h5_file_path: h5_file_path.to_path_buf(),
            run_id,
            scan_type,
            chip_id,
            date,
        }
    }

    /// Network scans hold a single recording per well.
    pub fn is_network_scan(&self) -> bool {
        self.h5_file_path.to_string_lossy().contains("Network")
    }
}

pub fn extract_recording_details<P: AsRef<Path>>(paths: &[P], log: &LogContext) -> Vec<RecordingDetails> {
    let _span = log.enter();
    info!("Extracting recording details from {} paths", paths.len());
    paths
        .iter()
        .map(|p| RecordingDetails::from_path(p.as_ref()))
        .collect()
}
