// src/discovery/maxwell.rs
//
// Probing MaxOne / MaxTwo files through an HDF5 reader supplied by the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use super::RecordingDetails;
use crate::error::{PipelineError, Result};
use crate::recording::binary::read_binary_recording;
use crate::recording::SharedRecording;
use crate::utils::log::LogContext;

/// Opens one recording of a MaxWell file. `stream_id` is `None` on MaxOne.
pub trait MaxwellReader: Send + Sync {
    fn read(&self, path: &Path, rec_name: &str, stream_id: Option<&str>) -> Result<SharedRecording>;
}

/// Recordings already exported to binary folders, laid out like the HDF5
/// groups they came from: `<path>/[wellNNN/]recNNNN/`.
pub struct BinaryFolderReader;

impl BinaryFolderReader {
    pub fn folder(path: &Path, rec_name: &str, stream_id: Option<&str>) -> PathBuf {
        match stream_id {
            Some(stream_id) => path.join(stream_id).join(rec_name),
            None => path.join(rec_name),
        }
    }
}

impl MaxwellReader for BinaryFolderReader {
    fn read(&self, path: &Path, rec_name: &str, stream_id: Option<&str>) -> Result<SharedRecording> {
        let folder = Self::folder(path, rec_name, stream_id);
        if !folder.is_dir() {
            return Err(PipelineError::Recording(format!(
                "Unable to open object (object '{}' doesn't exist)",
                rec_name
            )));
        }
        Ok(Arc::new(read_binary_recording(folder)?))
    }
}

pub fn rec_name(rec_num: usize) -> String {
    format!("rec{:04}", rec_num)
}

pub fn stream_name(well_num: usize) -> String {
    format!("well{:03}", well_num)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Device {
    MaxOne,
    MaxTwo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WellCounts {
    /// `None` when neither layout could be read.
    pub device: Option<Device>,
    /// Recordings per well, in well order.
    pub rec_counts: Vec<usize>,
}

impl WellCounts {
    pub fn num_wells(&self) -> usize {
        self.rec_counts.len()
    }
}

fn count_recordings(
    reader: &dyn MaxwellReader,
    path: &Path,
    stream_id: Option<&str>,
    network: bool,
) -> usize {
    let mut count = 0;
    while reader.read(path, &rec_name(count), stream_id).is_ok() {
        count += 1;
        if network {
            break;
        }
    }
    count
}

pub fn count_wells_and_recs(reader: &dyn MaxwellReader, path: &Path, log: &LogContext) -> WellCounts {
    let _span = log.enter();
    info!("Counting wells and recordings in {}", path.display());
    let details = RecordingDetails::from_path(path);
    info!("Scan type: {}", details.scan_type);
    let network = details.is_network_scan();

    let first_well = stream_name(0);
    let device = if reader.read(path, &rec_name(0), Some(&first_well)).is_ok() {
        Device::MaxTwo
    } else if reader.read(path, &rec_name(0), None).is_ok() {
        Device::MaxOne
    } else {
        error!("Unable to read recording. Cannot identify as MaxOne or MaxTwo.");
        return WellCounts {
            device: None,
            rec_counts: Vec::new(),
        };
    };

    let rec_counts = match device {
        Device::MaxOne => {
            info!("MaxOne detected.");
            vec![count_recordings(reader, path, None, network)]
        }
        Device::MaxTwo => {
            info!("MaxTwo detected.");
            let mut counts = Vec::new();
            for well in 0.. {
                let stream_id = stream_name(well);
                let count = count_recordings(reader, path, Some(&stream_id), network);
                if count == 0 {
                    break;
                }
                info!("Stream ID: {}, {} recordings detected.", stream_id, count);
                counts.push(count);
            }
            counts
        }
    };

    let min = rec_counts.iter().min().copied().unwrap_or(0);
    let max = rec_counts.iter().max().copied().unwrap_or(0);
    if min != max {
        warn!(
            "The number of recordings is not consistent across all stream IDs. Range: {}-{}",
            min, max
        );
    } else {
        info!("Recordings per stream ID: {}", max);
    }
    info!("Stream IDs detected: {}", rec_counts.len());

    WellCounts {
        device: Some(device),
        rec_counts,
    }
}

pub struct MaxwellRecording {
    pub recording: SharedRecording,
    pub rec_name: String,
    pub stream_id: Option<String>,
}

pub fn get_data_maxwell(
    reader: &dyn MaxwellReader,
    path: &Path,
    rec_num: usize,
    well_num: Option<usize>,
    log: &LogContext,
) -> Result<MaxwellRecording> {
    let _span = log.enter();
    let rec_name = rec_name(rec_num);
    let stream_id = well_num.map(stream_name);
    match reader.read(path, &rec_name, stream_id.as_deref()) {
        Ok(recording) => {
            info!("Read {} {}", rec_name, stream_id.as_deref().unwrap_or(""));
            Ok(MaxwellRecording {
                recording,
                rec_name,
                stream_id,
            })
        }
        Err(e) => {
            error!("Failed to read recording {}: {}", rec_name, e);
            Err(e)
        }
    }
}

/// True when every recording of every well can be read.
pub fn test_continuity(reader: &dyn MaxwellReader, path: &Path, log: &LogContext) -> bool {
    let counts = count_wells_and_recs(reader, path, log);
    let _span = log.enter();
    info!("Testing continuity of {}", path.display());
    if counts.num_wells() == 0 {
        error!("No recordings detected, none are continuous.");
        return false;
    }

    let mut continuous = true;
    for (well, &recs) in counts.rec_counts.iter().enumerate() {
        let well_num = (counts.device == Some(Device::MaxTwo)).then_some(well);
        for rec_num in 0..recs {
            match get_data_maxwell(reader, path, rec_num, well_num, log) {
                Ok(read) => info!(
                    "Successfully read stream {}, recording {}",
                    read.stream_id.as_deref().unwrap_or("-"),
                    read.rec_name
                ),
                Err(e) if e.to_string().contains("'routed'") => {
                    error!("'RecordSpikesOnly' was active during this recording. Data are not continuous.");
                    continuous = false;
                }
                Err(e) => {
                    error!("Unexpected error while reading {}: {}", rec_name(rec_num), e);
                    continuous = false;
                }
            }
        }
    }

    if continuous {
        info!("All recordings are continuous.");
    } else {
        error!("Data are not continuous.");
    }
    continuous
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::binary::write_binary_recording;
    use crate::recording::{InMemoryRecording, Recording};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    /// Serves recordings keyed by (stream, rec name); everything else fails.
    struct FakeReader {
        available: BTreeSet<(Option<String>, String)>,
    }

    impl FakeReader {
        fn maxtwo(counts: &[usize]) -> Self {
            let mut available = BTreeSet::new();
            for (well, &n) in counts.iter().enumerate() {
                for rec in 0..n {
                    available.insert((Some(stream_name(well)), rec_name(rec)));
                }
            }
            Self { available }
        }

        fn maxone(n: usize) -> Self {
            let available = (0..n).map(|rec| (None, rec_name(rec))).collect();
            Self { available }
        }
    }

    impl MaxwellReader for FakeReader {
        fn read(&self, _path: &Path, rec_name: &str, stream_id: Option<&str>) -> Result<SharedRecording> {
            if self
                .available
                .contains(&(stream_id.map(String::from), rec_name.to_string()))
            {
                Ok(Arc::new(
                    InMemoryRecording::new(1.0, vec!["0".into()], vec![[0.0, 0.0]], vec![vec![0.0]])
                        .unwrap(),
                ))
            } else {
                Err(PipelineError::Recording(
                    "Unable to open object (object 'routed' doesn't exist)".into(),
                ))
            }
        }
    }

    fn path(scan: &str) -> std::path::PathBuf {
        Path::new("/d/240101/M1").join(scan).join("000001/data.raw.h5")
    }

    #[test]
    fn names_are_zero_padded() {
        assert_eq!(rec_name(3), "rec0003");
        assert_eq!(stream_name(12), "well012");
    }

    #[test]
    fn maxtwo_counts_each_well() {
        let log = LogContext::disabled();
        let counts = count_wells_and_recs(&FakeReader::maxtwo(&[2, 2, 1]), &path("ActivityScan"), &log);
        assert_eq!(counts.device, Some(Device::MaxTwo));
        assert_eq!(counts.rec_counts, vec![2, 2, 1]);
    }

    #[test]
    fn maxone_stops_at_first_missing_recording() {
        let log = LogContext::disabled();
        let counts = count_wells_and_recs(&FakeReader::maxone(3), &path("ActivityScan"), &log);
        assert_eq!(counts.device, Some(Device::MaxOne));
        assert_eq!(counts.rec_counts, vec![3]);
    }

    #[test]
    fn network_scans_count_one_recording() {
        let log = LogContext::disabled();
        let counts = count_wells_and_recs(&FakeReader::maxtwo(&[3, 3]), &path("Network"), &log);
        assert_eq!(counts.rec_counts, vec![1, 1]);
    }

    #[test]
    fn unreadable_file_has_no_wells() {
        let log = LogContext::disabled();
        let counts = count_wells_and_recs(&FakeReader::maxone(0), &path("Network"), &log);
        assert_eq!(counts.device, None);
        assert!(!test_continuity(&FakeReader::maxone(0), &path("Network"), &log));
    }

    #[test]
    fn continuity_holds_when_everything_reads() {
        let log = LogContext::disabled();
        assert!(test_continuity(&FakeReader::maxtwo(&[2, 2]), &path("ActivityScan"), &log));
        assert!(get_data_maxwell(&FakeReader::maxone(1), &path("x"), 0, None, &log).is_ok());
        assert!(get_data_maxwell(&FakeReader::maxone(1), &path("x"), 1, None, &log).is_err());
    }

    #[test]
    fn binary_folders_stand_in_for_maxtwo_groups() {
        let dir = TempDir::new().unwrap();
        let rec = InMemoryRecording::new(100.0, vec!["0".into()], vec![[0.0, 0.0]], vec![vec![1.0; 4]]).unwrap();
        for well in 0..2 {
            write_binary_recording(&rec, BinaryFolderReader::folder(dir.path(), &rec_name(0), Some(&stream_name(well))))
                .unwrap();
        }
        let log = LogContext::disabled();
        let counts = count_wells_and_recs(&BinaryFolderReader, dir.path(), &log);
        assert_eq!(counts.device, Some(Device::MaxTwo));
        assert_eq!(counts.rec_counts, vec![1, 1]);
        let read = get_data_maxwell(&BinaryFolderReader, dir.path(), 0, Some(1), &log).unwrap();
        assert_eq!(read.recording.num_samples(0), 4);
    }
}
