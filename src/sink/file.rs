//! Rotated MessagePack log: a synchronous writer on its own thread,
//! fed through a bounded sentinel-terminated queue.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

use crate::error::Result;
use crate::record::{DataType, QueueEntry};

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const HOUR_FORMAT: &str = "%Y-%m-%dT%H";

/// Append-only msgpack file for one data type, rotated by UTC hour
pub struct RecordWriter {
    dir: PathBuf,
    current_hour: String,
    file: BufWriter<File>,
}

impl RecordWriter {
    pub fn create(dir: PathBuf) -> Result<Self> {
        let current_hour = utc_hour();
        let file = open_hour_file(&dir, &current_hour)?;
        Ok(Self {
            dir,
            current_hour,
            file,
        })
    }

    fn check_rotation(&mut self) -> Result<()> {
        let hour = utc_hour();
        if hour != self.current_hour {
            // open the new file before switching so a failure keeps the
            // old handle usable
            let file = open_hour_file(&self.dir, &hour)?;
            self.file.flush()?;
            self.file = file;
            self.current_hour = hour;
        }
        Ok(())
    }

    /// Append one self-delimited record and flush it.
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        self.check_rotation()?;
        rmp_serde::encode::write_named(&mut self.file, record)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

fn utc_hour() -> String {
    Utc::now().format(HOUR_FORMAT).to_string()
}

fn open_hour_file(dir: &Path, hour: &str) -> Result<BufWriter<File>> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{hour}.msgpack"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// Queue consumer: routes entries to the per-type writers until the
/// `None` sentinel arrives or the queue disconnects.
pub struct WriterService {
    data_dir: PathBuf,
    queue: Receiver<Option<QueueEntry>>,
}

impl WriterService {
    pub fn new(data_dir: PathBuf, queue: Receiver<Option<QueueEntry>>) -> Self {
        Self { data_dir, queue }
    }

    pub fn run(self) -> Result<()> {
        let mut depth = RecordWriter::create(self.data_dir.join(DataType::Depth.as_str()))?;
        let mut agg_trade =
            RecordWriter::create(self.data_dir.join(DataType::AggTrade.as_str()))?;

        loop {
            match self.queue.recv_timeout(POLL_TIMEOUT) {
                Ok(Some(entry)) => {
                    let written = match &entry {
                        QueueEntry::Depth(record) => depth.write(record),
                        QueueEntry::AggTrade(record) => agg_trade.write(record),
                    };
                    if let Err(error) = written {
                        error!(%error, data_type = %entry.data_type(), "failed to write record");
                    }
                }
                Ok(None) => break,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("closing writer");
        depth.close()?;
        agg_trade.close()?;
        Ok(())
    }
}

pub fn spawn_writer(
    data_dir: PathBuf,
    queue: Receiver<Option<QueueEntry>>,
) -> Result<JoinHandle<Result<()>>> {
    let handle = std::thread::Builder::new()
        .name("record-writer".to_string())
        .spawn(move || WriterService::new(data_dir, queue).run())?;
    Ok(handle)
}

/// All records of one msgpack file. Records are self-delimited; the
/// stream ends at EOF.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    loop {
        match rmp_serde::decode::from_read(&mut reader) {
            Ok(record) => records.push(record),
            Err(rmp_serde::decode::Error::InvalidMarkerRead(ref io))
                if io.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(error) => return Err(error.into()),
        }
    }
    Ok(records)
}

/// Msgpack files of one data-type directory in name (= hour) order.
pub fn sorted_record_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "msgpack"))
        .collect();
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::mpsc::sync_channel;

    use crate::exchange::TradeSide;
    use crate::record::{AggTradeRecord, DepthRecord};

    use super::*;

    fn depth_record(time: i64) -> DepthRecord {
        let mut bids = BTreeMap::new();
        bids.insert("140.5".to_string(), "3.2".to_string());
        DepthRecord {
            symbol: "SOLUSDT".to_string(),
            event_time_ms: time,
            bids,
            asks: BTreeMap::new(),
        }
    }

    #[test]
    fn writes_and_reads_back_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::create(dir.path().to_path_buf()).unwrap();
        writer.write(&depth_record(1)).unwrap();
        writer.write(&depth_record(2)).unwrap();
        writer.close().unwrap();

        let files = sorted_record_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        let records: Vec<DepthRecord> = read_records(&files[0]).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_time_ms, 1);
        assert_eq!(records[1].bids["140.5"], "3.2");
    }

    #[test]
    fn rotates_when_the_hour_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = RecordWriter::create(dir.path().to_path_buf()).unwrap();
        writer.write(&depth_record(1)).unwrap();

        // pretend the open file belongs to a past hour
        writer.current_hour = "2020-01-01T00".to_string();
        writer.write(&depth_record(2)).unwrap();
        writer.close().unwrap();

        let files = sorted_record_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn writer_service_routes_and_stops_on_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = sync_channel(16);

        tx.send(Some(QueueEntry::Depth(depth_record(1)))).unwrap();
        tx.send(Some(QueueEntry::AggTrade(AggTradeRecord {
            side: TradeSide::Long,
            symbol: "SOLUSDT".to_string(),
            event_time_ms: 2,
            price: "140.50".to_string(),
            quantity: "1".to_string(),
        })))
        .unwrap();
        tx.send(None).unwrap();

        WriterService::new(dir.path().to_path_buf(), rx).run().unwrap();

        let depth_files = sorted_record_files(&dir.path().join("depth")).unwrap();
        let trade_files = sorted_record_files(&dir.path().join("agg_trade")).unwrap();
        assert_eq!(depth_files.len(), 1);
        assert_eq!(trade_files.len(), 1);

        let trades: Vec<AggTradeRecord> = read_records(&trade_files[0]).unwrap();
        assert_eq!(trades[0].symbol, "SOLUSDT");
    }
}
