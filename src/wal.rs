use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::Path,
    sync::Mutex,
};

use log::{debug, warn};

use crate::{
    error::{ErrorKind, SmallError},
    schema::Value,
    types::{StorageResult, TransactionID},
};

/// One parsed line of the write-ahead log. The textual, comma-separated
/// format is a deliberately simple baseline: field values are not
/// escaped, so a string value containing a comma or newline would
/// corrupt the framing of the record that follows it. This is a known
/// limitation of the format, not a bug to be fixed here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Insert {
        tx: TransactionID,
        table: String,
        page_no: u32,
        slot_no: u32,
        values: Vec<Value>,
    },
    Delete {
        tx: TransactionID,
        table: String,
        page_no: u32,
        slot_no: u32,
        values: Vec<Value>,
    },
    Update {
        tx: TransactionID,
        table: String,
        page_no: u32,
        slot_no: u32,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    },
    Commit {
        tx: TransactionID,
    },
    Abort {
        tx: TransactionID,
    },
}

fn encode_value(v: &Value) -> String {
    match v {
        Value::Int(i) => format!("I:{}", i),
        Value::Str(bytes) => format!("S:{}", String::from_utf8_lossy(bytes)),
    }
}

fn decode_value(field: &str) -> StorageResult<Value> {
    if let Some(rest) = field.strip_prefix("I:") {
        let i: i32 = rest
            .parse()
            .map_err(|_| SmallError::with_kind(ErrorKind::CorruptLog, "bad int field in WAL record"))?;
        Ok(Value::Int(i))
    } else if let Some(rest) = field.strip_prefix("S:") {
        Ok(Value::Str(rest.as_bytes().to_vec()))
    } else {
        Err(SmallError::with_kind(
            ErrorKind::CorruptLog,
            &format!("field '{}' has no recognized type prefix", field),
        ))
    }
}

fn encode_values(values: &[Value]) -> String {
    values.iter().map(encode_value).collect::<Vec<_>>().join(",")
}

fn decode_values(fields: &[&str]) -> StorageResult<Vec<Value>> {
    fields.iter().map(|f| decode_value(f)).collect()
}

/// Appends and replays the textual WAL. One line per record; `append`
/// forces each write (and its flush) before returning, matching the
/// WAL rule that a data page is never written to disk ahead of the log
/// record describing it.
pub struct WalManager {
    file: Mutex<File>,
}

impl WalManager {
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn append_line(&self, line: String) -> StorageResult<()> {
        let mut file = self.file.lock().unwrap();
        writeln!(file, "{}", line)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn log_insert(
        &self,
        tx: TransactionID,
        table: &str,
        page_no: u32,
        slot_no: u32,
        values: &[Value],
    ) -> StorageResult<()> {
        self.append_line(format!(
            "INSERT,{},{},{},{},{}",
            tx,
            table,
            page_no,
            slot_no,
            encode_values(values)
        ))
    }

    pub fn log_delete(
        &self,
        tx: TransactionID,
        table: &str,
        page_no: u32,
        slot_no: u32,
        values: &[Value],
    ) -> StorageResult<()> {
        self.append_line(format!(
            "DELETE,{},{},{},{},{}",
            tx,
            table,
            page_no,
            slot_no,
            encode_values(values)
        ))
    }

    pub fn log_update(
        &self,
        tx: TransactionID,
        table: &str,
        page_no: u32,
        slot_no: u32,
        old_values: &[Value],
        new_values: &[Value],
    ) -> StorageResult<()> {
        self.append_line(format!(
            "UPDATE,{},{},{},{},{};{}",
            tx,
            table,
            page_no,
            slot_no,
            encode_values(old_values),
            encode_values(new_values)
        ))
    }

    pub fn log_commit(&self, tx: TransactionID) -> StorageResult<()> {
        self.append_line(format!("COMMIT,{}", tx))
    }

    pub fn log_abort(&self, tx: TransactionID) -> StorageResult<()> {
        self.append_line(format!("ABORT,{}", tx))
    }

    /// Parse every record currently in the log, in write order. Only a
    /// trailing partial line -- the tail of a write that never completed,
    /// recognizable because the file ends before its newline -- is
    /// discarded with a warning. Any other malformed line is corruption:
    /// it means a record that was supposedly durable is unreadable, so
    /// this returns `CorruptLog` rather than silently skipping it.
    pub fn read_all(&self) -> StorageResult<Vec<WalRecord>> {
        let mut file = self.file.lock().unwrap();
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut *file);
        let mut lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            let n = reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            let ends_with_newline = line.ends_with('\n');
            lines.push((line.clone(), ends_with_newline));
        }

        let mut records = Vec::new();
        let last_idx = lines.len().checked_sub(1);

        for (idx, (raw, ends_with_newline)) in lines.iter().enumerate() {
            let trimmed = raw.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                continue;
            }

            match parse_line(trimmed) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let is_trailing_partial = !ends_with_newline && Some(idx) == last_idx;
                    if is_trailing_partial {
                        warn!("discarding partial trailing WAL line: {} ({})", trimmed, e);
                    } else {
                        return Err(SmallError::with_kind(
                            ErrorKind::CorruptLog,
                            &format!("malformed WAL record before end of log: {} ({})", trimmed, e),
                        ));
                    }
                }
            }
        }

        debug!("parsed {} WAL records", records.len());
        Ok(records)
    }

    /// Truncate the log. Called after a checkpoint/clean shutdown where
    /// every record has already been durably reflected in the data
    /// files.
    pub fn reset(&self) -> StorageResult<()> {
        let mut file = self.file.lock().unwrap();
        file.set_len(0)?;
        use std::io::Seek;
        file.seek(std::io::SeekFrom::Start(0))?;
        Ok(())
    }
}

fn parse_line(line: &str) -> StorageResult<WalRecord> {
    let fields: Vec<&str> = line.split(',').collect();
    let corrupt = |msg: &str| SmallError::with_kind(ErrorKind::CorruptLog, msg);

    match fields.first().copied() {
        Some("INSERT") | Some("DELETE") => {
            if fields.len() < 5 {
                return Err(corrupt("INSERT/DELETE record has too few fields"));
            }
            let tx: TransactionID = fields[1].parse().map_err(|_| corrupt("bad tx id"))?;
            let table = fields[2].to_string();
            let page_no: u32 = fields[3].parse().map_err(|_| corrupt("bad page_no"))?;
            let slot_no: u32 = fields[4].parse().map_err(|_| corrupt("bad slot_no"))?;
            let values = decode_values(&fields[5..])?;

            if fields[0] == "INSERT" {
                Ok(WalRecord::Insert {
                    tx,
                    table,
                    page_no,
                    slot_no,
                    values,
                })
            } else {
                Ok(WalRecord::Delete {
                    tx,
                    table,
                    page_no,
                    slot_no,
                    values,
                })
            }
        }
        Some("UPDATE") => {
            if fields.len() < 6 {
                return Err(corrupt("UPDATE record has too few fields"));
            }
            let tx: TransactionID = fields[1].parse().map_err(|_| corrupt("bad tx id"))?;
            let table = fields[2].to_string();
            let page_no: u32 = fields[3].parse().map_err(|_| corrupt("bad page_no"))?;
            let slot_no: u32 = fields[4].parse().map_err(|_| corrupt("bad slot_no"))?;

            let rest = fields[5..].join(",");
            let mut halves = rest.splitn(2, ';');
            let old_part = halves.next().unwrap_or("");
            let new_part = halves.next().ok_or_else(|| corrupt("UPDATE record missing ';' separator"))?;

            let old_values = if old_part.is_empty() {
                Vec::new()
            } else {
                decode_values(&old_part.split(',').collect::<Vec<_>>())?
            };
            let new_values = if new_part.is_empty() {
                Vec::new()
            } else {
                decode_values(&new_part.split(',').collect::<Vec<_>>())?
            };

            Ok(WalRecord::Update {
                tx,
                table,
                page_no,
                slot_no,
                old_values,
                new_values,
            })
        }
        Some("COMMIT") => {
            if fields.len() != 2 {
                return Err(corrupt("COMMIT record must have exactly one field"));
            }
            let tx: TransactionID = fields[1].parse().map_err(|_| corrupt("bad tx id"))?;
            Ok(WalRecord::Commit { tx })
        }
        Some("ABORT") => {
            if fields.len() != 2 {
                return Err(corrupt("ABORT record must have exactly one field"));
            }
            let tx: TransactionID = fields[1].parse().map_err(|_| corrupt("bad tx id"))?;
            Ok(WalRecord::Abort { tx })
        }
        _ => Err(corrupt("unrecognized WAL record type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::init_log;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("wren_db_wal_test_{}_{}", name, std::process::id()));
        p
    }

    #[test]
    fn test_append_and_read_back_records() {
        init_log();
        let path = temp_path("round_trip");
        let _ = std::fs::remove_file(&path);

        let wal = WalManager::new(&path).unwrap();
        wal.log_insert(1, "t", 0, 0, &[Value::Int(1), Value::Str(b"hi".to_vec())])
            .unwrap();
        wal.log_update(
            1,
            "t",
            0,
            0,
            &[Value::Int(1), Value::Str(b"hi".to_vec())],
            &[Value::Int(1), Value::Str(b"bye".to_vec())],
        )
        .unwrap();
        wal.log_commit(1).unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        match &records[0] {
            WalRecord::Insert { tx, table, .. } => {
                assert_eq!(*tx, 1);
                assert_eq!(table, "t");
            }
            other => panic!("unexpected record: {:?}", other),
        }
        match &records[1] {
            WalRecord::Update { old_values, new_values, .. } => {
                assert_eq!(old_values[0], Value::Int(1));
                assert_eq!(new_values[1], Value::Str(b"bye".to_vec()));
            }
            other => panic!("unexpected record: {:?}", other),
        }
        assert_eq!(records[2], WalRecord::Commit { tx: 1 });

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_trailing_partial_line_is_discarded() {
        init_log();
        let path = temp_path("trailing_partial");
        let _ = std::fs::remove_file(&path);

        let wal = WalManager::new(&path).unwrap();
        wal.log_commit(1).unwrap();
        {
            let mut f = wal.file.lock().unwrap();
            write!(f, "INSERT,2,t,0,0,I:1").unwrap();
            f.flush().unwrap();
        }

        let records = wal.read_all().unwrap();
        assert_eq!(records, vec![WalRecord::Commit { tx: 1 }]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_interior_malformed_line_is_corrupt_log() {
        init_log();
        let path = temp_path("interior_corrupt");
        let _ = std::fs::remove_file(&path);

        let wal = WalManager::new(&path).unwrap();
        wal.log_commit(1).unwrap();
        {
            let mut f = wal.file.lock().unwrap();
            writeln!(f, "GARBAGE,not,a,record").unwrap();
            f.flush().unwrap();
        }
        wal.log_commit(2).unwrap();

        let err = wal.read_all().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptLog);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_reset_truncates_log() {
        init_log();
        let path = temp_path("reset");
        let _ = std::fs::remove_file(&path);

        let wal = WalManager::new(&path).unwrap();
        wal.log_commit(1).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);

        wal.reset().unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 0);

        let _ = std::fs::remove_file(&path);
    }
}
