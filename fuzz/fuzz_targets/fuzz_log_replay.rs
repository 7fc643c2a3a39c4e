//! Fuzz testing for append-log replay.
//!
//! Writes arbitrary bytes as a log file and replays it. Replay must stop at
//! the first torn or corrupt record without panicking, and every record it
//! returns must survive being appended to a fresh log and replayed again.

#![no_main]

use libfuzzer_sys::fuzz_target;

use pmkv::storage::{AppendLog, DurableLog, LogRecord};

fuzz_target!(|data: &[u8]| {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fuzz.aof");
    std::fs::write(&path, data).unwrap();

    let Ok(records) = AppendLog::replay(&path) else {
        return;
    };

    let copy = dir.path().join("copy.aof");
    let log = AppendLog::open(&copy).unwrap();
    for record in &records {
        match record {
            LogRecord::Set { key, value } => log.append_set(key, value).unwrap(),
            LogRecord::Del { key } => log.append_del(key).unwrap(),
        }
    }
    log.force_flush().unwrap();

    assert_eq!(AppendLog::replay(&copy).unwrap(), records);
});
