#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use eventline::{
    AppendCommand, Contract, ContractRegistry, EventDecoder, EventLine, EventLineConfig,
    ExpectedVersion, StreamRev, UpConverterRegistry, WriterConfig,
};

// =============================================================================
// Sample Contracts
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposited {
    pub amount: i64,
}

impl Contract for Deposited {
    const NAME: &'static str = "Deposited";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdrawn {
    pub amount: i64,
}

impl Contract for Withdrawn {
    const NAME: &'static str = "Withdrawn";
}

/// Old shape of `Renamed`: one combined name field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenamedV1 {
    pub name: String,
}

impl Contract for RenamedV1 {
    const NAME: &'static str = "Renamed.v1";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenamedV2 {
    pub first: String,
    pub last: String,
}

impl Contract for RenamedV2 {
    const NAME: &'static str = "Renamed.v2";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Renamed {
    pub display: String,
}

impl Contract for Renamed {
    const NAME: &'static str = "Renamed";
}

pub fn contracts() -> ContractRegistry {
    let mut contracts = ContractRegistry::new();
    contracts
        .register::<Deposited>()
        .register::<Withdrawn>()
        .register::<RenamedV1>()
        .register::<RenamedV2>()
        .register::<Renamed>();
    contracts
}

/// `Renamed.v1 -> Renamed.v2 -> Renamed`.
pub fn upconverters() -> UpConverterRegistry {
    let mut upconverters = UpConverterRegistry::new();
    upconverters
        .register(|v1: RenamedV1| {
            let mut parts = v1.name.splitn(2, ' ');
            RenamedV2 {
                first: parts.next().unwrap_or_default().to_string(),
                last: parts.next().unwrap_or_default().to_string(),
            }
        })
        .register(|v2: RenamedV2| Renamed {
            display: format!("{}, {}", v2.last, v2.first),
        });
    upconverters
}

pub fn decoder() -> EventDecoder {
    EventDecoder::new(contracts(), upconverters())
}

// =============================================================================
// Databases
// =============================================================================

pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::TempDir::new().expect("create temp dir")
}

pub fn db_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

pub fn test_config() -> EventLineConfig {
    EventLineConfig {
        writer: writer_config_with_batch_timeout(Duration::from_millis(2)),
        reader_threads: Some(2),
        ..EventLineConfig::default()
    }
}

pub async fn open_db(path: &Path) -> EventLine {
    EventLine::open_with_config(path, decoder(), test_config())
        .await
        .expect("open eventline")
}

pub async fn open_temp_db(name: &str) -> (tempfile::TempDir, PathBuf, EventLine) {
    let dir = create_temp_dir();
    let path = db_path(&dir, name);
    let db = open_db(&path).await;
    (dir, path, db)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn writer_config_with_batch_timeout(batch_timeout: Duration) -> WriterConfig {
    WriterConfig {
        batch_timeout,
        ..WriterConfig::default()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Appends `amounts` as `Deposited` events right after the current head.
pub async fn deposit(db: &EventLine, stream: &str, amounts: &[i64]) -> eventline::AppendResult {
    let head = db.head_version(stream).await.expect("head version");
    let records = amounts
        .iter()
        .enumerate()
        .map(|(i, amount)| {
            db.encode(head.add(i as u64 + 1), &Deposited { amount: *amount })
                .expect("encode")
        })
        .collect();
    let expected = if head.is_none() {
        ExpectedVersion::NoStream
    } else {
        ExpectedVersion::Exact(head)
    };
    db.append(AppendCommand::new(stream, expected, records))
        .await
        .expect("append")
}

/// Runs linearizer passes until nothing is pending.
pub async fn linearize_all(db: &EventLine) {
    loop {
        db.run_linearizer_once().await.expect("linearizer pass");
        if db.progress().await.expect("progress").pending_commits == 0 {
            return;
        }
    }
}

pub fn rev(n: u64) -> StreamRev {
    StreamRev::from_raw(n)
}

pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
