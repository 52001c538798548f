use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rayon::prelude::*;

use seekdb::{Db, DbOptions, ReadOptions, WriteOptions};

#[derive(Debug, Parser)]
#[command(name = "seekdb")]
#[command(about = "SeekDB helper tools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Put {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = true)]
        sync: bool,
    },
    Merge {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long)]
        operand: String,
        #[arg(long, default_value_t = true)]
        sync: bool,
    },
    Delete {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = true)]
        sync: bool,
    },
    DeleteRange {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long, default_value_t = true)]
        sync: bool,
    },
    Get {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        key: String,
    },
    /// Smallest live key at or after --target (or the smallest overall).
    Seek {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        target: Option<String>,
    },
    /// Walk the live keyspace with repeated seeks.
    Scan {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Flush {
        #[arg(long)]
        db: PathBuf,
    },
    Compact {
        #[arg(long)]
        db: PathBuf,
    },
    Metrics {
        #[arg(long)]
        db: PathBuf,
    },
    SstDump {
        #[arg(long)]
        sst: PathBuf,
    },
    DbCheck {
        #[arg(long)]
        db: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Put {
            db,
            key,
            value,
            sync,
        } => put_cmd(&db, &key, &value, sync),
        Command::Merge {
            db,
            key,
            operand,
            sync,
        } => merge_cmd(&db, &key, &operand, sync),
        Command::Delete { db, key, sync } => delete_cmd(&db, &key, sync),
        Command::DeleteRange {
            db,
            start,
            end,
            sync,
        } => delete_range_cmd(&db, &start, &end, sync),
        Command::Get { db, key } => get_cmd(&db, &key),
        Command::Seek { db, target } => seek_cmd(&db, target.as_deref()),
        Command::Scan { db, start, limit } => scan_cmd(&db, start.as_deref(), limit),
        Command::Flush { db } => flush_cmd(&db),
        Command::Compact { db } => compact_cmd(&db),
        Command::Metrics { db } => metrics_cmd(&db),
        Command::SstDump { sst } => sst_dump(&sst),
        Command::DbCheck { db } => db_check(&db),
    }
}

fn open(db: &Path) -> anyhow::Result<Db> {
    Db::open(db, DbOptions::default()).with_context(|| format!("open db {}", db.display()))
}

fn put_cmd(db: &Path, key: &str, value: &str, sync: bool) -> anyhow::Result<()> {
    let db = open(db)?;
    db.put(
        key.as_bytes().to_vec(),
        value.as_bytes().to_vec(),
        WriteOptions { sync },
    )?;
    println!("ok");
    Ok(())
}

fn merge_cmd(db: &Path, key: &str, operand: &str, sync: bool) -> anyhow::Result<()> {
    let db = open(db)?;
    db.merge(
        key.as_bytes().to_vec(),
        operand.as_bytes().to_vec(),
        WriteOptions { sync },
    )?;
    println!("ok");
    Ok(())
}

fn delete_cmd(db: &Path, key: &str, sync: bool) -> anyhow::Result<()> {
    let db = open(db)?;
    db.delete(key.as_bytes().to_vec(), WriteOptions { sync })?;
    println!("ok");
    Ok(())
}

fn delete_range_cmd(db: &Path, start: &str, end: &str, sync: bool) -> anyhow::Result<()> {
    anyhow::ensure!(start < end, "delete-range requires start < end");
    let db = open(db)?;
    db.delete_range(
        start.as_bytes().to_vec(),
        end.as_bytes().to_vec(),
        WriteOptions { sync },
    )?;
    println!("ok");
    Ok(())
}

fn get_cmd(db: &Path, key: &str) -> anyhow::Result<()> {
    let db = open(db)?;
    match db.get(key.as_bytes(), ReadOptions::default())? {
        Some(value) => println!("value={}", String::from_utf8_lossy(&value)),
        None => println!("not_found"),
    }
    Ok(())
}

fn seek_cmd(db: &Path, target: Option<&str>) -> anyhow::Result<()> {
    let db = open(db)?;
    let found = match target {
        Some(target) => {
            db.get_smallest_at_or_after(ReadOptions::default(), target.as_bytes())?
        }
        None => db.get_smallest(ReadOptions::default())?,
    };
    match found {
        Some(key) => println!("key={}", String::from_utf8_lossy(&key)),
        None => println!("not_found"),
    }
    Ok(())
}

fn scan_cmd(db: &Path, start: Option<&str>, limit: Option<usize>) -> anyhow::Result<()> {
    let db = open(db)?;
    let limit = limit.unwrap_or(usize::MAX);

    let mut cursor: Vec<u8> = start.map(|s| s.as_bytes().to_vec()).unwrap_or_default();
    let mut printed = 0usize;
    while printed < limit {
        let Some(key) = db.get_smallest_at_or_after(ReadOptions::default(), &cursor)? else {
            break;
        };
        let value = db.get(&key, ReadOptions::default())?;
        println!(
            "key={} value={}",
            String::from_utf8_lossy(&key),
            value
                .map(|v| String::from_utf8_lossy(&v).into_owned())
                .unwrap_or_else(|| "<none>".to_string()),
        );
        printed += 1;

        // Smallest possible key strictly greater than `key`.
        cursor = key.to_vec();
        cursor.push(0);
    }
    println!("scanned={printed}");
    Ok(())
}

fn flush_cmd(db: &Path) -> anyhow::Result<()> {
    let db = open(db)?;
    db.flush()?;
    println!("ok");
    Ok(())
}

fn compact_cmd(db: &Path) -> anyhow::Result<()> {
    let db = open(db)?;
    db.compact()?;
    println!("ok");
    Ok(())
}

fn metrics_cmd(db: &Path) -> anyhow::Result<()> {
    let db = open(db)?;
    let metrics = db.metrics();
    println!("latest_seqno={}", metrics.latest_seqno);
    println!("min_pinned_seqno={}", metrics.min_pinned_seqno);
    println!("immutable_memtables={}", metrics.immutable_memtables);
    for (level, level_metrics) in &metrics.levels {
        println!(
            "level{level}: files={} bytes={}",
            level_metrics.file_count, level_metrics.bytes
        );
    }
    Ok(())
}

fn sst_dump(sst: &Path) -> anyhow::Result<()> {
    let reader = seekdb::sst::SstReader::open(sst)?;
    println!("file: {}", sst.display());
    println!("props: {:?}", reader.properties());

    let mut iter = reader.iter(u64::MAX);
    iter.seek_to_first();
    let mut count = 0u64;
    while let Some(next) = iter.next() {
        let (key, value) = next?;
        count += 1;
        if count <= 16 {
            println!(
                "entry[{count:04}] key={:?} seq={} kind={:?} value_len={}",
                String::from_utf8_lossy(&key.user_key),
                key.seqno,
                key.kind,
                value.len()
            );
        }
    }
    println!("entries={count}");
    Ok(())
}

fn db_check(db: &Path) -> anyhow::Result<()> {
    let sst_dir = db.join("sst");
    if !sst_dir.exists() {
        println!("ok files=0 entries=0");
        return Ok(());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(&sst_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if seekdb::sst::parse_sst_file_name(name).is_some() {
            paths.push(entry.path());
        }
    }

    let results: Vec<anyhow::Result<u64>> = paths
        .par_iter()
        .map(|path| {
            let reader = seekdb::sst::SstReader::open(path)
                .with_context(|| format!("open sst {}", path.display()))?;

            let mut iter = reader.iter(u64::MAX);
            iter.seek_to_first();
            let mut entries = 0u64;
            while let Some(next) = iter.next() {
                let _ = next.with_context(|| format!("read sst {}", path.display()))?;
                entries += 1;
            }
            if entries != reader.properties().entries {
                anyhow::bail!(
                    "entry count mismatch in {}: props={} read={}",
                    path.display(),
                    reader.properties().entries,
                    entries
                );
            }
            Ok(entries)
        })
        .collect();

    let mut total = 0u64;
    for result in results {
        total += result?;
    }
    println!("ok files={} entries={total}", paths.len());
    Ok(())
}
