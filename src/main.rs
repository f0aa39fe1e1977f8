//! vibetree - command line front end for B+-tree index files

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use vibetree::access::{FieldType, RangePredicate, Tuple, Value};
use vibetree::storage::BufferPoolManager;
use vibetree::{BTree, IndexConfig, IndexDescriptor, IndexError};

/// vibetree - build, fill and inspect B+-tree index files
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Buffer pool frames
    #[arg(short = 'b', long, default_value = "256", global = true)]
    buffer_frames: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty index file
    Create {
        path: PathBuf,
        /// Field types, comma separated (int32, int64, utf8, bytes)
        #[arg(short, long, value_delimiter = ',', default_value = "int64,utf8")]
        fields: Vec<String>,
        /// How many leading fields form the key
        #[arg(short, long, default_value = "1")]
        key_fields: usize,
        #[arg(short, long, default_value = "4096")]
        page_size: usize,
    },
    /// Bulk load generated tuples with keys 0..count into an empty index
    Load {
        path: PathBuf,
        #[arg(short, long)]
        count: u64,
        #[arg(short, long, default_value = "0.8")]
        fill_factor: f64,
    },
    /// Insert generated tuples in random key order from several threads
    Insert {
        path: PathBuf,
        #[arg(short, long)]
        count: u64,
        #[arg(short, long, default_value = "4")]
        threads: usize,
        #[arg(short, long, default_value = "42")]
        seed: u64,
        /// First generated key
        #[arg(long, default_value = "0")]
        start: u64,
    },
    /// Print the tuples of a key range
    Scan {
        path: PathBuf,
        /// Lower bound; a comma separated key or key prefix
        #[arg(long)]
        low: Option<String>,
        /// Upper bound; a comma separated key or key prefix
        #[arg(long)]
        high: Option<String>,
        #[arg(long)]
        exclusive_low: bool,
        #[arg(long)]
        exclusive_high: bool,
        /// Scan from high to low
        #[arg(long)]
        backward: bool,
        /// Visit pages in file order instead of key order
        #[arg(long, conflicts_with_all = ["low", "high", "backward"])]
        disk_order: bool,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Verify the tree and print its statistics
    Stats { path: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.command {
        Command::Create {
            path,
            fields,
            key_fields,
            page_size,
        } => {
            let field_types = fields
                .iter()
                .map(|name| parse_field_type(name))
                .collect::<Result<Vec<_>>>()?;
            let descriptor = IndexDescriptor::new(field_types, key_fields)?;
            let config = IndexConfig {
                page_size,
                buffer_frames: args.buffer_frames,
                ..Default::default()
            };
            let pool = BufferPoolManager::with_lru(page_size, args.buffer_frames)?;
            let tree = BTree::create(pool, &path, descriptor, config)?;
            tree.close()?;
            println!("Created {}", path.display());
        }
        Command::Load {
            path,
            count,
            fill_factor,
        } => {
            let tree = open(&path, args.buffer_frames)?;
            let started = Instant::now();
            {
                let mut loader = tree.begin_bulk_load(fill_factor)?;
                for i in 0..count {
                    loader.add(&synthetic_tuple(tree.descriptor(), i))?;
                }
                loader.end()?;
            }
            println!("Loaded {} tuples in {:.2?}", count, started.elapsed());
            tree.close()?;
        }
        Command::Insert {
            path,
            count,
            threads,
            seed,
            start,
        } => {
            let tree = open(&path, args.buffer_frames)?;
            let (inserted, duplicates) = insert_random(&tree, start, count, threads.max(1), seed)?;
            println!("Inserted {} tuples ({} duplicates skipped)", inserted, duplicates);
            tree.close()?;
        }
        Command::Scan {
            path,
            low,
            high,
            exclusive_low,
            exclusive_high,
            backward,
            disk_order,
            limit,
        } => {
            let tree = open(&path, args.buffer_frames)?;
            let descriptor = tree.descriptor().clone();
            let accessor = tree.create_accessor();
            let limit = limit.unwrap_or(usize::MAX);

            let tuples: Box<dyn Iterator<Item = Result<Tuple, IndexError>> + '_> = if disk_order {
                Box::new(accessor.disk_order_scan())
            } else {
                let mut predicate = RangePredicate::all();
                if let Some(low) = low {
                    predicate = predicate.with_low(parse_key(&descriptor, &low)?, !exclusive_low);
                }
                if let Some(high) = high {
                    predicate =
                        predicate.with_high(parse_key(&descriptor, &high)?, !exclusive_high);
                }
                if backward {
                    predicate = predicate.backward();
                }
                Box::new(accessor.range(predicate)?)
            };

            let mut shown = 0;
            for tuple in tuples.take(limit) {
                let values = tuple?.to_values(&descriptor.field_types)?;
                let rendered: Vec<String> = values.iter().map(render).collect();
                println!("{}", rendered.join(" | "));
                shown += 1;
            }
            println!("({} tuples)", shown);
            tree.close()?;
        }
        Command::Stats { path } => {
            let tree = open(&path, args.buffer_frames)?;
            tree.verify()?;
            let stats = tree.statistics()?;
            println!("Index {}", path.display());
            println!("   - Height: {}", stats.height);
            println!("   - Interior pages: {}", stats.interior_pages);
            println!("   - Leaf pages: {}", stats.leaf_pages);
            println!("   - Tuples: {}", stats.tuple_count);
            println!("   - Free pages: {}", stats.free_pages);
            println!("   - Highest page id: {}", stats.max_page);
            tree.close()?;
        }
    }

    Ok(())
}

fn open(path: &Path, buffer_frames: usize) -> Result<BTree> {
    if !path.exists() {
        bail!("{} does not exist; create it first", path.display());
    }
    // The page size is only known after reading the file header.
    let page_size = peek_page_size(path)?;
    let config = IndexConfig {
        page_size,
        buffer_frames,
        ..Default::default()
    };
    let pool = BufferPoolManager::with_lru(page_size, buffer_frames)?;
    BTree::open(pool, path, config).with_context(|| format!("Failed to open {}", path.display()))
}

fn peek_page_size(path: &Path) -> Result<usize> {
    use vibetree::storage::disk::{PageManager, MAX_PAGE_SIZE};
    use vibetree::storage::metadata::IndexMetadata;

    let header = PageManager::read_prefix(path, MAX_PAGE_SIZE)?;
    Ok(IndexMetadata::read_from(&header)?.page_size as usize)
}

/// Inserts keys `start..start + count` in a seeded random order, split over
/// `threads` workers. Returns the number of tuples inserted and duplicates.
fn insert_random(
    tree: &BTree,
    start: u64,
    count: u64,
    threads: usize,
    seed: u64,
) -> Result<(u64, u64)> {
    let mut keys: Vec<u64> = (start..start + count).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(seed));
    let chunk = keys.len().div_ceil(threads).max(1);

    let started = Instant::now();
    let results: Vec<Result<(u64, u64)>> = std::thread::scope(|s| {
        let handles: Vec<_> = keys
            .chunks(chunk)
            .map(|part| {
                s.spawn(move || -> Result<(u64, u64)> {
                    let accessor = tree.create_accessor();
                    let mut inserted = 0;
                    let mut duplicates = 0;
                    for &key in part {
                        match accessor.insert(&synthetic_tuple(tree.descriptor(), key)) {
                            Ok(()) => inserted += 1,
                            Err(IndexError::DuplicateKey) => duplicates += 1,
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Ok((inserted, duplicates))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("insert worker panicked")),
            })
            .collect()
    });

    let mut totals = (0, 0);
    for result in results {
        let (inserted, duplicates) = result?;
        totals.0 += inserted;
        totals.1 += duplicates;
    }
    info!(
        "{} threads inserted {} tuples in {:.2?}",
        threads,
        totals.0,
        started.elapsed()
    );
    Ok(totals)
}

fn parse_field_type(name: &str) -> Result<FieldType> {
    Ok(match name.trim().to_ascii_lowercase().as_str() {
        "int32" | "int" => FieldType::Int32,
        "int64" | "bigint" => FieldType::Int64,
        "utf8" | "string" | "text" => FieldType::Utf8,
        "bytes" | "binary" => FieldType::Bytes,
        other => bail!("Unknown field type: {}", other),
    })
}

fn parse_value(field_type: FieldType, text: &str) -> Result<Value> {
    let text = text.trim();
    Ok(match field_type {
        FieldType::Int32 => Value::Int32(text.parse().context("Invalid int32")?),
        FieldType::Int64 => Value::Int64(text.parse().context("Invalid int64")?),
        FieldType::Utf8 => Value::Utf8(text.to_string()),
        FieldType::Bytes => Value::Bytes(text.as_bytes().to_vec()),
    })
}

/// Parses a comma separated key or key prefix.
fn parse_key(descriptor: &IndexDescriptor, text: &str) -> Result<Tuple> {
    let parts: Vec<&str> = text.split(',').collect();
    if parts.len() > descriptor.key_field_count {
        bail!(
            "Key has {} fields but the index key has {}",
            parts.len(),
            descriptor.key_field_count
        );
    }
    let values = parts
        .iter()
        .zip(descriptor.key_types())
        .map(|(part, field_type)| parse_value(*field_type, part))
        .collect::<Result<Vec<_>>>()?;
    Ok(Tuple::from_values(&values))
}

/// Tuple number `n` of a generated data set. Keys sort in the order of `n`.
fn synthetic_tuple(descriptor: &IndexDescriptor, n: u64) -> Tuple {
    let values: Vec<Value> = descriptor
        .field_types
        .iter()
        .enumerate()
        .map(|(i, field_type)| {
            let seed = if i < descriptor.key_field_count { n } else { n.wrapping_mul(31) + i as u64 };
            match field_type {
                FieldType::Int32 => Value::Int32(seed as i32),
                FieldType::Int64 => Value::Int64(seed as i64),
                FieldType::Utf8 => Value::Utf8(format!("{:012}", seed)),
                FieldType::Bytes => Value::Bytes(seed.to_be_bytes().to_vec()),
            }
        })
        .collect();
    Tuple::from_values(&values)
}

fn render(value: &Value) -> String {
    match value {
        Value::Int32(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Utf8(s) => s.clone(),
        Value::Bytes(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
    }
}
