use std::backtrace::Backtrace;
use std::env;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use fbi_rs::build::{build_database, BuildOptions};
use fbi_rs::io::{find_unsorted, read_codes, read_records, write_codes, write_records};
use fbi_rs::stats::Summary;
use fbi_rs::{Algorithm, Code, Engine, EngineOptions, Record, DATA_BIT};

use rand::prelude::*;
use tracing::info;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    if let Err(err) = install_signal_handlers() {
        eprintln!("Warning: failed to install signal handlers: {err}");
    }

    if env::args().any(|arg| arg == "--help" || arg == "-h") {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fbi_rs=info".parse().expect("static directive"))
                .add_directive("fbi=info".parse().expect("static directive")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config = match Config::parse(args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: {message}\n");
            print_usage();
            process::exit(1);
        }
    };

    if let Some(threads) = config.threads {
        if let Err(err) = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
        {
            eprintln!("Warning: failed to size thread pool: {err}");
        }
    }

    if let Err(err) = run(config) {
        eprintln!("Error: {err}");
        let mut source = err.source();
        while let Some(inner) = source {
            eprintln!("  caused by: {inner}");
            source = inner.source();
        }
        process::exit(1);
    }
}

fn run(config: Config) -> CliResult<()> {
    match &config.mode {
        Mode::Generate(options) => run_generate(options),
        Mode::Build(options) => run_build(options),
        Mode::Query(options) => run_query(options),
        Mode::Verify(options) => run_verify(options),
    }
}

fn run_generate(options: &GenerateOptions) -> CliResult<()> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let records: Vec<Record> = (0..options.records)
        .map(|key| Record::new(rng.gen(), key as u32))
        .collect();
    if records.is_empty() && options.queries > 0 {
        return Err("cannot derive queries from an empty dataset".into());
    }

    let queries: Vec<Code> = (0..options.queries)
        .map(|_| {
            let mut code = records[rng.gen_range(0..records.len())].code;
            for idx in rand::seq::index::sample(&mut rng, DATA_BIT, options.flip) {
                code[idx / 8] ^= 0x80 >> (idx % 8);
            }
            code
        })
        .collect();

    write_records(&options.data, &records)?;
    write_codes(&options.query_path, &queries)?;
    println!(
        "Wrote {} records to {} and {} queries to {}",
        records.len(),
        options.data.display(),
        queries.len(),
        options.query_path.display()
    );
    Ok(())
}

fn run_build(options: &BuildCommand) -> CliResult<()> {
    println!("Loading records from {}...", options.input.display());
    let records = read_records(&options.input, None)?;
    if records.is_empty() {
        return Err("No records loaded".into());
    }
    println!("Loaded {} records", records.len());

    let layout: Vec<(usize, usize)> = options
        .partitions
        .iter()
        .enumerate()
        .map(|(i, &partition)| (partition, i % options.disks))
        .collect();

    let start = Instant::now();
    let topology = build_database(&records, &layout, &options.dir, &options.build)?;
    let descriptor = options.dir.join(&options.descriptor);
    topology.save_to_path(&descriptor)?;

    println!("\n=== Database Built ===");
    println!("Time: {:.2?}", start.elapsed());
    println!("Partitions: {}", topology.partitions.len());
    println!("Descriptor: {}", descriptor.display());
    Ok(())
}

fn run_query(options: &QueryOptions) -> CliResult<()> {
    let start = Instant::now();
    let engine = Engine::open_with(&options.db, options.engine)?;
    info!(seconds = start.elapsed().as_secs_f64(), "index loaded");

    let queries = read_codes(&options.queries, options.max_queries)?;
    if queries.is_empty() {
        return Err("No queries loaded".into());
    }

    let mut out: Box<dyn Write> = match &options.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let mut sizes = Summary::new();
    let mut times = Summary::new();
    let mut results = Summary::new();
    let mut incomplete = 0usize;

    if options.task == Task::Batch {
        let start = Instant::now();
        let batched = engine.batch_with_report(
            &queries,
            options.algorithm,
            options.plan_distance,
            options.distance,
            options.skip,
        )?;
        let elapsed = start.elapsed().as_secs_f64();
        for report in &batched {
            writeln!(out, "{}", report.keys.len())?;
            results.push(report.keys.len() as f64);
            if !report.is_complete() {
                incomplete += 1;
            }
        }
        times.push(elapsed);
        println!("[BATCH] {} queries in {:.3}s", batched.len(), elapsed);
    } else {
        let mut coverage = engine.new_coverage();
        for query in &queries {
            let timer = Instant::now();
            let plan = engine.plan(query, options.algorithm, options.plan_distance, options.skip)?;
            let size = engine.cost(&plan);
            let mut found = 0usize;

            match options.task {
                Task::Plan => {}
                Task::Stat => coverage.record(&plan),
                Task::Run | Task::Verify => {
                    let report = engine.run_with_report(query, options.distance, &plan)?;
                    if !report.is_complete() {
                        incomplete += 1;
                    }
                    let keys = report.keys;
                    found = keys.len();
                    results.push(found as f64);
                    if options.task == Task::Verify {
                        let reference_plan =
                            engine.plan(query, Algorithm::Exhaustive, options.distance, options.skip)?;
                        let reference = engine.run(query, options.distance, &reference_plan)?;
                        if keys != reference {
                            return Err(format!(
                                "{} plan returned {} keys, exhaustive scan {}",
                                options.algorithm,
                                keys.len(),
                                reference.len()
                            )
                            .into());
                        }
                        eprintln!("{} OK.", keys.len());
                    }
                }
                Task::Batch => unreachable!("batch handled above"),
            }

            let elapsed = timer.elapsed().as_secs_f64();
            if matches!(options.task, Task::Plan | Task::Run) {
                writeln!(out, "{found} {size} {elapsed}")?;
            }
            sizes.push(size as f64);
            times.push(elapsed);
        }
        if options.task == Task::Stat {
            for count in coverage.nonzero() {
                writeln!(out, "{count}")?;
            }
        }
    }
    out.flush()?;

    println!("[NUM] {}", queries.len());
    println!("[SIZE] {:.2} +/- {:.2}", sizes.mean(), sizes.std_dev());
    println!("[TIME] {:.6} +/- {:.6}", times.mean(), times.std_dev());
    println!("[RESULT] {:.2} +/- {:.2}", results.mean(), results.std_dev());
    if incomplete > 0 {
        println!("[INCOMPLETE] {incomplete} (capped, failed or truncated scans)");
    }
    let hits = engine.hit_stats();
    for partition in engine.partitions() {
        println!("[HITS] {partition} {}", hits[partition]);
    }
    Ok(())
}

fn run_verify(options: &VerifyOptions) -> CliResult<()> {
    let unsorted = find_unsorted(&options.data, options.first, options.stride)?;
    for position in &unsorted {
        println!("{position}");
    }
    if unsorted.is_empty() {
        println!("{} is sorted from bit {}", options.data.display(), options.first);
        Ok(())
    } else {
        Err(format!("{} positions out of order", unsorted.len()).into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Plan,
    Stat,
    Run,
    Verify,
    Batch,
}

fn parse_task(value: &str) -> Result<Task, String> {
    match value.to_lowercase().as_str() {
        "plan" | "0" => Ok(Task::Plan),
        "stat" | "1" => Ok(Task::Stat),
        "run" | "2" => Ok(Task::Run),
        "verify" | "3" => Ok(Task::Verify),
        "batch" | "4" => Ok(Task::Batch),
        other => Err(format!("unsupported task: {other}")),
    }
}

#[derive(Debug)]
struct GenerateOptions {
    records: usize,
    queries: usize,
    flip: usize,
    seed: u64,
    data: PathBuf,
    query_path: PathBuf,
}

#[derive(Debug)]
struct BuildCommand {
    input: PathBuf,
    dir: PathBuf,
    descriptor: PathBuf,
    partitions: Vec<usize>,
    disks: usize,
    build: BuildOptions,
}

#[derive(Debug)]
struct QueryOptions {
    db: PathBuf,
    queries: PathBuf,
    output: Option<PathBuf>,
    task: Task,
    algorithm: Algorithm,
    distance: u32,
    plan_distance: u32,
    skip: u32,
    max_queries: Option<usize>,
    engine: EngineOptions,
}

#[derive(Debug)]
struct VerifyOptions {
    data: PathBuf,
    first: u32,
    stride: usize,
}

#[derive(Debug)]
enum Mode {
    Generate(GenerateOptions),
    Build(BuildCommand),
    Query(QueryOptions),
    Verify(VerifyOptions),
}

#[derive(Debug)]
struct Config {
    mode: Mode,
    threads: Option<usize>,
}

impl Config {
    fn parse(args: Vec<String>) -> Result<Self, String> {
        let mut iter = args.into_iter();
        let command = iter.next().ok_or("missing command")?;

        // flags shared by every command
        let mut threads = None;
        let mut seed = 0x5a5a_1234_u64;
        let mut records = 100_000;
        let mut queries_count = 1000;
        let mut flip = 2;
        let mut data = None;
        let mut queries = None;
        let mut input = None;
        let mut dir = None;
        let mut descriptor = PathBuf::from("db.txt");
        let mut partitions = None;
        let mut every = None;
        let mut disks = 1;
        let mut build = BuildOptions::default();
        let mut db = None;
        let mut output = None;
        let mut task = Task::Run;
        let mut algorithm = Algorithm::Optimal;
        let mut distance = 3u32;
        let mut plan_distance = None;
        let mut skip = 8u32;
        let mut max_queries = None;
        let mut engine = EngineOptions::default();
        let mut first = 0u32;
        let mut stride = 1;

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--threads" => threads = Some(next_usize(&mut iter, &arg)?),
                "--seed" => seed = next_u64(&mut iter, &arg)?,
                "--records" => records = next_usize(&mut iter, &arg)?,
                "--num-queries" => queries_count = next_usize(&mut iter, &arg)?,
                "--flip" => flip = next_usize(&mut iter, &arg)?,
                "--data" => data = Some(next_path(&mut iter, &arg)?),
                "--queries" => queries = Some(next_path(&mut iter, &arg)?),
                "--input" => input = Some(next_path(&mut iter, &arg)?),
                "--dir" => dir = Some(next_path(&mut iter, &arg)?),
                "--descriptor" => descriptor = next_path(&mut iter, &arg)?,
                "--partitions" => {
                    let value = next_value(&mut iter, &arg)?;
                    partitions = Some(parse_list(&value)?);
                }
                "--every" => every = Some(next_usize(&mut iter, &arg)?),
                "--disks" => disks = next_usize(&mut iter, &arg)?,
                "--rate" => build.sample_rate = next_usize(&mut iter, &arg)?,
                "--sample-skip" => build.sample_skip = next_u32(&mut iter, &arg)?,
                "--db" => db = Some(next_path(&mut iter, &arg)?),
                "--output" => output = Some(next_path(&mut iter, &arg)?),
                "--task" => task = parse_task(&next_value(&mut iter, &arg)?)?,
                "--algorithm" | "--alg" => {
                    let value = next_value(&mut iter, &arg)?;
                    algorithm = value.parse().map_err(|err| format!("{err}: {value}"))?;
                }
                "--distance" | "-D" => distance = next_u32(&mut iter, &arg)?,
                "--plan-distance" => plan_distance = Some(next_u32(&mut iter, &arg)?),
                "--skip" => skip = next_u32(&mut iter, &arg)?,
                "--max-queries" | "-Q" => max_queries = Some(next_usize(&mut iter, &arg)?),
                "--buffer" => engine.buffer_size = next_usize(&mut iter, &arg)?,
                "--block" => engine.block_size = next_usize(&mut iter, &arg)?,
                "--direct" => engine.direct_io = true,
                "--first" | "-F" => first = next_u32(&mut iter, &arg)?,
                "--stride" => stride = next_usize(&mut iter, &arg)?,
                other => {
                    return Err(format!("Unknown argument: {}", other));
                }
            }
        }

        let mode = match command.as_str() {
            "generate" => Mode::Generate(GenerateOptions {
                records,
                queries: queries_count,
                flip: flip.min(DATA_BIT),
                seed,
                data: data.ok_or("generate requires --data")?,
                query_path: queries.ok_or("generate requires --queries")?,
            }),
            "build" => {
                if disks == 0 {
                    return Err("--disks must be positive".to_string());
                }
                let partitions = match (partitions, every) {
                    (Some(list), None) => list,
                    (None, Some(step)) if step > 0 && DATA_BIT % step == 0 => {
                        (0..DATA_BIT).step_by(step).collect()
                    }
                    (None, Some(_)) => {
                        return Err(format!("--every must divide {DATA_BIT}"));
                    }
                    (None, None) => vec![0, DATA_BIT / 2],
                    (Some(_), Some(_)) => {
                        return Err("use either --partitions or --every".to_string());
                    }
                };
                Mode::Build(BuildCommand {
                    input: input.ok_or("build requires --input")?,
                    dir: dir.ok_or("build requires --dir")?,
                    descriptor,
                    partitions,
                    disks,
                    build,
                })
            }
            "query" => Mode::Query(QueryOptions {
                db: db.ok_or("query requires --db")?,
                queries: queries.ok_or("query requires --queries")?,
                output,
                task,
                algorithm,
                distance,
                plan_distance: plan_distance.unwrap_or(distance),
                skip,
                max_queries,
                engine,
            }),
            "verify" => {
                if first as usize >= DATA_BIT {
                    return Err(format!("--first must be below {DATA_BIT}"));
                }
                if stride == 0 {
                    return Err("--stride must be positive".to_string());
                }
                Mode::Verify(VerifyOptions {
                    data: data.ok_or("verify requires --data")?,
                    first,
                    stride,
                })
            }
            other => return Err(format!("Unknown command: {other}")),
        };

        Ok(Self { mode, threads })
    }
}

fn next_value(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    iter.next()
        .ok_or_else(|| format!("missing value for {}", flag))
}

fn next_path(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<PathBuf, String> {
    Ok(PathBuf::from(next_value(iter, flag)?))
}

fn next_usize(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<usize, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<usize>()
        .map_err(|_| format!("invalid value for {}: {}", flag, value))
}

fn next_u32(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<u32, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<u32>()
        .map_err(|_| format!("invalid value for {}: {}", flag, value))
}

fn next_u64(iter: &mut impl Iterator<Item = String>, flag: &str) -> Result<u64, String> {
    let value = next_value(iter, flag)?;
    value
        .parse::<u64>()
        .map_err(|_| format!("invalid value for {}: {}", flag, value))
}

fn parse_list(value: &str) -> Result<Vec<usize>, String> {
    value
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid partition id: {item}"))
        })
        .collect()
}

fn print_usage() {
    eprintln!("fbi - Hamming range index over 128-bit sketches\n");
    eprintln!("USAGE:");
    eprintln!("  # Random dataset and perturbed queries");
    eprintln!("  fbi generate --data <records> --queries <codes> [--records N] [--num-queries Q]\n");
    eprintln!("  # Sort partitions and build their sample indexes");
    eprintln!("  fbi build --input <records> --dir <out> [--every 16 | --partitions 0,64]\n");
    eprintln!("  # Plan and run queries");
    eprintln!("  fbi query --db <out/db.txt> --queries <codes> [--task run] [--algorithm optimal]\n");
    eprintln!("  # Check a data file is sorted for a partition");
    eprintln!("  fbi verify --data <file> --first <bit> [--stride N]\n");

    eprintln!("GENERATE:");
    eprintln!("  --records <N>         Records to write (default: 100000)");
    eprintln!("  --num-queries <N>     Queries to write (default: 1000)");
    eprintln!("  --flip <N>            Bits flipped in every query (default: 2)");
    eprintln!("  --seed <N>            Random seed (default: 1515870004)\n");

    eprintln!("BUILD:");
    eprintln!("  --partitions <list>   Comma separated partition bits (default: 0,64)");
    eprintln!("  --every <bits>        One partition every <bits> bits");
    eprintln!("  --disks <N>           Spread partitions over N logical disks (default: 1)");
    eprintln!("  --rate <N>            Records per sample (default: 1000)");
    eprintln!("  --sample-skip <bits>  Bits per trie level: 1, 2, 4, 8 or 16 (default: 2)");
    eprintln!("  --descriptor <name>   Descriptor file name inside --dir (default: db.txt)\n");

    eprintln!("QUERY:");
    eprintln!("  --task <name>         plan, stat, run, verify or batch (default: run)");
    eprintln!("  --algorithm <name>    exhaustive, best-effort, uniform or optimal (default: optimal)");
    eprintln!("  --distance <r>        Inclusive Hamming radius (default: 3)");
    eprintln!("  --plan-distance <r>   Radius used for planning (default: --distance)");
    eprintln!("  --skip <bits>         Boundary granularity of the optimal planner (default: 8)");
    eprintln!("  --max-queries <N>     Limit queries loaded");
    eprintln!("  --output <path>       Per-query output (default: stdout)");
    eprintln!("  --buffer <bytes>      Scan buffer size (default: 10485760)");
    eprintln!("  --block <bytes>       Read alignment (default: 512)");
    eprintln!("  --direct              Open data files with O_DIRECT\n");

    eprintln!("GENERAL:");
    eprintln!("  --threads <N>         Worker threads");
    eprintln!("  RUST_LOG=<filter>     Log filter (default: fbi_rs=info)\n");
}

fn install_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            eprintln!("\nReceived signal {}; dumping stack trace...", signal);
            let backtrace = Backtrace::force_capture();
            eprintln!("{}", backtrace);
            eprintln!("Exiting due to signal {}.", signal);
            process::exit(130);
        }
    });

    Ok(())
}
