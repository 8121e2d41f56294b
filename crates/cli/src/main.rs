// Build per-group Spearman RDMs from session response tables and compare them (RSA).

use csv::ReaderBuilder;
use flate2::read::{GzDecoder, MultiGzDecoder};
use ndarray::Array2;
use std::{env, error::Error, fs::File, io::Read, path::Path, time::Instant};
use tar::Archive;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rdm_core::{
    AccumulatedGroups, AnalysisConfig, Execution, LabelMap, Pipeline, RdmStore, RsaMatrix,
    SessionAccumulator,
};

const USAGE: &str = "Usage: rdm <labels.txt> <group1,group2,...> <session.tsv[.gz|.tar.gz]>... [options]
Options:
  --config FILE           JSON analysis config (flags below override it)
  --chunk-size N          rows per block (default: 5000)
  --execution MODE        sequential | parallel
  --rsa-samples K         compare RDMs on K subsampled rows (default: exact)
  --seed S                subsampling seed (default: 42)
  --store DIR             persist RDMs under DIR and compare from disk
  --per-session           also average RSA matrices computed per session
  --out STEM              output stem (default: rdm)
  --threads N             worker threads (default: all available)
  --time                  print timing summary
Session tables are tab-delimited with a header; each row is one feature,
the first column holds its numeric label code, the rest one value per sample.";

struct SessionTable {
    feature_labels: Vec<u32>,
    /// samples x features
    responses: Array2<f32>,
}

#[derive(Default)]
struct Args {
    labels_path: String,
    groups: Vec<String>,
    sessions: Vec<String>,
    config_path: Option<String>,
    chunk_size: Option<usize>,
    execution: Option<Execution>,
    rsa_samples: Option<usize>,
    seed: Option<u64>,
    store: Option<String>,
    per_session: bool,
    out: Option<String>,
    threads: Option<usize>,
    time: bool,
}

fn read_session_table<R: Read>(reader: R) -> Result<SessionTable, Box<dyn Error>> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(reader);

    // label column + at least one sample
    let n_samples = rdr.headers()?.len().saturating_sub(1);
    if n_samples == 0 {
        return Err("Session table must contain a label column and at least one sample column".into());
    }

    let mut feature_labels = Vec::new();
    let mut values = Vec::new();
    for (idx, record) in rdr.records().enumerate() {
        let record = record?;
        let line = idx + 2;

        let raw_label = record.get(0).unwrap_or("").trim();
        let label: u32 = raw_label
            .parse()
            .map_err(|_| format!("Invalid label code '{}' on line {}", raw_label, line))?;
        if record.len() != n_samples + 1 {
            return Err(format!(
                "Line {} has {} values, expected {}",
                line,
                record.len() - 1,
                n_samples
            )
            .into());
        }

        feature_labels.push(label);
        for field in record.iter().skip(1) {
            let v: f32 = field
                .trim()
                .parse()
                .map_err(|_| format!("Invalid value '{}' on line {}", field, line))?;
            values.push(v);
        }
    }

    // stored feature-major, the engine wants samples as rows
    let by_feature = Array2::from_shape_vec((feature_labels.len(), n_samples), values)?;
    Ok(SessionTable {
        feature_labels,
        responses: by_feature.reversed_axes().as_standard_layout().to_owned(),
    })
}

fn load_session(path: &str) -> Result<SessionTable, Box<dyn Error>> {
    if path.ends_with(".tar.gz") {
        let mut archive = Archive::new(GzDecoder::new(File::open(path)?));
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_file() {
                return read_session_table(&mut entry);
            }
        }
        Err(format!("No readable file found in tar archive {}", path).into())
    } else if path.ends_with(".gz") {
        read_session_table(MultiGzDecoder::new(File::open(path)?))
    } else {
        read_session_table(File::open(path)?)
    }
}

/// Pair existing session files with their 1-based session number; return the
/// missing paths separately.
fn present_sessions(paths: &[String]) -> (Vec<(usize, &str)>, Vec<&str>) {
    let mut present = Vec::new();
    let mut missing = Vec::new();
    for (idx, path) in paths.iter().enumerate() {
        if Path::new(path).is_file() {
            present.push((idx + 1, path.as_str()));
        } else {
            missing.push(path.as_str());
        }
    }
    (present, missing)
}

fn flag_value(args: &[String], i: &mut usize, name: &str) -> Result<Option<String>, Box<dyn Error>> {
    let arg = &args[*i];
    if arg == name {
        let value = args
            .get(*i + 1)
            .ok_or_else(|| format!("Missing value for {}", name))?;
        *i += 2;
        return Ok(Some(value.clone()));
    }
    if let Some(value) = arg.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')) {
        *i += 1;
        return Ok(Some(value.to_string()));
    }
    Ok(None)
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, Box<dyn Error>> {
    value
        .parse()
        .map_err(|_| format!("Invalid {} value: {}", name, value).into())
}

fn parse_args() -> Result<Args, Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        return Err(USAGE.into());
    }

    let mut parsed = Args {
        labels_path: args[1].clone(),
        groups: args[2]
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(ToString::to_string)
            .collect(),
        ..Args::default()
    };

    let mut i = 3;
    while i < args.len() {
        let arg = &args[i];
        if arg == "--time" {
            parsed.time = true;
            i += 1;
        } else if arg == "--per-session" {
            parsed.per_session = true;
            i += 1;
        } else if let Some(v) = flag_value(&args, &mut i, "--config")? {
            parsed.config_path = Some(v);
        } else if let Some(v) = flag_value(&args, &mut i, "--chunk-size")? {
            parsed.chunk_size = Some(parse_number(&v, "--chunk-size")?);
        } else if let Some(v) = flag_value(&args, &mut i, "--execution")? {
            parsed.execution = Some(v.parse().map_err(|_| format!("Unknown execution mode: {}", v))?);
        } else if let Some(v) = flag_value(&args, &mut i, "--rsa-samples")? {
            parsed.rsa_samples = Some(parse_number(&v, "--rsa-samples")?);
        } else if let Some(v) = flag_value(&args, &mut i, "--seed")? {
            parsed.seed = Some(parse_number(&v, "--seed")?);
        } else if let Some(v) = flag_value(&args, &mut i, "--store")? {
            parsed.store = Some(v);
        } else if let Some(v) = flag_value(&args, &mut i, "--out")? {
            parsed.out = Some(v);
        } else if let Some(v) = flag_value(&args, &mut i, "--threads")? {
            parsed.threads = Some(parse_number(&v, "--threads")?);
        } else if arg.starts_with("--") {
            return Err(format!("Unknown argument: {}", arg).into());
        } else {
            parsed.sessions.push(arg.clone());
            i += 1;
        }
    }

    if parsed.groups.is_empty() {
        return Err("No groups given".into());
    }
    if parsed.sessions.is_empty() {
        return Err("At least one session table is required".into());
    }
    Ok(parsed)
}

fn build_config(args: &Args) -> Result<AnalysisConfig, Box<dyn Error>> {
    let mut config = match &args.config_path {
        Some(path) => AnalysisConfig::from_json_file(Path::new(path))?,
        None => AnalysisConfig::default(),
    };
    if let Some(chunk_size) = args.chunk_size {
        config.engine.chunk_size = chunk_size;
    }
    if let Some(execution) = args.execution {
        config.engine.execution = execution;
    }
    if args.rsa_samples.is_some() {
        config.rsa.max_samples = args.rsa_samples;
    }
    if let Some(seed) = args.seed {
        config.rsa.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let config = build_config(&args)?;

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| format!("Failed to set thread pool: {}", e))?;
        println!("Using {} threads.", threads);
    } else {
        println!("Using all available CPU cores.");
    }

    let labels = LabelMap::parse(&std::fs::read_to_string(&args.labels_path)?)?;
    info!(labels = labels.len(), groups = args.groups.len(), "loaded label map");

    // Data loading
    let load_start = Instant::now();
    let mut accumulator = SessionAccumulator::new(&labels, args.groups.iter().map(String::as_str));
    let mut per_session = Vec::new();
    let (present, missing) = present_sessions(&args.sessions);
    for path in &missing {
        warn!(path = %path, "session file not found, skipping");
        println!("Session file {} not found, skipping.", path);
    }
    if present.is_empty() {
        return Err("None of the session files exist".into());
    }
    for (session, path) in present {
        let table = load_session(path)?;
        println!(
            "Session {}: {} samples x {} features ({})",
            session,
            table.responses.nrows(),
            table.responses.ncols(),
            path
        );
        accumulator.add_session(session, &table.responses, &table.feature_labels)?;
        if args.per_session {
            let mut single = SessionAccumulator::new(&labels, args.groups.iter().map(String::as_str));
            single.add_session(session, &table.responses, &table.feature_labels)?;
            per_session.push((session, single.finish()?));
        }
    }
    let accumulated: AccumulatedGroups = accumulator.finish()?;
    let load_duration = load_start.elapsed();

    // RDMs and RSA
    let calc_start = Instant::now();
    let mut pipeline = Pipeline::new(config)?;
    if let Some(dir) = &args.store {
        pipeline = pipeline.with_store(RdmStore::open(dir)?);
    }
    let output = pipeline.run(accumulated)?;
    let session_rsa = if args.per_session {
        Some(pipeline.run_per_session(per_session)?)
    } else {
        None
    };
    let calc_duration = calc_start.elapsed();

    for skip in &output.skipped {
        println!("Skipped {}", skip);
    }
    println!(
        "Computed {} RDMs, RSA matrix {} x {}.",
        output.groups.len(),
        output.rsa.len(),
        output.rsa.len()
    );

    // Output writing
    let output_start = Instant::now();
    let stem = args.out.as_deref().unwrap_or("rdm");
    let tar_gz_path = format!("{}_rsa.tar.gz", stem);
    output.rsa.write_tar_gz(Path::new(&tar_gz_path), stem)?;
    println!("RSA matrix written to {}", tar_gz_path);

    if let Some(sessions) = session_rsa {
        let matrices: Vec<RsaMatrix> = sessions.into_iter().map(|s| s.rsa).collect();
        let mean = RsaMatrix::mean(&matrices)?;
        let mean_stem = format!("{}_session_mean", stem);
        let mean_path = format!("{}_rsa.tar.gz", mean_stem);
        mean.write_tar_gz(Path::new(&mean_path), &mean_stem)?;
        println!("Per-session mean RSA matrix written to {}", mean_path);
    }
    let output_duration = output_start.elapsed();

    if args.time {
        let total_duration = load_duration + calc_duration + output_duration;
        println!("Data loading:           {:8.3} seconds", load_duration.as_secs_f64());
        println!("RDM and RSA calculation: {:8.3} seconds", calc_duration.as_secs_f64());
        println!("Output writing:         {:8.3} seconds", output_duration.as_secs_f64());
        println!("Total time:             {:8.3} seconds", total_duration.as_secs_f64());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_table_is_transposed_to_samples_by_feature() {
        let tsv = "label\ts1\ts2\ts3\n1\t0.5\t1.5\t2.5\n2\t3\t4\t5\n";
        let table = read_session_table(tsv.as_bytes()).expect("table");
        assert_eq!(table.feature_labels, vec![1, 2]);
        assert_eq!(table.responses.dim(), (3, 2));
        assert_eq!(table.responses[[0, 0]], 0.5);
        assert_eq!(table.responses[[2, 1]], 5.0);
    }

    #[test]
    fn bad_label_code_names_the_line() {
        let tsv = "label\ts1\nV1\t0.5\n";
        let err = read_session_table(tsv.as_bytes()).err().expect("error");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn missing_session_files_are_set_aside() {
        let manifest = format!("{}/Cargo.toml", env!("CARGO_MANIFEST_DIR"));
        let paths = vec![
            "does/not/exist_session1.tsv".to_string(),
            manifest.clone(),
        ];
        let (present, missing) = present_sessions(&paths);
        assert_eq!(present, vec![(2, manifest.as_str())]);
        assert_eq!(missing, vec!["does/not/exist_session1.tsv"]);
    }

    #[test]
    fn flag_value_accepts_both_forms() {
        let args: Vec<String> = ["rdm", "--seed", "7", "--out=x"].iter().map(|s| s.to_string()).collect();
        let mut i = 1;
        assert_eq!(flag_value(&args, &mut i, "--seed").expect("ok"), Some("7".to_string()));
        assert_eq!(i, 3);
        assert_eq!(flag_value(&args, &mut i, "--seed").expect("ok"), None);
        assert_eq!(flag_value(&args, &mut i, "--out").expect("ok"), Some("x".to_string()));
        assert_eq!(i, 4);
    }
}
