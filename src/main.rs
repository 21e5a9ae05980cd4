use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use c0vm::vm::{bytecode, dump};
use c0vm::{ReportFormat, RunStats, RuntimeConfig, VM, stdlib};

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum ReportFormatArg {
    #[default]
    Human,
    Json,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Human => ReportFormat::Human,
            ReportFormatArg::Json => ReportFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "c0vm")]
#[command(about = "A virtual machine for C0 bytecode", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a .bc0 file
    Run {
        /// The bytecode file to run
        file: PathBuf,

        /// Log every executed instruction to stderr
        #[arg(long)]
        trace: bool,

        /// Hard limit on heap size in bytes
        #[arg(long, value_name = "BYTES")]
        heap_limit: Option<usize>,

        /// Read runtime settings from a TOML file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Print the disassembled program to stderr before running it
        #[arg(long)]
        dump_bytecode: bool,

        /// Print run statistics to stderr (human or json format)
        #[arg(long, value_enum, require_equals = true, num_args = 0..=1, default_missing_value = "human")]
        report: Option<ReportFormatArg>,
    },
    /// Disassemble a .bc0 file
    Dump {
        /// The bytecode file to disassemble
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            trace,
            heap_limit,
            config,
            dump_bytecode,
            report,
        } => {
            let mut runtime_config = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(c) => c,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };
            runtime_config.trace |= trace;
            if heap_limit.is_some() {
                runtime_config.heap_limit = heap_limit;
            }
            if let Some(format) = report {
                runtime_config.report = Some(format.into());
            }

            init_logging(runtime_config.trace);
            run_file(&file, &runtime_config, dump_bytecode)
        }
        Commands::Dump { file } => {
            init_logging(false);
            match bytecode::load_file(&file) {
                Ok(program) => {
                    print!("{}", dump::disassemble(&program));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("error: {}: {}", file.display(), e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Logs go to stderr. `--trace` enables everything; otherwise `RUST_LOG`
/// decides, defaulting to warnings only.
fn init_logging(trace: bool) {
    let filter = if trace {
        EnvFilter::new("c0vm=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn run_file(path: &Path, config: &RuntimeConfig, dump_bytecode: bool) -> ExitCode {
    let program = match bytecode::load_file(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    if dump_bytecode {
        eprint!("{}", dump::disassemble(&program));
    }

    let natives = stdlib::natives();
    let output = Box::new(io::BufWriter::new(io::stdout()));
    let mut vm = match VM::with_config(&program, &natives, config, output) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let result = vm.run();
    let stats = vm.stats();
    // Flushes buffered program output before any diagnostics.
    drop(vm);
    let _ = io::stdout().flush();

    let (code, report) = match result {
        Ok(value) => (
            ExitCode::from(value as u8),
            Report {
                result: Some(value),
                error: None,
                stats: &stats,
            },
        ),
        Err(e) => {
            eprintln!("{}", e);
            (
                ExitCode::from(e.exit_code()),
                Report {
                    result: None,
                    error: Some(e.to_string()),
                    stats: &stats,
                },
            )
        }
    };

    if let Some(format) = config.report {
        print_report(format, &report);
    }
    code
}

#[derive(Serialize)]
struct Report<'a> {
    result: Option<i32>,
    error: Option<String>,
    #[serde(flatten)]
    stats: &'a RunStats,
}

fn print_report(format: ReportFormat, report: &Report<'_>) {
    match format {
        ReportFormat::Json => match serde_json::to_string(report) {
            Ok(json) => eprintln!("{}", json),
            Err(e) => eprintln!("error: failed to serialize report: {}", e),
        },
        ReportFormat::Human => {
            eprintln!("--- c0vm report ---");
            match (&report.result, &report.error) {
                (Some(value), _) => eprintln!("result:         {}", value),
                (None, Some(e)) => eprintln!("error:          {}", e),
                (None, None) => {}
            }
            eprintln!("instructions:   {}", report.stats.instructions);
            eprintln!("calls:          {}", report.stats.calls);
            eprintln!("native calls:   {}", report.stats.native_calls);
            eprintln!("max call depth: {}", report.stats.max_call_depth);
            eprintln!("heap bytes:     {}", report.stats.heap_bytes);
            eprintln!("heap objects:   {}", report.stats.heap_objects);
        }
    }
}
