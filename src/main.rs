use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

use flashback::TraceConfig;

#[derive(Parser)]
#[command(
    name = "flashback",
    about = "Compile a WebAssembly module to AVM2 bytecode in a loadable SWF",
    version
)]
struct Cli {
    /// Input .wasm file (pre-normalized: flattened, i64-lowered).
    input: PathBuf,

    /// Output path; .swf or .abc selects the container.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit a Wrapper Sprite subclass and register it as the SymbolClass.
    #[arg(long)]
    sprite: bool,

    /// Emit debugfile/debugline at each statement.
    #[arg(long)]
    debug: bool,

    /// Trace function entry and every statement.
    #[arg(long)]
    trace: bool,

    /// Trace function entry only.
    #[arg(long = "trace-funcs")]
    trace_funcs: bool,

    /// Restrict tracing to these functions (comma-separated).
    #[arg(long = "trace-only", value_delimiter = ',')]
    trace_only: Vec<String>,

    /// Never trace these functions (comma-separated).
    #[arg(long = "trace-exclude", value_delimiter = ',')]
    trace_exclude: Vec<String>,

    /// Write the module's text form next to the output.
    #[arg(long = "save-wat")]
    save_wat: Option<PathBuf>,
}

fn run(cli: &Cli) -> Result<()> {
    let bytes = std::fs::read(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;

    if let Some(wat_path) = &cli.save_wat {
        let text = wasmprinter::print_bytes(&bytes).context("failed to print module text")?;
        std::fs::write(wat_path, text)
            .with_context(|| format!("failed to write {}", wat_path.display()))?;
        eprintln!("[compile] wrote {}", wat_path.display());
    }

    let cfg = TraceConfig {
        debug: cli.debug,
        trace: cli.trace,
        trace_funcs: cli.trace_funcs,
        trace_only: cli.trace_only.clone(),
        trace_exclude: cli.trace_exclude.clone(),
        source_file: cli
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned()),
    };

    let output = match &cli.output {
        Some(path) => path.clone(),
        None => cli.input.with_extension("swf"),
    };
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    eprintln!("[compile] {}", cli.input.display());
    let data = match ext.as_deref() {
        Some("swf") => flashback::compile_to_swf(&bytes, &cfg, cli.sprite)?,
        Some("abc") => flashback::compile_to_abc(&bytes, &cfg, cli.sprite)?,
        _ => bail!(
            "cannot tell .swf from .abc for output {}",
            output.display()
        ),
    };

    std::fs::write(&output, &data)
        .with_context(|| format!("failed to write {}", output.display()))?;
    eprintln!("[compile] wrote {} ({} bytes)", output.display(), data.len());
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
