use anyhow::{anyhow, Context, Result};
use clap::Parser as ArgParser;
use rustyline::{error::ReadlineError, DefaultEditor};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lamn::{Engine, LamnError, Value, VmConfig};

#[derive(ArgParser)]
#[command(name = "lamn")]
#[command(about = "Run lamn scripts or start an interactive session", long_about = None)]
#[command(version)]
struct Cli {
    /// Script to run; starts the REPL when omitted
    script: Option<PathBuf>,
    /// Arguments passed to the script as `...`
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
    /// Run a chunk given on the command line (repeatable)
    #[arg(short = 'e', long = "execute", value_name = "CHUNK")]
    execute: Vec<String>,
    /// Print the compiled bytecode instead of running
    #[arg(short, long)]
    disassemble: bool,
    /// Maximum call depth per coroutine
    #[arg(long, default_value_t = VmConfig::default().max_call_depth)]
    max_call_depth: usize,
    /// Maximum value-stack cells per coroutine
    #[arg(long, default_value_t = VmConfig::default().max_stack)]
    max_stack: usize,
}

impl Cli {
    fn config(&self) -> VmConfig {
        VmConfig::default()
            .with_max_call_depth(self.max_call_depth)
            .with_max_stack(self.max_stack)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Syntax errors at the end of input mean the REPL should keep reading.
fn is_incomplete(err: &LamnError) -> bool {
    let msg = err.to_string();
    msg.contains("got Eof") || msg.contains("unfinished long")
}

/// Script errors hold `Rc` values, so they cross into `anyhow` as text.
fn script_error(err: LamnError) -> anyhow::Error {
    anyhow!("{err}")
}

fn print_results(values: &[Value]) {
    if values.is_empty() {
        return;
    }
    let line: Vec<String> = values.iter().map(Value::to_string).collect();
    println!("{}", line.join("\t"));
}

// ── Batch mode ────────────────────────────────────────────────────────────────

fn disassemble(source: &str, name: &str) -> Result<()> {
    let unit = lamn::compile(source, name).map_err(script_error)?;
    print!("{}", lamn_compiler::disassemble(&unit));
    Ok(())
}

fn run_chunk(engine: &mut Engine, source: &str, name: &str, args: Vec<Value>) -> Result<()> {
    let unit = lamn::compile(source, name).map_err(script_error)?;
    engine.execute_with_args(unit, args).map_err(script_error)?;
    Ok(())
}

fn batch(cli: &Cli) -> Result<()> {
    let mut engine = Engine::with_config(cli.config());
    for (i, chunk) in cli.execute.iter().enumerate() {
        let name = format!("(command line {})", i + 1);
        if cli.disassemble {
            disassemble(chunk, &name)?;
        } else {
            run_chunk(&mut engine, chunk, &name, Vec::new())?;
        }
    }
    if let Some(path) = &cli.script {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read '{}'", path.display()))?;
        let name = path.display().to_string();
        if cli.disassemble {
            disassemble(&source, &name)?;
        } else {
            let args = cli.args.iter().map(|a| Value::from(a.as_str())).collect();
            run_chunk(&mut engine, &source, &name, args)?;
        }
    }
    Ok(())
}

// ── Interactive REPL ──────────────────────────────────────────────────────────

fn repl(config: VmConfig) -> Result<()> {
    println!("lamn {}  (type 'exit' or Ctrl-D to quit)", env!("CARGO_PKG_VERSION"));

    let mut rl = DefaultEditor::new().context("failed to initialise line editor")?;
    let mut engine = Engine::with_config(config);
    let mut buf = String::new();

    loop {
        let prompt = if buf.is_empty() { "> " } else { ">> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if buf.is_empty() {
                    if line.trim() == "exit" {
                        break;
                    }
                    if !line.trim().is_empty() {
                        let _ = rl.add_history_entry(line.as_str());
                    }
                } else {
                    buf.push('\n');
                }
                buf.push_str(&line);

                // a bare expression is echoed; otherwise run it as statements
                let as_expr = format!("return {buf}");
                let unit = match lamn::compile(&as_expr, "stdin") {
                    Ok(unit) => Ok(unit),
                    Err(_) => lamn::compile(&buf, "stdin"),
                };
                match unit {
                    Ok(unit) => {
                        buf.clear();
                        match engine.execute(unit) {
                            Ok(values) => print_results(&values),
                            Err(e) => eprintln!("{e}"),
                        }
                    }
                    Err(e) if is_incomplete(&e) => continue,
                    Err(e) => {
                        eprintln!("{e}");
                        buf.clear();
                    }
                }
            }
            Err(ReadlineError::Eof) => {
                if !buf.is_empty() {
                    eprintln!("<incomplete input>");
                }
                println!();
                break;
            }
            Err(ReadlineError::Interrupted) => buf.clear(),
            Err(e) => return Err(e).context("read error"),
        }
    }
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LAMN_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.script.is_none() && cli.execute.is_empty() {
        return repl(cli.config());
    }
    batch(&cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclosed_blocks_are_incomplete() {
        let err = lamn::compile("while true do", "stdin").unwrap_err();
        assert!(is_incomplete(&err));
        let err = lamn::compile("local = 1", "stdin").unwrap_err();
        assert!(!is_incomplete(&err));
    }

    #[test]
    fn script_errors_become_messages() {
        let mut engine = Engine::new();
        let err = run_chunk(&mut engine, "error({})", "chunk", Vec::new()).unwrap_err();
        assert!(err.to_string().starts_with("table"));
        let err = run_chunk(&mut engine, "local x = nil\nreturn x.y", "chunk", Vec::new()).unwrap_err();
        assert_eq!(err.to_string(), "chunk:2: attempt to index a nil value");
        assert!(disassemble("return (", "chunk").is_err());
    }

    #[test]
    fn flags_map_onto_the_config() {
        let cli = Cli::parse_from(["lamn", "--max-call-depth", "50", "-e", "print(1)"]);
        assert_eq!(cli.config().max_call_depth, 50);
        assert_eq!(cli.config().max_stack, VmConfig::default().max_stack);
        assert_eq!(cli.execute, vec!["print(1)".to_string()]);
    }

    #[test]
    fn script_arguments_follow_the_script() {
        let cli = Cli::parse_from(["lamn", "main.lamn", "a", "--b"]);
        assert_eq!(cli.script, Some(PathBuf::from("main.lamn")));
        assert_eq!(cli.args, vec!["a".to_string(), "--b".to_string()]);
    }
}
