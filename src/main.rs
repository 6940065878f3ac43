//! procguard CLI

use anyhow::{bail, Context, Result};
use procguard::{
    ExecutionObserver, ExecutionRequest, Executor, ExecutorConfig, PlatformInfo, StreamKind,
};
use std::env;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so the child's stdout stays clean
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("procguard=info".parse()?),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "info" => {
            show_platform_info();
        }
        "run" => {
            let options = RunOptions::parse(&args[2..])?;
            let code = run_command(options).await?;
            std::process::exit(code);
        }
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage() {
    println!("procguard v{}", procguard::VERSION);
    println!();
    println!("Usage:");
    println!("  procguard info                       Show platform information");
    println!("  procguard run [options] -- <cmd>...  Run a command under limits");
    println!();
    println!("Options:");
    println!("  --timeout-ms <N>   CPU-time ceiling in milliseconds (0 = none)");
    println!("  --memory-mb <N>    Peak memory ceiling in megabytes (0 = none)");
    println!("  --cwd <DIR>        Working directory for the command");
    println!("  --config <FILE>    Executor config (YAML, or JSON by extension)");
    println!();
    println!("Examples:");
    println!("  procguard run --timeout-ms 2000 -- python3 solution.py");
    println!("  procguard run --memory-mb 64 -- ./a.out");
}

fn show_platform_info() {
    let info = PlatformInfo::detect();

    println!("Platform Information:");
    println!("  OS: {} ({})", info.os_name, info.platform.name());
    println!("  Architecture: {}", info.arch);
    println!("  CPUs: {}", info.cpu_count);
    println!("  Memory: {} MB", info.total_memory_mb);
    println!("  Strategy: {}", info.strategy);
    println!("  Native wake: {}", info.native_wake);
    println!("  Pre-exec limits: {}", info.platform.has_pre_exec_limits());
    println!("  Job objects: {}", info.platform.has_limit_groups());
    if cfg!(target_os = "linux") {
        println!("  pidfd: {}", info.pidfd_supported);
    }
}

#[derive(Debug, Default)]
struct RunOptions {
    timeout_ms: u64,
    memory_mb: u64,
    cwd: Option<PathBuf>,
    config: Option<PathBuf>,
    argv: Vec<String>,
}

impl RunOptions {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = RunOptions::default();
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--" => {
                    options.argv = iter.cloned().collect();
                    break;
                }
                "--timeout-ms" => {
                    let value = iter.next().context("--timeout-ms needs a value")?;
                    options.timeout_ms = value.parse().context("invalid --timeout-ms")?;
                }
                "--memory-mb" => {
                    let value = iter.next().context("--memory-mb needs a value")?;
                    options.memory_mb = value.parse().context("invalid --memory-mb")?;
                }
                "--cwd" => {
                    let value = iter.next().context("--cwd needs a value")?;
                    options.cwd = Some(PathBuf::from(value));
                }
                "--config" => {
                    let value = iter.next().context("--config needs a value")?;
                    options.config = Some(PathBuf::from(value));
                }
                other if other.starts_with("--") => bail!("Unknown option: {}", other),
                _ => {
                    // No separator: the rest is the command
                    options.argv.push(arg.clone());
                    options.argv.extend(iter.cloned());
                    break;
                }
            }
        }

        if options.argv.is_empty() {
            bail!("Usage: procguard run [options] -- <cmd> [args...]");
        }
        Ok(options)
    }
}

/// Writes the child's output straight to ours
struct LiveOutput {
    ends: mpsc::UnboundedSender<StreamKind>,
}

impl ExecutionObserver for LiveOutput {
    fn on_spawn(&self, pid: u32) {
        debug!(pid, "Child started");
    }

    fn on_stdout(&self, data: &[u8]) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(data).and_then(|_| out.flush());
    }

    fn on_stderr(&self, data: &[u8]) {
        let mut err = io::stderr().lock();
        let _ = err.write_all(data).and_then(|_| err.flush());
    }

    fn on_stream_end(&self, stream: StreamKind) {
        let _ = self.ends.send(stream);
    }
}

async fn run_command(options: RunOptions) -> Result<i32> {
    let config = match options.config {
        Some(ref path) => ExecutorConfig::from_file(path)?,
        None => ExecutorConfig::default(),
    }
    .with_env_overrides()?;
    let drain_timeout = config.drain_timeout();

    let mut request = ExecutionRequest::new(options.argv.clone())
        .timeout_ms(options.timeout_ms)
        .memory_limit_mb(options.memory_mb);
    if let Some(dir) = options.cwd {
        request = request.cwd(dir);
    }

    info!("Running: {}", options.argv.join(" "));

    let (ends_tx, mut ends_rx) = mpsc::unbounded_channel();
    let executor = Executor::new(config);
    let handle = Arc::new(executor.submit(request, Arc::new(LiveOutput { ends: ends_tx }))?);

    // Forward our stdin until EOF
    let stdin_handle = Arc::clone(&handle);
    std::thread::Builder::new()
        .name("procguard-cli-stdin".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            let mut stdin = io::stdin().lock();
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stdin_handle.write_stdin(&buf[..n]),
                }
            }
            stdin_handle.end_stdin();
        })?;

    let result = handle
        .wait()
        .await
        .context("execution result was not delivered")?;

    // Let the pumps flush whatever the child wrote last
    let _ = tokio::time::timeout(drain_timeout, async {
        let mut remaining = 2;
        while remaining > 0 && ends_rx.recv().await.is_some() {
            remaining -= 1;
        }
    })
    .await;

    eprintln!("{}", result.to_json()?);

    let code = match (result.exit_code, result.term_signal) {
        (Some(code), _) => code as i32,
        (None, signal) if signal > 0 => 128 + signal,
        _ => 1,
    };
    Ok(code)
}
