use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use droidpilot::config::AppConfig;
use droidpilot::device::adb::AdbDevice;
use droidpilot::runner::{RunDisposition, TaskResult, TaskRunner, TaskStatus};

/// Drive an Android device from the host to complete natural-language and
/// fixed-form tasks.
#[derive(Parser, Debug)]
#[command(name = "droidpilot")]
#[command(version)]
#[command(about = "Android task orchestrator over an adb shell bridge", long_about = None)]
struct Cli {
    /// Device serial or address (e.g. emulator-5554, 192.168.1.100:5555)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Run a single task and exit
    #[arg(short = 't', long, value_name = "TASK")]
    task: Option<String>,

    /// List connected devices
    #[arg(long)]
    list_devices: bool,

    /// List registered handler modules
    #[arg(long)]
    modules: bool,

    /// Capture one screenshot to the given file
    #[arg(long, value_name = "FILE")]
    screenshot: Option<String>,

    /// Interactive mode: choose an input mode and run tasks continuously
    #[arg(short = 'i', long)]
    interactive: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    if cli.list_devices {
        return match AdbDevice::list_devices(&config.device.adb_path).await {
            Ok(devices) if devices.is_empty() => {
                println!("no devices connected");
                ExitCode::SUCCESS
            }
            Ok(devices) => {
                for serial in devices {
                    println!("{serial}");
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot list devices: {e}");
                ExitCode::from(2)
            }
        };
    }

    if cli.modules {
        return match droidpilot::registry::ModuleRegistry::discover(&config.apps_dir) {
            Ok(registry) => {
                println!("registered modules:");
                for record in registry.list() {
                    let keywords = record.info.keywords.join(", ");
                    println!(
                        "  {} ({})  package: {}  keywords: {}",
                        record.id,
                        record.info.name,
                        record.info.package_id.as_deref().unwrap_or("-"),
                        keywords
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot load modules: {e}");
                ExitCode::from(2)
            }
        };
    }

    let device = match droidpilot::open_device(&config, cli.device.as_deref()).await {
        Ok(device) => device,
        Err(e) => {
            eprintln!("device error: {e}");
            return ExitCode::from(2);
        }
    };

    if let Some(path) = &cli.screenshot {
        return match device.screenshot_full().await {
            Ok(png) => match tokio::fs::write(path, &png).await {
                Ok(()) => {
                    println!("screenshot saved to {path}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("cannot write {path}: {e}");
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("screenshot failed: {e}");
                ExitCode::from(2)
            }
        };
    }

    let runner = match TaskRunner::new(config, device) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("startup error: {e}");
            return ExitCode::from(2);
        }
    };

    // Ctrl-C requests cooperative cancellation: the executor aborts at the
    // next step boundary and still resets the device to home.
    {
        let cancel = runner.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ncancellation requested, finishing current step…");
                cancel.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
    }

    if let Some(task) = &cli.task {
        let result = runner.run(task).await;
        print_result(&result);
        return match result.status {
            TaskStatus::Success => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        };
    }

    if cli.interactive {
        return interactive_loop(&runner).await;
    }

    println!("nothing to do; try --task, --interactive, --modules or --help");
    ExitCode::SUCCESS
}

fn print_result(result: &TaskResult) {
    match result.status {
        TaskStatus::Success => {
            println!("✓ {} ({:.1}s)", result.message, result.elapsed.as_secs_f32());
        }
        _ => {
            let kind = result.error_kind.as_deref().unwrap_or("failed");
            println!("✗ [{kind}] {}", result.message);
            if !result.trace.is_empty() {
                println!("  executed steps:");
                for entry in &result.trace {
                    let mark = if entry.ok { "✓" } else { "✗" };
                    println!("    {mark} {}", entry.description);
                }
            }
        }
    }
}

async fn interactive_loop(runner: &TaskRunner) -> ExitCode {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        println!();
        println!("select input mode:");
        println!("  1. fast form  (联系人:消息 / 朋友圈:内容, zero-cost parsing)");
        println!("  2. natural language  (AI-classified)");
        println!("  q. quit");
        print_prompt("mode> ");

        let mode = match lines.next_line().await {
            Ok(Some(line)) => line.trim().to_string(),
            _ => return ExitCode::from(1),
        };
        let fast_mode = match mode.as_str() {
            "1" => true,
            "2" => false,
            "q" | "quit" | "exit" => return ExitCode::SUCCESS,
            _ => {
                println!("invalid choice");
                continue;
            }
        };

        if fast_mode {
            println!("fast form: 张三:你好  /  朋友圈:今天天气真好  (empty line returns to menu)");
        } else {
            println!("natural language: 给张三发消息说你好  (empty line returns to menu)");
        }

        // Inner loop: run tasks until an empty line / sentinel, or a
        // classification failure sends us back to the menu.
        loop {
            print_prompt("task> ");
            let input = match lines.next_line().await {
                Ok(Some(line)) => line.trim().to_string(),
                _ => return ExitCode::from(1),
            };
            if input.is_empty() || matches!(input.as_str(), "q" | "quit" | "exit") {
                break;
            }

            let task = if fast_mode && !input.to_lowercase().starts_with("ss:") {
                format!("ss:{input}")
            } else {
                input
            };

            let result = runner.run(&task).await;
            print_result(&result);

            if result.disposition == RunDisposition::ReselectMode {
                println!("returning to mode selection");
                break;
            }
        }
    }
}

fn print_prompt(prompt: &str) {
    use std::io::Write;
    print!("{prompt}");
    let _ = std::io::stdout().flush();
}
