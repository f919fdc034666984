//! corterm - run a shell or SFTP session and print its output grouped by
//! the command that produced it

use anyhow::{Context, Result};
use log::{info, warn};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use corterm::config::Config;
use corterm::context::Correspondence;
use corterm::session::{Session, SessionEvent};

fn print_help() {
    println!(
        r#"corterm {} - terminal front-end that attributes output to commands

USAGE:
    corterm [OPTIONS] [--] [COMMAND [ARGS...]]

OPTIONS:
    -h, --help                Print this help message
    -V, --version             Print version information
    --init-config[=force]     Generate config file (force overwrites)
    --config <PATH>           Use this config file

COMMAND defaults to terminal.shell from the config, then $SHELL.
Lines read from stdin are sent to the session as commands.

EXAMPLES:
    corterm                           Run your shell
    corterm sftp user@host            Track an SFTP session
    corterm --init-config             Generate default config

CONFIG FILE:
    ~/.config/corterm/config.toml
"#,
        env!("CARGO_PKG_VERSION")
    );
}

/// Parsed command line
struct Options {
    config_path: Option<PathBuf>,
    command: Vec<String>,
}

/// Quote a word so the command tokenizer reads it back unchanged
fn quote_word(word: &str) -> String {
    if !word.is_empty() && !word.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        return word.to_string();
    }
    format!("\"{}\"", word.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        config_path: None,
        command: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--" => break,
            "--config" => {
                let path = iter.next().context("--config needs a path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            _ if arg.starts_with("--config=") => {
                options.config_path = Some(PathBuf::from(&arg["--config=".len()..]));
            }
            _ if arg.starts_with('-') && options.command.is_empty() => {
                anyhow::bail!("Unknown option: {}", arg);
            }
            _ => {
                options.command.push(arg.clone());
                break;
            }
        }
    }
    options.command.extend(iter.cloned());
    Ok(options)
}

fn default_command(config: &Config) -> String {
    if !config.terminal.shell.is_empty() {
        return config.terminal.shell.clone();
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Print one correspondence; a header line marks each new command
fn print_output(out: &mut impl Write, last_id: &mut Option<u64>, c: &Correspondence) -> Result<()> {
    if let Some(meta) = &c.command {
        if *last_id != Some(meta.id) {
            let pwd = meta
                .remote_pwd
                .as_deref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default();
            writeln!(out, "\n[cmd {}] {}{}", meta.id, meta.command_text.trim_end(), pwd)?;
            *last_id = Some(meta.id);
        }
    }
    write!(out, "{}{}", c.content.plain_text(), c.trailing.plain_text())?;
    out.flush()?;
    Ok(())
}

/// Forward stdin lines; `None` marks end of input
fn spawn_stdin_reader() -> mpsc::Receiver<Option<String>> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(Some(line)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
        let _ = tx.send(None);
    });
    rx
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    // --help
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // --version
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("corterm {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // --init-config or --init-config=force
    if let Some(arg) = args.iter().find(|a| a.starts_with("--init-config")) {
        let force = arg.split('=').nth(1) == Some("force");
        match Config::write_default_config(force) {
            Ok(path) => {
                println!("Config file generated: {}", path.display());
                return Ok(());
            }
            Err(e) => {
                eprintln!("Failed to generate config: {:#}", e);
                return Err(e);
            }
        }
    }

    let options = parse_options(&args)?;
    let config = match &options.config_path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load(),
    };

    let command_line = if options.command.is_empty() {
        default_command(&config)
    } else {
        options
            .command
            .iter()
            .map(|w| quote_word(w))
            .collect::<Vec<_>>()
            .join(" ")
    };

    info!("corterm starting: {}", command_line);
    let mut session = Session::spawn(&command_line, &config)?;
    let input = spawn_stdin_reader();
    let idle = Duration::from_millis(config.session.poll_interval_ms.max(1));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut last_id = None;
    let mut stdin_open = true;

    loop {
        for event in session.poll()? {
            match event {
                SessionEvent::Output { correspondence, .. } => {
                    print_output(&mut out, &mut last_id, &correspondence)?;
                }
                SessionEvent::Exited(code) => {
                    writeln!(out)?;
                    info!("corterm exiting with {}", code);
                    std::process::exit(code);
                }
            }
        }

        while stdin_open {
            match input.try_recv() {
                Ok(Some(line)) => {
                    if let Err(e) = session.send_input(&line) {
                        eprintln!("corterm: {:#}", e);
                    }
                }
                Ok(None) | Err(mpsc::TryRecvError::Disconnected) => {
                    info!("stdin closed, ending session");
                    stdin_open = false;
                    session.kill();
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        std::thread::sleep(idle);
    }
}
