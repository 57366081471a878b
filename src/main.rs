//! Headless front end: parses the command line, builds the framework,
//! and drives it from a minimal console while draining the UI event
//! channel.
//!
//! Exit codes: 0 normal, 2 fatal configuration error, 3 hardware-open
//! failure.

use std::io::{BufRead, Write, stdin, stdout};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use log::{error, info};

use ephys_rt::ui::{Severity, UiEvent};
use ephys_rt::{Error, Framework, FrameworkConfig, ProcCommand};

fn parse_args() -> Result<FrameworkConfig, String> {
    let mut config = FrameworkConfig {
        simulate: false,
        ..FrameworkConfig::default()
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let dir = args.next().ok_or("--config needs a directory")?;
                config.config_dir = PathBuf::from(&dir);
                config.data_dir = PathBuf::from(&dir).join("data");
            }
            "--simulate" => config.simulate = true,
            "--no-save" => config.no_save = true,
            "--start-macro" => {
                config.start_macro = Some(args.next().ok_or("--start-macro needs a name")?);
            }
            "--help" | "-h" => {
                return Err(
                    "usage: ephys_rt [--config <dir>] [--simulate] [--no-save] [--start-macro <name>]"
                        .to_string(),
                );
            }
            other => return Err(format!("unknown argument {other}")),
        }
    }
    Ok(config)
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match parse_args() {
        Ok(c) => c,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let mut framework = match Framework::build(config) {
        Ok(fw) => fw,
        Err(e @ Error::InvalidDevice(_)) => {
            error!("{e}");
            return ExitCode::from(3);
        }
        Err(e) => {
            error!("{e}");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = framework.load_macros() {
        error!("{e}");
        return ExitCode::from(2);
    }

    framework.start();
    info!("acquisition running; type 'help' for commands");

    // UI drain: prints core events; detached, dies with the process
    let ui = framework.ui.clone();
    thread::spawn(move || {
        loop {
            for event in ui.drain() {
                match event {
                    UiEvent::Message {
                        severity,
                        text,
                        timeout,
                    } => match severity {
                        Severity::Info => {
                            let suffix =
                                timeout.map(|t| format!(" ({t:.0}s)")).unwrap_or_default();
                            println!("[info] {text}{suffix}");
                        }
                        Severity::Warning => println!("[warning] {text}"),
                        Severity::Fatal => println!("[FATAL] {text}"),
                    },
                    UiEvent::ReProStarted { name } => println!("[repro] {name} started"),
                    UiEvent::ReProFinished { name, outcome } => {
                        println!("[repro] {name} finished: {outcome:?}")
                    }
                    UiEvent::SessionStarted => println!("[session] started"),
                    UiEvent::SessionStopped { saved } => println!(
                        "[session] stopped ({})",
                        if saved { "saved" } else { "discarded" }
                    ),
                    UiEvent::IncompleteSave { repro } => {
                        println!("[warning] incomplete save for run of {repro}")
                    }
                }
            }
            thread::sleep(Duration::from_millis(100));
        }
    });

    let proc_tx = framework.proc_commands();
    let stdin = stdin();
    print_prompt();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let mut words = line.split_whitespace();
        match words.next().unwrap_or("") {
            "" => {}
            "quit" | "q" => break,
            "stop" => framework.scheduler.request_stop(),
            "break" => framework.scheduler.soft_stop(),
            "session" => {
                let save = !framework.config.no_save;
                if let Err(e) = framework.session.toggle(save) {
                    println!("session: {e}");
                }
            }
            "discard" => {
                if let Err(e) = framework.session.stop(false) {
                    println!("session: {e}");
                }
            }
            "macro" => match words.next() {
                Some(name) => {
                    framework.scheduler.request_stop();
                    let _ = proc_tx.send(ProcCommand::RunMacro(name.to_string()));
                }
                None => println!("usage: macro <name>"),
            },
            "resume" => {
                framework.scheduler.request_stop();
                let _ = proc_tx.send(ProcCommand::Resume);
            }
            "next" => {
                framework.scheduler.request_stop();
                let _ = proc_tx.send(ProcCommand::ResumeNext);
            }
            "repros" => {
                for name in framework.scheduler.names() {
                    println!("  {name}");
                }
            }
            "help" => {
                println!(
                    "commands: session | discard | macro <name> | stop | break | resume | next | repros | quit"
                );
            }
            other => println!("unknown command {other} (try 'help')"),
        }
        print_prompt();
    }

    framework.shutdown();
    ExitCode::SUCCESS
}

fn print_prompt() {
    print!("> ");
    let _ = stdout().flush();
}
