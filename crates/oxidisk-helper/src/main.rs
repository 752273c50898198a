use anyhow::{Context, Result};
use clap::Parser;
use oxidisk_engine::dispatcher::Dispatcher;
use oxidisk_engine::{logging, EngineConfig};
use oxidisk_hal::MacosHal;
use oxidisk_helper::cli::Args;
use oxidisk_helper::{dispatch, HelperRequest};
use serde_json::json;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static TERM_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_term(_sig: libc::c_int) {
    TERM_REQUESTED.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init();

    let raw = match &args.request_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request from {}", path.display()))?,
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("failed to read request from stdin")?;
            input
        }
    };
    let request: HelperRequest =
        serde_json::from_str(&raw).context("request is not valid JSON")?;

    let mut cfg = EngineConfig::default();
    if let Some(path) = args.journal_path {
        cfg.journal_path = path;
    }
    if let Some(path) = args.sudoers_path {
        cfg.sudoers_path = path;
    }
    cfg.allow_experimental_resize = args.experimental_resize;

    let dispatcher = Dispatcher::new(Arc::new(MacosHal::new()), cfg);
    let bus = dispatcher.bus();

    // A SIGTERM from the shell flips the cooperative cancel flag; the engine
    // winds down at the next block or line boundary.
    unsafe {
        libc::signal(libc::SIGTERM, on_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, on_term as libc::sighandler_t);
    }
    let watcher_bus = dispatcher.bus();
    let watcher = std::thread::spawn(move || loop {
        if TERM_REQUESTED.load(Ordering::SeqCst) {
            watcher_bus.request_cancel();
            return;
        }
        if SHUTTING_DOWN.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    });

    // Stream events as JSON lines; the final response is the last line.
    let progress_rx = bus.subscribe_progress();
    let progress_printer = std::thread::spawn(move || {
        for event in progress_rx {
            emit_tagged("progress", &event);
        }
    });
    let log_rx = bus.subscribe_logs();
    let log_printer = std::thread::spawn(move || {
        for event in log_rx {
            emit_tagged("log", &event);
        }
    });

    let response = dispatch(&dispatcher, request);

    // Close the event channels before the final line so readers see the
    // response last.
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
    let _ = watcher.join();
    drop(dispatcher);
    drop(bus);
    let _ = progress_printer.join();
    let _ = log_printer.join();

    let encoded = serde_json::to_string(&response).context("failed to encode response")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{encoded}").context("failed to write response")?;
    stdout.flush().ok();

    if !response.ok {
        std::process::exit(1);
    }
    Ok(())
}

fn emit_tagged<T: serde::Serialize>(kind: &str, event: &T) {
    let mut value = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(_) => return,
    };
    if let Some(map) = value.as_object_mut() {
        map.insert("type".to_string(), json!(kind));
    }
    if let Ok(line) = serde_json::to_string(&value) {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}
