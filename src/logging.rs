use once_cell::sync::OnceCell;
use std::env;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "logs/grove.log";

/// Installs the console and rolling file subscribers.
///
/// `RUST_LOG` selects the filter (default `info`), `RUST_LOG_FILE` the
/// file (default `logs/grove.log`, rotated daily). Calling it twice keeps
/// the first subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact();

    let log_path = env::var("RUST_LOG_FILE").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let log_path = Path::new(&log_path);
    let directory = log_path.parent().unwrap_or(Path::new("."));
    let file_name = log_path.file_name().unwrap_or(std::ffi::OsStr::new("grove.log"));
    let (nb_writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, file_name));

    let file_layer = fmt::layer()
        .with_writer(nb_writer)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .compact();

    if tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        return;
    }
    let _ = FILE_GUARD.set(guard);

    // worker threads panic off the main thread; keep the message in the log
    std::panic::set_hook(Box::new(|info| {
        let mut msg = String::new();
        if let Some(loc) = info.location() {
            msg.push_str(&format!("panic at {}:{}:{} ", loc.file(), loc.line(), loc.column()));
        }
        if let Some(s) = info.payload().downcast_ref::<&str>() {
            msg.push_str(s);
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            msg.push_str(s);
        } else {
            msg.push_str("<non-string panic>");
        }
        let thread = std::thread::current();
        let bt = std::backtrace::Backtrace::force_capture();
        tracing::error!(thread = thread.name().unwrap_or("<unnamed>"), "{}\nBacktrace:\n{:?}", msg, bt);
    }));
}
