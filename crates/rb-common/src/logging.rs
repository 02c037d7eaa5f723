//! Logging setup, driven by the `logging` block of `ProgramConfig`.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Where formatted log lines actually go, selected by `logging_output`:
/// `"stderr"`, `"console"`/`"stdout"` (the default), or any other value
/// treated as a file path to append to.
#[derive(Clone)]
enum LogSink {
    Stdout,
    Stderr,
    File(Arc<Mutex<std::fs::File>>),
}

impl LogSink {
    fn from_output(output: &str) -> io::Result<Self> {
        match output.to_lowercase().as_str() {
            "stderr" => Ok(LogSink::Stderr),
            "console" | "stdout" | "" => Ok(LogSink::Stdout),
            path => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(LogSink::File(Arc::new(Mutex::new(file))))
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            LogSink::Stdout => io::stdout().write(buf),
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File(f) => f.lock().unwrap().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogSink::Stdout => io::stdout().flush(),
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File(f) => f.lock().unwrap().flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize the global tracing subscriber from the configured mode/format.
/// `logging_mode: none` installs a filter that passes nothing through.
pub fn init_logging(config: &LoggingConfig) {
    let filter = match config.mode.to_lowercase().as_str() {
        "none" => "off".to_string(),
        "debug" => "dhcp_batcher=debug,rb_dhcp=debug,rb_batch=debug,rb_common=debug".to_string(),
        "warn" => "dhcp_batcher=warn,rb_dhcp=warn,rb_batch=warn,rb_common=warn".to_string(),
        _ => "dhcp_batcher=info,rb_dhcp=info,rb_batch=info,rb_common=info".to_string(),
    };

    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let sink = LogSink::from_output(&config.output).unwrap_or_else(|e| {
        eprintln!(
            "warning: unable to open logging_output {:?} ({e}), falling back to stdout",
            config.output
        );
        LogSink::Stdout
    });

    if config.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(sink))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(sink))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sink_console_is_stdout() {
        assert!(matches!(LogSink::from_output("console").unwrap(), LogSink::Stdout));
        assert!(matches!(LogSink::from_output("").unwrap(), LogSink::Stdout));
    }

    #[test]
    fn test_log_sink_stderr() {
        assert!(matches!(LogSink::from_output("stderr").unwrap(), LogSink::Stderr));
    }

    #[test]
    fn test_log_sink_file_path_writes_and_appends() {
        let path = std::env::temp_dir().join(format!("dhcp-batcher-logtest-{:?}.log", std::thread::current().id()));
        let path_str = path.to_str().unwrap();

        let mut sink = LogSink::from_output(path_str).expect("open log file");
        sink.write_all(b"first\n").unwrap();
        sink.flush().unwrap();

        let mut sink2 = LogSink::from_output(path_str).expect("reopen log file");
        sink2.write_all(b"second\n").unwrap();
        sink2.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");

        let _ = std::fs::remove_file(&path);
    }
}
