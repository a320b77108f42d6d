pub mod logging {
    use std::fs::{self, OpenOptions};
    use std::path::{Path, PathBuf};
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
    use tracing_subscriber::EnvFilter;

    const FILTER_ENV: &str = "VOICE_CALL_LOG_FILTER";
    const DEPS_ENV: &str = "VOICE_CALL_TRACE_DEPS";

    /// Targets emitted by this workspace; they follow the requested level.
    const CALL_TARGETS: &[&str] = &["voice", "signal", "voice_call_core", "signal_bus"];

    /// ICE, DTLS and relay internals. Capped at info unless asked for.
    const MEDIA_STACK_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "interceptor",
        "rtcp",
        "redis",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot write log file {path:?}: {source}")]
        LogFile {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("tracing subscriber already installed: {0}")]
        AlreadyInstalled(String),
    }

    // Dropping the guard stops the background writer.
    static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber for the call binary. Calling it again
    /// after a successful install does nothing.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER_GUARD.get().is_some() {
            return Ok(());
        }
        let (writer, guard) = open_writer(config.file.as_deref())?;
        let level = LevelFilter::from(config.level);
        let custom = std::env::var(FILTER_ENV).ok();
        let include_deps = media_stack_requested();
        let directives = custom
            .clone()
            .unwrap_or_else(|| call_directives(level, include_deps));

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(&directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_names(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::AlreadyInstalled(err.to_string()))?;
        let _ = WRITER_GUARD.set(guard);

        if custom.is_none() && level >= LevelFilter::DEBUG && !include_deps {
            tracing::debug!(
                target = "voice.call",
                "webrtc and redis traces capped at info; set {DEPS_ENV}=1 to include them"
            );
        }
        Ok(())
    }

    fn open_writer(path: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
        let Some(path) = path else {
            return Ok(tracing_appender::non_blocking(std::io::stderr()));
        };
        let log_file_error = |source| InitError::LogFile {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(log_file_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(log_file_error)?;
        Ok(tracing_appender::non_blocking(file))
    }

    /// `EnvFilter` directives for `level`. Below debug one directive covers
    /// everything; from debug up only call targets get the extra detail.
    pub(crate) fn call_directives(level: LevelFilter, include_media_stack: bool) -> String {
        let verbosity = level.to_string().to_ascii_lowercase();
        if level < LevelFilter::DEBUG {
            return verbosity;
        }
        let media_stack = if include_media_stack {
            verbosity.as_str()
        } else {
            "info"
        };
        let call = CALL_TARGETS
            .iter()
            .map(|target| format!("{target}={verbosity}"));
        let deps = MEDIA_STACK_TARGETS
            .iter()
            .map(|target| format!("{target}={media_stack}"));
        std::iter::once("info".to_owned())
            .chain(call)
            .chain(deps)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn media_stack_requested() -> bool {
        std::env::var(DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
    }

}
