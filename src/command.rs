/// Command lines handed to the monitor, and the fixed-shape iperf3 argv.
use crate::config::IperfConfig;
use std::ffi::OsString;
use std::path::PathBuf;

/// Executable plus arguments. Always has a program; never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<String>,
}

/// Errors building a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The argv had no program.
    Empty,
    /// A client run needs a target host.
    MissingHost,
    /// A numeric argument was zero.
    Zero(&'static str),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Empty => write!(f, "command line is empty"),
            CommandError::MissingHost => write!(f, "client mode requires a target host"),
            CommandError::Zero(name) => write!(f, "{name} must be greater than 0"),
        }
    }
}

impl std::error::Error for CommandError {}

impl CommandLine {
    pub fn new(program: impl Into<OsString>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from a full argv where the first element is the program.
    pub fn from_argv(argv: Vec<String>) -> Result<Self, CommandError> {
        let mut iter = argv.into_iter();
        let program = iter.next().ok_or(CommandError::Empty)?;
        if program.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self::new(program, iter.collect()))
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Which side of the test iperf3 runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IperfMode {
    Client {
        host: String,
        interval_secs: u32,
        duration_secs: u32,
    },
    /// One-off server: exits after serving a single test, so its output is
    /// exactly one document.
    Server,
}

/// Everything needed to produce one iperf3 invocation.
#[derive(Debug, Clone)]
pub struct IperfArgs {
    pub binary: PathBuf,
    pub mode: IperfMode,
    pub port: u16,
    pub extra_args: Vec<String>,
}

impl IperfArgs {
    /// Client run against the configured host.
    pub fn client(config: &IperfConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            mode: IperfMode::Client {
                host: config.host.clone(),
                interval_secs: config.interval_secs,
                duration_secs: config.duration_secs,
            },
            port: config.port,
            extra_args: config.extra_args.clone(),
        }
    }

    /// One-off server on the configured port.
    pub fn server(config: &IperfConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            mode: IperfMode::Server,
            port: config.port,
            extra_args: config.extra_args.clone(),
        }
    }

    /// Render the argv. `-J` is always present: only structured output is read.
    pub fn to_command(&self) -> Result<CommandLine, CommandError> {
        if self.binary.as_os_str().is_empty() {
            return Err(CommandError::Empty);
        }
        if self.port == 0 {
            return Err(CommandError::Zero("port"));
        }

        let mut args = Vec::new();
        match &self.mode {
            IperfMode::Client {
                host,
                interval_secs,
                duration_secs,
            } => {
                if host.trim().is_empty() {
                    return Err(CommandError::MissingHost);
                }
                if *interval_secs == 0 {
                    return Err(CommandError::Zero("interval"));
                }
                if *duration_secs == 0 {
                    return Err(CommandError::Zero("duration"));
                }
                args.extend([
                    "-c".to_string(),
                    host.trim().to_string(),
                    "-p".to_string(),
                    self.port.to_string(),
                    "-i".to_string(),
                    interval_secs.to_string(),
                    "-t".to_string(),
                    duration_secs.to_string(),
                ]);
            }
            IperfMode::Server => {
                args.extend([
                    "-s".to_string(),
                    "-p".to_string(),
                    self.port.to_string(),
                    "-1".to_string(),
                ]);
            }
        }
        args.push("-J".to_string());
        args.extend(self.extra_args.iter().cloned());

        Ok(CommandLine::new(self.binary.clone().into_os_string(), args))
    }
}
