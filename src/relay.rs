use std::env;
use std::io::{self, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use async_stream::stream;
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Duration;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::{Stream, StreamExt};

use crate::progress::{parse_line, LineSplitter, RelayEvent};

const DEFAULT_SOURCE_URL: &str = "https://example.com/hls/live.m3u8";
const DEFAULT_DESTINATION_URL: &str = "rtmps://dc5-1.rtmp.t.me:443/s/STREAM_KEY";
const DEFAULT_DURATION: Duration = Duration::from_secs(90);
const DEFAULT_HEADERS: [&str; 3] = [
    "User-Agent: Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36",
    "Referer: https://example.com/",
    "Origin: https://example.com",
];

/// ffmpeg's exit code after it handles SIGTERM/SIGINT itself.
pub const STOP_EXIT_CODE: i32 = 255;

/// How long to keep reading diagnostics after the transcoder exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub program: String,
    pub source_url: String,
    pub destination_url: String,
    pub headers: Vec<String>,
    pub duration_limit: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            program: "ffmpeg".to_string(),
            source_url: DEFAULT_SOURCE_URL.to_string(),
            destination_url: DEFAULT_DESTINATION_URL.to_string(),
            headers: DEFAULT_HEADERS.iter().map(|h| h.to_string()).collect(),
            duration_limit: DEFAULT_DURATION,
        }
    }
}

impl RelayConfig {
    /// Compiled-in defaults, with deployment overrides from `RELAY_*` variables.
    pub fn from_env() -> Self {
        let mut config = RelayConfig::default();
        if let Ok(program) = env::var("RELAY_FFMPEG") {
            config.program = program;
        }
        if let Ok(url) = env::var("RELAY_SOURCE_URL") {
            config.source_url = url;
        }
        if let Ok(url) = env::var("RELAY_DESTINATION_URL") {
            config.destination_url = url;
        }
        if let Ok(secs) = env::var("RELAY_DURATION_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(secs) => config.duration_limit = Duration::from_secs(secs),
                Err(_) => warn!("Ignoring RELAY_DURATION_SECS={:?}, not a number of seconds", secs),
            }
        }
        config
    }

    /// The full ffmpeg argument list: resilient HLS input, a fixed low-latency
    /// H.264/AAC encode, and FLV output suited to a live RTMP(S) ingest.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();
        if !self.headers.is_empty() {
            args.push("-headers".to_string());
            args.push(format!("{}\r\n", self.headers.join("\r\n")));
        }

        let input = [
            "-http_persistent", "0", // new connection per segment
            "-reconnect", "1",
            "-reconnect_streamed", "1",
            "-reconnect_delay_max", "5",
        ];
        let video = [
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-profile:v", "baseline",
            "-level", "3.0",
            "-b:v", "1200k",
            "-maxrate", "1200k",
            "-bufsize", "2400k",
            "-r", "25",
            "-g", "50",
            "-s", "960x540",
            "-pix_fmt", "yuv420p",
            "-threads", "4",
        ];
        let audio = ["-c:a", "aac", "-b:a", "128k", "-ac", "2", "-ar", "44100"];
        let output = [
            "-f", "flv",
            "-flvflags", "no_duration_filesize",
            "-drop_pkts_on_overflow", "1",
            "-max_delay", "500000",
        ];

        args.extend(input.iter().map(|s| s.to_string()));
        args.push("-i".to_string());
        args.push(self.source_url.clone());
        args.extend(video.iter().map(|s| s.to_string()));
        args.extend(audio.iter().map(|s| s.to_string()));
        args.extend(output.iter().map(|s| s.to_string()));
        args.push(self.destination_url.clone());
        args
    }

    /// The transcoder gets its own process group so a terminal Ctrl-C reaches
    /// only us; we forward a single SIGTERM instead.
    pub fn command(&self) -> Command {
        let mut command = std::process::Command::new(&self.program);
        command
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut command = Command::from(command);
        command.kill_on_drop(true);
        command
    }
}

/// Something that can be asked to shut down gracefully.
pub trait Terminate {
    fn terminate(&mut self) -> Result<()>;
}

/// Sends SIGTERM to a process.
pub struct Sigterm {
    pid: Pid,
}

impl Sigterm {
    pub fn new(pid: u32) -> Self {
        Sigterm {
            pid: Pid::from_raw(pid as i32),
        }
    }
}

impl Terminate for Sigterm {
    fn terminate(&mut self) -> Result<()> {
        kill(self.pid, Signal::SIGTERM).with_context(|| format!("failed to signal pid {}", self.pid))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Deadline,
    Interrupt,
}

/// Owns the stop decision for one transcoder run. The duration timer and the
/// operator interrupt both end here, and only the first one signals.
pub struct StopControl<T> {
    target: T,
    deadline_armed: bool,
    signalled: bool,
}

impl<T: Terminate> StopControl<T> {
    pub fn new(target: T) -> Self {
        StopControl {
            target,
            deadline_armed: true,
            signalled: false,
        }
    }

    pub fn deadline_armed(&self) -> bool {
        self.deadline_armed
    }

    pub fn signalled(&self) -> bool {
        self.signalled
    }

    /// The duration limit elapsed. The timer is spent either way.
    pub fn on_deadline(&mut self) -> bool {
        self.deadline_armed = false;
        self.stop(StopReason::Deadline)
    }

    /// Operator interrupt; cancels the pending timer.
    pub fn on_interrupt(&mut self) -> bool {
        self.deadline_armed = false;
        self.stop(StopReason::Interrupt)
    }

    fn stop(&mut self, reason: StopReason) -> bool {
        if self.signalled {
            debug!("Already stopping, ignoring {:?}", reason);
            return false;
        }
        self.signalled = true;
        info!("Stopping transcoder ({:?})", reason);
        if let Err(err) = self.target.terminate() {
            warn!("{:#}", err);
        }
        true
    }
}

/// How a transcoder run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitObservation {
    Completed,
    ExpectedStop,
    /// Exit code, or 128 + signal number for death by an unexpected signal.
    AbnormalExit(i32),
    SpawnFailed(String),
}

impl ExitObservation {
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitObservation::Completed,
            (Some(STOP_EXIT_CODE), _) => ExitObservation::ExpectedStop,
            (Some(code), _) => ExitObservation::AbnormalExit(code),
            (None, Some(sig)) if sig == Signal::SIGTERM as i32 || sig == Signal::SIGINT as i32 => {
                ExitObservation::ExpectedStop
            }
            (None, Some(sig)) => ExitObservation::AbnormalExit(128 + sig),
            (None, None) => ExitObservation::AbnormalExit(-1),
        }
    }

    pub fn report(&self) {
        match self {
            ExitObservation::Completed => info!("Stream completed successfully"),
            ExitObservation::ExpectedStop => info!("Stream stopped"),
            ExitObservation::AbnormalExit(code) => {
                error!("Stream failed, transcoder exited with code {}", code);
                error!("This is usually the network: check that outbound RTMPS (port 443) is not blocked by the ISP or a firewall");
            }
            ExitObservation::SpawnFailed(reason) => {
                error!("Failed to start transcoder: {}", reason);
                error!("Check that ffmpeg is installed: ffmpeg -version");
            }
        }
    }
}

/// Turns the transcoder's stderr into events as the bytes arrive.
pub fn diagnostic_events<R>(reader: Option<R>) -> impl Stream<Item = RelayEvent>
where
    R: AsyncRead + Unpin,
{
    stream! {
        if let Some(mut reader) = reader {
            let mut splitter = LineSplitter::default();
            let mut chunk = [0u8; 4096];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => splitter.push(&chunk[..n]),
                    Err(err) => {
                        warn!("Lost transcoder output: {}", err);
                        break;
                    }
                }
                while let Some(line) = splitter.next_line() {
                    if let Some(event) = parse_line(&line) {
                        yield event;
                    }
                }
            }
            if let Some(event) = splitter.finish().and_then(|line| parse_line(&line)) {
                yield event;
            }
        }
    }
}

/// Runs the transcoder until it exits, stopping it once when `limit` elapses
/// or an interrupt arrives, whichever is first.
pub async fn supervise<S, T, M, F>(
    mut command: Command,
    limit: Duration,
    mut interrupts: S,
    make_target: M,
    mut on_event: F,
) -> ExitObservation
where
    S: Stream<Item = ()> + Unpin,
    T: Terminate,
    M: FnOnce(u32) -> T,
    F: FnMut(RelayEvent),
{
    command.stderr(Stdio::piped());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return ExitObservation::SpawnFailed(err.to_string()),
    };
    let Some(pid) = child.id() else {
        return observe(child.wait().await);
    };
    debug!("Transcoder running as pid {}", pid);

    let mut stop = StopControl::new(make_target(pid));
    let events = diagnostic_events(child.stderr.take());
    tokio::pin!(events);
    let deadline = tokio::time::sleep(limit);
    tokio::pin!(deadline);
    let mut stderr_open = true;
    let mut interrupts_open = true;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            event = events.next(), if stderr_open => match event {
                Some(event) => on_event(event),
                None => stderr_open = false,
            },
            _ = &mut deadline, if stop.deadline_armed() => {
                info!("Duration limit of {}s reached", limit.as_secs());
                stop.on_deadline();
            }
            received = interrupts.next(), if interrupts_open => match received {
                Some(()) => {
                    info!("Interrupt received");
                    stop.on_interrupt();
                }
                None => interrupts_open = false,
            },
        }
    };

    if stderr_open {
        let drain = async {
            while let Some(event) = events.next().await {
                on_event(event);
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!("Transcoder output still open after exit, not waiting further");
        }
    }

    observe(status)
}

fn observe(status: io::Result<ExitStatus>) -> ExitObservation {
    match status {
        Ok(status) => ExitObservation::from_status(status),
        Err(err) => {
            error!("Lost track of transcoder: {}", err);
            ExitObservation::AbnormalExit(-1)
        }
    }
}

/// Relays `config.source_url` to `config.destination_url` until the duration
/// limit or Ctrl-C. Progress is drawn on a single stdout line.
pub async fn run(config: &RelayConfig) -> ExitObservation {
    let interrupts: Pin<Box<dyn Stream<Item = ()> + Send>> =
        match signal(SignalKind::interrupt()) {
            Ok(sigint) => Box::pin(SignalStream::new(sigint)),
            Err(err) => {
                warn!("Cannot listen for Ctrl-C, relying on the duration limit: {}", err);
                Box::pin(tokio_stream::empty())
            }
        };

    info!(
        "Relaying {} -> {} for {}s",
        config.source_url,
        config.destination_url,
        config.duration_limit.as_secs()
    );
    supervise(
        config.command(),
        config.duration_limit,
        interrupts,
        Sigterm::new,
        show_event,
    )
    .await
}

fn show_event(event: RelayEvent) {
    match event {
        RelayEvent::Progress(progress) => {
            print!("\r{}", progress);
            let _ = io::stdout().flush();
        }
        RelayEvent::Error(line) => {
            println!();
            error!("{}", line);
        }
    }
}
