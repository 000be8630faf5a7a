//! Operator console: reads line commands on its own thread and drives the
//! server through the [`EventLoopBridge`].

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use log::{info, warn};
use tokio::sync::Notify;

use crate::bridge::EventLoopBridge;
use crate::data::{Signal, SignalAction};
use crate::error::BridgeError;

pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub const HELP_TEXT: &str = "Available commands: exit/quit - stop the server, help - show this help, \
test_signal - broadcast a test signal, status - show connected client count, clients - list connected clients";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
    TestSignal,
    Status,
    Clients,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let command = line.trim().to_lowercase();
        match command.as_str() {
            "exit" | "quit" => Command::Exit,
            "help" => Command::Help,
            "test_signal" => Command::TestSignal,
            "status" => Command::Status,
            "clients" => Command::Clients,
            "" => Command::Empty,
            _ => Command::Unknown(command),
        }
    }
}

/// Cross-thread stop request. Any thread may trigger it; async code can wait
/// for it.
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    triggered: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if !self.inner.triggered.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// The signal broadcast by `test_signal`.
pub fn canned_test_signal() -> Signal {
    Signal::new(SignalAction::Buy, "000001.SZ")
        .with_price(15.80)
        .with_volume(100)
        .with_strategy_id("test_strategy_001")
        .with_signal_id("test_signal_001")
        .stamped_now()
}

pub struct ControlSurface {
    bridge: Arc<EventLoopBridge>,
    stop: StopHandle,
    timeout: Duration,
}

impl ControlSurface {
    pub fn new(bridge: Arc<EventLoopBridge>, stop: StopHandle) -> Self {
        Self {
            bridge,
            stop,
            timeout: COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the console on stdin/stdout in a dedicated thread.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("control-surface".to_string())
            .spawn(move || {
                let stdin = io::stdin();
                if let Err(e) = self.run(stdin.lock(), io::stdout()) {
                    warn!("Control surface stopped: {}", e);
                    self.stop.trigger();
                }
            })
    }

    /// Processes commands until `exit`/`quit`, end of input, or a stop
    /// triggered elsewhere. End of input also triggers the stop handle.
    pub fn run<R: BufRead, W: Write>(&self, input: R, mut output: W) -> io::Result<()> {
        for line in input.lines() {
            if self.stop.is_triggered() {
                return Ok(());
            }

            let command = Command::parse(&line?);
            if !self.execute(&command, &mut output)? {
                return Ok(());
            }
        }

        info!("Console input closed, requesting shutdown");
        self.stop.trigger();
        Ok(())
    }

    /// Executes one command. Returns false when the console should stop.
    pub fn execute<W: Write>(&self, command: &Command, output: &mut W) -> io::Result<bool> {
        match command {
            Command::Exit => {
                writeln!(output, "Exit command received, shutting down the server...")?;
                self.stop.trigger();
                return Ok(false);
            }
            Command::Help => writeln!(output, "{}", HELP_TEXT)?,
            Command::TestSignal => self.broadcast_test_signal(output)?,
            Command::Status => match self.bridge.client_count(self.timeout) {
                Ok(count) => writeln!(output, "Connected clients: {}", count)?,
                Err(e) => self.report_error(output, "Status request", &e)?,
            },
            Command::Clients => match self.bridge.clients(self.timeout) {
                Ok(clients) if clients.is_empty() => writeln!(output, "No clients connected")?,
                Ok(clients) => {
                    writeln!(output, "Connected clients ({}):", clients.len())?;
                    for client in clients {
                        writeln!(output, "  {}", client)?;
                    }
                }
                Err(e) => self.report_error(output, "Client listing", &e)?,
            },
            Command::Empty => {}
            Command::Unknown(other) => {
                writeln!(output, "Unknown command: {}. Type 'help' for available commands.", other)?
            }
        }
        output.flush()?;
        Ok(true)
    }

    fn broadcast_test_signal<W: Write>(&self, output: &mut W) -> io::Result<()> {
        let signal = canned_test_signal();
        let pretty = serde_json::to_string_pretty(&signal).unwrap_or_else(|_| signal.to_string());
        writeln!(output, "Broadcasting test signal: {}", pretty)?;

        match self.bridge.broadcast(signal, self.timeout) {
            Ok(report) if report.is_noop() => writeln!(output, "Test signal not sent: no clients connected"),
            Ok(report) => writeln!(output, "Test signal broadcast: {}", report),
            Err(e) => self.report_error(output, "Test signal broadcast", &e),
        }
    }

    fn report_error<W: Write>(&self, output: &mut W, what: &str, err: &BridgeError) -> io::Result<()> {
        warn!("{} failed ({}): {}", what, err.as_label(), err);
        match err {
            BridgeError::Timeout { .. } => writeln!(output, "{} timed out; the outcome is unknown", what),
            BridgeError::LoopUnavailable => writeln!(output, "Error: event loop not ready, {} skipped", what),
            _ => writeln!(output, "{} failed: {}", what, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::config::ServerConfig;

    fn run_script(bridge: Arc<EventLoopBridge>, script: &str) -> (String, StopHandle) {
        let stop = StopHandle::new();
        let surface = ControlSurface::new(bridge, stop.clone());
        let mut output = Vec::new();
        surface.run(Cursor::new(script.to_string()), &mut output).unwrap();
        (String::from_utf8(output).unwrap(), stop)
    }

    fn started_bridge() -> Arc<EventLoopBridge> {
        let bridge = EventLoopBridge::new(ServerConfig::ephemeral());
        bridge.start().unwrap();
        Arc::new(bridge)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("exit"), Command::Exit);
        assert_eq!(Command::parse("  QUIT \n"), Command::Exit);
        assert_eq!(Command::parse("help"), Command::Help);
        assert_eq!(Command::parse("test_signal"), Command::TestSignal);
        assert_eq!(Command::parse("status"), Command::Status);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("launch"), Command::Unknown("launch".to_string()));
    }

    #[test]
    fn test_canned_signal() {
        let signal = canned_test_signal();
        assert_eq!(signal.action, Some(SignalAction::Buy));
        assert_eq!(signal.symbol.as_deref(), Some("000001.SZ"));
        assert_eq!(signal.price, Some(15.8));
        assert_eq!(signal.volume, Some(100));
        assert_eq!(signal.signal_id.as_deref(), Some("test_signal_001"));
        assert!(signal.timestamp.is_some());
    }

    #[test]
    fn test_exit_stops_processing() {
        let (output, stop) = run_script(started_bridge(), "help\nbogus\nstatus\nexit\nstatus\n");

        assert!(output.contains("Available commands"));
        assert!(output.contains("Unknown command: bogus"));
        assert_eq!(output.matches("Connected clients: 0").count(), 1);
        assert!(output.contains("shutting down"));
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_end_of_input_triggers_stop() {
        let (output, stop) = run_script(started_bridge(), "clients\n");
        assert!(output.contains("No clients connected"));
        assert!(stop.is_triggered());
    }

    #[test]
    fn test_signal_without_clients_reports_noop() {
        let (output, _stop) = run_script(started_bridge(), "test_signal\nquit\n");
        assert!(output.contains("\"symbol\": \"000001.SZ\""));
        assert!(output.contains("no clients connected"));
    }

    #[test]
    fn test_commands_report_unavailable_loop() {
        let bridge = Arc::new(EventLoopBridge::new(ServerConfig::ephemeral()));
        let (output, _stop) = run_script(bridge, "test_signal\nstatus\nexit\n");
        assert!(output.contains("event loop not ready"));
        assert!(!output.contains("Connected clients"));
    }

    #[tokio::test]
    async fn test_stop_handle_wakes_waiter() {
        let stop = StopHandle::new();
        let trigger = stop.clone();
        let waiter = tokio::spawn(async move { stop.wait().await });

        thread::spawn(move || trigger.trigger()).join().unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_handle_already_triggered() {
        let stop = StopHandle::new();
        stop.trigger();
        tokio::time::timeout(Duration::from_millis(100), stop.wait()).await.unwrap();
    }
}
