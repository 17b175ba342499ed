use cloudide_protocol::{RawFrame, TerminalControl, TerminalOutput, decode_terminal_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{CloseReason, Connection, Inbound, InboundStream};
use crate::error::TransportError;

/// Where decoded terminal output is written.
pub trait TerminalSurface: Send + 'static {
    fn write(&mut self, bytes: &[u8]);

    /// Called when the local viewport changes size.
    fn resize(&mut self, _size: TerminalSize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl TerminalSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn resize_frame(self) -> TerminalControl {
        TerminalControl::Resize {
            cols: self.cols,
            rows: self.rows,
        }
    }
}

/// Headless emulator surface.
pub struct Vt100Surface {
    parser: vt100::Parser,
}

impl Vt100Surface {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, 0),
        }
    }

    /// Visible screen text.
    pub fn contents(&self) -> String {
        self.parser.screen().contents()
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }
}

impl TerminalSurface for Vt100Surface {
    fn write(&mut self, bytes: &[u8]) {
        self.parser.process(bytes);
    }

    fn resize(&mut self, size: TerminalSize) {
        self.parser.screen_mut().set_size(size.rows, size.cols);
    }
}

/// Remembers the last size sent to the backend so unchanged layouts do not
/// produce resize frames.
#[derive(Debug, Default)]
pub struct ViewportFit {
    last_sent: Option<TerminalSize>,
}

impl ViewportFit {
    pub fn new() -> Self {
        Self::default()
    }

    /// The frame sent on attach. Always produced.
    pub fn initial(&mut self, size: TerminalSize) -> TerminalControl {
        self.last_sent = Some(size);
        size.resize_frame()
    }

    /// A frame for `size` if it differs from what was last sent. Zero-area
    /// sizes (a hidden viewport) are ignored.
    pub fn observe(&mut self, size: TerminalSize) -> Option<TerminalControl> {
        if size.cols == 0 || size.rows == 0 || self.last_sent == Some(size) {
            return None;
        }
        self.last_sent = Some(size);
        Some(size.resize_frame())
    }

    pub fn last_sent(&self) -> Option<TerminalSize> {
        self.last_sent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Connecting,
    Attached,
    Closed,
}

enum Command {
    Keys(String),
    Resize(TerminalSize),
    Dispose,
}

/// One terminal connection driving one surface.
pub struct TerminalSession;

impl TerminalSession {
    /// Connect to `url` and start pumping frames between the socket and
    /// `surface`. The surface is owned by the session until disposal.
    pub fn attach<T: TerminalSurface>(
        url: impl Into<String>,
        surface: T,
        initial_size: TerminalSize,
        outbound_queue: usize,
    ) -> TerminalHandle {
        let (connection, inbound) = Connection::connect(url, outbound_queue);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TerminalState::Connecting);

        let task = tokio::spawn(run(
            connection,
            inbound,
            surface,
            initial_size,
            commands_rx,
            state_tx,
        ));

        TerminalHandle {
            commands: commands_tx,
            state: state_rx,
            task: Some(task),
        }
    }
}

/// Caller side of a [`TerminalSession`].
pub struct TerminalHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<TerminalState>,
    task: Option<JoinHandle<()>>,
}

impl TerminalHandle {
    pub fn state(&self) -> TerminalState {
        *self.state.borrow()
    }

    /// Forward keystroke data as stdin frames. Ignored unless attached.
    pub fn send_keys(&self, data: impl Into<String>) -> bool {
        self.commands.send(Command::Keys(data.into())).is_ok()
    }

    /// Report the current viewport size.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        self.commands
            .send(Command::Resize(TerminalSize::new(cols, rows)))
            .is_ok()
    }

    pub async fn wait_attached(&self) -> bool {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state != TerminalState::Connecting)
            .await
            .map(|state| *state == TerminalState::Attached)
            .unwrap_or(false)
    }

    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|state| *state == TerminalState::Closed).await;
    }

    /// Close the socket and release the surface. Safe to call repeatedly.
    pub async fn dispose(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let _ = self.commands.send(Command::Dispose);
        if let Err(e) = task.await {
            warn!("terminal task ended abnormally: {e}");
        }
    }
}

impl Drop for TerminalHandle {
    fn drop(&mut self) {
        // Aborting drops the task's connection and surface.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run<T: TerminalSurface>(
    connection: Connection,
    mut inbound: InboundStream,
    mut surface: T,
    initial_size: TerminalSize,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<TerminalState>,
) {
    let mut size = initial_size;
    surface.resize(size);

    // Connecting: only size changes and disposal matter.
    let attached = loop {
        tokio::select! {
            ready = connection.wait_ready() => break Some(ready),
            command = commands.recv() => match command {
                Some(Command::Resize(next)) => {
                    size = next;
                    surface.resize(size);
                }
                Some(Command::Keys(_)) => debug!("terminal not attached, keys dropped"),
                Some(Command::Dispose) | None => break None,
            },
        }
    };
    let Some(attached) = attached else {
        teardown(connection, surface, &state);
        return;
    };

    if attached {
        let _ = state.send(TerminalState::Attached);
        info!(url = %connection.url(), cols = size.cols, rows = size.rows, "terminal attached");
        let mut fit = ViewportFit::new();
        send_control(&connection, &fit.initial(size));

        if pump(&connection, &mut inbound, &mut surface, &mut commands, &mut fit).await {
            teardown(connection, surface, &state);
            return;
        }
    } else {
        let reason = match inbound.recv().await {
            Some(Inbound::Closed(CloseReason::Error(e))) => e,
            _ => "connection closed".to_string(),
        };
        warn!(url = %connection.url(), "terminal connection failed: {reason}");
        surface.write(format!("\r\n[terminal error: {reason}]\r\n").as_bytes());
    }
    let _ = state.send(TerminalState::Closed);

    // Closed: keep the diagnostic on the surface until disposal.
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::Dispose) {
            break;
        }
    }
    teardown(connection, surface, &state);
}

/// Runs while attached. Returns `true` if disposal was requested.
async fn pump<T: TerminalSurface>(
    connection: &Connection,
    inbound: &mut InboundStream,
    surface: &mut T,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    fit: &mut ViewportFit,
) -> bool {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Keys(data)) => {
                    for frame in TerminalControl::stdin_frames(&data) {
                        send_control(connection, &frame);
                    }
                }
                Some(Command::Resize(size)) => {
                    surface.resize(size);
                    if let Some(frame) = fit.observe(size) {
                        send_control(connection, &frame);
                    }
                }
                Some(Command::Dispose) | None => return true,
            },
            frame = inbound.recv() => {
                let output = match &frame {
                    Some(Inbound::Text(text)) => decode_terminal_frame(RawFrame::Text(text)),
                    Some(Inbound::Binary(bytes)) => decode_terminal_frame(RawFrame::Binary(bytes)),
                    Some(Inbound::Closed(reason)) => {
                        write_close_notice(surface, reason);
                        return false;
                    }
                    None => {
                        write_close_notice(surface, &CloseReason::Remote);
                        return false;
                    }
                };
                match output {
                    TerminalOutput::Output(bytes) => surface.write(&bytes),
                    TerminalOutput::Exit { code } => {
                        let notice = match code {
                            Some(code) => format!("\r\n[process exited with code {code}]\r\n"),
                            None => "\r\n[process exited]\r\n".to_string(),
                        };
                        surface.write(notice.as_bytes());
                        connection.close();
                        return false;
                    }
                    TerminalOutput::Error { message } => {
                        warn!(url = %connection.url(), "terminal error: {message}");
                        surface.write(format!("\r\n[terminal error: {message}]\r\n").as_bytes());
                        connection.close();
                        return false;
                    }
                }
            }
        }
    }
}

fn write_close_notice<T: TerminalSurface>(surface: &mut T, reason: &CloseReason) {
    match reason {
        CloseReason::Local => {}
        CloseReason::Remote => surface.write(b"\r\n[connection closed]\r\n"),
        CloseReason::Error(e) => {
            surface.write(format!("\r\n[terminal error: {e}]\r\n").as_bytes());
        }
    }
}

fn send_control(connection: &Connection, frame: &TerminalControl) {
    let result = frame
        .to_json()
        .map_err(TransportError::from)
        .and_then(|text| connection.send(text));
    if let Err(e) = result {
        warn!(url = %connection.url(), "terminal frame dropped: {e}");
    }
}

fn teardown<T: TerminalSurface>(
    connection: Connection,
    surface: T,
    state: &watch::Sender<TerminalState>,
) {
    connection.close();
    drop(surface);
    let _ = state.send(TerminalState::Closed);
    debug!(url = %connection.url(), "terminal disposed");
}
