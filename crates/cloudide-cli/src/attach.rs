use std::io::{self, Write};

use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::terminal;
use futures_util::StreamExt;
use tracing::debug;

use cloudide_session::{Session, TerminalSize, TerminalSurface};

use crate::keys::{is_detach, key_to_stdin};

/// Raw mode for the lifetime of the guard, restored on drop (even on panic).
struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

/// Writes terminal output straight to the local terminal.
pub struct StdoutSurface;

impl TerminalSurface for StdoutSurface {
    fn write(&mut self, bytes: &[u8]) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

/// Attach the local terminal to a workspace shell until the remote side
/// closes or the user presses Ctrl-].
pub async fn run(session: &Session, terminal_id: &str) -> Result<()> {
    let (cols, rows) = terminal::size()?;
    let guard = RawModeGuard::enable()?;
    eprint!("[attached to {} -- Ctrl-] to detach]\r\n", session.workspace_id());

    let mut handle =
        session.attach_terminal(terminal_id, StdoutSurface, TerminalSize::new(cols, rows));
    let mut events = EventStream::new();

    let result = loop {
        tokio::select! {
            _ = handle.closed() => break Ok(()),
            event = events.next() => match event {
                Some(Ok(Event::Key(key))) => {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if is_detach(&key) {
                        debug!("detach requested");
                        break Ok(());
                    }
                    if let Some(data) = key_to_stdin(&key) {
                        handle.send_keys(data);
                    }
                }
                Some(Ok(Event::Resize(cols, rows))) => {
                    handle.resize(cols, rows);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
        }
    };

    handle.dispose().await;
    drop(guard);
    eprintln!();
    result
}
