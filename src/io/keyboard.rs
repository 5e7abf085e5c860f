//! Interactive key handling for the sensor session
//!
//! Runs on its own thread with the terminal in raw mode:
//! - `q` / `Esc` / `Ctrl+C` - quit
//! - `c` - show camera frames
//! - `m` - show motion mask

use crate::services::session::SessionCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Map a key press to a session command
pub fn command_for(key: &KeyEvent) -> Option<SessionCommand> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            Some(SessionCommand::Quit)
        }
        KeyCode::Char('q') | KeyCode::Esc => Some(SessionCommand::Quit),
        KeyCode::Char('c') => Some(SessionCommand::ShowColor),
        KeyCode::Char('m') => Some(SessionCommand::ShowMask),
        _ => None,
    }
}

/// Restores cooked mode when the watcher exits
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Spawn the key watcher. Without a terminal it logs and exits immediately.
pub fn spawn_key_watcher(
    commands: mpsc::UnboundedSender<SessionCommand>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        if let Err(e) = enable_raw_mode() {
            warn!(error = %e, "keyboard_unavailable");
            return;
        }
        let _guard = RawModeGuard;
        debug!("keyboard_watcher_started");

        while !stop.load(Ordering::Relaxed) {
            match event::poll(POLL_INTERVAL) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(error = %e, "keyboard_poll_failed");
                    return;
                }
            }

            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };
            if let Some(cmd) = command_for(&key) {
                let quit = cmd == SessionCommand::Quit;
                if commands.send(cmd).is_err() || quit {
                    return;
                }
            }
        }
    })
}
