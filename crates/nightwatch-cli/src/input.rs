use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use nightwatch_core::StopSignal;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Operator key actions other than quitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    /// Start or stop pinning
    Toggle,
    /// Capture or restore latched fields
    Latch,
}

/// Spawn a thread that monitors keyboard input.
///
/// Esc, q/Q and Ctrl+C trigger `shutdown`; other recognised keys are sent on
/// the returned channel.
pub fn spawn_keyboard_monitor(shutdown: Arc<StopSignal>) -> (JoinHandle<()>, Receiver<KeyAction>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        debug!("Keyboard monitor started");

        while !shutdown.is_stopped() {
            // Poll for events with a timeout to allow checking shutdown state
            if !event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            let Ok(Event::Key(key_event)) = event::read() else {
                continue;
            };
            if should_shutdown(&key_event) {
                debug!("Shutdown key pressed: {:?}", key_event.code);
                shutdown.trigger();
                break;
            }
            if let Some(action) = key_action(&key_event)
                && tx.send(action).is_err()
            {
                break;
            }
        }

        debug!("Keyboard monitor stopped");
    });
    (handle, rx)
}

/// Check if the key event should trigger shutdown.
fn should_shutdown(event: &KeyEvent) -> bool {
    match event.code {
        KeyCode::Esc => true,
        KeyCode::Char('q') | KeyCode::Char('Q') => true,
        KeyCode::Char('c') if event.modifiers.contains(KeyModifiers::CONTROL) => true,
        _ => false,
    }
}

fn key_action(event: &KeyEvent) -> Option<KeyAction> {
    match event.code {
        KeyCode::Char('t') | KeyCode::Char('T') => Some(KeyAction::Toggle),
        KeyCode::Char('l') | KeyCode::Char('L') => Some(KeyAction::Latch),
        _ => None,
    }
}
