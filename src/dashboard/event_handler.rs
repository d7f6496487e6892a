use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};

use super::app::DashboardApp;

/// Poll timeout for event handling (250ms = 4 fps)
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Handle keyboard events for the dashboard
///
/// Returns Ok(()) on success, or an error if event reading fails.
/// This function is non-blocking - it polls with a timeout.
pub fn handle_events(app: &mut DashboardApp) -> io::Result<()> {
    // Poll for events with timeout (non-blocking)
    if event::poll(POLL_TIMEOUT)? {
        // Read the event
        if let Event::Key(key_event) = event::read()? {
            handle_key_event(app, key_event);
        }
    }
    Ok(())
}

/// Process a single key event
fn handle_key_event(app: &mut DashboardApp, key: KeyEvent) {
    if key.kind != event::KeyEventKind::Press {
        return;
    }

    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => {
            app.should_quit = true;
        }
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.should_quit = true;
        }
        KeyCode::Char('d') => {
            app.dashboard_visible = !app.dashboard_visible;
        }
        KeyCode::Up => {
            if app.log_scroll > 0 {
                app.log_scroll = app.log_scroll.saturating_sub(1);
            }
        }
        KeyCode::Down => {
            app.log_scroll = app.log_scroll.saturating_add(1);
        }
        KeyCode::PageUp => {
            app.log_scroll = app.log_scroll.saturating_sub(10);
        }
        KeyCode::PageDown => {
            app.log_scroll = app.log_scroll.saturating_add(10);
        }
        KeyCode::Home => {
            app.log_scroll = 0;
        }
        _ => {}
    }
}
